//! Waiter registry: run id -> callers blocked on that run's terminal state.

use std::collections::HashMap;

use tokio::sync::{Mutex, oneshot};

use crate::model::Run;

#[derive(Default)]
pub(super) struct WaiterRegistry {
    inner: Mutex<HashMap<String, Vec<oneshot::Sender<Run>>>>,
}

impl WaiterRegistry {
    /// Register one caller; the receiver resolves with the terminal run.
    pub(super) async fn register(&self, run_id: &str) -> oneshot::Receiver<Run> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .lock()
            .await
            .entry(run_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Broadcast `run` to every waiter on its id and clear the list.
    ///
    /// Returns the number of callers woken.
    pub(super) async fn notify(&self, run: &Run) -> usize {
        let waiters = self.inner.lock().await.remove(&run.id).unwrap_or_default();
        waiters
            .into_iter()
            .filter_map(|tx| tx.send(run.clone()).ok())
            .count()
    }

    /// Drop senders whose caller went away, removing the entry once empty.
    pub(super) async fn prune_closed(&self, run_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(waiters) = inner.get_mut(run_id) {
            waiters.retain(|tx| !tx.is_closed());
            if waiters.is_empty() {
                inner.remove(run_id);
            }
        }
    }

    /// Run ids with at least one blocked caller.
    pub(super) async fn run_ids(&self) -> Vec<String> {
        self.inner.lock().await.keys().cloned().collect()
    }

    pub(super) async fn waiting_callers(&self) -> usize {
        self.inner.lock().await.values().map(Vec::len).sum()
    }
}
