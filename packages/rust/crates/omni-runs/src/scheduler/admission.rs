//! Admission: claim the oldest pending run while a slot is free. The admission
//! lock orders claims within this process; the store claim decides between
//! processes, so a run is admitted at most once per `pending` cycle.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::Utc;
use tokio::sync::oneshot;

use crate::error::{RunError, RunResult};
use crate::model::Run;
use crate::observability::RunEvent;

use super::RunScheduler;

/// One occupied concurrency slot, released on drop.
///
/// Held by the spawned execution task; dropping it on any path (completion,
/// panic, abort) returns the slot and clears the run's cancel signal.
pub(super) struct SlotGuard {
    scheduler: Arc<RunScheduler>,
    run_id: String,
    cancel_registered: bool,
}

impl SlotGuard {
    /// Drop the run's cancel signal ahead of finalization, so a later
    /// admission of the same run can register its own.
    pub(super) fn disarm_cancel(&mut self) {
        if self.cancel_registered {
            self.scheduler.lock_cancellations().remove(&self.run_id);
            self.cancel_registered = false;
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.disarm_cancel();
        self.scheduler.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl RunScheduler {
    /// Admit runs until the queue is empty or every slot is taken.
    ///
    /// Shared by the enqueue trigger, the completion trigger and the sweep.
    /// Returns the number of runs admitted.
    pub async fn process_queue(self: &Arc<Self>) -> usize {
        let mut admitted = 0;
        loop {
            match self.admit_next().await {
                Ok(Some(_)) => admitted += 1,
                Ok(None) => break,
                Err(error) => {
                    tracing::warn!(
                        event = RunEvent::AdmissionFailed.as_str(),
                        error = %error,
                        "run admission failed"
                    );
                    break;
                }
            }
        }
        admitted
    }

    /// Admit the oldest pending run if a slot is free, spawning its execution.
    pub(super) async fn admit_next(self: &Arc<Self>) -> RunResult<Option<Run>> {
        let _admission = self.admission.lock().await;
        if self.active.load(Ordering::Acquire) >= self.config.max_concurrent_runs {
            return Ok(None);
        }
        let now = Utc::now();
        let Some(run) = self
            .store
            .claim_oldest_pending(&self.instance_id, now, now + self.config.lease_ttl())
            .await
            .map_err(|e| RunError::store(&e))?
        else {
            return Ok(None);
        };
        let occupied = self.active.fetch_add(1, Ordering::AcqRel) + 1;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.lock_cancellations().insert(run.id.clone(), cancel_tx);
        let slot = SlotGuard {
            scheduler: Arc::clone(self),
            run_id: run.id.clone(),
            cancel_registered: true,
        };
        tracing::info!(
            event = RunEvent::RunAdmitted.as_str(),
            run_id = %run.id,
            seq = run.seq,
            active_slots = occupied,
            max_concurrent_runs = self.config.max_concurrent_runs,
            "run admitted"
        );
        tokio::spawn(Arc::clone(self).execute(run.clone(), slot, cancel_rx));
        Ok(Some(run))
    }

    /// Slots currently held by executions in this process.
    pub fn active_slots(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub(super) fn is_executing_here(&self, run_id: &str) -> bool {
        self.lock_cancellations().contains_key(run_id)
    }
}
