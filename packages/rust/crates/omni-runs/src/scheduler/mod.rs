//! Run scheduler: admission under a concurrency cap, backend dispatch,
//! result materialization, waiter notification.
//!
//! Both admission triggers (enqueue/completion events and the periodic sweep)
//! go through [`RunScheduler::process_queue`] -> `admit_next`, which selects
//! and transitions runs under a single admission lock.

mod admission;
mod execute;
mod metrics;
mod recovery;
mod sweep;
mod types;
mod waiters;

use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::oneshot;

use crate::backend::BackendRegistry;
use crate::error::{RunError, RunResult};
use crate::model::{
    Message, ModelDescriptor, NewMessage, NewModel, NewRun, NewToolContract, Run, RunStatus,
    ToolContract,
};
use crate::observability::RunEvent;
use crate::store::JobStore;

pub use execute::materialize_completion;
pub use types::{
    SchedulerConfig, SchedulerHealthState, SchedulerMetricsSnapshot, StaleRunPolicy,
    classify_scheduler_health,
};

use waiters::WaiterRegistry;

/// Owns the in-memory scheduling state; durable state lives in the [`JobStore`].
pub struct RunScheduler {
    /// Owner id stamped on runs this scheduler admits.
    instance_id: String,
    store: Arc<dyn JobStore>,
    backends: BackendRegistry,
    config: SchedulerConfig,
    /// Serializes selection + `pending -> running` against other admissions,
    /// enqueues, appends and cancellations.
    admission: tokio::sync::Mutex<()>,
    active: AtomicUsize,
    cancellations: Mutex<HashMap<String, oneshot::Sender<()>>>,
    waiters: WaiterRegistry,
}

impl RunScheduler {
    /// Build a scheduler without background tasks (no sweep, no recovery).
    pub fn new(
        store: Arc<dyn JobStore>,
        backends: BackendRegistry,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            store,
            backends,
            config: config.normalized(),
            admission: tokio::sync::Mutex::new(()),
            active: AtomicUsize::new(0),
            cancellations: Mutex::new(HashMap::new()),
            waiters: WaiterRegistry::default(),
        })
    }

    /// Build a scheduler, reclassify stale `running` runs, then start the periodic sweep.
    pub async fn start(
        store: Arc<dyn JobStore>,
        backends: BackendRegistry,
        config: SchedulerConfig,
    ) -> RunResult<Arc<Self>> {
        let scheduler = Self::new(store, backends, config);
        scheduler.recover_stale_runs().await?;
        scheduler.spawn_sweep_loop();
        Ok(scheduler)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub async fn create_model(&self, model: NewModel) -> RunResult<ModelDescriptor> {
        if model.concrete_name.trim().is_empty() {
            return Err(RunError::InvalidRequest(
                "model concrete name must not be empty".to_string(),
            ));
        }
        self.store
            .create_model(model)
            .await
            .map_err(|e| RunError::store(&e))
    }

    pub async fn create_tool(&self, tool: NewToolContract) -> RunResult<ToolContract> {
        tool.validate().map_err(RunError::InvalidRequest)?;
        self.store
            .create_tool(tool)
            .await
            .map_err(|e| RunError::store(&e))
    }

    /// Create a `draft` run after checking its model and tool references.
    pub async fn create_run(&self, run: NewRun) -> RunResult<Run> {
        self.require_model(&run.model_id).await?;
        if let Some(tool_id) = run.tool_id.as_deref() {
            self.require_tool(tool_id).await?;
        }
        let created = self
            .store
            .create_run(run)
            .await
            .map_err(|e| RunError::store(&e))?;
        tracing::debug!(
            event = RunEvent::RunCreated.as_str(),
            run_id = %created.id,
            name = %created.name,
            model_id = %created.model_id,
            tool_id = ?created.tool_id,
            "run created"
        );
        Ok(created)
    }

    /// Append a transcript entry. Rejected while the run is `running`.
    pub async fn append_message(&self, run_id: &str, message: NewMessage) -> RunResult<Message> {
        message.validate().map_err(RunError::InvalidRequest)?;
        let _admission = self.admission.lock().await;
        let run = self.require_run(run_id).await?;
        if run.status == RunStatus::Running {
            return Err(RunError::InvalidState {
                run_id: run.id,
                status: run.status,
                operation: "append a message to",
            });
        }
        let appended = self
            .store
            .append_message(run_id, message)
            .await
            .map_err(|e| RunError::store(&e))?;
        tracing::debug!(
            event = RunEvent::RunMessageAppended.as_str(),
            run_id,
            role = %appended.role,
            tool_calls = appended.tool_calls.len(),
            "run message appended"
        );
        Ok(appended)
    }

    pub async fn get_run(&self, run_id: &str) -> RunResult<Run> {
        self.require_run(run_id).await
    }

    /// Ordered transcript of a run.
    pub async fn transcript(&self, run_id: &str) -> RunResult<Vec<Message>> {
        self.require_run(run_id).await?;
        self.store
            .list_messages(run_id)
            .await
            .map_err(|e| RunError::store(&e))
    }

    /// Terminal assistant message of a successful run.
    pub async fn response_message(&self, run: &Run) -> RunResult<Option<Message>> {
        let Some(message_id) = run.response.as_deref() else {
            return Ok(None);
        };
        self.store
            .get_message(&run.id, message_id)
            .await
            .map_err(|e| RunError::store(&e))
    }

    /// Move a run to `pending`.
    ///
    /// No-op for a `pending` run; a terminal run starts a fresh admission
    /// cycle; a `running` run is rejected.
    pub async fn enqueue(self: &Arc<Self>, run_id: &str) -> RunResult<Run> {
        self.move_to_pending(run_id, false).await
    }

    /// With `draft_only`, runs past `draft` are returned untouched instead
    /// of being re-queued or rejected.
    async fn move_to_pending(self: &Arc<Self>, run_id: &str, draft_only: bool) -> RunResult<Run> {
        let run = {
            let _admission = self.admission.lock().await;
            let mut run = self.require_run(run_id).await?;
            let event = match run.status {
                RunStatus::Pending => return Ok(run),
                _ if draft_only && run.status != RunStatus::Draft => return Ok(run),
                RunStatus::Running => {
                    return Err(RunError::InvalidState {
                        run_id: run.id,
                        status: run.status,
                        operation: "enqueue",
                    });
                }
                RunStatus::Draft => RunEvent::RunEnqueued,
                RunStatus::Success | RunStatus::Error => RunEvent::RunRequeued,
            };
            let previous = run.status;
            run.mark_pending()?;
            self.save_run(&run).await?;
            tracing::debug!(
                event = event.as_str(),
                run_id,
                previous = %previous,
                "run enqueued"
            );
            run
        };
        if self.config.event_triggers {
            self.process_queue().await;
        }
        Ok(run)
    }

    /// Ensure the run is queued and wait for its terminal state.
    ///
    /// Resolves with the run on `success`, rejects with
    /// [`RunError::Execution`] on `error`. A run that is already terminal
    /// resolves immediately without re-running.
    pub async fn invoke(self: &Arc<Self>, run_id: &str) -> RunResult<Run> {
        let run = self.require_run(run_id).await?;
        if run.is_terminal() {
            return terminal_outcome(run);
        }
        let waiter = self.waiters.register(run_id).await;
        tracing::debug!(
            event = RunEvent::WaiterRegistered.as_str(),
            run_id,
            status = %run.status,
            "invoke waiter registered"
        );
        if run.status == RunStatus::Draft
            && let Err(error) = self.move_to_pending(run_id, true).await
        {
            drop(waiter);
            self.waiters.prune_closed(run_id).await;
            return Err(error);
        }
        let finished = self.wait_registered(run_id, waiter).await?;
        terminal_outcome(finished)
    }

    /// Cancel a run.
    ///
    /// A `running` run has its execution dropped and is recorded as a
    /// cancelled error; a `draft`/`pending` run is failed before admission.
    /// Returns the terminal run, which may be a success if execution won the
    /// race against the cancel signal.
    pub async fn cancel(self: &Arc<Self>, run_id: &str) -> RunResult<Run> {
        let admission = self.admission.lock().await;
        let mut run = self.require_run(run_id).await?;
        match run.status {
            RunStatus::Running => {
                let waiter = self.waiters.register(run_id).await;
                let signal = self.lock_cancellations().remove(run_id);
                drop(admission);
                let Some(signal) = signal else {
                    // Executing in another process (shared store) or already finishing.
                    let current = self.require_run(run_id).await?;
                    if current.is_terminal() {
                        self.notify_waiters(&current).await;
                        return Ok(current);
                    }
                    return Err(RunError::InvalidState {
                        run_id: current.id,
                        status: current.status,
                        operation: "cancel",
                    });
                };
                let _ = signal.send(());
                self.wait_registered(run_id, waiter).await
            }
            RunStatus::Draft | RunStatus::Pending => {
                run.mark_failed(RunError::Cancelled.to_string(), Utc::now())?;
                self.save_run(&run).await?;
                drop(admission);
                tracing::info!(
                    event = RunEvent::RunCancelled.as_str(),
                    run_id,
                    "run cancelled before admission"
                );
                self.notify_waiters(&run).await;
                Ok(run)
            }
            RunStatus::Success | RunStatus::Error => Err(RunError::InvalidState {
                run_id: run.id,
                status: run.status,
                operation: "cancel",
            }),
        }
    }

    /// Await a registered waiter, closing the race with a completion that
    /// was broadcast before registration.
    async fn wait_registered(
        &self,
        run_id: &str,
        waiter: oneshot::Receiver<Run>,
    ) -> RunResult<Run> {
        let current = self.require_run(run_id).await?;
        if current.is_terminal() {
            self.notify_waiters(&current).await;
        }
        waiter.await.map_err(|_| RunError::Execution {
            run_id: run_id.to_string(),
            error: "scheduler dropped the waiter before completion".to_string(),
        })
    }

    async fn notify_waiters(&self, run: &Run) {
        let woken = self.waiters.notify(run).await;
        if woken > 0 {
            tracing::debug!(
                event = RunEvent::WaitersNotified.as_str(),
                run_id = %run.id,
                status = %run.status,
                woken,
                "run waiters notified"
            );
        }
    }

    async fn require_run(&self, run_id: &str) -> RunResult<Run> {
        self.store
            .get_run(run_id)
            .await
            .map_err(|e| RunError::store(&e))?
            .ok_or_else(|| RunError::RunNotFound(run_id.to_string()))
    }

    async fn require_model(&self, model_id: &str) -> RunResult<ModelDescriptor> {
        self.store
            .get_model(model_id)
            .await
            .map_err(|e| RunError::store(&e))?
            .ok_or_else(|| RunError::ModelNotFound(model_id.to_string()))
    }

    async fn require_tool(&self, tool_id: &str) -> RunResult<ToolContract> {
        self.store
            .get_tool(tool_id)
            .await
            .map_err(|e| RunError::store(&e))?
            .ok_or_else(|| RunError::ToolNotFound(tool_id.to_string()))
    }

    async fn save_run(&self, run: &Run) -> RunResult<()> {
        self.store
            .save_run(run)
            .await
            .map_err(|e| RunError::store(&e))
    }

    fn lock_cancellations(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<()>>> {
        self.cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn terminal_outcome(run: Run) -> RunResult<Run> {
    match run.status {
        RunStatus::Success => Ok(run),
        _ => Err(RunError::Execution {
            error: run
                .error
                .clone()
                .unwrap_or_else(|| format!("run ended in status {}", run.status)),
            run_id: run.id,
        }),
    }
}
