use chrono::Utc;

use crate::error::{RunError, RunResult};
use crate::model::RunStatus;
use crate::observability::RunEvent;

use super::{RunScheduler, StaleRunPolicy};

impl RunScheduler {
    /// Reclassify `running` runs whose execution is gone.
    ///
    /// A run is stale when no execution in this process holds it and its
    /// lease has expired, i.e. its owner stopped renewing. Called from
    /// [`RunScheduler::start`] and on every heartbeat. Returns the number of
    /// runs touched.
    pub async fn recover_stale_runs(&self) -> RunResult<usize> {
        let _admission = self.admission.lock().await;
        let running = self
            .store
            .list_runs(RunStatus::Running)
            .await
            .map_err(|e| RunError::store(&e))?;
        let now = Utc::now();
        let mut recovered = 0;
        for mut run in running {
            if self.is_executing_here(&run.id) {
                continue;
            }
            if run.lease_is_live(now) {
                tracing::debug!(
                    event = RunEvent::RecoveryLeaseHeld.as_str(),
                    run_id = %run.id,
                    owner = run.owner.as_deref().unwrap_or_default(),
                    "running run still leased; left to its owner"
                );
                continue;
            }
            match self.config.stale_run_policy {
                StaleRunPolicy::Requeue => {
                    run.mark_pending()?;
                    self.save_run(&run).await?;
                    tracing::info!(
                        event = RunEvent::RecoveryRequeued.as_str(),
                        run_id = %run.id,
                        "stale running run requeued"
                    );
                }
                StaleRunPolicy::Fail => {
                    run.mark_failed(RunError::Interrupted.to_string(), now)?;
                    self.save_run(&run).await?;
                    tracing::warn!(
                        event = RunEvent::RecoveryInterrupted.as_str(),
                        run_id = %run.id,
                        "stale running run marked interrupted"
                    );
                    self.notify_waiters(&run).await;
                }
            }
            recovered += 1;
        }
        Ok(recovered)
    }
}
