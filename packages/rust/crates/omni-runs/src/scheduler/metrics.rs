use chrono::{DateTime, Utc};

use crate::error::{RunError, RunResult};
use crate::model::RunStatus;

use super::{RunScheduler, SchedulerHealthState, SchedulerMetricsSnapshot, classify_scheduler_health};

fn age_secs(now: DateTime<Utc>, since: DateTime<Utc>) -> u64 {
    u64::try_from((now - since).num_seconds()).unwrap_or(0)
}

impl RunScheduler {
    /// Aggregate queue/slot metrics for the heartbeat and the CLI.
    pub async fn metrics(&self) -> RunResult<SchedulerMetricsSnapshot> {
        let now = Utc::now();
        let mut counts = [0usize; RunStatus::ALL.len()];
        let mut oldest_pending = None::<u64>;
        let mut longest_running = None::<u64>;

        for (index, status) in RunStatus::ALL.into_iter().enumerate() {
            let runs = self
                .store
                .list_runs(status)
                .await
                .map_err(|e| RunError::store(&e))?;
            counts[index] = runs.len();
            match status {
                RunStatus::Pending => {
                    for run in &runs {
                        let age = age_secs(now, run.created_at);
                        oldest_pending = Some(oldest_pending.map_or(age, |v| v.max(age)));
                    }
                }
                RunStatus::Running => {
                    for run in &runs {
                        if let Some(started_at) = run.start_time {
                            let age = age_secs(now, started_at);
                            longest_running = Some(longest_running.map_or(age, |v| v.max(age)));
                        }
                    }
                }
                _ => {}
            }
        }

        let [draft, pending, running, succeeded, failed] = counts;
        let mut snapshot = SchedulerMetricsSnapshot {
            draft,
            pending,
            running,
            succeeded,
            failed,
            active_slots: self.active_slots(),
            max_concurrent_runs: self.config.max_concurrent_runs,
            waiting_callers: self.waiters.waiting_callers().await,
            oldest_pending_age_secs: oldest_pending,
            longest_running_age_secs: longest_running,
            health_state: SchedulerHealthState::Healthy,
        };
        snapshot.health_state = classify_scheduler_health(
            &snapshot,
            self.config.max_pending_age_secs,
            self.config.max_running_age_secs,
        );
        Ok(snapshot)
    }
}
