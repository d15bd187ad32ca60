//! Periodic sweep: admission liveness when no event trigger fires, waiter
//! release for runs finished by another scheduler, plus the heartbeat
//! (stale lease recovery and health log).

use std::sync::{Arc, Weak};

use tokio::time::{Instant, MissedTickBehavior};

use crate::observability::RunEvent;

use super::{RunScheduler, SchedulerHealthState};

impl RunScheduler {
    /// Spawn the sweep loop. It holds only a weak reference and stops once
    /// the scheduler is dropped.
    pub(super) fn spawn_sweep_loop(self: &Arc<Self>) {
        let scheduler = Arc::downgrade(self);
        let sweep_interval = self.config.sweep_interval();
        let heartbeat_interval = self.config.heartbeat_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut next_heartbeat = Instant::now() + heartbeat_interval;
            loop {
                interval.tick().await;
                let Some(scheduler) = Weak::upgrade(&scheduler) else {
                    tracing::debug!(
                        event = RunEvent::SweepStopped.as_str(),
                        "scheduler dropped; sweep loop stopped"
                    );
                    break;
                };
                let admitted = scheduler.process_queue().await;
                if admitted > 0 {
                    tracing::debug!(
                        event = RunEvent::SweepTick.as_str(),
                        admitted,
                        "sweep admitted pending runs"
                    );
                }
                scheduler.release_settled_waiters().await;
                if Instant::now() >= next_heartbeat {
                    next_heartbeat = Instant::now() + heartbeat_interval;
                    scheduler.heartbeat().await;
                }
            }
        });
    }

    /// Wake waiters on runs that reached a terminal state outside this
    /// process (shared store) or whose notification was missed.
    async fn release_settled_waiters(&self) {
        for run_id in self.waiters.run_ids().await {
            match self.store.get_run(&run_id).await {
                Ok(Some(run)) if run.is_terminal() => self.notify_waiters(&run).await,
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(
                        event = RunEvent::WaiterPollFailed.as_str(),
                        run_id = %run_id,
                        error = %format!("{error:#}"),
                        "failed to poll waited run"
                    );
                }
            }
        }
    }

    async fn heartbeat(&self) {
        // Requeued runs are admitted by the next sweep tick.
        if let Err(error) = self.recover_stale_runs().await {
            tracing::warn!(
                event = RunEvent::RecoveryFailed.as_str(),
                error = %error,
                "heartbeat stale run recovery failed"
            );
        }
        let probe_timeout = self.config.heartbeat_probe_timeout();
        let metrics = match tokio::time::timeout(probe_timeout, self.metrics()).await {
            Ok(Ok(metrics)) => metrics,
            Ok(Err(error)) => {
                tracing::warn!(
                    event = RunEvent::HeartbeatProbeTimeout.as_str(),
                    error = %error,
                    "scheduler heartbeat probe failed"
                );
                return;
            }
            Err(_) => {
                tracing::warn!(
                    event = RunEvent::HeartbeatProbeTimeout.as_str(),
                    timeout_ms = self.config.heartbeat_probe_timeout_ms,
                    "scheduler heartbeat probe timed out"
                );
                return;
            }
        };
        match metrics.health_state {
            SchedulerHealthState::Healthy => {
                tracing::trace!(
                    event = RunEvent::HeartbeatHealthy.as_str(),
                    pending = metrics.pending,
                    running = metrics.running,
                    active_slots = metrics.active_slots,
                    waiting_callers = metrics.waiting_callers,
                    "scheduler heartbeat healthy"
                );
            }
            SchedulerHealthState::QueueStalled => {
                tracing::warn!(
                    event = RunEvent::HeartbeatQueueStalled.as_str(),
                    oldest_pending_age_secs = metrics.oldest_pending_age_secs.unwrap_or_default(),
                    threshold_secs = self.config.max_pending_age_secs,
                    "scheduler queue stalled"
                );
            }
            SchedulerHealthState::RunningStalled => {
                tracing::warn!(
                    event = RunEvent::HeartbeatRunningStalled.as_str(),
                    longest_running_age_secs = metrics.longest_running_age_secs.unwrap_or_default(),
                    threshold_secs = self.config.max_running_age_secs,
                    "scheduler running stalled"
                );
            }
        }
    }
}
