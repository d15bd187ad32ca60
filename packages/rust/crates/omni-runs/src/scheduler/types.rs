//! Scheduler configuration and metrics types.

use std::time::Duration;

const MAX_LEASE_SECS: u64 = 86_400;

use serde::{Deserialize, Serialize};

/// What to do with runs found `running` when a scheduler starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StaleRunPolicy {
    /// Reset to `pending` for re-admission.
    #[default]
    Requeue,
    /// Mark `error` with an "interrupted" reason.
    Fail,
}

impl std::str::FromStr for StaleRunPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "requeue" => Ok(Self::Requeue),
            "fail" => Ok(Self::Fail),
            other => Err(format!("unknown stale run policy: {other}")),
        }
    }
}

/// Config for admission, sweep and heartbeat.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Hard cap on simultaneously `running` runs.
    pub max_concurrent_runs: usize,
    /// Periodic sweep interval in milliseconds.
    pub sweep_interval_ms: u64,
    /// Per-run execution timeout in seconds.
    pub run_timeout_secs: u64,
    /// Admit on enqueue and on completion. When false only the sweep admits.
    pub event_triggers: bool,
    pub stale_run_policy: StaleRunPolicy,
    /// Heartbeat (metrics + health log) interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Heartbeat metrics probe timeout in milliseconds.
    pub heartbeat_probe_timeout_ms: u64,
    /// Pending age threshold for unhealthy state.
    pub max_pending_age_secs: u64,
    /// Running age threshold for unhealthy state.
    pub max_running_age_secs: u64,
    /// Execution lease stamped on admitted runs. Another scheduler sharing
    /// the store reclaims a `running` run only after its lease expires.
    pub lease_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 2,
            sweep_interval_ms: 1_000,
            run_timeout_secs: 300,
            event_triggers: true,
            stale_run_policy: StaleRunPolicy::Requeue,
            heartbeat_interval_secs: 10,
            heartbeat_probe_timeout_ms: 2_000,
            max_pending_age_secs: 120,
            max_running_age_secs: 900,
            lease_secs: 30,
        }
    }
}

impl SchedulerConfig {
    pub(crate) fn normalized(mut self) -> Self {
        self.max_concurrent_runs = self.max_concurrent_runs.max(1);
        self.sweep_interval_ms = self.sweep_interval_ms.max(10);
        self.run_timeout_secs = self.run_timeout_secs.max(1);
        self.heartbeat_interval_secs = self.heartbeat_interval_secs.max(1);
        self.heartbeat_probe_timeout_ms = self.heartbeat_probe_timeout_ms.max(1);
        self.max_pending_age_secs = self.max_pending_age_secs.max(1);
        self.max_running_age_secs = self.max_running_age_secs.max(1);
        self.lease_secs = self.lease_secs.clamp(1, MAX_LEASE_SECS);
        self
    }

    pub(crate) fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub(crate) fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub(crate) fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub(crate) fn heartbeat_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_probe_timeout_ms)
    }

    pub(crate) fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.lease_secs).unwrap_or(86_400))
    }

    pub(crate) fn lease_renew_interval(&self) -> Duration {
        Duration::from_millis(self.lease_secs * 1_000 / 3)
    }
}

/// Queue health state from age thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerHealthState {
    /// Pending/running runs are within configured age bounds.
    Healthy,
    /// Old pending run indicates an admission stall.
    QueueStalled,
    /// Long-running run indicates an execution stall.
    RunningStalled,
}

/// Aggregate queue/slot metrics.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerMetricsSnapshot {
    pub draft: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Slots held by executions in this process.
    pub active_slots: usize,
    pub max_concurrent_runs: usize,
    /// Callers blocked in `invoke`.
    pub waiting_callers: usize,
    pub oldest_pending_age_secs: Option<u64>,
    pub longest_running_age_secs: Option<u64>,
    pub health_state: SchedulerHealthState,
}

/// Classify scheduler health from age thresholds.
pub fn classify_scheduler_health(
    metrics: &SchedulerMetricsSnapshot,
    max_pending_age_secs: u64,
    max_running_age_secs: u64,
) -> SchedulerHealthState {
    if metrics.oldest_pending_age_secs.unwrap_or(0) > max_pending_age_secs {
        return SchedulerHealthState::QueueStalled;
    }
    if metrics.longest_running_age_secs.unwrap_or(0) > max_running_age_secs {
        return SchedulerHealthState::RunningStalled;
    }
    SchedulerHealthState::Healthy
}
