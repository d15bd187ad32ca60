/// Event ids attached to scheduler log lines as `event = ...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    RunCreated,
    RunMessageAppended,
    RunEnqueued,
    RunRequeued,
    RunAdmitted,
    RunSucceeded,
    RunFailed,
    RunCancelled,
    RunFinalizeFailed,
    RunLeaseLost,
    WaiterRegistered,
    WaitersNotified,
    WaiterPollFailed,
    AdmissionFailed,
    SweepTick,
    SweepStopped,
    HeartbeatHealthy,
    HeartbeatQueueStalled,
    HeartbeatRunningStalled,
    HeartbeatProbeTimeout,
    RecoveryRequeued,
    RecoveryInterrupted,
    RecoveryLeaseHeld,
    RecoveryFailed,
    BackendInvoked,
    BackendRegistered,
    StoreBackendEnabled,
    StoreValkeyConnected,
    StoreValkeyCommandRetrySucceeded,
    StoreValkeyCommandRetryFailed,
    StoreValkeyClaimContended,
    CliSchedulerStarted,
    CliInterrupted,
    CliBatchWaiterFailed,
    ConfigValueIgnored,
}

impl RunEvent {
    pub const ALL: [Self; 35] = [
        Self::RunCreated,
        Self::RunMessageAppended,
        Self::RunEnqueued,
        Self::RunRequeued,
        Self::RunAdmitted,
        Self::RunSucceeded,
        Self::RunFailed,
        Self::RunCancelled,
        Self::RunFinalizeFailed,
        Self::RunLeaseLost,
        Self::WaiterRegistered,
        Self::WaitersNotified,
        Self::WaiterPollFailed,
        Self::AdmissionFailed,
        Self::SweepTick,
        Self::SweepStopped,
        Self::HeartbeatHealthy,
        Self::HeartbeatQueueStalled,
        Self::HeartbeatRunningStalled,
        Self::HeartbeatProbeTimeout,
        Self::RecoveryRequeued,
        Self::RecoveryInterrupted,
        Self::RecoveryLeaseHeld,
        Self::RecoveryFailed,
        Self::BackendInvoked,
        Self::BackendRegistered,
        Self::StoreBackendEnabled,
        Self::StoreValkeyConnected,
        Self::StoreValkeyCommandRetrySucceeded,
        Self::StoreValkeyCommandRetryFailed,
        Self::StoreValkeyClaimContended,
        Self::CliSchedulerStarted,
        Self::CliInterrupted,
        Self::CliBatchWaiterFailed,
        Self::ConfigValueIgnored,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RunCreated => "runs.run.created",
            Self::RunMessageAppended => "runs.run.message_appended",
            Self::RunEnqueued => "runs.run.enqueued",
            Self::RunRequeued => "runs.run.requeued",
            Self::RunAdmitted => "runs.run.admitted",
            Self::RunSucceeded => "runs.run.succeeded",
            Self::RunFailed => "runs.run.failed",
            Self::RunCancelled => "runs.run.cancelled",
            Self::RunFinalizeFailed => "runs.run.finalize_failed",
            Self::RunLeaseLost => "runs.run.lease_lost",
            Self::WaiterRegistered => "runs.waiter.registered",
            Self::WaitersNotified => "runs.waiter.notified",
            Self::WaiterPollFailed => "runs.waiter.poll_failed",
            Self::AdmissionFailed => "runs.admission.failed",
            Self::SweepTick => "runs.sweep.tick",
            Self::SweepStopped => "runs.sweep.stopped",
            Self::HeartbeatHealthy => "runs.heartbeat.healthy",
            Self::HeartbeatQueueStalled => "runs.heartbeat.queue_stalled",
            Self::HeartbeatRunningStalled => "runs.heartbeat.running_stalled",
            Self::HeartbeatProbeTimeout => "runs.heartbeat.probe_timeout",
            Self::RecoveryRequeued => "runs.recovery.requeued",
            Self::RecoveryInterrupted => "runs.recovery.interrupted",
            Self::RecoveryLeaseHeld => "runs.recovery.lease_held",
            Self::RecoveryFailed => "runs.recovery.failed",
            Self::BackendInvoked => "runs.backend.invoked",
            Self::BackendRegistered => "runs.backend.registered",
            Self::StoreBackendEnabled => "runs.store.backend_enabled",
            Self::StoreValkeyConnected => "runs.store.valkey.connected",
            Self::StoreValkeyCommandRetrySucceeded => "runs.store.valkey.command_retry_succeeded",
            Self::StoreValkeyCommandRetryFailed => "runs.store.valkey.command_retry_failed",
            Self::StoreValkeyClaimContended => "runs.store.valkey.claim_contended",
            Self::CliSchedulerStarted => "runs.cli.scheduler_started",
            Self::CliInterrupted => "runs.cli.interrupted",
            Self::CliBatchWaiterFailed => "runs.cli.batch_waiter_failed",
            Self::ConfigValueIgnored => "runs.config.value_ignored",
        }
    }
}
