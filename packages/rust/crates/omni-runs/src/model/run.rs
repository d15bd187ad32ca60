//! Run record and its status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RunError, RunResult};

/// Run lifecycle state.
///
/// `draft -> pending -> running -> {success | error}`; terminal runs may be
/// re-queued to `pending`, which starts a new admission cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Created, transcript still being assembled.
    Draft,
    /// Waiting for admission.
    Pending,
    /// Admitted and executing against a backend.
    Running,
    /// Completed with an assistant response.
    Success,
    /// Completed with an error.
    Error,
}

impl RunStatus {
    /// All states, in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Draft,
        Self::Pending,
        Self::Running,
        Self::Success,
        Self::Error,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// Besides the forward path this admits re-queueing terminal runs,
    /// cancelling runs that were never admitted, and resetting a stale
    /// `running` run back to `pending` during recovery.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Draft, Self::Pending)
                | (Self::Pending, Self::Running)
                | (Self::Running, Self::Success | Self::Error | Self::Pending)
                | (Self::Success | Self::Error, Self::Pending)
                | (Self::Draft | Self::Pending, Self::Error)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == value.trim())
            .ok_or_else(|| format!("unknown run status: {value}"))
    }
}

/// A scheduled unit of model-invocation work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    /// Unique id assigned at creation.
    pub id: String,
    /// Human label, non-authoritative.
    pub name: String,
    /// Backend client descriptor id.
    pub model_id: String,
    /// Optional output contract id; `None` means free-text completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    pub status: RunStatus,
    /// Terminal assistant message id, set only on `success`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    /// Error detail, set only on `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Store-assigned creation sequence; admission order among pending runs.
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Scheduler instance that admitted the run in its latest cycle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Execution lease; the owner renews it while the run is `running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Exactly one of `response`/`error` once terminal, neither before.
    pub fn has_consistent_outcome(&self) -> bool {
        match self.status {
            RunStatus::Success => self.response.is_some() && self.error.is_none(),
            RunStatus::Error => self.error.is_some() && self.response.is_none(),
            _ => self.response.is_none() && self.error.is_none(),
        }
    }

    /// True while a live owner holds the execution lease.
    pub fn lease_is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == RunStatus::Running && self.lease_expires_at.is_some_and(|until| until > now)
    }

    fn transition(&mut self, next: RunStatus, operation: &'static str) -> RunResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(RunError::InvalidState {
                run_id: self.id.clone(),
                status: self.status,
                operation,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Move to `pending`, clearing the outcome of any previous cycle.
    pub(crate) fn mark_pending(&mut self) -> RunResult<()> {
        self.transition(RunStatus::Pending, "enqueue")?;
        self.response = None;
        self.error = None;
        self.start_time = None;
        self.end_time = None;
        self.owner = None;
        self.lease_expires_at = None;
        Ok(())
    }

    pub(crate) fn mark_running(
        &mut self,
        owner: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> RunResult<()> {
        self.transition(RunStatus::Running, "admit")?;
        self.start_time = Some(now);
        self.end_time = None;
        self.owner = Some(owner.to_string());
        self.lease_expires_at = Some(lease_until);
        Ok(())
    }

    pub(crate) fn mark_succeeded(&mut self, message_id: String, now: DateTime<Utc>) -> RunResult<()> {
        self.transition(RunStatus::Success, "complete")?;
        self.response = Some(message_id);
        self.error = None;
        self.end_time = Some(now);
        self.lease_expires_at = None;
        Ok(())
    }

    pub(crate) fn mark_failed(&mut self, error: String, now: DateTime<Utc>) -> RunResult<()> {
        self.transition(RunStatus::Error, "fail")?;
        self.response = None;
        self.error = Some(error);
        self.end_time = Some(now);
        self.lease_expires_at = None;
        Ok(())
    }
}

/// Collaborator request to create a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRun {
    pub name: String,
    pub model_id: String,
    pub tool_id: Option<String>,
}

impl NewRun {
    pub fn new(name: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model_id: model_id.into(),
            tool_id: None,
        }
    }

    #[must_use]
    pub fn with_tool(mut self, tool_id: impl Into<String>) -> Self {
        self.tool_id = Some(tool_id.into());
        self
    }
}
