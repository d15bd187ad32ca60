//! Job store: durable Runs, Messages, Tools and Models.
//!
//! Admission goes through [`JobStore::claim_oldest_pending`], a store-level
//! compare-and-set, so schedulers in different processes sharing one store
//! never admit the same `pending` run twice. The claim stamps an owner and a
//! lease; recovery only reclaims `running` runs whose lease has expired.

mod memory;
mod valkey;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{
    Message, ModelDescriptor, NewMessage, NewModel, NewRun, NewToolContract, Run, RunStatus,
    ToolContract,
};

pub use memory::MemoryJobStore;
pub use valkey::{DEFAULT_VALKEY_KEY_PREFIX, ValkeyJobStore};

/// Storage capability consumed by the scheduler and collaborators.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Short backend label for logs (`memory`, `valkey`).
    fn backend_name(&self) -> &'static str;

    async fn create_model(&self, model: NewModel) -> Result<ModelDescriptor>;

    async fn get_model(&self, model_id: &str) -> Result<Option<ModelDescriptor>>;

    async fn create_tool(&self, tool: NewToolContract) -> Result<ToolContract>;

    async fn get_tool(&self, tool_id: &str) -> Result<Option<ToolContract>>;

    /// Persist a new `draft` run with a fresh id and creation sequence.
    async fn create_run(&self, run: NewRun) -> Result<Run>;

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>>;

    /// Overwrite the stored run record (status indexes included).
    async fn save_run(&self, run: &Run) -> Result<()>;

    /// Runs in `status`, oldest creation sequence first.
    async fn list_runs(&self, status: RunStatus) -> Result<Vec<Run>>;

    /// Atomically move the oldest `pending` run to `running` under `owner`.
    ///
    /// Among concurrent callers (in any process) exactly one wins a given run.
    async fn claim_oldest_pending(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Run>>;

    /// Extend the lease of a run still `running` under `owner`.
    ///
    /// Returns `false` once the run left `running` or changed owner.
    async fn renew_lease(
        &self,
        run_id: &str,
        owner: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(mut run) = self.get_run(run_id).await? else {
            return Ok(false);
        };
        if run.status != RunStatus::Running || run.owner.as_deref() != Some(owner) {
            return Ok(false);
        }
        run.lease_expires_at = Some(lease_until);
        self.save_run(&run).await?;
        Ok(true)
    }

    /// Append to the run transcript; insertion order is transcript order.
    async fn append_message(&self, run_id: &str, message: NewMessage) -> Result<Message>;

    async fn list_messages(&self, run_id: &str) -> Result<Vec<Message>>;

    async fn get_message(&self, run_id: &str, message_id: &str) -> Result<Option<Message>> {
        Ok(self
            .list_messages(run_id)
            .await?
            .into_iter()
            .find(|message| message.id == message_id))
    }
}

pub(crate) fn new_record_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
