//! In-memory job store (single process, default backend).

use std::collections::HashMap;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::model::{
    Message, ModelDescriptor, NewMessage, NewModel, NewRun, NewToolContract, Run, RunStatus,
    ToolContract,
};

use super::{JobStore, new_record_id};

#[derive(Default)]
struct MemoryState {
    models: HashMap<String, ModelDescriptor>,
    tools: HashMap<String, ToolContract>,
    runs: HashMap<String, Run>,
    messages: HashMap<String, Vec<Message>>,
    next_seq: u64,
}

/// Job store backed by process memory.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: RwLock<MemoryState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn create_model(&self, model: NewModel) -> Result<ModelDescriptor> {
        let descriptor = ModelDescriptor {
            id: new_record_id(),
            provider: model.provider,
            concrete_name: model.concrete_name,
        };
        self.inner
            .write()
            .await
            .models
            .insert(descriptor.id.clone(), descriptor.clone());
        Ok(descriptor)
    }

    async fn get_model(&self, model_id: &str) -> Result<Option<ModelDescriptor>> {
        Ok(self.inner.read().await.models.get(model_id).cloned())
    }

    async fn create_tool(&self, tool: NewToolContract) -> Result<ToolContract> {
        let contract = ToolContract {
            id: new_record_id(),
            name: tool.name,
            description: tool.description,
            schema: tool.schema,
        };
        self.inner
            .write()
            .await
            .tools
            .insert(contract.id.clone(), contract.clone());
        Ok(contract)
    }

    async fn get_tool(&self, tool_id: &str) -> Result<Option<ToolContract>> {
        Ok(self.inner.read().await.tools.get(tool_id).cloned())
    }

    async fn create_run(&self, run: NewRun) -> Result<Run> {
        let mut state = self.inner.write().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        let record = Run {
            id: new_record_id(),
            name: run.name,
            model_id: run.model_id,
            tool_id: run.tool_id,
            status: RunStatus::Draft,
            response: None,
            error: None,
            created_at: Utc::now(),
            seq,
            start_time: None,
            end_time: None,
            owner: None,
            lease_expires_at: None,
        };
        state.runs.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        Ok(self.inner.read().await.runs.get(run_id).cloned())
    }

    async fn save_run(&self, run: &Run) -> Result<()> {
        let mut state = self.inner.write().await;
        let Some(slot) = state.runs.get_mut(&run.id) else {
            bail!("cannot save unknown run {}", run.id);
        };
        *slot = run.clone();
        Ok(())
    }

    async fn list_runs(&self, status: RunStatus) -> Result<Vec<Run>> {
        let state = self.inner.read().await;
        let mut runs: Vec<Run> = state
            .runs
            .values()
            .filter(|run| run.status == status)
            .cloned()
            .collect();
        runs.sort_by_key(|run| run.seq);
        Ok(runs)
    }

    async fn claim_oldest_pending(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Run>> {
        let mut state = self.inner.write().await;
        let Some(run) = state
            .runs
            .values_mut()
            .filter(|run| run.status == RunStatus::Pending)
            .min_by_key(|run| run.seq)
        else {
            return Ok(None);
        };
        run.mark_running(owner, now, lease_until)?;
        Ok(Some(run.clone()))
    }

    async fn renew_lease(
        &self,
        run_id: &str,
        owner: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.inner.write().await;
        match state.runs.get_mut(run_id) {
            Some(run) if run.status == RunStatus::Running && run.owner.as_deref() == Some(owner) => {
                run.lease_expires_at = Some(lease_until);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_message(&self, run_id: &str, message: NewMessage) -> Result<Message> {
        let mut state = self.inner.write().await;
        if !state.runs.contains_key(run_id) {
            bail!("cannot append message to unknown run {run_id}");
        }
        let record = Message {
            id: new_record_id(),
            run_id: run_id.to_string(),
            role: message.role,
            content: message.content,
            tool_calls: message.tool_calls,
            tool_call_id: message.tool_call_id,
            created_at: Utc::now(),
        };
        state
            .messages
            .entry(run_id.to_string())
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn list_messages(&self, run_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .inner
            .read()
            .await
            .messages
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }
}
