//! Redis/Valkey-backed job store for multi-process schedulers and restart recovery.
//!
//! Claims are decided by `ZREM` on the pending index: only the caller whose
//! `ZREM` removed the id owns the `pending -> running` transition.
//!
//! Layout under `key_prefix`:
//! - `:model:<id>`, `:tool:<id>`, `:run:<id>`: JSON documents
//! - `:messages:<run_id>`: transcript list (RPUSH order)
//! - `:status:<status>`: sorted set of run ids scored by creation sequence
//! - `:seq`: creation sequence counter

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::FromRedisValue;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::model::{
    Message, ModelDescriptor, NewMessage, NewModel, NewRun, NewToolContract, Run, RunStatus,
    ToolContract,
};
use crate::observability::RunEvent;

use super::{JobStore, new_record_id};

pub const DEFAULT_VALKEY_KEY_PREFIX: &str = "omni-runs";

/// Job store persisted in Valkey/Redis.
#[derive(Debug)]
pub struct ValkeyJobStore {
    client: redis::Client,
    key_prefix: String,
    connection: Arc<Mutex<Option<redis::aio::MultiplexedConnection>>>,
}

impl ValkeyJobStore {
    pub fn new(url: &str, key_prefix: Option<String>) -> Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("invalid redis url for job store: {url}"))?;
        let key_prefix = key_prefix
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_VALKEY_KEY_PREFIX.to_string());
        Ok(Self {
            client,
            key_prefix,
            connection: Arc::new(Mutex::new(None)),
        })
    }

    fn model_key(&self, model_id: &str) -> String {
        format!("{}:model:{}", self.key_prefix, model_id)
    }

    fn tool_key(&self, tool_id: &str) -> String {
        format!("{}:tool:{}", self.key_prefix, tool_id)
    }

    fn run_key(&self, run_id: &str) -> String {
        format!("{}:run:{}", self.key_prefix, run_id)
    }

    fn messages_key(&self, run_id: &str) -> String {
        format!("{}:messages:{}", self.key_prefix, run_id)
    }

    fn status_key(&self, status: RunStatus) -> String {
        format!("{}:status:{}", self.key_prefix, status.as_str())
    }

    fn seq_key(&self) -> String {
        format!("{}:seq", self.key_prefix)
    }

    async fn ensure_connection(
        &self,
        connection: &mut Option<redis::aio::MultiplexedConnection>,
    ) -> Result<()> {
        if connection.is_some() {
            return Ok(());
        }
        *connection = Some(
            self.client
                .get_multiplexed_async_connection()
                .await
                .context("failed to open redis connection for job store")?,
        );
        tracing::debug!(
            event = RunEvent::StoreValkeyConnected.as_str(),
            key_prefix = %self.key_prefix,
            "valkey job store connected"
        );
        Ok(())
    }

    async fn run_command<T, F>(&self, operation: &'static str, build: F) -> Result<T>
    where
        T: FromRedisValue + Send,
        F: Fn() -> redis::Cmd,
    {
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 0..2 {
            let mut conn_guard = self.connection.lock().await;
            self.ensure_connection(&mut conn_guard).await?;
            let conn = conn_guard
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("redis job store connection unavailable"))?;
            let result: redis::RedisResult<T> = build().query_async(conn).await;
            match result {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::debug!(
                            event = RunEvent::StoreValkeyCommandRetrySucceeded.as_str(),
                            operation,
                            attempt = attempt + 1,
                            "valkey command succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => {
                    tracing::warn!(
                        event = RunEvent::StoreValkeyCommandRetryFailed.as_str(),
                        operation,
                        attempt = attempt + 1,
                        error = %err,
                        "valkey command attempt failed; reconnecting"
                    );
                    *conn_guard = None;
                    last_err = Some(anyhow::anyhow!(err).context("redis command failed for job store"));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("redis command failed for unknown reason")))
    }

    async fn run_pipeline(&self, operation: &'static str, build: impl Fn() -> redis::Pipeline) -> Result<()> {
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 0..2 {
            let mut conn_guard = self.connection.lock().await;
            self.ensure_connection(&mut conn_guard).await?;
            let conn = conn_guard
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("redis job store connection unavailable"))?;
            let result: redis::RedisResult<()> = build().query_async(conn).await;
            match result {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        event = RunEvent::StoreValkeyCommandRetryFailed.as_str(),
                        operation,
                        attempt = attempt + 1,
                        error = %err,
                        "valkey pipeline attempt failed; reconnecting"
                    );
                    *conn_guard = None;
                    last_err =
                        Some(anyhow::anyhow!(err).context("redis pipeline failed for job store"));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("redis pipeline failed for unknown reason")))
    }

    async fn get_json<T: DeserializeOwned>(&self, operation: &'static str, key: &str) -> Result<Option<T>> {
        let payload = self
            .run_command::<Option<String>, _>(operation, || {
                let mut cmd = redis::cmd("GET");
                cmd.arg(key);
                cmd
            })
            .await?;
        payload
            .map(|raw| {
                serde_json::from_str(&raw)
                    .with_context(|| format!("invalid json payload in job store at {key}"))
            })
            .transpose()
    }

    async fn set_json<T: serde::Serialize>(&self, operation: &'static str, key: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_string(value).context("failed to encode job store record")?;
        self.run_command::<(), _>(operation, || {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(&payload);
            cmd
        })
        .await
    }
}

#[async_trait]
impl JobStore for ValkeyJobStore {
    fn backend_name(&self) -> &'static str {
        "valkey"
    }

    async fn create_model(&self, model: NewModel) -> Result<ModelDescriptor> {
        let descriptor = ModelDescriptor {
            id: new_record_id(),
            provider: model.provider,
            concrete_name: model.concrete_name,
        };
        self.set_json("create_model", &self.model_key(&descriptor.id), &descriptor)
            .await?;
        Ok(descriptor)
    }

    async fn get_model(&self, model_id: &str) -> Result<Option<ModelDescriptor>> {
        self.get_json("get_model", &self.model_key(model_id)).await
    }

    async fn create_tool(&self, tool: NewToolContract) -> Result<ToolContract> {
        let contract = ToolContract {
            id: new_record_id(),
            name: tool.name,
            description: tool.description,
            schema: tool.schema,
        };
        self.set_json("create_tool", &self.tool_key(&contract.id), &contract)
            .await?;
        Ok(contract)
    }

    async fn get_tool(&self, tool_id: &str) -> Result<Option<ToolContract>> {
        self.get_json("get_tool", &self.tool_key(tool_id)).await
    }

    async fn create_run(&self, run: NewRun) -> Result<Run> {
        let seq_key = self.seq_key();
        let seq = self
            .run_command::<u64, _>("next_run_seq", || {
                let mut cmd = redis::cmd("INCR");
                cmd.arg(&seq_key);
                cmd
            })
            .await?;
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
        self.save_run(&record).await?;
        Ok(record)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        self.get_json("get_run", &self.run_key(run_id)).await
    }

    async fn save_run(&self, run: &Run) -> Result<()> {
        let payload = serde_json::to_string(run).context("failed to encode run for redis")?;
        let run_key = self.run_key(&run.id);
        let status_keys: Vec<(RunStatus, String)> = RunStatus::ALL
            .into_iter()
            .map(|status| (status, self.status_key(status)))
            .collect();
        self.run_pipeline("save_run", || {
            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.cmd("SET").arg(&run_key).arg(&payload).ignore();
            for (status, key) in &status_keys {
                if *status == run.status {
                    pipe.cmd("ZADD").arg(key).arg(run.seq).arg(&run.id).ignore();
                } else {
                    pipe.cmd("ZREM").arg(key).arg(&run.id).ignore();
                }
            }
            pipe
        })
        .await
    }

    async fn list_runs(&self, status: RunStatus) -> Result<Vec<Run>> {
        let status_key = self.status_key(status);
        let run_ids = self
            .run_command::<Vec<String>, _>("list_runs", || {
                let mut cmd = redis::cmd("ZRANGE");
                cmd.arg(&status_key).arg(0).arg(-1);
                cmd
            })
            .await?;
        let mut runs = Vec::with_capacity(run_ids.len());
        for run_id in run_ids {
            match self.get_run(&run_id).await? {
                // The index may briefly disagree with the document under concurrent writers.
                Some(run) if run.status == status => runs.push(run),
                Some(_) | None => {}
            }
        }
        Ok(runs)
    }

    async fn claim_oldest_pending(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Run>> {
        let status_key = self.status_key(RunStatus::Pending);
        loop {
            let run_ids = self
                .run_command::<Vec<String>, _>("claim_peek", || {
                    let mut cmd = redis::cmd("ZRANGE");
                    cmd.arg(&status_key).arg(0).arg(0);
                    cmd
                })
                .await?;
            let Some(run_id) = run_ids.into_iter().next() else {
                return Ok(None);
            };
            let removed = self
                .run_command::<i64, _>("claim_take", || {
                    let mut cmd = redis::cmd("ZREM");
                    cmd.arg(&status_key).arg(&run_id);
                    cmd
                })
                .await?;
            if removed == 0 {
                tracing::debug!(
                    event = RunEvent::StoreValkeyClaimContended.as_str(),
                    run_id = %run_id,
                    owner,
                    "pending run claimed by another scheduler"
                );
                continue;
            }
            // The index can lag the document; a non-pending document is dropped from the index above.
            let Some(mut run) = self.get_run(&run_id).await? else {
                continue;
            };
            if run.status != RunStatus::Pending {
                continue;
            }
            run.mark_running(owner, now, lease_until)?;
            self.save_run(&run).await?;
            return Ok(Some(run));
        }
    }

    async fn append_message(&self, run_id: &str, message: NewMessage) -> Result<Message> {
        let record = Message {
            id: new_record_id(),
            run_id: run_id.to_string(),
            role: message.role,
            content: message.content,
            tool_calls: message.tool_calls,
            tool_call_id: message.tool_call_id,
            created_at: Utc::now(),
        };
        let payload =
            serde_json::to_string(&record).context("failed to encode message for redis")?;
        let key = self.messages_key(run_id);
        self.run_command::<i64, _>("append_message", || {
            let mut cmd = redis::cmd("RPUSH");
            cmd.arg(&key).arg(&payload);
            cmd
        })
        .await?;
        Ok(record)
    }

    async fn list_messages(&self, run_id: &str) -> Result<Vec<Message>> {
        let key = self.messages_key(run_id);
        let payloads = self
            .run_command::<Vec<String>, _>("list_messages", || {
                let mut cmd = redis::cmd("LRANGE");
                cmd.arg(&key).arg(0).arg(-1);
                cmd
            })
            .await?;
        payloads
            .iter()
            .map(|payload| {
                serde_json::from_str::<Message>(payload)
                    .with_context(|| format!("invalid message payload for run_id={run_id}"))
            })
            .collect()
    }
}
