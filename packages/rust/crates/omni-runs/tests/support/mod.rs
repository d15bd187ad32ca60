//! Shared scheduler fixtures: scripted backend, in-memory scheduler, run seeding.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use omni_runs::{
    BackendClient, BackendRegistry, Completion, InvocationRequest, JobStore, MemoryJobStore,
    Message, MessageRole, ModelDescriptor, NewMessage, NewModel, NewRun, NewToolContract,
    Provider, Run, RunScheduler, RunStatus, SchedulerConfig, ToolContract,
};

type Responder = Box<dyn Fn(&str, &InvocationRequest<'_>) -> Result<Completion> + Send + Sync>;

/// Observations recorded by [`ScriptedBackend`].
#[derive(Default)]
pub struct BackendStats {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    invocations: AtomicUsize,
    started: Mutex<Vec<String>>,
}

impl BackendStats {
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Prompts in the order their invocations started.
    pub fn started(&self) -> Vec<String> {
        self.started
            .lock()
            .map(|started| started.clone())
            .unwrap_or_default()
    }
}

struct InFlight<'a>(&'a BackendStats);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Backend that sleeps for `delay`, then answers through a responder keyed
/// on the last user prompt.
pub struct ScriptedBackend {
    delay: Duration,
    responder: Responder,
    stats: Arc<BackendStats>,
}

impl ScriptedBackend {
    pub fn new(
        delay: Duration,
        responder: impl Fn(&str, &InvocationRequest<'_>) -> Result<Completion> + Send + Sync + 'static,
    ) -> Self {
        Self {
            delay,
            responder: Box::new(responder),
            stats: Arc::new(BackendStats::default()),
        }
    }

    /// Free-text reply `echo: <prompt>`.
    pub fn echo(delay: Duration) -> Self {
        Self::new(delay, |prompt, _| {
            Ok(Completion::Text(format!("echo: {prompt}")))
        })
    }

    pub fn stats(&self) -> Arc<BackendStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl BackendClient for ScriptedBackend {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Completion> {
        let prompt = last_user_prompt(request.transcript);
        self.stats.invocations.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut started) = self.stats.started.lock() {
            started.push(prompt.clone());
        }
        let now = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.stats);
        tokio::time::sleep(self.delay).await;
        (self.responder)(&prompt, &request)
    }
}

pub fn last_user_prompt(transcript: &[Message]) -> String {
    transcript
        .iter()
        .rev()
        .find(|message| message.role == MessageRole::User)
        .map(|message| message.content.clone())
        .unwrap_or_default()
}

/// In-memory store that rejects a scripted number of `save_run` calls.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryJobStore,
    terminal_failures: AtomicUsize,
    pending_failures: AtomicUsize,
}

impl FlakyStore {
    /// Reject the next `count` saves of a terminal run.
    pub fn fail_terminal_saves(&self, count: usize) {
        self.terminal_failures.store(count, Ordering::SeqCst);
    }

    /// Reject the next `count` saves of a pending run.
    pub fn fail_pending_saves(&self, count: usize) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl JobStore for FlakyStore {
    fn backend_name(&self) -> &'static str {
        "flaky"
    }

    async fn create_model(&self, model: NewModel) -> Result<ModelDescriptor> {
        self.inner.create_model(model).await
    }

    async fn get_model(&self, model_id: &str) -> Result<Option<ModelDescriptor>> {
        self.inner.get_model(model_id).await
    }

    async fn create_tool(&self, tool: NewToolContract) -> Result<ToolContract> {
        self.inner.create_tool(tool).await
    }

    async fn get_tool(&self, tool_id: &str) -> Result<Option<ToolContract>> {
        self.inner.get_tool(tool_id).await
    }

    async fn create_run(&self, run: NewRun) -> Result<Run> {
        self.inner.create_run(run).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        self.inner.get_run(run_id).await
    }

    async fn save_run(&self, run: &Run) -> Result<()> {
        if run.is_terminal() && take_one(&self.terminal_failures) {
            bail!("connection reset while saving run {}", run.id);
        }
        if run.status == RunStatus::Pending && take_one(&self.pending_failures) {
            bail!("connection reset while saving run {}", run.id);
        }
        self.inner.save_run(run).await
    }

    async fn list_runs(&self, status: RunStatus) -> Result<Vec<Run>> {
        self.inner.list_runs(status).await
    }

    async fn claim_oldest_pending(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Run>> {
        self.inner.claim_oldest_pending(owner, now, lease_until).await
    }

    async fn renew_lease(
        &self,
        run_id: &str,
        owner: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        self.inner.renew_lease(run_id, owner, lease_until).await
    }

    async fn append_message(&self, run_id: &str, message: NewMessage) -> Result<Message> {
        self.inner.append_message(run_id, message).await
    }

    async fn list_messages(&self, run_id: &str) -> Result<Vec<Message>> {
        self.inner.list_messages(run_id).await
    }
}

pub fn config(max_concurrent_runs: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent_runs,
        heartbeat_interval_secs: 3_600,
        ..SchedulerConfig::default()
    }
}

pub struct Harness {
    pub scheduler: Arc<RunScheduler>,
    pub store: Arc<dyn JobStore>,
    pub stats: Arc<BackendStats>,
    pub model: ModelDescriptor,
}

/// Scheduler over an in-memory store with `backend` serving OpenAI models.
/// No sweep task; admission runs on event triggers only.
pub async fn harness(backend: ScriptedBackend, config: SchedulerConfig) -> Harness {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    harness_with_store(backend, config, store, false).await
}

pub async fn harness_with_store(
    backend: ScriptedBackend,
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    start: bool,
) -> Harness {
    let stats = backend.stats();
    let backends = BackendRegistry::new().with_client(Provider::OpenAi, Arc::new(backend));
    let scheduler = if start {
        RunScheduler::start(Arc::clone(&store), backends, config)
            .await
            .expect("scheduler should start")
    } else {
        RunScheduler::new(Arc::clone(&store), backends, config)
    };
    let model = scheduler
        .create_model(NewModel::new(Provider::OpenAi, "gpt-4o-mini"))
        .await
        .expect("model should be created");
    Harness {
        scheduler,
        store,
        stats,
        model,
    }
}

impl Harness {
    /// Draft run with a single user message.
    pub async fn prompt_run(&self, prompt: &str) -> Run {
        self.prompt_run_with(NewRun::new(prompt, &self.model.id), prompt)
            .await
    }

    pub async fn prompt_run_with(&self, run: NewRun, prompt: &str) -> Run {
        let run = self
            .scheduler
            .create_run(run)
            .await
            .expect("run should be created");
        self.scheduler
            .append_message(&run.id, NewMessage::user(prompt))
            .await
            .expect("prompt should be appended");
        run
    }

    pub async fn status(&self, run_id: &str) -> RunStatus {
        self.scheduler
            .get_run(run_id)
            .await
            .expect("run should exist")
            .status
    }

    pub async fn count(&self, status: RunStatus) -> usize {
        self.store
            .list_runs(status)
            .await
            .expect("list runs should succeed")
            .len()
    }
}
