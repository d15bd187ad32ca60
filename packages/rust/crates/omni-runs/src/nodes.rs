//! CLI command handlers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use omni_runs::{
    Message, NewMessage, NewModel, NewRun, NewToolContract, Provider, Run, RunError, RunEvent,
    RunScheduler, RunStatus, RuntimeSettings,
};

pub(crate) struct RunCommandRequest {
    pub(crate) provider: Provider,
    pub(crate) model: String,
    pub(crate) prompt: String,
    pub(crate) system: Option<String>,
    pub(crate) tool_schema: Option<PathBuf>,
    pub(crate) tool_name: String,
    pub(crate) name: String,
}

#[derive(Debug, Deserialize)]
struct BatchFile {
    runs: Vec<BatchEntry>,
}

#[derive(Debug, Deserialize)]
struct BatchEntry {
    name: String,
    #[serde(default = "default_provider")]
    provider: String,
    model: String,
    #[serde(default)]
    system: Option<String>,
    prompt: String,
    #[serde(default)]
    tool: Option<BatchTool>,
}

#[derive(Debug, Deserialize)]
struct BatchTool {
    name: String,
    #[serde(default)]
    description: Option<String>,
    schema: serde_json::Value,
}

fn default_provider() -> String {
    Provider::OpenAi.as_str().to_string()
}

#[derive(Debug, Serialize)]
struct RunReport {
    run: Run,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<Message>,
}

#[derive(Debug, Serialize)]
struct BatchSummary {
    total: usize,
    succeeded: usize,
    failed: usize,
    runs: Vec<RunReport>,
}

async fn start_scheduler(
    settings: &RuntimeSettings,
    max_concurrent: Option<usize>,
) -> Result<Arc<RunScheduler>> {
    let mut config = settings.scheduler_config();
    if let Some(max_concurrent) = max_concurrent {
        config.max_concurrent_runs = max_concurrent.max(1);
    }
    let store = settings.build_store()?;
    let scheduler = RunScheduler::start(store, settings.backend_registry(), config).await?;
    tracing::debug!(
        event = RunEvent::CliSchedulerStarted.as_str(),
        instance_id = scheduler.instance_id(),
        max_concurrent_runs = scheduler.config().max_concurrent_runs,
        run_timeout_secs = scheduler.config().run_timeout_secs,
        "run scheduler started"
    );
    Ok(scheduler)
}

async fn report(scheduler: &RunScheduler, run_id: &str) -> Result<RunReport> {
    let run = scheduler.get_run(run_id).await?;
    let response = scheduler.response_message(&run).await?;
    Ok(RunReport { run, response })
}

fn read_tool_schema(path: &Path) -> Result<serde_json::Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read tool schema {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("tool schema {} is not valid JSON", path.display()))
}

pub(crate) async fn run_single_mode(
    request: RunCommandRequest,
    max_concurrent: Option<usize>,
    settings: &RuntimeSettings,
) -> Result<()> {
    let scheduler = start_scheduler(settings, max_concurrent).await?;
    let model = scheduler
        .create_model(NewModel::new(request.provider, request.model))
        .await?;
    let mut new_run = NewRun::new(request.name, model.id);
    if let Some(path) = request.tool_schema.as_deref() {
        let schema = read_tool_schema(path)?;
        let tool = scheduler
            .create_tool(NewToolContract::new(request.tool_name, schema))
            .await?;
        new_run = new_run.with_tool(tool.id);
    }
    let run = scheduler.create_run(new_run).await?;
    if let Some(system) = request.system {
        scheduler
            .append_message(&run.id, NewMessage::system(system))
            .await?;
    }
    scheduler
        .append_message(&run.id, NewMessage::user(request.prompt))
        .await?;

    let outcome = tokio::select! {
        outcome = scheduler.invoke(&run.id) => outcome,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!(
                event = RunEvent::CliInterrupted.as_str(),
                run_id = %run.id,
                "interrupt received; cancelling run"
            );
            scheduler.cancel(&run.id).await
        }
    };
    match outcome {
        Ok(_) | Err(RunError::Execution { .. }) => {}
        Err(error) => return Err(error.into()),
    }
    let report = report(&scheduler, &run.id).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.run.status != RunStatus::Success {
        anyhow::bail!(
            "run {} ended in {}: {}",
            report.run.id,
            report.run.status,
            report.run.error.unwrap_or_default()
        );
    }
    Ok(())
}

pub(crate) async fn run_batch_mode(
    file: &Path,
    max_concurrent: Option<usize>,
    settings: &RuntimeSettings,
) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read batch file {}", file.display()))?;
    let batch: BatchFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse batch file {}", file.display()))?;
    let scheduler = start_scheduler(settings, max_concurrent).await?;

    let mut models: HashMap<(Provider, String), String> = HashMap::new();
    let mut run_ids = Vec::with_capacity(batch.runs.len());
    for entry in batch.runs {
        let provider: Provider = entry
            .provider
            .parse()
            .map_err(|error: String| anyhow::anyhow!("run `{}`: {error}", entry.name))?;
        let model_key = (provider, entry.model.clone());
        let model_id = match models.get(&model_key) {
            Some(id) => id.clone(),
            None => {
                let model = scheduler
                    .create_model(NewModel::new(provider, entry.model))
                    .await?;
                models.insert(model_key, model.id.clone());
                model.id
            }
        };
        let mut new_run = NewRun::new(entry.name, model_id);
        if let Some(tool) = entry.tool {
            let mut contract = NewToolContract::new(tool.name, tool.schema);
            if let Some(description) = tool.description {
                contract = contract.with_description(description);
            }
            new_run = new_run.with_tool(scheduler.create_tool(contract).await?.id);
        }
        let run = scheduler.create_run(new_run).await?;
        if let Some(system) = entry.system {
            scheduler
                .append_message(&run.id, NewMessage::system(system))
                .await?;
        }
        scheduler
            .append_message(&run.id, NewMessage::user(entry.prompt))
            .await?;
        run_ids.push(run.id);
    }

    for run_id in &run_ids {
        scheduler.enqueue(run_id).await?;
    }
    let mut waiters = JoinSet::new();
    for run_id in run_ids.iter().cloned() {
        let scheduler = Arc::clone(&scheduler);
        waiters.spawn(async move { scheduler.invoke(&run_id).await });
    }
    while let Some(joined) = waiters.join_next().await {
        match joined {
            Ok(Ok(_) | Err(RunError::Execution { .. })) => {}
            Ok(Err(error)) => tracing::warn!(
                event = RunEvent::CliBatchWaiterFailed.as_str(),
                error = %error,
                "batch waiter failed"
            ),
            Err(error) => tracing::error!(
                event = RunEvent::CliBatchWaiterFailed.as_str(),
                error = %error,
                "batch waiter crashed"
            ),
        }
    }

    let mut runs = Vec::with_capacity(run_ids.len());
    for run_id in &run_ids {
        runs.push(report(&scheduler, run_id).await?);
    }
    let succeeded = runs
        .iter()
        .filter(|report| report.run.status == RunStatus::Success)
        .count();
    let summary = BatchSummary {
        total: runs.len(),
        succeeded,
        failed: runs.len() - succeeded,
        runs,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
