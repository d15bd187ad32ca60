//! Execution of one admitted run: backend dispatch, result materialization,
//! terminal transition, waiter notification.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

use crate::backend::{Completion, InvocationRequest};
use crate::error::{RunError, RunResult};
use crate::model::{NewMessage, Run, ToolContract};
use crate::observability::RunEvent;

use super::RunScheduler;
use super::admission::SlotGuard;

type QueueFuture<'a> = Pin<Box<dyn Future<Output = usize> + Send + 'a>>;

/// Turn a backend completion into the terminal assistant message.
///
/// A tooled run must come back with at least one call matching its contract;
/// a free-text run must come back with text.
pub fn materialize_completion(
    completion: Completion,
    contract: Option<&ToolContract>,
) -> RunResult<NewMessage> {
    match (completion, contract) {
        (Completion::Text(text), None) => Ok(NewMessage::assistant(text)),
        (Completion::ToolCalls(calls), Some(contract)) => {
            contract
                .check_calls(&calls)
                .map_err(RunError::ContractViolation)?;
            Ok(NewMessage::assistant("").with_tool_calls(calls))
        }
        (Completion::Text(_), Some(contract)) => Err(RunError::ContractViolation(format!(
            "tool `{}` expected a structured call, backend returned text",
            contract.name
        ))),
        (Completion::ToolCalls(calls), None) => Err(RunError::ContractViolation(format!(
            "free-text run received {} tool call(s) without a contract",
            calls.len()
        ))),
    }
}

impl RunScheduler {
    pub(super) async fn execute(
        self: Arc<Self>,
        run: Run,
        mut slot: SlotGuard,
        cancel: oneshot::Receiver<()>,
    ) {
        let outcome = tokio::select! {
            result = tokio::time::timeout(self.config.run_timeout(), self.dispatch(&run)) => {
                Some(result.unwrap_or(Err(RunError::TimedOut(self.config.run_timeout_secs))))
            }
            Ok(()) = cancel => Some(Err(RunError::Cancelled)),
            () = self.hold_lease(&run.id) => None,
        };
        slot.disarm_cancel();

        // Without the lease the run belongs to whoever reclaimed it.
        if let Some(outcome) = outcome {
            let finished = self.finalize(run, outcome).await;
            drop(slot);
            self.notify_waiters(&finished).await;
        } else {
            drop(slot);
        }
        if self.config.event_triggers {
            self.completion_trigger().await;
        }
    }

    /// Completion-side admission, boxed so spawned executions do not embed
    /// their own future type.
    fn completion_trigger(self: &Arc<Self>) -> QueueFuture<'_> {
        Box::pin(self.process_queue())
    }

    /// Renew the run's lease until ownership is lost; returns only then.
    async fn hold_lease(&self, run_id: &str) {
        let mut ticker = tokio::time::interval(self.config.lease_renew_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let lease_until = Utc::now() + self.config.lease_ttl();
            match self
                .store
                .renew_lease(run_id, &self.instance_id, lease_until)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(
                        event = RunEvent::RunLeaseLost.as_str(),
                        run_id,
                        owner = %self.instance_id,
                        "run lease lost; abandoning execution"
                    );
                    return;
                }
                Err(error) => {
                    tracing::warn!(
                        event = RunEvent::RunLeaseLost.as_str(),
                        run_id,
                        error = %format!("{error:#}"),
                        "run lease renewal failed; retrying"
                    );
                }
            }
        }
    }

    async fn dispatch(&self, run: &Run) -> RunResult<NewMessage> {
        let model = self.require_model(&run.model_id).await?;
        let client = self.backends.resolve(&model)?;
        let transcript = self
            .store
            .list_messages(&run.id)
            .await
            .map_err(|e| RunError::store(&e))?;
        let contract = match run.tool_id.as_deref() {
            Some(tool_id) => Some(self.require_tool(tool_id).await?),
            None => None,
        };
        tracing::debug!(
            event = RunEvent::BackendInvoked.as_str(),
            run_id = %run.id,
            provider = %model.provider,
            model = %model.concrete_name,
            messages = transcript.len(),
            tool = contract.as_ref().map(|contract| contract.name.as_str()),
            "backend invoked"
        );
        let completion = client
            .invoke(InvocationRequest {
                model: &model.concrete_name,
                transcript: &transcript,
                contract: contract.as_ref(),
            })
            .await
            .map_err(|e| RunError::backend(&e))?;
        materialize_completion(completion, contract.as_ref())
    }

    /// Record the outcome on the run and return the terminal record.
    ///
    /// If the terminal record cannot be persisted, one more attempt records
    /// the store failure as the run's error. The returned run is terminal
    /// either way, so waiters are always released.
    async fn finalize(&self, run: Run, outcome: RunResult<NewMessage>) -> Run {
        let outcome = match outcome {
            Ok(message) => self
                .store
                .append_message(&run.id, message)
                .await
                .map_err(|e| RunError::store(&e)),
            Err(error) => Err(error),
        };
        let now = Utc::now();
        let mut finished = run.clone();
        let recorded = match outcome {
            Ok(message) => {
                tracing::info!(
                    event = RunEvent::RunSucceeded.as_str(),
                    run_id = %run.id,
                    duration_ms = elapsed_ms(&run, now),
                    "run succeeded"
                );
                finished.mark_succeeded(message.id, now)
            }
            Err(error) => {
                let event = if error == RunError::Cancelled {
                    RunEvent::RunCancelled
                } else {
                    RunEvent::RunFailed
                };
                tracing::warn!(
                    event = event.as_str(),
                    run_id = %run.id,
                    duration_ms = elapsed_ms(&run, now),
                    error = %error,
                    "run failed"
                );
                finished.mark_failed(error.to_string(), now)
            }
        };
        let persisted = match recorded {
            Ok(()) => self.save_run(&finished).await,
            Err(error) => Err(error),
        };
        let Err(error) = persisted else {
            return finished;
        };

        tracing::error!(
            event = RunEvent::RunFinalizeFailed.as_str(),
            run_id = %run.id,
            status = %finished.status,
            error = %error,
            "failed to persist terminal run; recording store failure"
        );
        let mut failed = run;
        let retried = match failed.mark_failed(error.to_string(), Utc::now()) {
            Ok(()) => self.save_run(&failed).await,
            Err(transition) => Err(transition),
        };
        if let Err(error) = retried {
            tracing::error!(
                event = RunEvent::RunFinalizeFailed.as_str(),
                run_id = %failed.id,
                error = %error,
                "failed to persist store failure; run stays running until its lease expires"
            );
        }
        failed
    }
}

fn elapsed_ms(run: &Run, now: DateTime<Utc>) -> i64 {
    run.start_time
        .map_or(0, |start| (now - start).num_milliseconds())
}
