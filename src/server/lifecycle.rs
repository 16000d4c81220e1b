//! Execution units and the stop path.
//!
//! A handler fault is reported with its display text followed by its source
//! chain. The chain stands in for a stack trace; no backtrace is captured.

use std::any::Any;
use std::sync::Arc;

use tokio::task::{JoinError, JoinHandle};

use super::retry::RetryPolicy;
use super::tracker::{ExecutionTracker, InFlightGuard, StopDisposition};
use crate::command::{
    describe_error, CommandHandler, CommandResult, ExecutionRequest, HandlerResult,
};
use crate::orchestrator::OrchestratorClient;

/// Owns the path from an accepted StartExecution to its terminal report, and
/// the stop path that races it.
pub struct ExecutionManager {
    client: Arc<OrchestratorClient>,
    handler: Arc<dyn CommandHandler>,
    tracker: Arc<ExecutionTracker>,
    server_name: String,
    retry: RetryPolicy,
}

impl ExecutionManager {
    pub fn new(
        client: Arc<OrchestratorClient>,
        handler: Arc<dyn CommandHandler>,
        server_name: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            handler,
            tracker: ExecutionTracker::new(),
            server_name: server_name.into(),
            retry,
        }
    }

    pub fn tracker(&self) -> &Arc<ExecutionTracker> {
        &self.tracker
    }

    /// Marks the execution in flight and runs it on its own task. Returns
    /// `None` for an id that is already in flight.
    pub fn dispatch(self: &Arc<Self>, request: ExecutionRequest) -> Option<JoinHandle<()>> {
        let Some(guard) = self.tracker.begin(&request.execution_id) else {
            tracing::warn!(execution_id = %request.execution_id, "Execution already in flight, ignoring duplicate start");
            return None;
        };
        tracing::info!(execution_id = %request.execution_id, test_path = %request.test_path, "Execution accepted");

        let manager = Arc::clone(self);
        Some(tokio::spawn(async move { manager.run(request, guard).await }))
    }

    /// Reports `result` for an execution that never reached the handler.
    pub fn reject(
        self: &Arc<Self>,
        execution_id: &str,
        result: CommandResult,
    ) -> Option<JoinHandle<()>> {
        let Some(guard) = self.tracker.begin(execution_id) else {
            tracing::warn!(execution_id, "Execution already in flight, ignoring duplicate start");
            return None;
        };

        let manager = Arc::clone(self);
        Some(tokio::spawn(async move {
            if manager.tracker.claim_report(guard.execution_id()) {
                manager.report(guard.execution_id(), &result).await;
            }
        }))
    }

    async fn run(self: Arc<Self>, request: ExecutionRequest, guard: InFlightGuard) {
        let execution_id = guard.execution_id().to_string();
        let handler = Arc::clone(&self.handler);

        // A panicking handler only takes down this inner task.
        let outcome = tokio::spawn(async move { handler.execute_command(request).await }).await;

        if !self.tracker.claim_report(&execution_id) {
            tracing::info!(execution_id = %execution_id, "Execution ended after stop, result discarded");
            return;
        }

        let result = result_from_outcome(&execution_id, outcome);
        self.report(&execution_id, &result).await;
        drop(guard);
    }

    /// Sends the terminal report, then uploads the attached report if any.
    async fn report(&self, execution_id: &str, result: &CommandResult) {
        tracing::info!(execution_id, result = %result, "Reporting finished execution");

        let sent = self
            .retry
            .run("Finished execution report", execution_id, || {
                self.client
                    .finished_execution(&self.server_name, execution_id, result)
            })
            .await;
        if let Err(e) = sent {
            tracing::error!(execution_id, error = %e, "Failed to report finished execution");
            return;
        }

        let Some(report) = result.report() else {
            return;
        };
        let uploaded = self
            .retry
            .run("Report upload", execution_id, || {
                self.client
                    .upload_report(&self.server_name, execution_id, report)
            })
            .await;
        match uploaded {
            Ok(()) => tracing::debug!(execution_id, filename = %report.filename, bytes = report.data.len(), "Report uploaded"),
            Err(e) => tracing::error!(execution_id, filename = %report.filename, error = %e, "Failed to upload report"),
        }
    }

    /// Handles a StopExecution command.
    ///
    /// The stop hook always runs. A Stopped report is sent unless the unit
    /// already owns the terminal report or an earlier stop sent it.
    pub async fn stop(&self, execution_id: &str) {
        let disposition = self.tracker.request_stop(execution_id);
        tracing::info!(execution_id, ?disposition, "Stop requested");

        let handler = Arc::clone(&self.handler);
        let id = execution_id.to_string();
        if let Err(e) = tokio::spawn(async move { handler.stop_command(&id).await }).await {
            tracing::error!(execution_id, error = %e, "Stop hook failed");
        }

        match disposition {
            StopDisposition::Report | StopDisposition::Untracked => {
                self.report(execution_id, &CommandResult::Stopped).await;
            }
            StopDisposition::Duplicate => {
                tracing::debug!(execution_id, "Stopped already reported");
            }
            StopDisposition::AlreadyReporting | StopDisposition::Finished => {
                tracing::debug!(execution_id, "Execution finished before the stop arrived");
            }
        }
    }
}

/// Turns whatever the handler task produced into the terminal result.
fn result_from_outcome(
    execution_id: &str,
    outcome: Result<HandlerResult, JoinError>,
) -> CommandResult {
    match outcome {
        Ok(Ok(Some(result))) => result,
        Ok(Ok(None)) => CommandResult::error(
            "Internal error",
            "Command handler must return a result or fail",
        ),
        Ok(Err(e)) => {
            tracing::error!(execution_id, error = %e, "Command handler failed");
            CommandResult::error("Unhandled handler error", describe_error(e.as_ref()))
        }
        Err(e) => {
            let message = panic_message(e);
            tracing::error!(execution_id, panic = %message, "Command handler panicked");
            CommandResult::error("Handler panicked", message)
        }
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
