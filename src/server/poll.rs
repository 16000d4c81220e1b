use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::lifecycle::ExecutionManager;
use super::retry::RetryPolicy;
use crate::command::{describe_error, CommandResult, ExecutionRequest};
use crate::orchestrator::protocol::{CommandEnvelope, CommandType};
use crate::orchestrator::OrchestratorClient;

/// Long-polls the orchestrator for commands and routes each one.
///
/// Exactly one poll request is outstanding at a time. Execution runs on
/// separate tasks, so a slow command never delays the next poll.
pub struct CommandPoller {
    client: Arc<OrchestratorClient>,
    manager: Arc<ExecutionManager>,
    server_name: String,
    backoff: Duration,
    retry: RetryPolicy,
}

impl CommandPoller {
    pub fn new(
        client: Arc<OrchestratorClient>,
        manager: Arc<ExecutionManager>,
        server_name: impl Into<String>,
        backoff: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            manager,
            server_name: server_name.into(),
            backoff,
            retry,
        }
    }

    /// Polls until `shutdown` fires. Cancellation is observed between polls
    /// and during the back-off sleep; a poll already on the wire completes.
    pub async fn run(&self, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            let body = match self.client.take_pending_command(&self.server_name).await {
                Ok(Some(body)) => body,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(
                        server = %self.server_name,
                        error = %e,
                        "Poll failed, retrying in {:?}",
                        self.backoff
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.backoff) => continue,
                    }
                }
            };

            match CommandEnvelope::decode(&body) {
                Ok(Some(envelope)) => self.dispatch(envelope).await,
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Ignoring undecodable command"),
            }
        }

        tracing::debug!(server = %self.server_name, "Poll loop stopped");
    }

    /// Routes one decoded command.
    pub async fn dispatch(&self, envelope: CommandEnvelope) {
        tracing::debug!(
            command = %envelope.command_type,
            execution_id = %envelope.execution_id,
            "Received command"
        );

        match envelope.command_type {
            CommandType::StartExecution => self.start(envelope).await,
            CommandType::StopExecution => {
                if envelope.execution_id.is_empty() {
                    tracing::warn!("Ignoring stopExecution without an execution id");
                    return;
                }
                self.manager.stop(&envelope.execution_id).await;
            }
            CommandType::UpdateFiles => self.acknowledge_update_files().await,
            CommandType::Unknown => {
                tracing::warn!(execution_id = %envelope.execution_id, "Ignoring unknown command type");
            }
        }
    }

    async fn start(&self, envelope: CommandEnvelope) {
        if envelope.execution_id.is_empty() {
            tracing::warn!("Ignoring startExecution without an execution id");
            return;
        }
        if self.manager.tracker().is_in_flight(&envelope.execution_id) {
            tracing::warn!(execution_id = %envelope.execution_id, "Execution already in flight, ignoring duplicate start");
            return;
        }

        let mut request = ExecutionRequest {
            execution_id: envelope.execution_id,
            test_path: envelope.test_path,
            test_arguments: envelope.test_arguments,
            user_name: envelope.user_name,
            reservation_id: envelope.reservation_id,
            reservation_json: String::new(),
        };

        if !request.reservation_id.is_empty() {
            match self.client.fetch_reservation(&request.reservation_id).await {
                Ok(json) => request.reservation_json = json,
                Err(e) => {
                    tracing::error!(
                        execution_id = %request.execution_id,
                        reservation_id = %request.reservation_id,
                        error = %e,
                        "Reservation lookup failed"
                    );
                    let result =
                        CommandResult::error("Reservation lookup failed", describe_error(&e));
                    self.manager.reject(&request.execution_id, result);
                    return;
                }
            }
        }

        self.manager.dispatch(request);
    }

    async fn acknowledge_update_files(&self) {
        tracing::info!(server = %self.server_name, "Acknowledging file update");
        let acked = self
            .retry
            .run("File update acknowledgement", "", || {
                self.client.update_files_ended(&self.server_name)
            })
            .await;
        if let Err(e) = acked {
            tracing::error!(server = %self.server_name, error = %e, "Failed to acknowledge file update");
        }
    }
}
