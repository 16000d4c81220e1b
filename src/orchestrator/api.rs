//! Typed calls for each execution-API endpoint.

use reqwest::Method;

use super::protocol::*;
use super::{OrchestratorClient, Payload};
use crate::command::{sanitize_error_text, CommandResult, Report};
use crate::config::ServerIdentity;
use crate::error::Result;

/// Status the orchestrator uses for an empty poll.
pub const NO_CONTENT: u16 = 204;

impl OrchestratorClient {
    pub async fn register_server(&self, identity: &ServerIdentity) -> Result<()> {
        let payload = Payload::json(&RegisterRequest {
            name: &identity.name,
            description: &identity.description,
            server_type: &identity.server_type,
            capacity: identity.capacity,
        })?;
        self.request(Method::PUT, EXECUTION_SERVERS_PATH, payload).await?;
        Ok(())
    }

    pub async fn update_server(&self, identity: &ServerIdentity) -> Result<()> {
        let payload = Payload::json(&UpdateServerRequest {
            name: &identity.name,
            description: &identity.description,
            capacity: identity.capacity,
        })?;
        self.request(Method::POST, EXECUTION_SERVERS_PATH, payload).await?;
        Ok(())
    }

    pub async fn report_status(&self, server_name: &str, execution_ids: Vec<String>) -> Result<()> {
        let payload = Payload::json(&StatusRequest {
            name: server_name,
            execution_ids,
        })?;
        self.request(Method::POST, STATUS_PATH, payload).await?;
        Ok(())
    }

    /// Consumes one pending command. Returns `None` when there is no work,
    /// otherwise the undecoded response body.
    pub async fn take_pending_command(&self, server_name: &str) -> Result<Option<String>> {
        let payload = Payload::json(&PendingCommandRequest { name: server_name })?;
        let response = self
            .request(Method::DELETE, PENDING_COMMAND_PATH, payload)
            .await?;
        if response.status == NO_CONTENT {
            return Ok(None);
        }
        Ok(Some(response.body))
    }

    /// Reservation detail JSON, returned verbatim.
    pub async fn fetch_reservation(&self, reservation_id: &str) -> Result<String> {
        let response = self
            .request(Method::GET, &reservation_path(reservation_id), Payload::Empty)
            .await?;
        Ok(response.body)
    }

    /// Sends the terminal report for one execution. Error texts are sanitized
    /// here regardless of how the result was built.
    pub async fn finished_execution(
        &self,
        server_name: &str,
        execution_id: &str,
        result: &CommandResult,
    ) -> Result<()> {
        let error_name = sanitize_error_text(result.error_name());
        let error_description = sanitize_error_text(result.error_description());
        let payload = Payload::json(&FinishedExecutionRequest {
            name: server_name,
            execution_id,
            result: result.tag(),
            error_description: &error_description,
            error_name: &error_name,
        })?;
        self.request(Method::PUT, FINISHED_EXECUTION_PATH, payload)
            .await?;
        Ok(())
    }

    pub async fn upload_report(
        &self,
        server_name: &str,
        execution_id: &str,
        report: &Report,
    ) -> Result<()> {
        let url = self.url_from_segments(&[
            "API",
            "Execution",
            "ExecutionReport",
            server_name,
            execution_id,
            &report.filename,
        ])?;
        let payload = Payload::Raw {
            bytes: report.data.clone(),
            content_type: report.mime_type.clone(),
        };
        self.request_url(Method::POST, url, payload).await?;
        Ok(())
    }

    /// Acknowledges an UpdateFiles command. The orchestrator disables servers
    /// that never acknowledge.
    pub async fn update_files_ended(&self, server_name: &str) -> Result<()> {
        let payload = Payload::json(&UpdateFilesEndedRequest {
            name: server_name,
            error_message: "",
        })?;
        self.request(Method::POST, UPDATE_FILES_ENDED_PATH, payload)
            .await?;
        Ok(())
    }
}
