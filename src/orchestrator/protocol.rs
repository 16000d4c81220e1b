//! JSON bodies exchanged with the orchestrator's execution API.

use serde::{Deserialize, Serialize};

pub const LOGIN_PATH: &str = "/API/Auth/login";
pub const EXECUTION_SERVERS_PATH: &str = "/API/Execution/ExecutionServers";
pub const STATUS_PATH: &str = "/API/Execution/Status";
pub const PENDING_COMMAND_PATH: &str = "/API/Execution/PendingCommand";
pub const FINISHED_EXECUTION_PATH: &str = "/API/Execution/FinishedExecution";
pub const UPDATE_FILES_ENDED_PATH: &str = "/API/Execution/UpdateFilesEnded";

pub fn reservation_path(reservation_id: &str) -> String {
    format!("/API/Execution/Reservations/{}", reservation_id)
}

/// Kind of instruction carried by a pending-command envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandType {
    StartExecution,
    StopExecution,
    UpdateFiles,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandType::StartExecution => write!(f, "startExecution"),
            CommandType::StopExecution => write!(f, "stopExecution"),
            CommandType::UpdateFiles => write!(f, "updateFiles"),
            CommandType::Unknown => write!(f, "unknown"),
        }
    }
}

/// One unit of work or control instruction returned by a poll.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommandEnvelope {
    #[serde(rename = "Type")]
    pub command_type: CommandType,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub execution_id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub test_path: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub test_arguments: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub user_name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub reservation_id: String,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl CommandEnvelope {
    /// Decodes a poll response body. Empty bodies and JSON `null` carry no
    /// envelope.
    pub fn decode(body: &str) -> serde_json::Result<Option<Self>> {
        if body.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str::<Option<Self>>(body)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub domain: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegisterRequest<'a> {
    pub name: &'a str,
    pub description: &'a str,
    #[serde(rename = "Type")]
    pub server_type: &'a str,
    pub capacity: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateServerRequest<'a> {
    pub name: &'a str,
    pub description: &'a str,
    pub capacity: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusRequest<'a> {
    pub name: &'a str,
    pub execution_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PendingCommandRequest<'a> {
    pub name: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct FinishedExecutionRequest<'a> {
    pub name: &'a str,
    pub execution_id: &'a str,
    pub result: &'a str,
    pub error_description: &'a str,
    pub error_name: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateFilesEndedRequest<'a> {
    pub name: &'a str,
    pub error_message: &'a str,
}
