//! The pluggable command capability.
//!
//! The agent core never knows how a command runs. It hands each accepted
//! execution to a [`CommandHandler`] and forwards stop requests to the same
//! handler. [`crate::worker::ProcessCommandHandler`] is the stock
//! implementation backed by OS processes.

pub mod result;

use async_trait::async_trait;

pub use result::{sanitize_error_text, CommandResult, Report};

/// Error raised by a handler. Converted into an `Error` result, never
/// propagated further.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// `Ok(None)` breaks the handler contract and is reported as an internal error.
pub type HandlerResult = std::result::Result<Option<CommandResult>, HandlerError>;

/// Everything a handler gets to know about one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub execution_id: String,
    pub test_path: String,
    pub test_arguments: String,
    pub user_name: String,
    pub reservation_id: String,
    /// Reservation detail JSON, passed through untouched. Empty when the
    /// execution has no reservation.
    pub reservation_json: String,
}

#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Runs one command to completion. Called on its own task, possibly
    /// concurrently with other executions.
    async fn execute_command(&self, request: ExecutionRequest) -> HandlerResult;

    /// Asks the running command for `execution_id` to exit. Best effort: the
    /// command may finish on its own before it notices.
    async fn stop_command(&self, execution_id: &str);
}

/// Display text of an error followed by its source chain.
pub fn describe_error(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
