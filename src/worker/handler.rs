use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::command::{CommandHandler, CommandResult, ExecutionRequest, HandlerResult, Report};
use crate::config::OrchestratorConfig;
use crate::worker::process::{ExitKind, ProcessRunner};

/// Filename of the report uploaded for every process-backed execution.
pub const OUTPUT_REPORT_NAME: &str = "output.log";

const MISSING: &str = "None";

/// Runs the test path as an executable with the test arguments, exposing the
/// orchestrator connection and reservation to it through the environment.
#[derive(Debug, Clone)]
pub struct ProcessCommandHandler {
    runner: ProcessRunner,
    orchestrator: OrchestratorConfig,
    working_dir: Option<PathBuf>,
}

impl ProcessCommandHandler {
    pub fn new(orchestrator: OrchestratorConfig) -> Self {
        Self {
            runner: ProcessRunner::new(),
            orchestrator,
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn runner(&self) -> &ProcessRunner {
        &self.runner
    }

    /// Command line for a request: the sanitized test path followed by the
    /// space-separated arguments.
    pub fn command_line(request: &ExecutionRequest) -> Vec<String> {
        let mut args = vec![sanitize_test_path(&request.test_path)];
        if !request.test_arguments.is_empty() && request.test_arguments != MISSING {
            args.extend(
                request
                    .test_arguments
                    .split(' ')
                    .filter(|a| !a.is_empty())
                    .map(str::to_string),
            );
        }
        args
    }

    /// Environment overlay handed to the command.
    pub fn environment(&self, request: &ExecutionRequest) -> HashMap<String, String> {
        let or_missing = |value: &str| {
            if value.is_empty() {
                MISSING.to_string()
            } else {
                value.to_string()
            }
        };
        let orch = &self.orchestrator;

        HashMap::from([
            ("CLOUDSHELL_RESERVATION_ID".to_string(), or_missing(&request.reservation_id)),
            ("CLOUDSHELL_SERVER_ADDRESS".to_string(), or_missing(&orch.host)),
            ("CLOUDSHELL_SERVER_PORT".to_string(), orch.port.to_string()),
            ("CLOUDSHELL_USERNAME".to_string(), or_missing(&orch.username)),
            ("CLOUDSHELL_PASSWORD".to_string(), or_missing(&orch.password)),
            ("CLOUDSHELL_DOMAIN".to_string(), or_missing(&orch.domain)),
            ("CLOUDSHELL_RESERVATION_INFO".to_string(), or_missing(&request.reservation_json)),
        ])
    }
}

/// Replaces characters outside `-@%.,_/` and ASCII alphanumerics/space with `_`.
pub fn sanitize_test_path(path: &str) -> String {
    path.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '@' | '%' | '.' | ',' | '_' | '/' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl CommandHandler for ProcessCommandHandler {
    async fn execute_command(&self, request: ExecutionRequest) -> HandlerResult {
        let args = Self::command_line(&request);
        let env = self.environment(&request);

        tracing::info!(
            execution_id = %request.execution_id,
            test_path = %request.test_path,
            user = %request.user_name,
            reservation_id = %request.reservation_id,
            "Executing command"
        );

        let result = self
            .runner
            .execute(&args, &request.execution_id, &env, self.working_dir.as_deref())
            .await;
        tracing::debug!(execution_id = %request.execution_id, exit_code = result.exit_code, "Command finished");

        let report = Report::text(OUTPUT_REPORT_NAME, result.output.clone());
        let outcome = match result.kind() {
            ExitKind::Stopped => CommandResult::Stopped,
            ExitKind::Success => CommandResult::Passed(report),
            ExitKind::Failure | ExitKind::SpawnFailed => CommandResult::Failed(report),
        };
        Ok(Some(outcome))
    }

    async fn stop_command(&self, execution_id: &str) {
        self.runner.stop(execution_id);
    }
}
