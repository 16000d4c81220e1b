use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{AgentError, Result};

/// Credential value that is asked for on the terminal at startup.
pub const PROMPT_MARKER: &str = "<PROMPT>";
/// Replaced by the execution server name in other string settings.
pub const SERVER_NAME_MARKER: &str = "<EXECUTION_SERVER_NAME>";

/// Connection and credentials for the orchestrator.
#[derive(Clone)]
pub struct OrchestratorConfig {
    pub host: String,
    /// Port of the execution API.
    pub api_port: u16,
    /// Main orchestrator port, handed to commands through their environment.
    pub port: u16,
    pub username: String,
    pub password: String,
    pub domain: String,
    /// Upper bound on a single HTTP exchange, including a long poll.
    pub request_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            api_port: 9000,
            port: 8029,
            username: "admin".to_string(),
            password: String::new(),
            domain: "Global".to_string(),
            request_timeout: Duration::from_secs(300),
        }
    }
}

impl std::fmt::Debug for OrchestratorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorConfig")
            .field("host", &self.host)
            .field("api_port", &self.api_port)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"(password hidden)")
            .field("domain", &self.domain)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Identity the agent registers under.
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    pub name: String,
    pub description: String,
    /// Execution server type; must already exist on the orchestrator.
    pub server_type: String,
    /// Concurrent executions the orchestrator may send. Not enforced locally.
    pub capacity: u32,
}

impl Default for ServerIdentity {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            server_type: String::new(),
            capacity: 5,
        }
    }
}

/// Loop periods and retry policy.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    pub heartbeat_interval: Duration,
    /// Sleep after a poll transport failure.
    pub poll_backoff: Duration,
    /// Attempts for terminal reports, uploads and acknowledgments.
    pub report_attempts: u32,
    pub report_retry_delay: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(60),
            poll_backoff: Duration::from_secs(30),
            report_attempts: 3,
            report_retry_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub orchestrator: OrchestratorConfig,
    pub server: ServerIdentity,
    pub timing: TimingConfig,
    pub log_level: String,
    /// Register (or refresh) the server identity on startup.
    pub auto_register: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            server: ServerIdentity::default(),
            timing: TimingConfig::default(),
            log_level: "info".to_string(),
            auto_register: true,
        }
    }
}

/// On-disk JSON layout.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    cloudshell_server_address: Option<String>,
    cloudshell_port: Option<u16>,
    cloudshell_snq_port: Option<u16>,
    cloudshell_username: Option<String>,
    cloudshell_password: Option<String>,
    cloudshell_domain: Option<String>,
    cloudshell_execution_server_name: Option<String>,
    cloudshell_execution_server_description: Option<String>,
    cloudshell_execution_server_type: Option<String>,
    cloudshell_execution_server_capacity: Option<u32>,
    log_level: Option<String>,
    auto_register: Option<bool>,
    request_timeout_secs: Option<u64>,
    heartbeat_interval_secs: Option<u64>,
    poll_backoff_secs: Option<u64>,
    report_attempts: Option<u32>,
    report_retry_delay_secs: Option<u64>,
}

impl AgentConfig {
    pub fn new(orchestrator: OrchestratorConfig, server: ServerIdentity) -> Self {
        Self {
            orchestrator,
            server,
            ..Default::default()
        }
    }

    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Loads and validates a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let file: ConfigFile = serde_json::from_str(text)
            .map_err(|e| AgentError::Config(format!("invalid config JSON: {}", e)))?;
        let config = Self::from_file(file);
        config.validate()?;
        Ok(config)
    }

    /// Missing credentials default to [`PROMPT_MARKER`].
    fn from_file(file: ConfigFile) -> Self {
        let defaults = AgentConfig::default();
        let secs = Duration::from_secs;

        let name = file.cloudshell_execution_server_name.unwrap_or_default();
        let named = |value: String| value.replace(SERVER_NAME_MARKER, &name);

        let orchestrator = OrchestratorConfig {
            host: file.cloudshell_server_address.map(named).unwrap_or_default(),
            api_port: file.cloudshell_snq_port.unwrap_or(defaults.orchestrator.api_port),
            port: file.cloudshell_port.unwrap_or(defaults.orchestrator.port),
            username: file
                .cloudshell_username
                .map(named)
                .unwrap_or_else(|| PROMPT_MARKER.to_string()),
            password: file
                .cloudshell_password
                .unwrap_or_else(|| PROMPT_MARKER.to_string()),
            domain: file
                .cloudshell_domain
                .map(named)
                .unwrap_or(defaults.orchestrator.domain),
            request_timeout: file
                .request_timeout_secs
                .map(secs)
                .unwrap_or(defaults.orchestrator.request_timeout),
        };

        let server = ServerIdentity {
            name: name.clone(),
            description: file
                .cloudshell_execution_server_description
                .map(named)
                .unwrap_or_default(),
            server_type: file
                .cloudshell_execution_server_type
                .map(named)
                .unwrap_or_default(),
            capacity: file
                .cloudshell_execution_server_capacity
                .unwrap_or(defaults.server.capacity),
        };

        let timing = TimingConfig {
            heartbeat_interval: file
                .heartbeat_interval_secs
                .map(secs)
                .unwrap_or(defaults.timing.heartbeat_interval),
            poll_backoff: file
                .poll_backoff_secs
                .map(secs)
                .unwrap_or(defaults.timing.poll_backoff),
            report_attempts: file
                .report_attempts
                .unwrap_or(defaults.timing.report_attempts),
            report_retry_delay: file
                .report_retry_delay_secs
                .map(secs)
                .unwrap_or(defaults.timing.report_retry_delay),
        };

        Self {
            orchestrator,
            server,
            timing,
            log_level: file.log_level.map(named).unwrap_or(defaults.log_level),
            auto_register: file.auto_register.unwrap_or(defaults.auto_register),
        }
    }

    /// True while a credential still holds [`PROMPT_MARKER`].
    pub fn needs_prompt(&self) -> bool {
        self.orchestrator.username.contains(PROMPT_MARKER)
            || self.orchestrator.password.contains(PROMPT_MARKER)
    }

    /// Replaces [`PROMPT_MARKER`] in the credentials with what `prompt`
    /// returns. `prompt` gets a label and whether the answer is secret.
    pub fn resolve_prompts<F>(&mut self, mut prompt: F) -> Result<()>
    where
        F: FnMut(&str, bool) -> std::io::Result<String>,
    {
        if self.orchestrator.username.contains(PROMPT_MARKER) {
            let answer = prompt("Orchestrator username: ", false)?;
            self.orchestrator.username = self
                .orchestrator
                .username
                .replace(PROMPT_MARKER, answer.trim());
        }
        if self.orchestrator.password.contains(PROMPT_MARKER) {
            let answer = prompt("Orchestrator password: ", true)?;
            let answer = answer.trim_end_matches(['\r', '\n']);
            self.orchestrator.password = self.orchestrator.password.replace(PROMPT_MARKER, answer);
        }
        Ok(())
    }

    /// Reports every missing required setting at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.orchestrator.host.is_empty() {
            errors.push("cloudshell_server_address must be specified".to_string());
        }
        if self.server.name.is_empty() {
            errors.push("cloudshell_execution_server_name must be specified".to_string());
        }
        if self.server.server_type.is_empty() {
            errors.push(
                "cloudshell_execution_server_type must be specified and registered on the orchestrator"
                    .to_string(),
            );
        }
        if self.timing.report_attempts == 0 {
            errors.push("report_attempts must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AgentError::Config(errors.join("; ")))
        }
    }
}
