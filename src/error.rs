use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Error: {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Error: {code}: {command} failed: {output}")]
    CommandFailed {
        code: i32,
        command: String,
        output: String,
    },
}

impl AgentError {
    /// True when the orchestrator rejected a registration because the
    /// server name is already taken.
    pub fn is_already_registered(&self) -> bool {
        match self {
            AgentError::Status { body, .. } => body.to_ascii_lowercase().contains("already"),
            _ => false,
        }
    }

    /// True for failures that never reached an HTTP status line.
    pub fn is_transport(&self) -> bool {
        matches!(self, AgentError::Transport(_))
    }

    /// True when resending cannot duplicate work on the orchestrator: the
    /// connection was never established, or the server answered 5xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Transport(e) => e.is_connect(),
            AgentError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
