use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use exec_agent::config::AgentConfig;
use exec_agent::server::ExecutionServer;
use exec_agent::shutdown::install_shutdown_handler;
use exec_agent::worker::ProcessCommandHandler;

#[derive(Parser, Debug)]
#[command(name = "exec-agent")]
#[command(version)]
#[command(about = "Execution server agent that runs orchestrator commands on this host")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, short = 'c', default_value = "config.json")]
    config: PathBuf,

    /// Orchestrator username (overrides the config file)
    #[arg(long, env = "EXEC_AGENT_USERNAME")]
    username: Option<String>,

    /// Orchestrator password (overrides the config file)
    #[arg(long, env = "EXEC_AGENT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Log level filter, e.g. "debug" or "exec_agent=trace"
    /// RUST_LOG takes precedence when set.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = AgentConfig::from_json_file(&args.config)?;
    if let Some(username) = args.username {
        config.orchestrator.username = username;
    }
    if let Some(password) = args.password {
        config.orchestrator.password = password;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    if config.needs_prompt() {
        config.resolve_prompts(prompt_terminal)?;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    tracing::info!(
        config = %args.config.display(),
        server = %config.server.name,
        orchestrator = %config.orchestrator.host,
        "Starting execution agent"
    );

    let handler = Arc::new(ProcessCommandHandler::new(config.orchestrator.clone()));
    let auto_register = config.auto_register;
    let mut server = ExecutionServer::connect(config, handler).await?;
    if auto_register {
        server.register_or_update().await?;
    }

    let shutdown = install_shutdown_handler();
    server.start();
    shutdown.cancelled().await;

    tracing::info!(in_flight = ?server.in_flight(), "Shutting down");
    server.stop().await;
    Ok(())
}

/// Asks on stderr and reads one line from stdin. Secret answers are read
/// with terminal echo turned off.
fn prompt_terminal(label: &str, secret: bool) -> io::Result<String> {
    let mut stderr = io::stderr();
    write!(stderr, "{}", label)?;
    stderr.flush()?;

    let echo = if secret { EchoOff::new() } else { None };
    let mut line = String::new();
    let read = io::stdin().lock().read_line(&mut line);
    if echo.is_some() {
        drop(echo);
        writeln!(stderr)?;
    }
    if read? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "no input for credential prompt",
        ));
    }
    Ok(line)
}

/// Restores the saved terminal mode when dropped.
#[cfg(unix)]
struct EchoOff(libc::termios);

#[cfg(unix)]
impl EchoOff {
    fn new() -> Option<Self> {
        let mut mode = std::mem::MaybeUninit::<libc::termios>::uninit();
        // Not a terminal: read the answer as is.
        if unsafe { libc::tcgetattr(libc::STDIN_FILENO, mode.as_mut_ptr()) } != 0 {
            return None;
        }
        let saved = unsafe { mode.assume_init() };
        let mut quiet = saved;
        quiet.c_lflag &= !libc::ECHO;
        if unsafe { libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &quiet) } != 0 {
            return None;
        }
        Some(Self(saved))
    }
}

#[cfg(unix)]
impl Drop for EchoOff {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &self.0);
        }
    }
}

#[cfg(not(unix))]
struct EchoOff;

#[cfg(not(unix))]
impl EchoOff {
    fn new() -> Option<Self> {
        None
    }
}
