use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};
use crate::orchestrator::redaction::redact_command_arg;

/// Exit code reported when the process was killed by [`ProcessRunner::stop`].
pub const EXIT_STOPPED: i32 = -6000;
/// Exit code reported when the process could not be started at all.
pub const EXIT_SPAWN_FAILED: i32 = -5000;

const OUTPUT_CHANNEL_SIZE: usize = 256;
/// Stops remembered for identifiers that have not started yet.
const PENDING_STOP_LIMIT: usize = 256;

/// How a finished process should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Success,
    Failure,
    Stopped,
    SpawnFailed,
}

/// Combined stdout/stderr and exit code of one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub output: String,
    /// Real exit code, `-signal` for signal deaths, or one of the sentinels.
    pub exit_code: i32,
}

impl ProcessOutput {
    pub fn kind(&self) -> ExitKind {
        match self.exit_code {
            0 => ExitKind::Success,
            EXIT_STOPPED => ExitKind::Stopped,
            EXIT_SPAWN_FAILED => ExitKind::SpawnFailed,
            _ => ExitKind::Failure,
        }
    }

    fn spawn_failed(output: String) -> Self {
        Self {
            output,
            exit_code: EXIT_SPAWN_FAILED,
        }
    }
}

#[derive(Debug)]
struct LiveProcess {
    stopping: bool,
    kill: CancellationToken,
}

/// Runs commands as child processes, one per identifier, and kills whole
/// process groups on request.
///
/// Each child is placed in its own process group so that [`stop`](Self::stop)
/// also reaches anything the command forked.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    state: Arc<Mutex<RunnerState>>,
}

#[derive(Debug, Default)]
struct RunnerState {
    live: HashMap<String, LiveProcess>,
    pending_stops: VecDeque<String>,
}

impl RunnerState {
    fn take_pending_stop(&mut self, identifier: &str) -> bool {
        match self.pending_stops.iter().position(|id| id == identifier) {
            Some(index) => {
                self.pending_stops.remove(index);
                true
            }
            None => false,
        }
    }
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Identifiers with a process currently registered.
    pub fn running(&self) -> Vec<String> {
        self.state().live.keys().cloned().collect()
    }

    /// Runs `args` to completion and returns its combined output.
    ///
    /// `env` is layered over the inherited environment. Output is collected
    /// line by line as it is produced and mirrored to the debug log. stdout
    /// and stderr are read from separate pipes: lines keep their order within
    /// each stream, but lines from the two streams are merged in arrival order.
    ///
    /// If [`stop`](Self::stop) was already called for `identifier`, nothing
    /// is spawned and [`EXIT_STOPPED`] is returned.
    pub async fn execute(
        &self,
        args: &[String],
        identifier: &str,
        env: &HashMap<String, String>,
        directory: Option<&Path>,
    ) -> ProcessOutput {
        let shown: Vec<String> = args.iter().map(|a| redact_command_arg(a)).collect();
        let shown_env: HashMap<&str, &str> = env
            .iter()
            .map(|(k, v)| {
                let value = if k.to_ascii_uppercase().contains("PASSWORD") {
                    "(hidden)"
                } else {
                    v.as_str()
                };
                (k.as_str(), value)
            })
            .collect();
        tracing::debug!(execution_id = identifier, command = ?shown, env = ?shown_env, "Running process");

        let Some((program, rest)) = args.split_first() else {
            return ProcessOutput::spawn_failed("Failed to start: empty command".to_string());
        };

        let kill = CancellationToken::new();
        {
            let mut state = self.state();
            if state.take_pending_stop(identifier) {
                tracing::info!(execution_id = identifier, "Stop arrived before start, not running process");
                return ProcessOutput {
                    output: String::new(),
                    exit_code: EXIT_STOPPED,
                };
            }
            if state.live.contains_key(identifier) {
                tracing::warn!(execution_id = identifier, "A process is already running under this identifier");
                return ProcessOutput::spawn_failed(format!(
                    "Failed to start {:?}: a process is already running for {}",
                    shown, identifier
                ));
            }
            state.live.insert(
                identifier.to_string(),
                LiveProcess {
                    stopping: false,
                    kill: kill.clone(),
                },
            );
        }

        let mut command = Command::new(program);
        command
            .args(rest)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = directory {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.state().live.remove(identifier);
                tracing::error!(execution_id = identifier, error = %e, "Failed to start process");
                return ProcessOutput::spawn_failed(format!("Failed to start {:?}: {}", shown, e));
            }
        };
        let pid = child.id();

        let (tx, mut rx) = mpsc::channel::<String>(OUTPUT_CHANNEL_SIZE);
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, tx.clone());
        }
        drop(tx);

        let mut output = String::new();
        let mut killed = false;
        loop {
            tokio::select! {
                line = rx.recv() => match line {
                    Some(line) => {
                        tracing::debug!(execution_id = identifier, "Output line: {}", line.trim_end());
                        output.push_str(&line);
                        continue;
                    }
                    None => break,
                },
                _ = kill.cancelled(), if !killed => killed = true,
            }
            terminate(&mut child, pid);
        }

        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = kill.cancelled(), if !killed => killed = true,
            }
            terminate(&mut child, pid);
        };

        let stopping = self
            .state()
            .live
            .remove(identifier)
            .map(|p| p.stopping)
            .unwrap_or(false);

        if stopping {
            tracing::info!(execution_id = identifier, "Process stopped");
            return ProcessOutput {
                output,
                exit_code: EXIT_STOPPED,
            };
        }

        let exit_code = match status {
            Ok(status) => exit_code_of(status),
            Err(e) => {
                tracing::error!(execution_id = identifier, error = %e, "Failed to wait for process");
                output.push_str(&format!("\nFailed to wait for process: {}\n", e));
                EXIT_SPAWN_FAILED
            }
        };
        tracing::info!(execution_id = identifier, exit_code, "Process exited");

        ProcessOutput { output, exit_code }
    }

    /// Like [`execute`](Self::execute) but treats any nonzero exit as an error.
    pub async fn execute_checked(
        &self,
        args: &[String],
        identifier: &str,
        env: &HashMap<String, String>,
        directory: Option<&Path>,
    ) -> Result<ProcessOutput> {
        let result = self.execute(args, identifier, env, directory).await;
        if result.exit_code != 0 {
            let command: Vec<String> = args.iter().map(|a| redact_command_arg(a)).collect();
            let err = AgentError::CommandFailed {
                code: result.exit_code,
                command: format!("{:?}", command),
                output: result.output,
            };
            tracing::error!(execution_id = identifier, "{}", err);
            return Err(err);
        }
        Ok(result)
    }

    /// Kills the process group registered under `identifier`, if any.
    ///
    /// The matching [`execute`](Self::execute) call then returns
    /// [`EXIT_STOPPED`]. Returns false when nothing was running; the stop is
    /// then remembered so a later `execute` for the same identifier does not
    /// start. Only the most recent [`PENDING_STOP_LIMIT`] such stops are kept.
    pub fn stop(&self, identifier: &str) -> bool {
        tracing::info!(execution_id = identifier, "Received stop command");
        let mut state = self.state();
        if let Some(process) = state.live.get_mut(identifier) {
            process.stopping = true;
            process.kill.cancel();
            return true;
        }

        tracing::debug!(execution_id = identifier, "No live process to stop, remembering stop");
        if !state.pending_stops.iter().any(|id| id == identifier) {
            state.pending_stops.push_back(identifier.to_string());
            if state.pending_stops.len() > PENDING_STOP_LIMIT {
                state.pending_stops.pop_front();
            }
        }
        false
    }
}

fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(String::from_utf8_lossy(&buf).into_owned()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read process output");
                    break;
                }
            }
        }
    });
}

#[cfg(unix)]
fn terminate(_child: &mut Child, pid: Option<u32>) {
    let Some(pid) = pid else { return };
    // The child leads its own group, so its pid is the group id.
    let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        tracing::warn!(pid, error = %err, "Failed to kill process group");
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, _pid: Option<u32>) {
    if let Err(e) = child.start_kill() {
        tracing::warn!(error = %e, "Failed to kill process");
    }
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| -sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
