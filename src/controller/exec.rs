//! # Command Executor
//!
//! The single seam between the controller and external tooling (`kustomize`,
//! `kubectl`). Every invocation carries a working directory and a timeout;
//! on expiry the process (and its process group) is killed and reaped before
//! the error is returned.
//!
//! Tests substitute their own [`CommandExecutor`] so that every sync stage can
//! be exercised without real binaries.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// How long to wait for the output pipes to drain once the process has exited
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// One external command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub timeout: Duration,
}

impl CommandRequest {
    #[must_use]
    pub fn new(program: impl Into<String>, working_dir: &Path, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.to_path_buf(),
            timeout,
        }
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Command line as it would be typed in a shell, for logs
    #[must_use]
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a command that ran to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    /// Standard output only
    pub stdout: String,
    /// Standard output and standard error interleaved in arrival order
    pub combined: String,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed waiting for `{program}`: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{program}` did not exit within {timeout:?} and was killed")]
    TimedOut {
        program: String,
        timeout: Duration,
        /// Combined output captured before the process was killed
        output: String,
    },
}

impl ExecError {
    /// Output captured before the failure, if any
    #[must_use]
    pub fn output(&self) -> &str {
        match self {
            ExecError::TimedOut { output, .. } => output,
            ExecError::Spawn { .. } | ExecError::Wait { .. } => "",
        }
    }
}

/// Runs external commands
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run the command to completion or until its timeout expires
    ///
    /// A non-zero exit is not an error; callers inspect [`CommandOutput::exit_code`].
    async fn run(&self, request: &CommandRequest) -> Result<CommandOutput, ExecError>;
}

/// [`CommandExecutor`] backed by `tokio::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExecutor;

#[derive(Debug, Default)]
struct OutputBuffers {
    stdout: String,
    combined: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputStream {
    Stdout,
    Stderr,
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn run(&self, request: &CommandRequest) -> Result<CommandOutput, ExecError> {
        debug!(
            command = %request.command_line(),
            working_dir = %request.working_dir.display(),
            timeout_secs = request.timeout.as_secs_f64(),
            "executing command"
        );

        let mut command = Command::new(&request.program);
        command
            .args(&request.args)
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so a timeout can take down helpers the tool spawned
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| ExecError::Spawn {
            program: request.program.clone(),
            source,
        })?;

        let buffers = Arc::new(Mutex::new(OutputBuffers::default()));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(collect_lines(
                stdout,
                OutputStream::Stdout,
                Arc::clone(&buffers),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(collect_lines(
                stderr,
                OutputStream::Stderr,
                Arc::clone(&buffers),
            )));
        }

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            () = tokio::time::sleep(request.timeout) => None,
        };

        match waited {
            Some(Ok(status)) => {
                drain_readers(readers).await;
                let (stdout, combined) = take_buffers(&buffers);
                Ok(CommandOutput {
                    exit_code: status.code(),
                    stdout,
                    combined,
                })
            }
            Some(Err(source)) => Err(ExecError::Wait {
                program: request.program.clone(),
                source,
            }),
            None => {
                warn!(
                    command = %request.command_line(),
                    timeout_secs = request.timeout.as_secs_f64(),
                    "command timed out, killing process"
                );
                #[cfg(unix)]
                if let Some(pid) = child.id() {
                    kill_process_group(pid);
                }
                if let Err(e) = child.kill().await {
                    warn!("failed to kill timed out `{}`: {}", request.program, e);
                }
                drain_readers(readers).await;
                let (_, combined) = take_buffers(&buffers);
                Err(ExecError::TimedOut {
                    program: request.program.clone(),
                    timeout: request.timeout,
                    output: combined,
                })
            }
        }
    }
}

async fn collect_lines<R>(reader: R, stream: OutputStream, buffers: Arc<Mutex<OutputBuffers>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let Ok(mut buffers) = buffers.lock() else {
                    break;
                };
                if stream == OutputStream::Stdout {
                    buffers.stdout.push_str(&text);
                }
                buffers.combined.push_str(&text);
            }
            Err(e) => {
                debug!("error reading command output: {}", e);
                break;
            }
        }
    }
}

/// Wait for the pipe readers, abandoning them if a lingering grandchild keeps a pipe open
async fn drain_readers(readers: Vec<tokio::task::JoinHandle<()>>) {
    for reader in readers {
        let abort = reader.abort_handle();
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await.is_err() {
            abort.abort();
        }
    }
}

fn take_buffers(buffers: &Mutex<OutputBuffers>) -> (String, String) {
    match buffers.lock() {
        Ok(mut buffers) => (
            std::mem::take(&mut buffers.stdout),
            std::mem::take(&mut buffers.combined),
        ),
        Err(_) => (String::new(), String::new()),
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) takes no pointers; a negative pid addresses the process
    // group created for this child via `process_group(0)`.
    let result = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if result != 0 {
        debug!(
            "killpg({}) failed: {}",
            pgid,
            std::io::Error::last_os_error()
        );
    }
}
