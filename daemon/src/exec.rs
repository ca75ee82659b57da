//! External command execution.
//!
//! Commands are spawned directly from a tokenized argument vector, so no shell
//! sees the configured text unless a rule explicitly asks for one via
//! [`run_shell`]. Standard output and standard error share a single pipe, which
//! keeps the combined output in the order the child wrote it.
use std::future::Future;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::tokenizer::bin_and_args;

/// Shell used by [`run_shell`] when none is configured.
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// How long to keep collecting output after a timed-out child was killed.
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Why a command is reported as failed.
#[derive(Debug, Error)]
pub enum CommandFailure {
    #[error("empty command line")]
    EmptyCommand,

    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command exited with {status}")]
    NonZeroExit { status: ExitStatus },

    #[error("command killed after exceeding its {}s deadline", .after.as_secs_f32())]
    TimedOut { after: Duration },

    #[error("I/O error while running command: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a single command invocation.
#[derive(Debug)]
pub struct CommandOutcome {
    /// Interleaved stdout and stderr, lossily decoded as UTF-8.
    pub output: String,
    /// Set when the command could not be started or did not succeed.
    pub failure: Option<CommandFailure>,
}

impl CommandOutcome {
    fn succeeded(output: String) -> Self {
        Self { output, failure: None }
    }

    fn failed_with(output: String, failure: CommandFailure) -> Self {
        Self { output, failure: Some(failure) }
    }
}

/// One command line to run for a matched rule, with its execution settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub line: String,
    /// Run through this shell with `-c` instead of direct execution.
    pub shell: Option<String>,
    pub workdir: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

/// Executes [`Invocation`]s on behalf of the dispatch loop.
pub trait CommandRunner: Send + Sync + 'static {
    fn run(&self, invocation: &Invocation) -> impl Future<Output = CommandOutcome> + Send;
}

/// Runs invocations as real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, invocation: &Invocation) -> impl Future<Output = CommandOutcome> + Send {
        let invocation = invocation.clone();
        async move {
            let workdir = invocation.workdir.as_deref();
            match invocation.shell.as_deref() {
                Some(shell) => {
                    run_shell(&invocation.line, Some(shell), workdir, invocation.timeout).await
                }
                None => run_command(&invocation.line, workdir, invocation.timeout).await,
            }
        }
    }
}

/// Tokenizes `line` and runs it without a shell.
pub async fn run_command(
    line: &str,
    workdir: Option<&Path>,
    timeout: Option<Duration>,
) -> CommandOutcome {
    let (program, args) = bin_and_args(line);
    if program.is_empty() {
        return CommandOutcome::failed_with(String::new(), CommandFailure::EmptyCommand);
    }
    run_program(&program, &args, workdir, timeout).await
}

/// Runs `program` with a pre-split argument vector.
pub async fn run_program(
    program: &str,
    args: &[String],
    workdir: Option<&Path>,
    timeout: Option<Duration>,
) -> CommandOutcome {
    let mut command = Command::new(program);
    command.args(args);
    if let Some(dir) = workdir {
        command.current_dir(dir);
    }
    execute(command, program, timeout).await
}

/// Runs `line` through `shell -c`, for callers that want globbing and pipes.
/// Falls back to [`DEFAULT_SHELL`].
pub async fn run_shell(
    line: &str,
    shell: Option<&str>,
    workdir: Option<&Path>,
    timeout: Option<Duration>,
) -> CommandOutcome {
    let shell = shell.unwrap_or(DEFAULT_SHELL);
    let mut command = Command::new(shell);
    command.arg("-c").arg(line);
    if let Some(dir) = workdir {
        command.current_dir(dir);
    }
    execute(command, shell, timeout).await
}

async fn execute(mut command: Command, program: &str, timeout: Option<Duration>) -> CommandOutcome {
    let (reader, writer) = match std::io::pipe() {
        Ok(pair) => pair,
        Err(e) => return CommandOutcome::failed_with(String::new(), e.into()),
    };
    let stderr_writer = match writer.try_clone() {
        Ok(w) => w,
        Err(e) => return CommandOutcome::failed_with(String::new(), e.into()),
    };

    // Own process group, so a deadline also reaches anything the command
    // left running in the background.
    command
        .stdin(Stdio::null())
        .stdout(writer)
        .stderr(stderr_writer)
        .process_group(0)
        .kill_on_drop(true);

    let spawned = command.spawn();
    // The command still owns our copies of the write end; the reader only
    // sees EOF once they are closed.
    drop(command);

    let mut child = match spawned {
        Ok(child) => child,
        Err(source) => {
            return CommandOutcome::failed_with(
                String::new(),
                CommandFailure::Spawn { program: program.to_string(), source },
            )
        }
    };
    let pgid = child.id();

    let mut collector = tokio::task::spawn_blocking(move || {
        let mut reader = reader;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).map(|_| buf)
    });

    // One deadline covers both the exit and the output, since background
    // processes keep the pipe open after the command itself has exited.
    let (waited, collected) = match timeout {
        Some(limit) => {
            let deadline = Instant::now() + limit;
            let exited = tokio::time::timeout_at(deadline, child.wait()).await;
            let Ok(waited) = exited else {
                return expire(&mut child, pgid, collector, limit).await;
            };
            let drained = tokio::time::timeout_at(deadline, &mut collector).await;
            let Ok(collected) = drained else {
                return expire(&mut child, pgid, collector, limit).await;
            };
            (waited, collected)
        }
        None => {
            let waited = child.wait().await;
            (waited, collector.await)
        }
    };

    let output = match collected {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(e)) => return CommandOutcome::failed_with(String::new(), e.into()),
        Err(e) => {
            return CommandOutcome::failed_with(String::new(), std::io::Error::other(e).into())
        }
    };

    match waited {
        Ok(status) if status.success() => CommandOutcome::succeeded(output),
        Ok(status) => CommandOutcome::failed_with(output, CommandFailure::NonZeroExit { status }),
        Err(e) => CommandOutcome::failed_with(output, e.into()),
    }
}

/// Kills the command's process group once its deadline has passed and keeps
/// whatever output arrives within [`KILL_GRACE`].
async fn expire(
    child: &mut Child,
    pgid: Option<u32>,
    collector: JoinHandle<std::io::Result<Vec<u8>>>,
    after: Duration,
) -> CommandOutcome {
    if let Some(pgid) = pgid {
        kill_process_group(pgid).await;
    }
    // Reaps the direct child, killing it first if the group signal missed it.
    if !matches!(child.try_wait(), Ok(Some(_))) {
        if let Err(e) = child.kill().await {
            tracing::warn!(pid = ?pgid, error = %e, "Can't kill timed out command");
        }
    }

    let output = match tokio::time::timeout(KILL_GRACE, collector).await {
        Ok(Ok(Ok(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
        _ => String::new(),
    };
    CommandOutcome::failed_with(output, CommandFailure::TimedOut { after })
}

/// Sends SIGKILL to every process in group `pgid` via the system `kill`.
async fn kill_process_group(pgid: u32) {
    let status = Command::new("kill")
        .args(["-KILL", "--", &format!("-{pgid}")])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    match status {
        Ok(status) if status.success() => {}
        Ok(status) => tracing::warn!(pgid, %status, "Can't kill command process group"),
        Err(e) => tracing::warn!(pgid, error = %e, "Can't kill command process group"),
    }
}
