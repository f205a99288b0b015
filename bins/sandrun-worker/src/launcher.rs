//! Sandbox Launcher - runs one or two sandboxed processes
//!
//! **Single mode:** one process with stdin closed, stdout and stderr relayed
//! to the console and captured. **Dual mode:** a "user" and a "test" process wired
//! stdout-to-stdin in both directions, every direction captured.
//!
//! In both modes the launcher:
//! 1. Starts the process(es) with all standard streams piped
//! 2. Spawns one relay task per stream
//! 3. Waits on the run's completion barrier (optionally under a deadline)
//! 4. Waits for the authoritative process to exit
//! 5. Reads `prepare.log` and `stats.log` from the mounted directory
//!
//! The launcher knows nothing about persistence; the caller hands its
//! `SandboxOutput` to the lifecycle logger.

use crate::barrier::CompletionBarrier;
use crate::relay::{BoxedSink, Relay, RelayReport};
use crate::volume::VolumeError;
use sandrun_common::types::{ExitOutcome, ResourceUsage, RunTranscripts};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Resource usage written by the sandbox after the user program exits
pub const STATS_FILE: &str = "stats.log";
/// Staging output written before the sandbox starts
pub const PREPARE_FILE: &str = "prepare.log";

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("failed to start sandbox '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("sandbox '{name}' has no {stream} pipe")]
    MissingPipe { name: String, stream: &'static str },

    #[error("failed waiting for sandbox '{name}': {source}")]
    Wait {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("prepare log missing at {}: {source}", .path.display())]
    PrepareLogMissing {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("relay '{stream}' did not finish cleanly: {reason}")]
    RelayFailed { stream: &'static str, reason: String },
}

/// Non-fatal: the run carries on with zero usage
#[derive(Debug, Error)]
pub enum UsageError {
    #[error("resource usage unavailable at {}: {reason}", .path.display())]
    ResourceUsageUnavailable { path: PathBuf, reason: String },
}

/// A container runtime able to run one sandboxed process per working dir
#[allow(async_fn_in_trait)]
pub trait Sandbox {
    /// Command running one sandbox with `workdir` mounted. Standard streams
    /// are configured by the launcher.
    fn command(&self, workdir: &Path, name: &str) -> Result<Command, LaunchError>;

    /// Called once per run before any process starts
    async fn prepare(&self) -> Result<(), LaunchError> {
        Ok(())
    }

    /// Stop a sandbox whose client process was killed on deadline
    async fn terminate(&self, name: &str) {
        let _ = name;
    }
}

/// Where console passthrough relays write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Echo {
    Console,
    Silent,
}

#[derive(Debug)]
pub struct SandboxOutput {
    pub transcripts: RunTranscripts,
    pub exit: ExitOutcome,
    pub usage: ResourceUsage,
}

struct Spawned {
    name: String,
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    stderr: ChildStderr,
}

pub struct SandboxLauncher<S> {
    sandbox: S,
    echo: Echo,
    timeout: Option<Duration>,
}

impl<S: Sandbox> SandboxLauncher<S> {
    pub fn new(sandbox: S) -> Self {
        Self {
            sandbox,
            echo: Echo::Console,
            timeout: None,
        }
    }

    #[cfg(test)]
    pub fn sandbox(&self) -> &S {
        &self.sandbox
    }

    pub fn with_echo(mut self, echo: Echo) -> Self {
        self.echo = echo;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run one sandbox with its output relayed to the console
    #[tracing::instrument(skip(self, workdir), fields(workdir = %workdir.display()))]
    pub async fn run_single(&self, workdir: &Path) -> Result<SandboxOutput, LaunchError> {
        self.sandbox.prepare().await?;

        let Spawned {
            name,
            mut child,
            stdin,
            stdout,
            stderr,
        } = self.spawn(workdir, "run").await?;
        // Nothing feeds a single run; a program reading stdin sees EOF
        drop(stdin);

        let barrier = CompletionBarrier::new(2);
        let out = tokio::spawn(
            Relay::capturing("stdout", stdout, Some(self.console_out())).run(barrier.signal()),
        );
        let err = tokio::spawn(
            Relay::capturing("stderr", stderr, Some(self.console_err())).run(barrier.signal()),
        );

        let deadline_hit = self.await_barrier(&barrier, &mut [(name.as_str(), &mut child)]).await;
        let out = join_relay("stdout", out).await?;
        let err = join_relay("stderr", err).await?;

        let status = child
            .wait()
            .await
            .map_err(|source| LaunchError::Wait { name: name.clone(), source })?;

        let exit = match deadline_hit {
            Some(limit) => ExitOutcome::timed_out(limit),
            None => ExitOutcome::from_status(status),
        };
        info!(sandbox = %name, exit = %exit, "Sandbox finished");

        let prepare_log = match tokio::fs::read(workdir.join(PREPARE_FILE)).await {
            Ok(data) => data,
            Err(e) => {
                debug!(error = %e, "No prepare log for single run");
                Vec::new()
            }
        };
        let usage = load_usage(workdir).await;

        Ok(SandboxOutput {
            transcripts: RunTranscripts {
                in_log: Vec::new(),
                out_log: out.transcript,
                extra_log: err.transcript,
                prepare_log,
            },
            exit,
            usage,
        })
    }

    /// Run the user sandbox against a test harness sandbox
    ///
    /// Only the user process's exit status decides the outcome. The harness
    /// is reaped (or stopped) afterwards, and its status is only logged.
    #[tracing::instrument(skip(self, user_dir, test_dir), fields(user_dir = %user_dir.display(), test_dir = %test_dir.display()))]
    pub async fn run_dual(&self, user_dir: &Path, test_dir: &Path) -> Result<SandboxOutput, LaunchError> {
        self.sandbox.prepare().await?;

        // Both commands are built first so a bad path aborts before any code runs
        let (user_name, user_command) = self.build_command(user_dir, "user")?;
        let (test_name, test_command) = self.build_command(test_dir, "test")?;

        let user = self.start(user_name, user_command).await?;
        let test = match self.start(test_name, test_command).await {
            Ok(test) => test,
            Err(e) => {
                // Dropping `user` only kills the client process
                self.sandbox.terminate(&user.name).await;
                return Err(e);
            }
        };

        let Spawned {
            name: user_name,
            child: mut user_child,
            stdin: user_stdin,
            stdout: user_stdout,
            stderr: user_stderr,
        } = user;
        let Spawned {
            name: test_name,
            child: mut test_child,
            stdin: test_stdin,
            stdout: test_stdout,
            stderr: test_stderr,
        } = test;

        let barrier = CompletionBarrier::new(4);
        let user_to_test = tokio::spawn(
            Relay::capturing("user->test", user_stdout, Some(Box::new(test_stdin))).run(barrier.signal()),
        );
        let test_to_user = tokio::spawn(
            Relay::capturing("test->user", test_stdout, Some(Box::new(user_stdin))).run(barrier.signal()),
        );
        let user_err = tokio::spawn(
            Relay::passthrough("user-stderr", user_stderr, self.console_err()).run(barrier.signal()),
        );
        let test_err = tokio::spawn(
            Relay::capturing("test-stderr", test_stderr, Some(Box::new(tokio::io::sink())))
                .run(barrier.signal()),
        );

        let deadline_hit = self
            .await_barrier(
                &barrier,
                &mut [
                    (user_name.as_str(), &mut user_child),
                    (test_name.as_str(), &mut test_child),
                ],
            )
            .await;

        let user_to_test = join_relay("user->test", user_to_test).await?;
        let test_to_user = join_relay("test->user", test_to_user).await?;
        join_relay("user-stderr", user_err).await?;
        let test_err = join_relay("test-stderr", test_err).await?;

        let status = user_child.wait().await.map_err(|source| LaunchError::Wait {
            name: user_name.clone(),
            source,
        })?;
        let exit = match deadline_hit {
            Some(limit) => ExitOutcome::timed_out(limit),
            None => ExitOutcome::from_status(status),
        };
        info!(sandbox = %user_name, exit = %exit, "User sandbox finished");

        self.reap_harness(&test_name, &mut test_child).await;

        let prepare_path = user_dir.join(PREPARE_FILE);
        let prepare_log = tokio::fs::read(&prepare_path)
            .await
            .map_err(|source| LaunchError::PrepareLogMissing { path: prepare_path, source })?;
        let usage = load_usage(user_dir).await;

        Ok(SandboxOutput {
            transcripts: RunTranscripts {
                in_log: test_to_user.transcript,
                out_log: user_to_test.transcript,
                extra_log: test_err.transcript,
                prepare_log,
            },
            exit,
            usage,
        })
    }

    async fn spawn(&self, workdir: &Path, role: &str) -> Result<Spawned, LaunchError> {
        let (name, command) = self.build_command(workdir, role)?;
        self.start(name, command).await
    }

    /// Unique sandbox name and its configured command; nothing is started
    fn build_command(&self, workdir: &Path, role: &str) -> Result<(String, Command), LaunchError> {
        let name = format!("sandrun-{}-{}", role, uuid::Uuid::new_v4());
        let mut command = self.sandbox.command(workdir, &name)?;
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok((name, command))
    }

    async fn start(&self, name: String, mut command: Command) -> Result<Spawned, LaunchError> {
        let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
            name: name.clone(),
            source,
        })?;

        let (stdin, stdout, stderr) = match take_pipes(&name, &mut child) {
            Ok(pipes) => pipes,
            Err(e) => {
                self.sandbox.terminate(&name).await;
                return Err(e);
            }
        };

        info!(sandbox = %name, pid = ?child.id(), "Sandbox started");
        Ok(Spawned {
            name,
            child,
            stdin,
            stdout,
            stderr,
        })
    }

    /// Wait for every relay. Returns the deadline if it had to kill sandboxes
    /// to get there; killing closes their pipes, which ends the relays.
    async fn await_barrier(
        &self,
        barrier: &CompletionBarrier,
        running: &mut [(&str, &mut Child)],
    ) -> Option<Duration> {
        let Some(limit) = self.timeout else {
            barrier.wait().await;
            return None;
        };

        if tokio::time::timeout(limit, barrier.wait()).await.is_ok() {
            return None;
        }

        warn!(
            timeout_ms = limit.as_millis() as u64,
            relays = barrier.expected(),
            "Run exceeded its deadline, killing sandboxes"
        );
        for (name, child) in running.iter_mut() {
            if let Err(e) = child.start_kill() {
                debug!(sandbox = %name, error = %e, "Kill failed, process likely gone");
            }
            self.sandbox.terminate(name).await;
        }
        barrier.wait().await;
        Some(limit)
    }

    async fn reap_harness(&self, name: &str, child: &mut Child) {
        match child.try_wait() {
            Ok(Some(status)) => debug!(sandbox = %name, status = %status, "Test harness exited"),
            Ok(None) => {
                debug!(sandbox = %name, "Test harness still running after user exit, stopping it");
                if let Err(e) = child.start_kill() {
                    debug!(sandbox = %name, error = %e, "Kill failed");
                }
                self.sandbox.terminate(name).await;
            }
            Err(e) => debug!(sandbox = %name, error = %e, "Could not query test harness status"),
        }
    }

    fn console_out(&self) -> BoxedSink {
        match self.echo {
            Echo::Console => Box::new(tokio::io::stdout()),
            Echo::Silent => Box::new(tokio::io::sink()),
        }
    }

    fn console_err(&self) -> BoxedSink {
        match self.echo {
            Echo::Console => Box::new(tokio::io::stderr()),
            Echo::Silent => Box::new(tokio::io::sink()),
        }
    }
}

fn take_pipes(
    name: &str,
    child: &mut Child,
) -> Result<(ChildStdin, ChildStdout, ChildStderr), LaunchError> {
    let missing = |stream| LaunchError::MissingPipe {
        name: name.to_string(),
        stream,
    };
    let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
    Ok((stdin, stdout, stderr))
}

async fn join_relay(
    stream: &'static str,
    handle: JoinHandle<RelayReport>,
) -> Result<RelayReport, LaunchError> {
    handle.await.map_err(|e| LaunchError::RelayFailed {
        stream,
        reason: e.to_string(),
    })
}

/// Read `stats.log`, falling back to zero usage when it is missing or malformed
pub async fn load_usage(dir: &Path) -> ResourceUsage {
    match read_usage(dir).await {
        Ok(usage) => usage,
        Err(e) => {
            warn!(error = %e, "Continuing without resource usage");
            ResourceUsage::default()
        }
    }
}

async fn read_usage(dir: &Path) -> Result<ResourceUsage, UsageError> {
    let path = dir.join(STATS_FILE);
    let unavailable = |reason: String| UsageError::ResourceUsageUnavailable {
        path: path.clone(),
        reason,
    };

    let raw = tokio::fs::read(&path)
        .await
        .map_err(|e| unavailable(e.to_string()))?;
    serde_json::from_slice(&raw).map_err(|e| unavailable(e.to_string()))
}
