//! Shared subprocess execution for both runner variants.
//!
//! A runner owns a fixed [`CommandSpec`] and a validated [`RunnerConfig`].
//! Running it spawns exactly one child process, captures both output
//! streams, and waits for completion under a timeout. Interpreting the
//! outcome is variant-specific and handled by [`TestRunner::validate`].

use std::fmt;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context, Result};
use tokio::io::AsyncReadExt;

use crate::output;
use crate::qemu::QemuRunner;
use crate::uhyve::UhyveRunner;

/// Port the guest waits on for a debugger attachment.
pub const DEFAULT_GDB_PORT: u16 = 1234;

/// Guest memory size in megabytes.
pub const DEFAULT_GUEST_MEMORY_MB: u32 = 512;

/// A fixed command line plus runner-local environment overrides.
///
/// Built once by a runner constructor and not modified afterwards. The
/// overrides are layered on top of the inherited environment at spawn time
/// rather than mutating the process-wide environment.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub(crate) program: String,
    pub(crate) args: Vec<String>,
    pub(crate) env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
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

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn to_tokio_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Validated per-run configuration shared by both runner variants.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub timeout: Duration,
    pub num_cores: usize,
    pub memory_mb: u32,
    pub gdb_enabled: bool,
    /// Assigned only when gdb is enabled.
    pub gdb_port: Option<u16>,
    /// Run the hypervisor itself verbosely (`-vv` on the CLI).
    pub verbose: bool,
}

impl RunnerConfig {
    /// Validates the timeout and clamps the core count to what the host
    /// actually provides. Over-requesting cores is a warning, not an error.
    pub fn new(timeout_secs: u64, num_cores: usize, gdb_enabled: bool, verbose: bool) -> Result<Self> {
        ensure!(timeout_secs > 0, "timeout must be a positive number of seconds");

        let available = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        let num_cores = if num_cores > available {
            tracing::warn!(
                requested = num_cores,
                available,
                "more guest cores requested than the host provides, clamping"
            );
            available
        } else {
            num_cores
        };

        Ok(Self {
            timeout: Duration::from_secs(timeout_secs),
            num_cores,
            memory_mb: DEFAULT_GUEST_MEMORY_MB,
            gdb_enabled,
            gdb_port: gdb_enabled.then_some(DEFAULT_GDB_PORT),
            verbose,
        })
    }
}

/// Outcome of a single guest invocation.
#[derive(Debug)]
pub struct ExecutionResult {
    /// Absent when the run was aborted by the timeout.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    pub timed_out: bool,
}

/// The two supported execution environments for a guest image.
#[derive(Debug)]
pub enum TestRunner {
    Qemu(QemuRunner),
    Uhyve(UhyveRunner),
}

impl TestRunner {
    pub fn command(&self) -> &CommandSpec {
        match self {
            TestRunner::Qemu(runner) => runner.command(),
            TestRunner::Uhyve(runner) => runner.command(),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        match self {
            TestRunner::Qemu(runner) => runner.config(),
            TestRunner::Uhyve(runner) => runner.config(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            TestRunner::Qemu(_) => "qemu",
            TestRunner::Uhyve(_) => "uhyve",
        }
    }

    /// Executes the guest and returns the raw outcome.
    pub async fn run(&self) -> Result<ExecutionResult> {
        tracing::info!(
            runner = self.name(),
            command = %self.command(),
            timeout_secs = self.config().timeout.as_secs(),
            gdb = self.config().gdb_enabled,
            "launching guest test"
        );
        execute(self.command(), self.config().timeout).await
    }

    /// Applies the variant's exit-code policy, then the shared panic check.
    pub fn validate(&self, result: &ExecutionResult) -> bool {
        match self {
            TestRunner::Qemu(runner) => runner.validate(result),
            TestRunner::Uhyve(runner) => runner.validate(result),
        }
    }
}

/// Shared final check: the guest must not have printed the panic marker.
///
/// Dumps both captures to stderr on failure so a postmortem does not need a
/// second run.
pub(crate) fn validate_base(result: &ExecutionResult) -> bool {
    if output::validate_stdout(&result.stdout) {
        true
    } else {
        eprintln!(
            "Test failed due to panic. Dumping output (stderr):\n{}\n\nDumping stdout:\n{}\nFinished dump",
            result.stderr, result.stdout
        );
        false
    }
}

/// Spawns `command`, captures both output streams, and waits until it
/// completes or the timeout fires, whichever comes first.
async fn execute(command: &CommandSpec, timeout: Duration) -> Result<ExecutionResult> {
    let mut cmd = command.to_tokio_command();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let start = Instant::now();
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn `{}`", command.program))?;

    let mut stdout_pipe = child.stdout.take().context("guest stdout was not captured")?;
    let mut stderr_pipe = child.stderr.take().context("guest stderr was not captured")?;

    // Drain the pipes concurrently; a chatty guest must not be able to fill
    // the pipe buffers and deadlock against wait().
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => {
            let status = status.context("failed to wait for the guest process")?;
            let elapsed = start.elapsed();
            Ok(ExecutionResult {
                exit_code: status.code(),
                stdout: collect(stdout_task).await,
                stderr: collect(stderr_task).await,
                elapsed,
                timed_out: false,
            })
        }
        Err(_) => {
            tracing::debug!(program = %command.program, "timeout elapsed, killing guest");
            if let Err(error) = child.start_kill() {
                tracing::warn!(%error, "failed to kill timed-out guest");
            }
            let _ = child.wait().await;
            // Killing the child closes its pipes, so the drain tasks finish
            // with whatever partial output the guest produced.
            Ok(ExecutionResult {
                exit_code: None,
                stdout: collect(stdout_task).await,
                stderr: collect(stderr_task).await,
                elapsed: timeout,
                timed_out: true,
            })
        }
    }
}

async fn collect(task: tokio::task::JoinHandle<Vec<u8>>) -> String {
    String::from_utf8_lossy(&task.await.unwrap_or_default()).into_owned()
}
