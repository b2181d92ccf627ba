//! Test runner for Hermit guest images.
//!
//! Invoked by cargo as a custom test-framework runner: the last positional
//! argument is the freshly built guest executable. The guest runs either
//! under QEMU (when a bootloader path is given) or under the uhyve
//! hypervisor, and the exit status plus the captured console output decide
//! the verdict.

mod output;
mod qemu;
mod runner;
mod testname;
mod uhyve;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{ensure, Context, Result};
use clap::{ArgAction, Parser};

use crate::qemu::QemuRunner;
use crate::runner::{RunnerConfig, TestRunner};
use crate::uhyve::UhyveRunner;

/// The in-guest unit-test suite is currently broken and is bypassed by name
/// instead of being reported as a failure.
const RESERVED_SKIP_TEST: &str = "hermit";

#[derive(Parser, Debug)]
#[command(name = "hermit-test-runner", about = "QEMU/uhyve test execution for Hermit guest images")]
struct Cli {
    /// Path to the Hermit bootloader; implicitly switches execution to QEMU
    #[arg(long = "bootloader_path", value_name = "PATH", conflicts_with = "uhyve_path")]
    bootloader_path: Option<PathBuf>,

    /// Path to uhyve if it is not in PATH
    #[arg(long = "uhyve_path", value_name = "PATH")]
    uhyve_path: Option<PathBuf>,

    /// Arguments handed over by the cargo test runner; the last one is the
    /// test executable, the rest are reserved
    #[arg(value_name = "RUNNER_ARGS", required = true, num_args = 1..)]
    runner_args: Vec<String>,

    /// Print the captured guest output even on success; -vv additionally
    /// runs the hypervisor itself verbosely
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    /// Let the guest wait for a gdb attachment on port 1234 before starting
    #[arg(long)]
    gdb: bool,

    /// Number of guest CPU cores
    #[arg(long = "num_cores", value_name = "N", default_value_t = 1)]
    num_cores: usize,

    /// Seconds before the run is aborted as timed out
    #[arg(long, value_name = "SECONDS", default_value_t = 300)]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let passed = run(cli).await?;
    Ok(if passed { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Returns true when the test passed (or was deliberately skipped).
async fn run(cli: Cli) -> Result<bool> {
    tracing::debug!(args = ?cli.runner_args, "runner arguments");

    // Leading runner_args are reserved; only the trailing executable path
    // is consumed.
    let test_exe = PathBuf::from(
        cli.runner_args
            .last()
            .context("no test executable argument given")?,
    );
    ensure!(
        test_exe.is_file(),
        "invalid path to test executable: {}",
        test_exe.display()
    );

    let config = RunnerConfig::new(cli.timeout, cli.num_cores, cli.gdb, cli.verbose >= 2)?;

    let file_name = test_exe
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("test executable has no valid file name: {}", test_exe.display()))?;
    let test_name = testname::clean_test_name(file_name);

    let runner = match &cli.bootloader_path {
        Some(bootloader) => TestRunner::Qemu(QemuRunner::new(&test_exe, bootloader, config)?),
        None => TestRunner::Uhyve(UhyveRunner::new(&test_exe, cli.uhyve_path.as_deref(), config)?),
    };

    if test_name == RESERVED_SKIP_TEST {
        println!("Executing the in-guest unit tests is currently broken. Skipping test without marking it as failed.");
        println!("If you wish to run them manually, invoke:");
        println!("`{}`", runner.command());
        return Ok(true);
    }

    let result = runner.run().await?;

    if result.timed_out {
        println!(
            "Test {} did not finish before timeout of {} seconds",
            test_name, cli.timeout
        );
        eprintln!(
            "Test failed - Dumping stderr:\n{}\n\nDumping stdout:\n{}",
            result.stderr, result.stdout
        );
        return Ok(false);
    }

    if runner.validate(&result) {
        println!(
            "Test Ok: {} - runtime: {:.2} seconds",
            test_name,
            result.elapsed.as_secs_f64()
        );
        if cli.verbose > 0 {
            println!("Test {test_name} stdout:\n{}", result.stdout);
            println!("Test {test_name} stderr:\n{}", result.stderr);
        }
        Ok(true)
    } else {
        println!(
            "Test failed: {} - runtime: {:.2} seconds",
            test_name,
            result.elapsed.as_secs_f64()
        );
        eprintln!(
            "Test failed - Dumping stderr:\n{}\n\nDumping stdout:\n{}",
            result.stderr, result.stdout
        );
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootloader_and_uhyve_paths_conflict() {
        let result = Cli::try_parse_from([
            "hermit-test-runner",
            "--bootloader_path",
            "loader",
            "--uhyve_path",
            "uhyve",
            "guest-exe",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn requires_at_least_one_runner_arg() {
        assert!(Cli::try_parse_from(["hermit-test-runner"]).is_err());
    }

    #[test]
    fn verbosity_counts_occurrences() {
        let cli = Cli::try_parse_from(["hermit-test-runner", "-vv", "guest-exe"]).unwrap();
        assert_eq!(cli.verbose, 2);

        let cli = Cli::try_parse_from(["hermit-test-runner", "--verbose", "guest-exe"]).unwrap();
        assert_eq!(cli.verbose, 1);
    }

    #[test]
    fn defaults_match_the_documented_surface() {
        let cli = Cli::try_parse_from(["hermit-test-runner", "guest-exe"]).unwrap();
        assert_eq!(cli.timeout, 300);
        assert_eq!(cli.num_cores, 1);
        assert_eq!(cli.verbose, 0);
        assert!(!cli.gdb);
        assert!(cli.bootloader_path.is_none());
        assert!(cli.uhyve_path.is_none());
    }

    #[test]
    fn last_runner_arg_is_the_executable() {
        let cli = Cli::try_parse_from(["hermit-test-runner", "reserved", "guest-exe"]).unwrap();
        assert_eq!(cli.runner_args.last().map(String::as_str), Some("guest-exe"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn zero_timeout_is_rejected_before_spawning() {
        let cli = Cli::try_parse_from(["hermit-test-runner", "--timeout", "0", "/bin/sh"]).unwrap();
        assert!(run(cli).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_test_executable_is_rejected() {
        let cli = Cli::try_parse_from(["hermit-test-runner", "/nonexistent/guest-exe"]).unwrap();
        assert!(run(cli).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reserved_test_name_skips_execution() {
        let path = std::env::temp_dir().join(format!("hermit-{:x}", std::process::id()));
        std::fs::write(&path, b"").unwrap();

        let cli = Cli::try_parse_from(["hermit-test-runner", path.to_str().unwrap()]).unwrap();
        assert!(run(cli).await.unwrap());

        std::fs::remove_file(path).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn passing_guest_reports_success() {
        // /bin/true stands in for uhyve: exit 0, no output, no panic marker.
        let cli = Cli::try_parse_from([
            "hermit-test-runner",
            "--uhyve_path",
            "/bin/true",
            "/bin/sh",
        ])
        .unwrap();
        assert!(run(cli).await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_guest_reports_failure() {
        // sleep rejects the image path as a bad interval and exits non-zero.
        let cli = Cli::try_parse_from([
            "hermit-test-runner",
            "--uhyve_path",
            "/bin/sleep",
            "--timeout",
            "10",
            "/bin/sh",
        ])
        .unwrap();
        assert!(!run(cli).await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn panicking_guest_fails_despite_exit_code_zero() {
        // /bin/echo exits 0 but parrots the image path, which carries the
        // panic marker here.
        let path = std::env::temp_dir().join(format!("guest-echo-{}!!!PANIC!!!", std::process::id()));
        std::fs::write(&path, b"").unwrap();

        let cli = Cli::try_parse_from([
            "hermit-test-runner",
            "--uhyve_path",
            "/bin/echo",
            path.to_str().unwrap(),
        ])
        .unwrap();
        assert!(!run(cli).await.unwrap());

        std::fs::remove_file(path).unwrap();
    }
}
