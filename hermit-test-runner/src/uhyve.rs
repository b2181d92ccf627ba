//! uhyve-based execution of Hermit guest images.
//!
//! uhyve loads the unikernel image directly, so no bootloader is involved.
//! Options its command line cannot express (gdb port, core count) are
//! passed as runner-local environment overrides instead.

use std::path::Path;

use anyhow::{bail, ensure, Context, Result};

use crate::runner::{validate_base, CommandSpec, ExecutionResult, RunnerConfig};

/// Environment variable uhyve reads for the guest core count.
pub const HERMIT_CPUS_ENV: &str = "HERMIT_CPUS";

/// Environment variable uhyve reads for the gdb port.
pub const HERMIT_GDB_PORT_ENV: &str = "HERMIT_GDB_PORT";

const UHYVE_PROGRAM: &str = "uhyve";

/// Runs a guest image under the uhyve hypervisor.
#[derive(Debug)]
pub struct UhyveRunner {
    command: CommandSpec,
    config: RunnerConfig,
}

impl UhyveRunner {
    pub fn new(test_exe: &Path, uhyve_path: Option<&Path>, config: RunnerConfig) -> Result<Self> {
        if cfg!(windows) {
            bail!(
                "uhyve requires KVM and cannot run on Windows; \
                 use Linux or macOS, or switch to QEMU via --bootloader_path"
            );
        }

        let program = match uhyve_path {
            Some(path) => {
                ensure!(path.is_file(), "invalid uhyve path: {}", path.display());
                path.canonicalize()
                    .with_context(|| format!("failed to resolve uhyve path {}", path.display()))?
                    .to_string_lossy()
                    .into_owned()
            }
            None => match which::which(UHYVE_PROGRAM) {
                Ok(path) => path.to_string_lossy().into_owned(),
                Err(error) => {
                    // Not fatal here: the reserved-name bypass never spawns,
                    // and a real run surfaces this as a spawn error.
                    tracing::debug!(%error, "uhyve not found in PATH, deferring to spawn");
                    UHYVE_PROGRAM.to_string()
                }
            },
        };

        let mut command = CommandSpec::new(program);
        if config.verbose {
            command = command.arg("-v");
        }
        command = command.arg(test_exe.to_string_lossy());
        if let Some(port) = config.gdb_port {
            command = command.env(HERMIT_GDB_PORT_ENV, port.to_string());
            println!("Testing with gdb enabled at port {port}");
        }
        if config.num_cores != 1 {
            command = command.env(HERMIT_CPUS_ENV, config.num_cores.to_string());
        }

        Ok(Self { command, config })
    }

    /// uhyve reports guest failures through its own exit status; only a
    /// clean zero gets as far as the panic-marker check.
    pub(crate) fn validate(&self, result: &ExecutionResult) -> bool {
        match result.exit_code {
            Some(0) => validate_base(result),
            Some(code) => {
                eprintln!("Test failed due to error exit code: {code}");
                false
            }
            None => false,
        }
    }

    pub fn command(&self) -> &CommandSpec {
        &self.command
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }
}
