//! QEMU-based execution of Hermit guest images.
//!
//! Full-system emulation boots the guest through the Hermit bootloader and
//! reads the test verdict from the isa-debug-exit device, which encodes the
//! guest's exit value in QEMU's own exit status.

use std::path::Path;

use anyhow::{ensure, Context, Result};

use crate::runner::{validate_base, CommandSpec, ExecutionResult, RunnerConfig};

/// Program expected on PATH for the emulator variant.
pub const QEMU_PROGRAM: &str = "qemu-system-x86_64";

/// Exit status the isa-debug-exit device reports on success: the guest
/// writes 0x10 to port 0xf4 and QEMU exits with `(0x10 << 1) | 1`.
pub const QEMU_SUCCESS_CODE: i32 = 33;

/// CPU features the Hermit kernel requires from the emulated processor.
const QEMU_CPU_FEATURES: &str = "qemu64,apic,fsgsbase,rdtscp,xsave,xsaveopt,fxsr";

/// Debug-exit device descriptor; lets the guest report an exit status.
const QEMU_DEBUG_EXIT_DEVICE: &str = "isa-debug-exit,iobase=0xf4,iosize=0x04";

/// Runs a guest image under full-system emulation via the bootloader.
///
/// QEMU has no guest-verbosity switch, so the hypervisor-verbosity bit of
/// the configuration is ignored on this path.
#[derive(Debug)]
pub struct QemuRunner {
    command: CommandSpec,
    config: RunnerConfig,
}

impl QemuRunner {
    pub fn new(test_exe: &Path, bootloader: &Path, config: RunnerConfig) -> Result<Self> {
        ensure!(
            test_exe.is_file(),
            "invalid path to test executable: {}",
            test_exe.display()
        );
        ensure!(
            bootloader.is_file(),
            "invalid bootloader path: {}",
            bootloader.display()
        );
        let bootloader = bootloader
            .canonicalize()
            .with_context(|| format!("failed to resolve bootloader path {}", bootloader.display()))?;

        let mut command = CommandSpec::new(QEMU_PROGRAM)
            .args(["-display", "none"])
            .args(["-smp", &config.num_cores.to_string()])
            .args(["-m", &format!("{}M", config.memory_mb)])
            .args(["-serial", "stdio"])
            .args(["-kernel", &bootloader.to_string_lossy()])
            .args(["-initrd", &test_exe.to_string_lossy()])
            .args(["-cpu", QEMU_CPU_FEATURES])
            .args(["-device", QEMU_DEBUG_EXIT_DEVICE]);
        if let Some(port) = config.gdb_port {
            command = command.args(["-s", "-S"]);
            println!("Testing with gdb enabled at port {port}");
        }

        Ok(Self { command, config })
    }

    /// QEMU-specific exit-code policy.
    ///
    /// The debug-exit device encodes the guest's verdict in the exit
    /// status; stdout is only consulted once the status checks pass.
    pub(crate) fn validate(&self, result: &ExecutionResult) -> bool {
        match result.exit_code {
            Some(0) => {
                // The isa-debug-exit device maps every guest exit to a
                // non-zero status; a zero here means the QEMU integration
                // changed underneath us, not that the test failed.
                tracing::error!(
                    "QEMU exited with status 0, which the isa-debug-exit device should make impossible"
                );
                false
            }
            Some(1) => {
                if which::which(QEMU_PROGRAM).is_err() {
                    eprintln!("Test failed due to QEMU error: `{QEMU_PROGRAM}` was not found in PATH");
                } else {
                    eprintln!("Test failed due to QEMU error. Is QEMU installed correctly?");
                }
                false
            }
            Some(QEMU_SUCCESS_CODE) => validate_base(result),
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
