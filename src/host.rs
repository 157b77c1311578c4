//! Host-side collaborators: CLI parsing, terminal-guard lifetime, frame
//! pacing and the top-level error sink.
//!
//! Spec §1 calls these out as external collaborators the VM core never
//! depends on. Since this retrieval has no separate host application, they
//! live here as the crate's own binary-adjacent module; `rc2014_vm::vm`
//! still never imports anything from this file.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{debug, error, info};

use rc2014_vm::VirtualMachine;

/// Target frame period when not running `--turbo` (spec §6).
const FRAME_PERIOD: Duration = Duration::from_micros(16_667);

/// CLI surface (spec §6).
#[derive(Parser, Debug)]
#[command(name = "rc2014-vm", version, about = "RC2014-class Z80 virtual machine")]
pub struct Options {
    /// Boot the ZEXALL instruction-exerciser ROM into bank 0.
    #[arg(long, conflicts_with = "basic")]
    pub zexall: bool,

    /// Boot the BASIC ROM into bank 0.
    #[arg(long, conflicts_with = "zexall")]
    pub basic: bool,

    /// Override bank 0's image path (wins over `--zexall`/`--basic`).
    #[arg(long)]
    pub bank0: Option<PathBuf>,

    /// Override bank 1's image path.
    #[arg(long, default_value = "assets/bank1.rom")]
    pub bank1: PathBuf,

    /// Override bank 2's image path.
    #[arg(long, default_value = "assets/bank2.rom")]
    pub bank2: PathBuf,

    /// Override bank 3's image path.
    #[arg(long, default_value = "assets/bank3.rom")]
    pub bank3: PathBuf,

    /// Run the host pacer as fast as possible instead of at ~60 FPS.
    #[arg(long)]
    pub turbo: bool,

    /// Enable the scheduler watchdog: reset the machine after this many
    /// idle scheduler iterations with no frame boundary. Off by default.
    #[arg(long)]
    pub watchdog: Option<u64>,
}

impl Options {
    /// Resolves bank 0's path from `--bank0`, then `--zexall`/`--basic`,
    /// then the ZEXALL default (spec §6).
    pub fn bank0_path(&self) -> PathBuf {
        if let Some(path) = &self.bank0 {
            return path.clone();
        }
        if self.basic {
            return PathBuf::from("assets/basic.rom");
        }
        PathBuf::from("assets/zexall.rom")
    }

    pub fn bank_paths(&self) -> [PathBuf; 4] {
        [
            self.bank0_path(),
            self.bank1.clone(),
            self.bank2.clone(),
            self.bank3.clone(),
        ]
    }
}

/// Snapshots stdin's termios on construction and restores it on drop, so a
/// crash mid-run never leaves the terminal in raw mode (spec §5).
pub struct TerminalGuard {
    saved: Option<rustix::termios::Termios>,
}

impl TerminalGuard {
    pub fn new() -> Self {
        let stdin = rustix::stdio::stdin();
        let saved = rustix::termios::tcgetattr(stdin).ok();
        if saved.is_none() {
            debug!("stdin is not a TTY, terminal guard is a no-op");
        }
        Self { saved }
    }

    fn restore(&mut self) {
        if let Some(termios) = self.saved.take() {
            let stdin = rustix::stdio::stdin();
            if let Err(e) = rustix::termios::tcsetattr(stdin, rustix::termios::OptionalActions::Now, &termios) {
                error!(error = %e, "failed to restore terminal attributes");
            }
        }
    }

}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

impl Default for TerminalGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleeps the host thread between `VirtualMachine::clock()` calls to hold a
/// steady frame rate, unless running `--turbo` (spec §6).
pub struct FrameClock {
    turbo: bool,
    next_frame: Instant,
}

impl FrameClock {
    pub fn new(turbo: bool) -> Self {
        Self {
            turbo,
            next_frame: Instant::now() + FRAME_PERIOD,
        }
    }

    pub fn tick(&mut self) {
        if self.turbo {
            return;
        }
        let now = Instant::now();
        if now < self.next_frame {
            std::thread::sleep(self.next_frame - now);
        }
        self.next_frame = (now.max(self.next_frame)) + FRAME_PERIOD;
    }
}

/// Drives the VM to completion: resets it, loops `clock()` under the frame
/// pacer until `stopped`, and reports the outcome.
pub struct HostDriver {
    options: Options,
}

impl HostDriver {
    pub fn new(options: Options) -> Self {
        Self { options }
    }

    pub fn run(self) -> rc2014_vm::VmResult<()> {
        let _guard = TerminalGuard::new();

        let mut vm = VirtualMachine::new().with_watchdog(self.options.watchdog);
        let bank_paths = self.options.bank_paths();
        info!(
            bank0 = %bank_paths[0].display(),
            bank1 = %bank_paths[1].display(),
            bank2 = %bank_paths[2].display(),
            bank3 = %bank_paths[3].display(),
            turbo = self.options.turbo,
            "resetting virtual machine"
        );
        vm.reset(bank_paths)?;

        let mut pacer = FrameClock::new(self.options.turbo);
        while !vm.is_stopped() {
            vm.clock();
            pacer.tick();
        }

        info!("virtual machine stopped cleanly");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bank0_path_prefers_explicit_override() {
        let opts = Options {
            zexall: false,
            basic: true,
            bank0: Some(PathBuf::from("custom.rom")),
            bank1: PathBuf::from("b1.rom"),
            bank2: PathBuf::from("b2.rom"),
            bank3: PathBuf::from("b3.rom"),
            turbo: false,
            watchdog: None,
        };
        assert_eq!(opts.bank0_path(), PathBuf::from("custom.rom"));
    }

    #[test]
    fn bank0_path_falls_back_to_basic_then_zexall_default() {
        let basic = Options {
            zexall: false,
            basic: true,
            bank0: None,
            bank1: PathBuf::from("b1.rom"),
            bank2: PathBuf::from("b2.rom"),
            bank3: PathBuf::from("b3.rom"),
            turbo: false,
            watchdog: None,
        };
        assert_eq!(basic.bank0_path(), PathBuf::from("assets/basic.rom"));

        let default = Options {
            zexall: false,
            basic: false,
            bank0: None,
            bank1: PathBuf::from("b1.rom"),
            bank2: PathBuf::from("b2.rom"),
            bank3: PathBuf::from("b3.rom"),
            turbo: false,
            watchdog: None,
        };
        assert_eq!(default.bank0_path(), PathBuf::from("assets/zexall.rom"));
    }
}
