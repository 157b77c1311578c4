//! RC2014-class Z80 virtual machine core.
//!
//! This crate implements the hard core of an 8-bit microcomputer emulator:
//! a Z80 interpreter, a four-bank paged MMU, one or two MC6850-style ACIA
//! channels, a CRT timing unit, and the single-threaded fractional-rate
//! scheduler that interleaves them. It never sleeps, never spawns a thread,
//! and never reads CLI arguments — those are the host binary's job
//! (`src/main.rs` and `src/host.rs`).

pub mod cpu;
pub mod error;
pub mod mmu;
pub mod registers;
pub mod sio;
pub mod vdu;
pub mod vm;

pub use error::{VmError, VmResult};
pub use vm::VirtualMachine;
