//! Crate-wide error taxonomy.
//!
//! `GuestHalt` is deliberately absent here: a guest-requested halt is not an
//! error, it is communicated through [`crate::vm::VirtualMachine::is_stopped`].

use std::path::PathBuf;

/// Errors that can surface from configuration, bank I/O, or bank indexing.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// Invalid CLI argument or missing option value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Bank file could not be opened, or a read/write was short.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Bank index outside `0..=3`.
    #[error("bank index {0} out of range (expected 0..=3)")]
    BankIndex(u8),
}

pub type VmResult<T> = Result<T, VmError>;
