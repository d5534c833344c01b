//! Error types for transact operations

use crate::oracle::VerifyMode;
use thiserror::Error;

/// Transact client errors
///
/// Every variant is fatal to a test run. The only automatic retry anywhere in
/// the crate is the single reconnect after a busy pipe.
#[derive(Debug, Error)]
pub enum TransactError {
    #[error("cannot connect: {0}")]
    Connect(#[source] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("bad Read buffer after {mode}: A={}, C={count} ({detail})", fmt_address(.address))]
    Corruption {
        mode: VerifyMode,
        address: u64,
        count: u32,
        detail: String,
    },

    #[error("close failed: {0}")]
    Close(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TransactError {
    /// Process exit status for this error
    ///
    /// OS-backed errors report their errno; everything the client detects on
    /// its own reports `EIO`, except allocation failures (`ENOMEM`) and bad
    /// parameters (`EINVAL`).
    pub fn code(&self) -> i32 {
        match self {
            TransactError::Connect(e) | TransactError::Close(e) | TransactError::Io(e) => {
                e.raw_os_error().filter(|&c| c != 0).unwrap_or(libc::EIO)
            }
            TransactError::Protocol(_)
            | TransactError::Device(_)
            | TransactError::Corruption { .. } => libc::EIO,
            TransactError::Resource(_) => libc::ENOMEM,
            TransactError::Unsupported(_) | TransactError::Config(_) => libc::EINVAL,
        }
    }
}

/// Render a block address the way diagnostics print it: `hi:lo` in hex.
pub fn split_address(address: u64) -> String {
    format!("{:x}:{:x}", (address >> 32) as u32, address as u32)
}

fn fmt_address(address: &u64) -> String {
    split_address(*address)
}

/// Result type for transact operations
pub type TransactResult<T> = Result<T, TransactError>;
