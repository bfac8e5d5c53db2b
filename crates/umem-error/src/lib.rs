#![forbid(unsafe_code)]
//! Error types for umem.
//!
//! Defines `UmemError` and a `Result<T>` alias used throughout the
//! workspace. Recoverable I/O errors propagate through `?`; programming
//! errors (illegal descriptor transitions, teardown with resident pages)
//! are panics at the point of violation and never appear here.

use thiserror::Error;
use umem_types::{PageAddr, TypeError};

/// Unified error type for all umem operations.
#[derive(Debug, Error)]
pub enum UmemError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("store access out of bounds: offset={offset} len={len} store_len={store_len}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        store_len: u64,
    },

    #[error("store is read-only")]
    ReadOnly,

    #[error("address {0} is not covered by any mapped region")]
    Unmapped(PageAddr),

    #[error("region overlaps an existing mapping at base {0}")]
    RegionOverlap(PageAddr),

    #[error("engine is shutting down")]
    ShuttingDown,
}

impl From<TypeError> for UmemError {
    fn from(err: TypeError) -> Self {
        Self::Config(err.to_string())
    }
}

impl UmemError {
    /// Whether a worker may retry the failed operation.
    ///
    /// Used by the eviction write-back loop: transient store errors are
    /// retried a bounded number of times, everything else is terminal.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// Result alias using `UmemError`.
pub type Result<T> = std::result::Result<T, UmemError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupted_io_is_transient() {
        let err = UmemError::from(std::io::Error::from(std::io::ErrorKind::Interrupted));
        assert!(err.is_transient());
    }

    #[test]
    fn hard_errors_are_not_transient() {
        let not_found = UmemError::from(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(!not_found.is_transient());
        assert!(!UmemError::ReadOnly.is_transient());
        assert!(!UmemError::Config("x".to_owned()).is_transient());
    }

    #[test]
    fn type_errors_convert_to_config() {
        let err: UmemError = TypeError::InvalidField {
            field: "page_size",
            reason: "must be a power of two in 512..=16MiB",
        }
        .into();
        assert!(matches!(err, UmemError::Config(_)));
    }
}
