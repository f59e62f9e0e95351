//! Error types for log operations.

use std::io;

use crate::address::Address;

/// Errors returned by log operations.
///
/// Transient allocation backpressure and expired partial allocations are not
/// errors; they surface through [`crate::log::AppendOutcome`] instead.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Device I/O failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The commit metadata store failed to persist or yield recovery info.
    /// The committed-until marker is not advanced past the failure.
    #[error("commit metadata error: {0}")]
    Commit(String),

    /// Invalid configuration, rejected before the allocator is initialized.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A malformed record was encountered while scanning.
    #[error("corrupt record at address {address}: {reason}")]
    Corruption {
        /// Address of the malformed record header.
        address: Address,
        /// What was wrong with it.
        reason: String,
    },

    /// The entry cannot fit in a single page.
    #[error("entry of {size} bytes exceeds the page capacity of {max} bytes")]
    EntryTooLarge {
        /// Total reserved size of the record, header and padding included.
        size: usize,
        /// Page size in bytes.
        max: usize,
    },

    /// The log has been closed.
    #[error("log is closed")]
    Closed,

    /// More threads touched the log concurrently than the epoch table holds.
    #[error("too many concurrent threads")]
    TooManyThreads,
}

impl LogError {
    pub(crate) fn commit(message: impl Into<String>) -> Self {
        LogError::Commit(message.into())
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        LogError::Config(message.into())
    }

    pub(crate) fn corruption(address: Address, reason: impl Into<String>) -> Self {
        LogError::Corruption {
            address,
            reason: reason.into(),
        }
    }
}
