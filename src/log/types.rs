//! Shared types for the log façade.

use std::fmt;

use crate::address::Address;

/// Handle for a partial append whose page turn is still in flight.
///
/// Returned by [`crate::log::PageLog::try_append`] as
/// [`AppendOutcome::Pending`]; the holder owns the in-flight page turn and
/// must eventually resume it with
/// [`crate::log::PageLog::try_complete_append`].
#[derive(Debug)]
pub struct AppendHandle {
    pub(crate) address: Address,
    pub(crate) reserved: u32,
}

impl AppendHandle {
    /// The address the pending record will occupy once the page is ready.
    pub fn address(&self) -> Address {
        self.address
    }
}

/// Outcome of a try-append step.
#[derive(Debug)]
pub enum AppendOutcome {
    /// The record was written at the given address.
    Done(Address),
    /// The append crossed into a page that is not writable yet; resume with
    /// [`crate::log::PageLog::try_complete_append`] using this handle.
    Pending(AppendHandle),
    /// The attempt lost to a concurrent page turn, or a pending page slid
    /// below the read-only boundary; start over with a fresh `try_append`.
    Restart,
}

/// A record yielded by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Record payload
    pub payload: Vec<u8>,
    /// Payload length in bytes
    pub length: u32,
    /// Address of the record header
    pub current_address: Address,
    /// Address of the next record, aligned to the 4-byte record boundary
    pub next_address: Address,
}

/// Statistics about the log
#[derive(Debug, Clone)]
pub struct LogStats {
    /// First valid address
    pub begin_address: Address,
    /// Published head address
    pub head_address: Address,
    /// Read-only boundary
    pub read_only_address: Address,
    /// Durable frontier
    pub flushed_until_address: Address,
    /// Committed frontier
    pub committed_until_address: Address,
    /// Tail address
    pub tail_address: Address,
    /// Page size in bytes
    pub page_size: u64,
    /// Number of pages in the in-memory ring
    pub buffer_pages: u64,
}

impl fmt::Display for LogStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Log statistics:")?;
        writeln!(f, "  Begin: {}", self.begin_address)?;
        writeln!(f, "  Head: {}", self.head_address)?;
        writeln!(f, "  Read-only: {}", self.read_only_address)?;
        writeln!(f, "  Flushed: {}", self.flushed_until_address)?;
        writeln!(f, "  Committed: {}", self.committed_until_address)?;
        writeln!(f, "  Tail: {}", self.tail_address)?;
        writeln!(f, "  Page size: {} bytes", self.page_size)?;
        writeln!(f, "  Buffer pages: {}", self.buffer_pages)
    }
}
