//! pagelog - a durable, high-throughput append-only log
//!
//! The log is layered over a paged hybrid store: a ring of in-memory pages
//! backed by a block device, with a separate commit-metadata store providing
//! ordered durability. Producers append byte payloads and receive
//! monotonically increasing logical addresses; consumers scan by address
//! range, optionally tailing uncommitted data.
//!
//! # Features
//!
//! - Lock-free concurrent appends through a CAS-reserved tail
//! - Epoch-protected boundary shifts and page reclamation
//! - Ordered durability: entries up to `CommittedUntilAddress` survive crash
//! - Sync, try-based, and async append paths
//! - Named persistent scan cursors checkpointed with every commit
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use pagelog::{LogSettings, PageLog};
//! use pagelog::device::FileSystemDisk;
//!
//! let device = FileSystemDisk::single_file("/tmp/data.log")?;
//! let mut settings = LogSettings::default();
//! settings.commit_path = Some(device.default_commit_path());
//!
//! let log = PageLog::open(settings, device)?;
//! let address = log.append(b"hello")?;
//! log.flush_and_commit(true)?;
//!
//! for record in log.scan(pagelog::Address::ZERO, pagelog::Address::MAX) {
//!     println!("{}: {} bytes", record.current_address, record.length);
//! }
//! ```

#![warn(missing_docs)]

pub mod address;
pub mod allocator;
pub mod commit;
pub mod device;
pub mod epoch;
pub mod error;
pub mod log;
pub mod scan;
pub mod settings;
mod utility;

// Re-exports for convenience
pub use address::{Address, AtomicAddress};
pub use error::LogError;
pub use log::{AppendHandle, AppendOutcome, LogRecord, LogStats, PageLog};
pub use settings::LogSettings;

/// Constants used throughout the library
pub mod constants {
    /// Size of a cache line in bytes
    pub const CACHE_LINE_BYTES: usize = 64;

    /// Maximum number of threads supported by the epoch table
    pub const MAX_THREADS: usize = 96;
}

/// Utility for size literals (e.g., 1_GiB)
pub mod size {
    /// 1 KiB in bytes
    pub const KIB: u64 = 1024;
    /// 1 MiB in bytes
    pub const MIB: u64 = 1024 * KIB;
    /// 1 GiB in bytes
    pub const GIB: u64 = 1024 * MIB;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::address::Address;
    pub use crate::device::{FileSystemDisk, NullDisk, StorageDevice};
    pub use crate::error::LogError;
    pub use crate::log::{AppendOutcome, LogRecord, PageLog};
    pub use crate::scan::ScanBufferingMode;
    pub use crate::settings::LogSettings;
}
