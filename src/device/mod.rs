//! Storage device abstraction for the log.
//!
//! The log treats its backing store as an external collaborator reached
//! through the [`StorageDevice`] trait: aligned async reads and writes over a
//! flat byte-offset space with a stable segment file layout underneath.
//!
//! Available devices:
//!
//! - [`NullDisk`]: discards writes, reads zeros (memory-only testing)
//! - [`FileSystemDisk`]: single-file or segmented file storage
//!
//! Synchronous implementations only need [`SyncStorageDevice`]; the async
//! wrapper comes for free.

mod file_device;
mod null_device;
mod traits;

pub use file_device::{FileSystemDisk, FileSystemFile, SegmentedFile};
pub use null_device::NullDisk;
pub use traits::{StorageDevice, SyncStorageDevice};
