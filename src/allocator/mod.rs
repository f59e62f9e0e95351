//! The paged allocator: monotonic address reservation over a ring of
//! in-memory pages, with epoch-staged boundary shifts and an ordered flush
//! pipeline.

pub mod hybrid_log;
pub mod page_allocator;

pub use hybrid_log::{AllocationResult, PagedLogAllocator};
pub(crate) use hybrid_log::FlushRange;
pub use page_allocator::{PageSlot, SlotState, NO_PAGE};
