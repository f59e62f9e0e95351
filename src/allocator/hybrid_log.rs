//! Paged log allocator.
//!
//! Manages a circular ring of in-memory pages partitioned by four boundary
//! markers:
//!
//! - below `head`: evicted, resolvable only through the device
//! - `head .. read_only`: resident, read-only, flushing or flushed
//! - `read_only .. tail`: resident and mutable
//! - at `tail`: the next reservation
//!
//! All boundary markers advance monotonically. The published (`safe`)
//! positions of the head and read-only boundaries are staged through the
//! epoch, so they observe quiescence on the ranges they give up.

use std::cmp;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam::channel::Sender;
use parking_lot::Mutex;

use crate::address::{Address, AtomicAddress, AtomicPageOffset, PageOffset};
use crate::allocator::page_allocator::{PageSlot, SlotState, NO_PAGE};
use crate::device::StorageDevice;
use crate::epoch::LightEpoch;
use crate::error::LogError;
use crate::log::io::block_on_device;
use crate::settings::LogSettings;
use crate::utility::AlignedBuffer;

/// Buffer alignment for page memory and device transfers
const PAGE_ALIGNMENT: usize = 4096;

/// Outcome of a tail reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationResult {
    /// Reservation succeeded; the range starting at the address is writable.
    Ready(Address),
    /// The reservation crossed into a page whose ring slot is not writable
    /// yet. The address is where the reservation will land; the caller owns
    /// the in-flight page turn and must eventually call
    /// [`PagedLogAllocator::check_allocate_complete`] with it.
    Pending(Address),
    /// Another thread owns an in-flight page turn; retry from scratch.
    Restart,
}

/// A flush request for a byte range within a single page.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FlushRange {
    /// First byte to write (inclusive)
    pub start: Address,
    /// One past the last byte to write
    pub end: Address,
}

/// Hands sealed ranges to the flush worker in address order.
///
/// Issuance runs inside epoch-deferred actions, which may execute on any
/// thread; the lock keeps the channel ordering identical to address order.
struct FlushPipeline {
    page_bits: u32,
    issued: Mutex<Address>,
    tx: Sender<FlushRange>,
}

impl FlushPipeline {
    /// Enqueue everything below `target` that has not been issued yet,
    /// split at page boundaries.
    fn issue_up_to(&self, target: Address) {
        let mut issued = self.issued.lock();
        while *issued < target {
            let end = cmp::min(issued.next_page_start(self.page_bits), target);
            let range = FlushRange {
                start: *issued,
                end,
            };
            if self.tx.send(range).is_err() {
                // Flush worker is gone; the log is shutting down.
                break;
            }
            *issued = end;
        }
    }
}

/// The paged allocator backing a log.
///
/// Hands out monotonic logical addresses via a lock-free tail, orchestrates
/// page turns, and feeds sealed ranges to the flush worker in address order.
pub struct PagedLogAllocator<D: StorageDevice> {
    /// Page size as a bit shift
    page_bits: u32,
    /// Page size in bytes
    page_size: u64,
    /// Number of pages in the ring
    buffer_pages: u64,
    /// Number of trailing pages kept mutable
    mutable_pages: u64,
    /// Backing device
    device: Arc<D>,
    /// Epoch protector shared with the log
    epoch: Arc<LightEpoch>,
    /// Ring of page buffers
    pages: Box<[AlignedBuffer]>,
    /// Ring-slot ownership and state
    slots: Box<[PageSlot]>,
    /// Tail reservation pointer
    tail: AtomicPageOffset,
    /// First valid address (advanced by truncation)
    begin_address: AtomicAddress,
    /// Requested head position
    head_target: AtomicAddress,
    /// Published head position; resident reads require `addr >= safe_head`
    safe_head_address: Arc<AtomicAddress>,
    /// Requested read-only boundary
    read_only_address: AtomicAddress,
    /// Published read-only boundary; flushes are issued up to here
    safe_read_only_address: Arc<AtomicAddress>,
    /// Durable frontier; advances contiguously as flushes complete
    flushed_until_address: AtomicAddress,
    /// Ordered flush issuance
    pipeline: Arc<FlushPipeline>,
}

impl<D: StorageDevice> PagedLogAllocator<D> {
    /// Create an allocator with all boundaries at zero.
    ///
    /// [`Self::restore`] must run before the first allocation.
    pub(crate) fn new(
        settings: &LogSettings,
        device: Arc<D>,
        epoch: Arc<LightEpoch>,
        flush_tx: Sender<FlushRange>,
    ) -> Result<Self, LogError> {
        settings.validate()?;

        let page_bits = settings.page_size_bits;
        let page_size = 1u64 << page_bits;
        let buffer_pages = settings.buffer_pages();
        let mutable_pages = cmp::max(1, (settings.mutable_fraction * buffer_pages as f64) as u64);

        let mut pages = Vec::with_capacity(buffer_pages as usize);
        let mut slots = Vec::with_capacity(buffer_pages as usize);
        for _ in 0..buffer_pages {
            let buffer = AlignedBuffer::zeroed(PAGE_ALIGNMENT, page_size as usize)
                .ok_or_else(|| LogError::config("failed to allocate page ring"))?;
            pages.push(buffer);
            slots.push(PageSlot::new());
        }

        Ok(Self {
            page_bits,
            page_size,
            buffer_pages,
            mutable_pages,
            device,
            epoch,
            pages: pages.into_boxed_slice(),
            slots: slots.into_boxed_slice(),
            tail: AtomicPageOffset::default(),
            begin_address: AtomicAddress::default(),
            head_target: AtomicAddress::default(),
            safe_head_address: Arc::new(AtomicAddress::default()),
            read_only_address: AtomicAddress::default(),
            safe_read_only_address: Arc::new(AtomicAddress::default()),
            flushed_until_address: AtomicAddress::default(),
            pipeline: Arc::new(FlushPipeline {
                page_bits,
                issued: Mutex::new(Address::ZERO),
                tx: flush_tx,
            }),
        })
    }

    #[inline]
    fn address_of(&self, page: u64, offset: u64) -> Address {
        Address::new((page << self.page_bits) + offset)
    }

    #[inline]
    fn slot_for(&self, page: u64) -> &PageSlot {
        &self.slots[(page % self.buffer_pages) as usize]
    }

    /// Page size in bytes
    #[inline]
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Page size as a bit shift
    #[inline]
    pub fn page_bits(&self) -> u32 {
        self.page_bits
    }

    /// Number of pages in the in-memory ring
    #[inline]
    pub fn buffer_pages(&self) -> u64 {
        self.buffer_pages
    }

    /// Backing device handle
    #[inline]
    pub(crate) fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Ask the flush worker to shut down once the queue drains.
    pub(crate) fn send_flush_shutdown(&self) {
        let _ = self.pipeline.tx.send(FlushRange {
            start: Address::ZERO,
            end: Address::ZERO,
        });
    }

    /// Current tail address (clamped to the page end during a page turn)
    #[inline]
    pub fn tail_address(&self) -> Address {
        self.tail.load(Ordering::Acquire).to_address(self.page_bits)
    }

    /// First valid address
    #[inline]
    pub fn begin_address(&self) -> Address {
        self.begin_address.load(Ordering::Acquire)
    }

    /// Published head address
    #[inline]
    pub fn head_address(&self) -> Address {
        self.safe_head_address.load(Ordering::Acquire)
    }

    /// Requested read-only boundary
    #[inline]
    pub fn read_only_address(&self) -> Address {
        self.read_only_address.load(Ordering::Acquire)
    }

    /// Published read-only boundary
    #[inline]
    pub fn safe_read_only_address(&self) -> Address {
        self.safe_read_only_address.load(Ordering::Acquire)
    }

    /// Durable frontier
    #[inline]
    pub fn flushed_until_address(&self) -> Address {
        self.flushed_until_address.load(Ordering::Acquire)
    }

    /// Whether the durable frontier has reached `target`.
    #[inline]
    pub(crate) fn is_flushed_until(&self, target: Address) -> bool {
        self.flushed_until_address() >= target
    }

    /// Reconstruct in-memory state from persisted metadata during open.
    ///
    /// Reloads the flushed prefix of the tail page from the device so appends
    /// continue mid-page.
    pub(crate) fn restore(
        &self,
        flushed_until: Address,
        head: Address,
        begin: Address,
    ) -> Result<(), LogError> {
        self.begin_address.store(begin, Ordering::Release);
        self.head_target.store(head, Ordering::Release);
        self.safe_head_address.store(head, Ordering::Release);
        self.read_only_address
            .store(flushed_until, Ordering::Release);
        self.safe_read_only_address
            .store(flushed_until, Ordering::Release);
        self.flushed_until_address
            .store(flushed_until, Ordering::Release);
        *self.pipeline.issued.lock() = flushed_until;

        let page = flushed_until.page(self.page_bits);
        let offset = flushed_until.offset(self.page_bits);
        self.tail
            .store(PageOffset::new(page, offset), Ordering::Release);

        let slot = self.slot_for(page);
        slot.install(NO_PAGE, page);
        slot.open();

        let reload_from = cmp::max(head, flushed_until.page_start(self.page_bits));
        if reload_from < flushed_until {
            let slot_idx = (page % self.buffer_pages) as usize;
            let len = (flushed_until - reload_from) as usize;
            let dst_offset = reload_from.offset(self.page_bits) as usize;
            // Open runs single-threaded; no appender can touch the ring yet.
            let dst = unsafe {
                std::slice::from_raw_parts_mut(
                    self.pages[slot_idx].as_ptr().add(dst_offset) as *mut u8,
                    len,
                )
            };
            block_on_device(self.device.read(reload_from.control(), dst))?;
            tracing::debug!(
                from = reload_from.control(),
                until = flushed_until.control(),
                "reloaded partial tail page"
            );
        }

        Ok(())
    }

    /// Reserve `size` bytes at the tail.
    ///
    /// The caller must hold epoch protection.
    pub fn try_allocate(&self, size: u32) -> AllocationResult {
        debug_assert!(size as u64 <= self.page_size);
        debug_assert!(size % 4 == 0);

        let reserved = self.tail.reserve(size as u64);
        let page = reserved.page();
        let offset = reserved.offset();
        let end = offset + size as u64;

        if end <= self.page_size {
            let address = self.address_of(page, offset);
            debug_assert!(self.slot_for(page).is_open_for(page));
            return AllocationResult::Ready(address);
        }

        if offset > self.page_size {
            // Another thread crossed first and owns the page turn.
            return AllocationResult::Restart;
        }

        // This reservation crossed the boundary: we own the page turn. Seal
        // the page at its crossing offset; the rest of the page stays zero
        // and scans treat a zero length word as a page skip.
        self.slot_for(page).seal();
        self.on_page_sealed(page);

        let next = page + 1;
        if !self.try_open_page(next) {
            return AllocationResult::Pending(self.address_of(next, 0));
        }

        self.tail.publish(next, size as u64);
        AllocationResult::Ready(self.address_of(next, 0))
    }

    /// Try to convert a pending reservation into a usable address.
    ///
    /// The caller must hold epoch protection and must be the owner of the
    /// in-flight page turn (the thread that received the `Pending`).
    pub fn check_allocate_complete(&self, pending: Address, size: u32) -> AllocationResult {
        debug_assert_eq!(pending.offset(self.page_bits), 0);

        let page = pending.page(self.page_bits);
        if !self.try_open_page(page) {
            return AllocationResult::Pending(pending);
        }

        self.tail.publish(page, size as u64);
        AllocationResult::Ready(pending)
    }

    /// Mark all mutable pages up to the current tail as read-only and
    /// schedule their flush. Returns the tail it captured.
    pub fn shift_read_only_to_tail(&self) -> Address {
        let tail = self.tail_address();
        self.shift_read_only(tail);
        tail
    }

    /// Advance `begin` forward, unreferencing earlier addresses.
    ///
    /// The region below the new begin is driven to read-only so the
    /// flush/eviction chain can release it; the head follows once the flush
    /// lands (see [`Self::drag_head_for_truncation`]).
    pub fn shift_begin_address(&self, until: Address) -> Address {
        let until = cmp::min(until, self.tail_address());
        if self.begin_address.advance(until) {
            self.shift_read_only(until);
        }
        self.begin_address()
    }

    /// Pull the head up to the truncated begin once the flush allows it.
    pub(crate) fn drag_head_for_truncation(&self) {
        let begin = self.begin_address();
        if self.head_address() < begin {
            self.shift_head(begin);
        }
    }

    fn on_page_sealed(&self, page: u64) {
        let next = page + 1;
        if next + 1 > self.mutable_pages {
            let ro_page = next + 1 - self.mutable_pages;
            self.shift_read_only(self.address_of(ro_page, 0));
        }
    }

    /// Monotonically advance the read-only boundary and stage its
    /// publication (plus flush issuance) through the epoch.
    fn shift_read_only(&self, target: Address) {
        let target = cmp::min(target, self.tail_address());
        if self.read_only_address.advance(target) {
            let safe_read_only = Arc::clone(&self.safe_read_only_address);
            let pipeline = Arc::clone(&self.pipeline);
            self.epoch.bump_current_epoch_with_action(move || {
                safe_read_only.advance(target);
                pipeline.issue_up_to(target);
            });
        }
    }

    /// Monotonically advance the head, capped by the durable frontier, and
    /// stage its publication through the epoch.
    fn shift_head(&self, desired: Address) {
        let cap = cmp::min(self.flushed_until_address(), self.read_only_address());
        let target = cmp::min(desired, cap);
        if self.head_target.advance(target) {
            let safe_head = Arc::clone(&self.safe_head_address);
            self.epoch.bump_current_epoch_with_action(move || {
                safe_head.advance(target);
            });
        }
    }

    /// Make the ring slot for `page` writable if its occupant has been
    /// flushed and evicted. Returns whether the slot is open for `page`.
    fn try_open_page(&self, page: u64) -> bool {
        let slot = self.slot_for(page);
        if slot.owner() == page {
            return slot.state() == SlotState::Open;
        }

        let occupant = slot.owner();
        if occupant != NO_PAGE {
            let occupant_end = self.address_of(occupant + 1, 0);
            if self.flushed_until_address() < occupant_end {
                // Make sure the flush has at least been requested.
                self.shift_read_only(occupant_end);
                return false;
            }
            if self.head_address() < occupant_end {
                self.shift_head(occupant_end);
                return false;
            }
            if !slot.install(occupant, page) {
                return slot.is_open_for(page);
            }
            // The occupant is unreachable now: flushed, and no reader can
            // hold an address below the published head.
            unsafe {
                std::ptr::write_bytes(
                    self.pages[(page % self.buffer_pages) as usize].as_ptr() as *mut u8,
                    0,
                    self.page_size as usize,
                );
            }
        } else if !slot.install(NO_PAGE, page) {
            return slot.is_open_for(page);
        }

        slot.open();
        true
    }

    /// Copy a record into reserved page memory.
    ///
    /// # Safety
    ///
    /// `address .. address + 4 + payload.len()` must lie within a single page
    /// reserved by the caller through [`Self::try_allocate`], and the caller
    /// must hold epoch protection.
    pub(crate) unsafe fn write_record(&self, address: Address, payload: &[u8]) {
        let slot_idx = (address.page(self.page_bits) % self.buffer_pages) as usize;
        let offset = address.offset(self.page_bits) as usize;
        debug_assert!(offset + 4 + payload.len() <= self.page_size as usize);

        let base = self.pages[slot_idx].as_ptr() as *mut u8;
        let length = payload.len() as u32;
        std::ptr::copy_nonoverlapping(length.to_le_bytes().as_ptr(), base.add(offset), 4);
        std::ptr::copy_nonoverlapping(payload.as_ptr(), base.add(offset + 4), payload.len());
    }

    /// Copy resident bytes out of the ring.
    ///
    /// # Safety
    ///
    /// The range must lie within a single page, at or above the published
    /// head and below the tail, and the caller must hold epoch protection.
    pub(crate) unsafe fn read_resident(&self, address: Address, out: &mut [u8]) {
        let slot_idx = (address.page(self.page_bits) % self.buffer_pages) as usize;
        let offset = address.offset(self.page_bits) as usize;
        debug_assert!(offset + out.len() <= self.page_size as usize);
        debug_assert_eq!(self.slots[slot_idx].owner(), address.page(self.page_bits));

        let base = self.pages[slot_idx].as_ptr();
        std::ptr::copy_nonoverlapping(base.add(offset), out.as_mut_ptr(), out.len());
    }

    /// View of a sealed/read-only range for the flush worker.
    ///
    /// The range was published through an epoch-deferred flush issuance, so
    /// every writer below it has quiesced and the slot cannot be recycled
    /// before [`Self::mark_flushed`] passes its end.
    pub(crate) fn flush_slice(&self, range: FlushRange) -> &[u8] {
        debug_assert!(range.start < range.end);
        debug_assert!(range.end <= range.start.next_page_start(self.page_bits));

        let page = range.start.page(self.page_bits);
        debug_assert_eq!(self.slot_for(page).owner(), page);

        let slot_idx = (page % self.buffer_pages) as usize;
        let offset = range.start.offset(self.page_bits) as usize;
        let len = (range.end - range.start) as usize;
        unsafe { std::slice::from_raw_parts(self.pages[slot_idx].as_ptr().add(offset), len) }
    }

    /// Ratchet the durable frontier after a completed device write.
    pub(crate) fn mark_flushed(&self, end: Address) {
        self.flushed_until_address.advance(end);
    }
}

// Safety: page memory is only written through reservations guarded by the
// tail CAS and only read through epoch-protected or post-quiescence paths.
unsafe impl<D: StorageDevice> Send for PagedLogAllocator<D> {}
unsafe impl<D: StorageDevice> Sync for PagedLogAllocator<D> {}
