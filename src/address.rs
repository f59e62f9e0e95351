//! Logical addresses into the paged log.
//!
//! An address is a flat 64-bit byte position in the log. The page number and
//! the offset within a page are derived from the configured page size, so the
//! same address type serves every page-size configuration. The tail pointer
//! uses a packed `(page, offset)` representation with overflow space so that
//! concurrent reservations can run past the end of a page without corrupting
//! the page number.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// A logical address in the log.
///
/// Addresses are byte positions and grow monotonically for the lifetime of a
/// log. Address 0 is reserved; the first record of a fresh log lands at
/// [`Address::FIRST_VALID`].
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Address(u64);

impl Address {
    /// Address 0 is never handed out for a record.
    pub const ZERO: Self = Self(0);

    /// The first address a fresh log allocates from.
    pub const FIRST_VALID: Self = Self(64);

    /// Sentinel for an unbounded scan end.
    pub const MAX: Self = Self(u64::MAX);

    /// Create an address from a raw byte position
    #[inline]
    pub const fn new(control: u64) -> Self {
        Self(control)
    }

    /// Get the raw byte position
    #[inline]
    pub const fn control(&self) -> u64 {
        self.0
    }

    /// Get the page number for a given page size
    #[inline]
    pub const fn page(&self, page_bits: u32) -> u64 {
        self.0 >> page_bits
    }

    /// Get the offset within the page for a given page size
    #[inline]
    pub const fn offset(&self, page_bits: u32) -> u64 {
        self.0 & ((1u64 << page_bits) - 1)
    }

    /// Get the address of the start of the containing page
    #[inline]
    pub const fn page_start(&self, page_bits: u32) -> Self {
        Self(self.0 & !((1u64 << page_bits) - 1))
    }

    /// First address of the page following the containing page
    #[inline]
    pub const fn next_page_start(&self, page_bits: u32) -> Self {
        Self(self.page_start(page_bits).0 + (1u64 << page_bits))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Address").field(&self.0).finish()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialOrd for Address {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Add<u64> for Address {
    type Output = Self;

    #[inline]
    fn add(self, delta: u64) -> Self::Output {
        Self(self.0 + delta)
    }
}

impl AddAssign<u64> for Address {
    #[inline]
    fn add_assign(&mut self, delta: u64) {
        self.0 += delta;
    }
}

impl Sub for Address {
    type Output = u64;

    #[inline]
    fn sub(self, other: Self) -> Self::Output {
        debug_assert!(self.0 >= other.0);
        self.0 - other.0
    }
}

impl From<u64> for Address {
    #[inline]
    fn from(control: u64) -> Self {
        Self(control)
    }
}

impl From<Address> for u64 {
    #[inline]
    fn from(addr: Address) -> Self {
        addr.0
    }
}

/// Atomic version of Address for shared boundary markers
#[repr(transparent)]
pub struct AtomicAddress {
    control: AtomicU64,
}

impl AtomicAddress {
    /// Create a new atomic address
    #[inline]
    pub const fn new(address: Address) -> Self {
        Self {
            control: AtomicU64::new(address.0),
        }
    }

    /// Load the address atomically
    #[inline]
    pub fn load(&self, ordering: AtomicOrdering) -> Address {
        Address(self.control.load(ordering))
    }

    /// Store an address atomically
    #[inline]
    pub fn store(&self, address: Address, ordering: AtomicOrdering) {
        self.control.store(address.0, ordering);
    }

    /// Compare and exchange the address atomically
    #[inline]
    pub fn compare_exchange(
        &self,
        current: Address,
        new: Address,
        success: AtomicOrdering,
        failure: AtomicOrdering,
    ) -> Result<Address, Address> {
        self.control
            .compare_exchange(current.0, new.0, success, failure)
            .map(Address)
            .map_err(Address)
    }

    /// Advance the address monotonically.
    ///
    /// Returns `true` if this call moved the marker forward; `false` if the
    /// marker already was at or past `new`.
    pub fn advance(&self, new: Address) -> bool {
        loop {
            let current = self.load(AtomicOrdering::Acquire);
            if new <= current {
                return false;
            }
            if self
                .compare_exchange(current, new, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }
}

impl Default for AtomicAddress {
    fn default() -> Self {
        Self::new(Address::default())
    }
}

impl fmt::Debug for AtomicAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addr = self.load(AtomicOrdering::Relaxed);
        f.debug_struct("AtomicAddress")
            .field("address", &addr)
            .finish()
    }
}

/// Packed page + offset for the tail pointer.
///
/// Uses 41 bits for the offset (giving ample overflow space for concurrent
/// reservations past the page end) and 23 bits for the page number.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct PageOffset(u64);

impl PageOffset {
    /// Number of bits used for the page number
    pub const PAGE_BITS: u32 = 23;

    /// Number of bits used for the in-page offset (with overflow space)
    pub const OFFSET_BITS: u32 = 64 - Self::PAGE_BITS;

    /// Maximum valid page number
    pub const MAX_PAGE: u64 = (1 << Self::PAGE_BITS) - 1;

    /// Create a new page offset
    #[inline]
    pub const fn new(page: u64, offset: u64) -> Self {
        debug_assert!(page <= Self::MAX_PAGE);
        Self((offset & ((1u64 << Self::OFFSET_BITS) - 1)) | (page << Self::OFFSET_BITS))
    }

    /// Get the page number
    #[inline]
    pub const fn page(&self) -> u64 {
        self.0 >> Self::OFFSET_BITS
    }

    /// Get the offset (can exceed the page size while a page turn is in flight)
    #[inline]
    pub const fn offset(&self) -> u64 {
        self.0 & ((1u64 << Self::OFFSET_BITS) - 1)
    }

    /// Get the raw control value
    #[inline]
    pub const fn control(&self) -> u64 {
        self.0
    }

    /// Convert to a logical address, clamping an overflowed offset to the
    /// page end.
    #[inline]
    pub fn to_address(&self, page_bits: u32) -> Address {
        let page_size = 1u64 << page_bits;
        let offset = std::cmp::min(self.offset(), page_size);
        Address((self.page() << page_bits) + offset)
    }

    /// Build from a logical address
    #[inline]
    pub fn from_address(address: Address, page_bits: u32) -> Self {
        Self::new(address.page(page_bits), address.offset(page_bits))
    }
}

impl fmt::Debug for PageOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageOffset")
            .field("page", &self.page())
            .field("offset", &self.offset())
            .finish()
    }
}

/// Atomic page offset for lock-free tail management
pub struct AtomicPageOffset {
    control: AtomicU64,
}

impl AtomicPageOffset {
    /// Create a new atomic page offset
    #[inline]
    pub const fn new(page_offset: PageOffset) -> Self {
        Self {
            control: AtomicU64::new(page_offset.0),
        }
    }

    /// Load the page offset atomically
    #[inline]
    pub fn load(&self, ordering: AtomicOrdering) -> PageOffset {
        PageOffset(self.control.load(ordering))
    }

    /// Store a page offset atomically
    #[inline]
    pub fn store(&self, page_offset: PageOffset, ordering: AtomicOrdering) {
        self.control.store(page_offset.0, ordering);
    }

    /// Reserve space at the tail.
    ///
    /// Returns the page offset before the reservation. The resulting offset
    /// can exceed the page size; the caller is responsible for detecting the
    /// crossing and performing the page turn.
    #[inline]
    pub fn reserve(&self, num_bytes: u64) -> PageOffset {
        PageOffset(self.control.fetch_add(num_bytes, AtomicOrdering::AcqRel))
    }

    /// Republish the tail on a new page.
    ///
    /// Only the thread that owns the in-flight page turn may call this; any
    /// increments other threads applied to the overflowed offset are
    /// intentionally discarded (those reservations were rejected).
    #[inline]
    pub fn publish(&self, page: u64, offset: u64) {
        self.store(PageOffset::new(page, offset), AtomicOrdering::Release);
    }
}

impl Default for AtomicPageOffset {
    fn default() -> Self {
        Self::new(PageOffset::default())
    }
}

impl fmt::Debug for AtomicPageOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let po = self.load(AtomicOrdering::Relaxed);
        f.debug_struct("AtomicPageOffset")
            .field("page_offset", &po)
            .finish()
    }
}
