//! The durable paged append-only log.
//!
//! Producers append byte payloads and receive monotonically increasing
//! logical addresses; consumers scan by address range, optionally tailing
//! uncommitted data. Entries up to the committed frontier survive a crash.

use std::cmp;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver};
use parking_lot::Mutex;

use crate::address::{Address, AtomicAddress};
use crate::allocator::{AllocationResult, FlushRange, PagedLogAllocator};
use crate::commit::{CommitManager, LocalCommitManager, MemoryCommitManager, RecoveryInfo};
use crate::device::StorageDevice;
use crate::epoch::{get_thread_id, LightEpoch};
use crate::error::LogError;
use crate::log::coordinator::CommitCoordinator;
use crate::log::io::IoExecutor;
use crate::log::types::{AppendHandle, AppendOutcome, LogStats};
use crate::scan::{LogScanIterator, ScanBufferingMode};
use crate::settings::{GetMemory, LogSettings};
use crate::utility::align4;

/// Size of the record header: a little-endian `u32` payload length.
pub const RECORD_HEADER_SIZE: usize = 4;

/// A durable, high-throughput append-only log over a paged hybrid store.
///
/// Appends run lock-free through a CAS-reserved tail; page flushes and
/// commit-metadata persistence run on a dedicated flush worker; consumers
/// scan by address range through [`LogScanIterator`].
pub struct PageLog<D: StorageDevice> {
    pub(crate) allocator: Arc<PagedLogAllocator<D>>,
    pub(crate) epoch: Arc<LightEpoch>,
    pub(crate) coordinator: Arc<CommitCoordinator>,
    /// Ceiling for uncommitted scans, published by `refresh_uncommitted`
    pub(crate) uncommitted_tail: Arc<AtomicAddress>,
    /// Optional hook supplying payload buffers for scan outputs
    pub(crate) get_memory: Option<GetMemory>,
    closed: AtomicBool,
    flush_worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl<D: StorageDevice> PageLog<D> {
    /// Open a log over `device`.
    ///
    /// Uses a [`LocalCommitManager`] at `settings.commit_path` when set, or
    /// an in-memory commit manager otherwise (memory-only operation).
    pub fn open(settings: LogSettings, device: D) -> Result<Self, LogError> {
        let manager: Box<dyn CommitManager> = match &settings.commit_path {
            Some(path) => Box::new(LocalCommitManager::new(path)),
            None => Box::new(MemoryCommitManager::new()),
        };
        Self::open_with_commit_manager(settings, device, manager)
    }

    /// Open a log with an explicit commit-metadata store.
    ///
    /// Immediately attempts restore from the latest commit blob, then serves
    /// appends from the restored tail.
    pub fn open_with_commit_manager(
        settings: LogSettings,
        device: D,
        manager: Box<dyn CommitManager>,
    ) -> Result<Self, LogError> {
        settings.validate()?;

        let epoch = Arc::new(LightEpoch::new());
        let device = Arc::new(device);
        let (flush_tx, flush_rx) = unbounded();
        let allocator = Arc::new(PagedLogAllocator::new(
            &settings,
            device,
            Arc::clone(&epoch),
            flush_tx,
        )?);

        let info = match manager
            .get_latest()
            .map_err(|e| LogError::commit(e.to_string()))?
        {
            None => RecoveryInfo::fresh(),
            Some(blob) => {
                RecoveryInfo::decode(&blob).map_err(|e| LogError::commit(e.to_string()))?
            }
        };

        let flushed_until = cmp::max(info.flushed_until_address, Address::FIRST_VALID);
        let begin = cmp::max(info.begin_address, Address::FIRST_VALID);
        let mut head = flushed_until.page_start(allocator.page_bits());
        head = cmp::max(head, begin);
        head = cmp::max(head, Address::FIRST_VALID);

        allocator.restore(flushed_until, head, begin)?;
        tracing::debug!(
            begin = begin.control(),
            head = head.control(),
            flushed_until = flushed_until.control(),
            cursors = info.cursors.len(),
            "log restored"
        );

        let coordinator = Arc::new(CommitCoordinator::new(manager, flushed_until));
        for (name, completed_until) in info.cursors {
            coordinator.register_cursor(&name, completed_until);
        }

        let worker = {
            let allocator = Arc::clone(&allocator);
            let coordinator = Arc::clone(&coordinator);
            thread::Builder::new()
                .name("pagelog-flush".to_string())
                .spawn(move || flush_worker_loop(allocator, coordinator, flush_rx))?
        };

        Ok(Self {
            allocator,
            epoch,
            coordinator,
            uncommitted_tail: Arc::new(AtomicAddress::new(flushed_until)),
            get_memory: settings.get_memory,
            closed: AtomicBool::new(false),
            flush_worker: Mutex::new(Some(worker)),
        })
    }

    // ---- appends ----

    /// Append a payload, spinning under backpressure until space is
    /// available. Returns the record's logical address.
    ///
    /// The spin cooperates with the epoch so deferred flushes and boundary
    /// shifts keep making progress.
    pub fn append(&self, payload: &[u8]) -> Result<Address, LogError> {
        let reserved = self.reserved_size(payload)?;
        let thread_id = get_thread_id()?;

        let mut pending: Option<Address> = None;
        loop {
            if self.is_closed() {
                return Err(LogError::Closed);
            }

            self.epoch.protect_and_drain(thread_id);
            let result = match pending.take() {
                None => self.allocator.try_allocate(reserved),
                Some(address) => self.resume_pending(address, reserved),
            };
            match result {
                AllocationResult::Ready(address) => {
                    unsafe { self.allocator.write_record(address, payload) };
                    self.epoch.unprotect(thread_id);
                    return Ok(address);
                }
                AllocationResult::Pending(address) => {
                    pending = Some(address);
                }
                AllocationResult::Restart => {}
            }
            self.epoch.unprotect(thread_id);

            self.epoch.tick();
            thread::yield_now();
        }
    }

    /// Append several payloads back to back, returning their addresses.
    pub fn append_batch(&self, payloads: &[&[u8]]) -> Result<Vec<Address>, LogError> {
        let mut addresses = Vec::with_capacity(payloads.len());
        for payload in payloads {
            addresses.push(self.append(payload)?);
        }
        Ok(addresses)
    }

    /// Attempt a single append step without blocking.
    ///
    /// On [`AppendOutcome::Pending`] the caller owns an in-flight page turn
    /// and must eventually resume it with [`Self::try_complete_append`]; on
    /// [`AppendOutcome::Restart`] the caller retries from scratch.
    pub fn try_append(&self, payload: &[u8]) -> Result<AppendOutcome, LogError> {
        if self.is_closed() {
            return Err(LogError::Closed);
        }
        let reserved = self.reserved_size(payload)?;
        let thread_id = get_thread_id()?;

        self.epoch.protect_and_drain(thread_id);
        let outcome = match self.allocator.try_allocate(reserved) {
            AllocationResult::Ready(address) => {
                unsafe { self.allocator.write_record(address, payload) };
                AppendOutcome::Done(address)
            }
            AllocationResult::Pending(address) => AppendOutcome::Pending(AppendHandle {
                address,
                reserved,
            }),
            AllocationResult::Restart => AppendOutcome::Restart,
        };
        self.epoch.unprotect(thread_id);
        Ok(outcome)
    }

    /// Resume a pending append.
    ///
    /// The read-only check runs strictly before the write, under the epoch:
    /// if the pending page slid below the read-only boundary the outcome is
    /// [`AppendOutcome::Restart`] and nothing is written.
    pub fn try_complete_append(
        &self,
        handle: AppendHandle,
        payload: &[u8],
    ) -> Result<AppendOutcome, LogError> {
        if self.is_closed() {
            return Err(LogError::Closed);
        }
        let reserved = self.reserved_size(payload)?;
        if reserved != handle.reserved {
            return Err(LogError::config(
                "payload size differs from the pending reservation",
            ));
        }
        let thread_id = get_thread_id()?;

        self.epoch.protect_and_drain(thread_id);
        let outcome = match self.resume_pending(handle.address, reserved) {
            AllocationResult::Ready(address) => {
                unsafe { self.allocator.write_record(address, payload) };
                AppendOutcome::Done(address)
            }
            AllocationResult::Pending(_) => AppendOutcome::Pending(handle),
            AllocationResult::Restart => AppendOutcome::Restart,
        };
        self.epoch.unprotect(thread_id);
        Ok(outcome)
    }

    /// Append asynchronously and await durability of the record.
    pub async fn append_async(&self, payload: &[u8]) -> Result<Address, LogError> {
        let reserved = self.reserved_size(payload)?;
        let address = self.append_to_memory_async(payload).await?;
        self.wait_for_commit_async(address + reserved as u64).await?;
        Ok(address)
    }

    /// Append asynchronously, returning as soon as the in-memory write
    /// completes. Durability follows with the next commit.
    pub async fn append_to_memory_async(&self, payload: &[u8]) -> Result<Address, LogError> {
        self.reserved_size(payload)?;

        let mut handle: Option<AppendHandle> = None;
        loop {
            // Epoch protection is scoped inside the try step; nothing is
            // held across the await below.
            let outcome = match handle.take() {
                None => self.try_append(payload)?,
                Some(h) => self.try_complete_append(h, payload)?,
            };
            match outcome {
                AppendOutcome::Done(address) => return Ok(address),
                AppendOutcome::Pending(h) => handle = Some(h),
                AppendOutcome::Restart => {}
            }

            self.epoch.tick();
            let mut commits = self.coordinator.subscribe();
            let _ = tokio::time::timeout(Duration::from_millis(1), commits.changed()).await;
        }
    }

    // ---- commit and durability ----

    /// Block until the committed frontier reaches `until`.
    ///
    /// `Address::ZERO` means the tail captured at call time.
    pub fn wait_for_commit(&self, until: Address) -> Result<(), LogError> {
        let target = self.resolve_commit_target(until);
        while self.committed_until_address() < target {
            if self.is_closed() {
                return Err(LogError::Closed);
            }
            self.epoch.tick();
            thread::yield_now();
        }
        Ok(())
    }

    /// Await the committed frontier reaching `until`.
    ///
    /// `Address::ZERO` means the tail captured at call time. A commit-store
    /// failure is surfaced to the triggering commit call, not here; waiters
    /// keep waiting until the log closes.
    pub async fn wait_for_commit_async(&self, until: Address) -> Result<(), LogError> {
        let target = self.resolve_commit_target(until);
        let mut commits = self.coordinator.subscribe();
        while self.committed_until_address() < target {
            if self.is_closed() {
                return Err(LogError::Closed);
            }
            self.epoch.tick();
            let _ = tokio::time::timeout(Duration::from_millis(1), commits.changed()).await;
        }
        Ok(())
    }

    /// Seal everything up to the current tail and schedule its flush.
    ///
    /// With `spin_wait`, spins (draining the epoch and yielding) until the
    /// captured tail is committed; without it, returns after scheduling.
    /// Either way, a recorded flush or commit-store failure is surfaced
    /// here. Returns the captured tail.
    pub fn flush_and_commit(&self, spin_wait: bool) -> Result<Address, LogError> {
        if self.is_closed() {
            return Err(LogError::Closed);
        }

        let tail = self.allocator.shift_read_only_to_tail();
        self.epoch.tick();
        if let Some(error) = self.coordinator.take_error() {
            return Err(error);
        }

        if spin_wait {
            while self.committed_until_address() < tail {
                if self.is_closed() {
                    return Err(LogError::Closed);
                }
                if let Some(error) = self.coordinator.take_error() {
                    return Err(error);
                }
                self.epoch.tick();
                thread::yield_now();
            }
        }
        Ok(tail)
    }

    /// Async variant of [`Self::flush_and_commit`]; always awaits the commit.
    pub async fn flush_and_commit_async(&self) -> Result<Address, LogError> {
        if self.is_closed() {
            return Err(LogError::Closed);
        }

        let tail = self.allocator.shift_read_only_to_tail();
        self.epoch.tick();

        let mut commits = self.coordinator.subscribe();
        while self.committed_until_address() < tail {
            if self.is_closed() {
                return Err(LogError::Closed);
            }
            if let Some(error) = self.coordinator.take_error() {
                return Err(error);
            }
            self.epoch.tick();
            let _ = tokio::time::timeout(Duration::from_millis(1), commits.changed()).await;
        }
        Ok(tail)
    }

    /// Publish completed in-memory appends to uncommitted scans.
    ///
    /// The new ceiling lands once every in-flight writer below the captured
    /// tail has quiesced.
    pub fn refresh_uncommitted(&self) {
        let tail = self.allocator.tail_address();
        let ceiling = Arc::clone(&self.uncommitted_tail);
        self.epoch.bump_current_epoch_with_action(move || {
            ceiling.advance(tail);
        });
        self.epoch.tick();
    }

    // ---- truncation ----

    /// Advance the begin address, unreferencing earlier entries.
    ///
    /// Waits until the head has followed past the truncation point, so the
    /// boundary invariants hold when this returns. The new begin address is
    /// persisted with the next commit.
    pub fn truncate_until(&self, until: Address) -> Result<Address, LogError> {
        if self.is_closed() {
            return Err(LogError::Closed);
        }
        let thread_id = get_thread_id()?;

        self.epoch.protect_and_drain(thread_id);
        let new_begin = self.allocator.shift_begin_address(until);
        self.epoch.unprotect(thread_id);

        while self.allocator.head_address() < new_begin {
            if self.is_closed() {
                return Err(LogError::Closed);
            }
            if let Some(error) = self.coordinator.take_error() {
                return Err(error);
            }
            self.allocator.drag_head_for_truncation();
            self.epoch.tick();
            thread::yield_now();
        }
        Ok(new_begin)
    }

    // ---- scans ----

    /// Scan committed records in `[begin, end)`.
    pub fn scan(&self, begin: Address, end: Address) -> LogScanIterator<'_, D> {
        LogScanIterator::new(self, begin, end, ScanBufferingMode::SinglePage, false, None)
    }

    /// Scan including uncommitted records up to the published tail ceiling.
    pub fn scan_uncommitted(&self, begin: Address, end: Address) -> LogScanIterator<'_, D> {
        LogScanIterator::new(self, begin, end, ScanBufferingMode::SinglePage, true, None)
    }

    /// Open a named persistent cursor.
    ///
    /// With `recover`, resumes from the cursor's checkpointed
    /// `completed_until` address; otherwise starts at the begin address. The
    /// cursor's progress is persisted with every commit.
    pub fn scan_named(&self, name: &str, recover: bool) -> Result<LogScanIterator<'_, D>, LogError> {
        if name.len() > u16::MAX as usize {
            return Err(LogError::config("iterator name longer than 65535 bytes"));
        }

        let begin = self.begin_address();
        let start = if recover {
            self.coordinator
                .cursor(name)
                .map(|c| c.load(Ordering::Acquire))
                .filter(|&addr| addr > begin)
                .unwrap_or(begin)
        } else {
            begin
        };

        let cursor = self.coordinator.register_cursor(name, start);
        if !recover {
            cursor.store(start, Ordering::Release);
        }

        Ok(LogScanIterator::named(
            self,
            start,
            Address::MAX,
            ScanBufferingMode::SinglePage,
            false,
            cursor,
        ))
    }

    // ---- accessors ----

    /// First valid address
    #[inline]
    pub fn begin_address(&self) -> Address {
        self.allocator.begin_address()
    }

    /// Published head address; lower addresses resolve only via the device
    #[inline]
    pub fn head_address(&self) -> Address {
        self.allocator.head_address()
    }

    /// Read-only boundary
    #[inline]
    pub fn read_only_address(&self) -> Address {
        self.allocator.read_only_address()
    }

    /// Durable frontier
    #[inline]
    pub fn flushed_until_address(&self) -> Address {
        self.allocator.flushed_until_address()
    }

    /// Committed frontier
    #[inline]
    pub fn committed_until_address(&self) -> Address {
        self.coordinator.committed_until()
    }

    /// Tail address
    #[inline]
    pub fn tail_address(&self) -> Address {
        self.allocator.tail_address()
    }

    /// Snapshot of the log's boundary markers
    pub fn stats(&self) -> LogStats {
        LogStats {
            begin_address: self.begin_address(),
            head_address: self.head_address(),
            read_only_address: self.read_only_address(),
            flushed_until_address: self.flushed_until_address(),
            committed_until_address: self.committed_until_address(),
            tail_address: self.tail_address(),
            page_size: self.allocator.page_size(),
            buffer_pages: self.allocator.buffer_pages(),
        }
    }

    /// Whether the log has been closed
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Commit outstanding data and shut down the flush worker.
    ///
    /// Idempotent; also runs on drop.
    pub fn close(&self) {
        let mut worker = self.flush_worker.lock();
        if worker.is_none() {
            return;
        }

        let _ = self.flush_and_commit(true);
        self.closed.store(true, Ordering::Release);
        self.allocator.send_flush_shutdown();
        if let Some(handle) = worker.take() {
            let _ = handle.join();
        }
    }

    // ---- internals ----

    /// Total reserved size for a payload: header plus 4-byte-aligned body.
    fn reserved_size(&self, payload: &[u8]) -> Result<u32, LogError> {
        if payload.is_empty() {
            // A zero length word marks sealed-page padding on the log, so an
            // empty record would terminate every scan of its page early.
            return Err(LogError::config("empty payloads are not supported"));
        }
        let reserved = RECORD_HEADER_SIZE + align4(payload.len());
        if reserved as u64 > self.allocator.page_size() {
            return Err(LogError::EntryTooLarge {
                size: reserved,
                max: self.allocator.page_size() as usize,
            });
        }
        Ok(reserved as u32)
    }

    /// Resume an in-flight page turn, checking the read-only boundary first.
    fn resume_pending(&self, pending: Address, reserved: u32) -> AllocationResult {
        if pending < self.allocator.read_only_address() {
            return AllocationResult::Restart;
        }
        self.allocator.check_allocate_complete(pending, reserved)
    }

    fn resolve_commit_target(&self, until: Address) -> Address {
        if until == Address::ZERO {
            self.tail_address()
        } else {
            until
        }
    }
}

impl<D: StorageDevice> Drop for PageLog<D> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Flush worker: applies sealed ranges to the device in address order,
/// ratchets the durable frontier contiguously, and reports each advance to
/// the commit coordinator.
fn flush_worker_loop<D: StorageDevice>(
    allocator: Arc<PagedLogAllocator<D>>,
    coordinator: Arc<CommitCoordinator>,
    flush_rx: Receiver<FlushRange>,
) {
    let executor = match IoExecutor::new() {
        Ok(executor) => executor,
        Err(e) => {
            tracing::error!(error = %e, "flush worker failed to start an I/O executor");
            coordinator.record_error(LogError::Io(e));
            return;
        }
    };

    let mut faulted = false;
    for range in flush_rx.iter() {
        if range.start == range.end {
            // Shutdown sentinel.
            break;
        }
        if faulted {
            // The frontier must advance contiguously; once a range fails,
            // later ranges can never be applied.
            continue;
        }

        let slice = allocator.flush_slice(range);
        let result = executor
            .block_on(allocator.device().write(range.start.control(), slice))
            .and_then(|_| executor.block_on(allocator.device().flush()));

        match result {
            Ok(()) => {
                allocator.mark_flushed(range.end);
                coordinator.commit(range.end, allocator.begin_address());
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    start = range.start.control(),
                    end = range.end.control(),
                    "page flush failed; durability frontier halted"
                );
                coordinator.record_error(LogError::Io(e));
                faulted = true;
            }
        }
    }
}

#[cfg(test)]
#[path = "page_log_tests.rs"]
mod tests;
