//! Positional scan cursor over the log.
//!
//! Resident addresses are copied out under an epoch guard; addresses below
//! the head are served from the device through page frames sized by the
//! buffering mode. A zero length word marks the unused tail of a sealed page
//! and skips the cursor to the next page.

use std::cmp;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::address::{Address, AtomicAddress};
use crate::device::StorageDevice;
use crate::epoch::get_thread_id;
use crate::error::LogError;
use crate::log::io::IoExecutor;
use crate::log::{LogRecord, PageLog, RECORD_HEADER_SIZE};
use crate::utility::{align4, AlignedBuffer};

/// How much device-backed data a scan keeps buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanBufferingMode {
    /// Read exactly the requested record bytes; no page frames.
    NoBuffering,
    /// Keep one page frame.
    #[default]
    SinglePage,
    /// Keep two page frames, retaining the neighbor page across boundaries.
    DoublePage,
}

impl ScanBufferingMode {
    fn frame_count(&self) -> usize {
        match self {
            ScanBufferingMode::NoBuffering => 0,
            ScanBufferingMode::SinglePage => 1,
            ScanBufferingMode::DoublePage => 2,
        }
    }
}

/// A loaded device page.
struct ScanFrame {
    page: u64,
    buffer: AlignedBuffer,
}

/// Forward-only scan cursor yielding [`LogRecord`]s.
///
/// Never returns bytes at or beyond the effective ceiling: the committed
/// frontier, or the published uncommitted tail when tailing.
pub struct LogScanIterator<'a, D: StorageDevice> {
    log: &'a PageLog<D>,
    current: Address,
    end: Address,
    buffering: ScanBufferingMode,
    scan_uncommitted: bool,
    /// Shared checkpointed cursor for named iterators
    cursor: Option<Arc<AtomicAddress>>,
    /// Consumer-acknowledged progress
    completed_until: Address,
    frames: Vec<ScanFrame>,
    executor: Option<IoExecutor>,
}

enum Step {
    Record(LogRecord),
    SkipToNextPage,
    End,
}

impl<'a, D: StorageDevice> LogScanIterator<'a, D> {
    pub(crate) fn new(
        log: &'a PageLog<D>,
        begin: Address,
        end: Address,
        buffering: ScanBufferingMode,
        scan_uncommitted: bool,
        name: Option<&str>,
    ) -> Self {
        let cursor = name.map(|n| log.coordinator.register_cursor(n, begin));
        Self {
            log,
            current: cmp::max(begin, Address::FIRST_VALID),
            end,
            buffering,
            scan_uncommitted,
            cursor,
            completed_until: begin,
            frames: Vec::new(),
            executor: None,
        }
    }

    pub(crate) fn named(
        log: &'a PageLog<D>,
        begin: Address,
        end: Address,
        buffering: ScanBufferingMode,
        scan_uncommitted: bool,
        cursor: Arc<AtomicAddress>,
    ) -> Self {
        Self {
            log,
            current: cmp::max(begin, Address::FIRST_VALID),
            end,
            buffering,
            scan_uncommitted,
            cursor: Some(cursor),
            completed_until: begin,
            frames: Vec::new(),
            executor: None,
        }
    }

    /// Change the buffering mode before the first device read.
    pub fn with_buffering(mut self, buffering: ScanBufferingMode) -> Self {
        self.buffering = buffering;
        self.frames.clear();
        self
    }

    /// Current cursor position
    pub fn current_address(&self) -> Address {
        self.current
    }

    /// Consumer-acknowledged progress
    pub fn completed_until(&self) -> Address {
        self.completed_until
    }

    /// Acknowledge consumption up to `address`.
    ///
    /// For named iterators the address is checkpointed with every commit and
    /// a later `scan_named(name, recover = true)` resumes from it.
    pub fn complete_until(&mut self, address: Address) {
        self.completed_until = cmp::max(self.completed_until, address);
        if let Some(cursor) = &self.cursor {
            cursor.advance(address);
        }
    }

    /// Fetch the next record.
    ///
    /// Returns `Ok(None)` at the range end or the effective ceiling; tailing
    /// scans can call again after more data is published.
    pub fn get_next(&mut self) -> Result<Option<LogRecord>, LogError> {
        let thread_id = get_thread_id()?;
        let page_bits = self.log.allocator.page_bits();
        let page_size = self.log.allocator.page_size();

        loop {
            // Truncated prefix yields nothing.
            let begin = self.log.begin_address();
            if self.current < begin {
                self.current = begin;
            }

            let limit = cmp::min(self.end, self.effective_ceiling());
            if self.current >= limit {
                return Ok(None);
            }

            // No room for a header before the page end: sealed-page padding.
            if self.current.offset(page_bits) + RECORD_HEADER_SIZE as u64 > page_size {
                self.current = self.current.next_page_start(page_bits);
                continue;
            }

            let step = self.next_step(thread_id, limit)?;
            match step {
                Step::Record(record) => {
                    self.current = record.next_address;
                    return Ok(Some(record));
                }
                Step::SkipToNextPage => {
                    self.current = self.current.next_page_start(page_bits);
                }
                Step::End => return Ok(None),
            }
        }
    }

    fn next_step(&mut self, thread_id: usize, limit: Address) -> Result<Step, LogError> {
        // Resident fast path, bracketed by the epoch.
        self.log.epoch.protect_and_drain(thread_id);
        if self.current >= self.log.allocator.head_address() {
            let step = self.resident_step(limit);
            self.log.epoch.unprotect(thread_id);
            return step;
        }
        self.log.epoch.unprotect(thread_id);

        self.device_step(limit)
    }

    /// Read the record at `current` from resident page memory.
    ///
    /// Caller holds the epoch and has verified `current >= head`.
    fn resident_step(&mut self, limit: Address) -> Result<Step, LogError> {
        let page_bits = self.log.allocator.page_bits();
        let page_size = self.log.allocator.page_size();

        if self.current + RECORD_HEADER_SIZE as u64 > limit {
            return Ok(Step::End);
        }

        let mut header = [0u8; RECORD_HEADER_SIZE];
        unsafe { self.log.allocator.read_resident(self.current, &mut header) };
        let length = u32::from_le_bytes(header);
        if length == 0 {
            return Ok(Step::SkipToNextPage);
        }

        let reserved = (RECORD_HEADER_SIZE + align4(length as usize)) as u64;
        if self.current.offset(page_bits) + reserved > page_size {
            return Err(LogError::corruption(
                self.current,
                format!("record of {length} bytes runs past the page end"),
            ));
        }

        let next = self.current + reserved;
        if next > limit {
            return Ok(Step::End);
        }

        let mut payload = self.alloc_payload(length as usize);
        unsafe {
            self.log
                .allocator
                .read_resident(self.current + RECORD_HEADER_SIZE as u64, &mut payload)
        };

        Ok(Step::Record(LogRecord {
            payload,
            length,
            current_address: self.current,
            next_address: next,
        }))
    }

    /// Read the record at `current` through the device.
    fn device_step(&mut self, limit: Address) -> Result<Step, LogError> {
        let page_bits = self.log.allocator.page_bits();
        let page_size = self.log.allocator.page_size();

        if self.current + RECORD_HEADER_SIZE as u64 > limit {
            return Ok(Step::End);
        }

        let mut header = [0u8; RECORD_HEADER_SIZE];
        self.read_device(self.current, &mut header)?;
        let length = u32::from_le_bytes(header);
        if length == 0 {
            return Ok(Step::SkipToNextPage);
        }

        let reserved = (RECORD_HEADER_SIZE + align4(length as usize)) as u64;
        if self.current.offset(page_bits) + reserved > page_size {
            return Err(LogError::corruption(
                self.current,
                format!("record of {length} bytes runs past the page end"),
            ));
        }

        let next = self.current + reserved;
        if next > limit {
            return Ok(Step::End);
        }

        let mut payload = self.alloc_payload(length as usize);
        self.read_device(self.current + RECORD_HEADER_SIZE as u64, &mut payload)?;

        Ok(Step::Record(LogRecord {
            payload,
            length,
            current_address: self.current,
            next_address: next,
        }))
    }

    /// Copy sub-head bytes, either directly or through a page frame.
    fn read_device(&mut self, address: Address, out: &mut [u8]) -> Result<(), LogError> {
        if self.buffering == ScanBufferingMode::NoBuffering {
            let device = Arc::clone(self.log.allocator.device());
            let executor = self.executor()?;
            executor.block_on(device.read(address.control(), out))?;
            return Ok(());
        }

        let page_bits = self.log.allocator.page_bits();
        let page = address.page(page_bits);
        let offset = address.offset(page_bits) as usize;

        let frame_idx = self.load_frame(page)?;
        let frame = &self.frames[frame_idx];
        out.copy_from_slice(&frame.buffer.as_slice()[offset..offset + out.len()]);
        Ok(())
    }

    /// Make sure the frame for `page` is loaded; returns its index.
    fn load_frame(&mut self, page: u64) -> Result<usize, LogError> {
        let page_size = self.log.allocator.page_size() as usize;
        let page_bits = self.log.allocator.page_bits();
        let frame_count = self.buffering.frame_count();

        if self.frames.is_empty() {
            for _ in 0..frame_count {
                let buffer = AlignedBuffer::zeroed(4096, page_size)
                    .ok_or_else(|| LogError::config("failed to allocate scan frame"))?;
                self.frames.push(ScanFrame {
                    page: u64::MAX,
                    buffer,
                });
            }
        }

        let idx = (page % frame_count as u64) as usize;
        if self.frames[idx].page != page {
            let page_start = page << page_bits;
            let device = Arc::clone(self.log.allocator.device());
            if self.executor.is_none() {
                self.executor = Some(IoExecutor::new().map_err(LogError::Io)?);
            }
            let executor = self.executor.as_ref().unwrap();
            let frame = &mut self.frames[idx];
            executor.block_on(device.read(page_start, frame.buffer.as_mut_slice()))?;
            frame.page = page;
        }
        Ok(idx)
    }

    fn executor(&mut self) -> Result<&IoExecutor, LogError> {
        if self.executor.is_none() {
            self.executor = Some(IoExecutor::new().map_err(LogError::Io)?);
        }
        Ok(self.executor.as_ref().unwrap())
    }

    fn effective_ceiling(&self) -> Address {
        let committed = self.log.committed_until_address();
        if self.scan_uncommitted {
            cmp::max(committed, self.log.uncommitted_tail.load(Ordering::Acquire))
        } else {
            committed
        }
    }

    fn alloc_payload(&self, len: usize) -> Vec<u8> {
        match &self.log.get_memory {
            Some(hook) => {
                let mut buf = hook(len);
                buf.resize(len, 0);
                buf
            }
            None => vec![0u8; len],
        }
    }
}

impl<'a, D: StorageDevice> Iterator for LogScanIterator<'a, D> {
    type Item = LogRecord;

    /// Iteration stops at the ceiling, the range end, or the first error;
    /// use [`LogScanIterator::get_next`] to observe errors.
    fn next(&mut self) -> Option<Self::Item> {
        self.get_next().ok().flatten()
    }
}
