//! Lightweight epoch protection.
//!
//! Threads mark themselves as protecting the current global epoch while they
//! touch page memory. Actions that reclaim or repurpose that memory are
//! deferred until every thread that was protecting the epoch at queueing time
//! has exited, at which point any thread draining the list executes them.

use std::cell::{RefCell, UnsafeCell};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;
use std::thread;

use parking_lot::Mutex;

use crate::constants::{CACHE_LINE_BYTES, MAX_THREADS};

// ============ Thread ID Allocation ============

/// Global counter for allocating thread-local IDs
static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(0);

/// Recycled thread IDs (returned when threads exit).
static FREE_THREAD_IDS: OnceLock<Mutex<Vec<usize>>> = OnceLock::new();

fn free_thread_ids() -> &'static Mutex<Vec<usize>> {
    FREE_THREAD_IDS.get_or_init(|| Mutex::new(Vec::new()))
}

#[derive(Debug)]
struct ThreadIdGuard {
    id: usize,
}

impl Drop for ThreadIdGuard {
    fn drop(&mut self) {
        if let Some(free) = FREE_THREAD_IDS.get() {
            free.lock().push(self.id);
        }
    }
}

fn try_allocate_thread_id() -> Option<ThreadIdGuard> {
    if let Some(id) = free_thread_ids().lock().pop() {
        return Some(ThreadIdGuard { id });
    }

    match NEXT_THREAD_ID.fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
        if next < MAX_THREADS {
            Some(next + 1)
        } else {
            None
        }
    }) {
        Ok(id) => Some(ThreadIdGuard { id }),
        Err(_) => {
            // Another thread may have just returned an ID. Re-check before giving up.
            free_thread_ids()
                .lock()
                .pop()
                .map(|id| ThreadIdGuard { id })
        }
    }
}

thread_local! {
    static THREAD_ID: RefCell<Option<ThreadIdGuard>> = const { RefCell::new(None) };
}

use crate::error::LogError;

/// Get the current thread's ID for epoch protection.
///
/// The ID is allocated on first call, remains stable for the thread's
/// lifetime, and is recycled when the thread exits.
///
/// # Errors
///
/// Returns [`LogError::TooManyThreads`] if more than `MAX_THREADS` threads
/// concurrently use the log.
#[inline]
pub fn get_thread_id() -> Result<usize, LogError> {
    try_get_thread_id().ok_or(LogError::TooManyThreads)
}

/// Try to get the current thread's ID for epoch protection.
#[inline]
pub fn try_get_thread_id() -> Option<usize> {
    THREAD_ID.with(|slot| {
        let mut slot = slot.borrow_mut();
        if let Some(guard) = slot.as_ref() {
            return Some(guard.id);
        }

        let guard = try_allocate_thread_id()?;
        let id = guard.id;
        *slot = Some(guard);
        Some(id)
    })
}

/// Special epoch value indicating the thread is not protected
pub const UNPROTECTED: u64 = 0;

/// Size of the drain list for deferred actions
const DRAIN_LIST_SIZE: usize = 256;

/// Entry in the epoch table (one per thread)
#[repr(C, align(64))]
struct Entry {
    /// Local epoch value published by this thread
    local_current_epoch: AtomicU64,
    /// Reentrant protection counter
    reentrant: AtomicU32,
    /// Padding to fill the cache line
    _padding: [u8; CACHE_LINE_BYTES - 12],
}

impl Entry {
    const fn new() -> Self {
        Self {
            local_current_epoch: AtomicU64::new(UNPROTECTED),
            reentrant: AtomicU32::new(0),
            _padding: [0; CACHE_LINE_BYTES - 12],
        }
    }
}

/// Action to be performed once an epoch has drained
struct EpochAction {
    /// The epoch this action waits on
    epoch: AtomicU64,
    /// The callback to invoke
    callback: UnsafeCell<Option<Box<dyn FnOnce() + Send + 'static>>>,
}

impl EpochAction {
    /// Epoch value indicating this slot is free
    const FREE: u64 = u64::MAX;
    /// Epoch value indicating this slot is locked
    const LOCKED: u64 = u64::MAX - 1;

    const fn new() -> Self {
        Self {
            epoch: AtomicU64::new(Self::FREE),
            callback: UnsafeCell::new(None),
        }
    }

    /// Try to pop and run the action if its epoch has drained
    fn try_pop(&self, expected_epoch: u64) -> bool {
        match self.epoch.compare_exchange(
            expected_epoch,
            Self::LOCKED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                let callback = unsafe { (*self.callback.get()).take() };
                self.epoch.store(Self::FREE, Ordering::Release);
                if let Some(cb) = callback {
                    cb();
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Try to push a new action into a free slot.
    ///
    /// Returns `Err(callback)` if the CAS failed, so the caller can retry
    /// with another slot.
    fn try_push<F>(&self, prior_epoch: u64, callback: F) -> Result<(), F>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.epoch.compare_exchange(
            Self::FREE,
            Self::LOCKED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                unsafe {
                    *self.callback.get() = Some(Box::new(callback));
                }
                self.epoch.store(prior_epoch, Ordering::Release);
                Ok(())
            }
            Err(_) => Err(callback),
        }
    }

    /// Try to replace a drained action with a new one, running the old one.
    fn try_swap<F>(&self, expected_epoch: u64, prior_epoch: u64, new_callback: F) -> Result<(), F>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.epoch.compare_exchange(
            expected_epoch,
            Self::LOCKED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                let existing = unsafe { (*self.callback.get()).take() };
                unsafe {
                    *self.callback.get() = Some(Box::new(new_callback));
                }
                self.epoch.store(prior_epoch, Ordering::Release);
                if let Some(cb) = existing {
                    cb();
                }
                Ok(())
            }
            Err(_) => Err(new_callback),
        }
    }
}

// Safety: EpochAction slots are guarded by the LOCKED epoch value; the
// callback cell is only touched by the thread holding the lock.
unsafe impl Send for EpochAction {}
unsafe impl Sync for EpochAction {}

/// Lightweight epoch protection framework.
///
/// Tracks which threads are touching page memory and defers boundary shifts
/// and page reclamation until all threads have moved past a safe point.
pub struct LightEpoch {
    /// Per-thread epoch table
    table: Box<[Entry]>,
    /// List of deferred actions
    drain_list: Box<[EpochAction]>,
    /// Number of pending drain actions
    drain_count: AtomicU32,
    /// Current global epoch
    current_epoch: AtomicU64,
    /// Cached safe-to-reclaim epoch
    safe_to_reclaim_epoch: AtomicU64,
}

impl LightEpoch {
    /// Create a new epoch instance
    pub fn new() -> Self {
        let table = (0..MAX_THREADS)
            .map(|_| Entry::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let drain_list = (0..DRAIN_LIST_SIZE)
            .map(|_| EpochAction::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            table,
            drain_list,
            drain_count: AtomicU32::new(0),
            current_epoch: AtomicU64::new(1),
            safe_to_reclaim_epoch: AtomicU64::new(0),
        }
    }

    /// Current global epoch value
    #[inline]
    pub fn current(&self) -> u64 {
        self.current_epoch.load(Ordering::Acquire)
    }

    /// Enter the protected region.
    ///
    /// Nests per thread; the matching [`Self::unprotect`] releases one level.
    #[inline]
    pub fn protect(&self, thread_id: usize) -> u64 {
        debug_assert!(thread_id < MAX_THREADS);
        let entry = &self.table[thread_id];

        let depth = entry.reentrant.fetch_add(1, Ordering::AcqRel);
        if depth == 0 {
            let epoch = self.current_epoch.load(Ordering::Acquire);
            entry.local_current_epoch.store(epoch, Ordering::Release);
            epoch
        } else {
            entry.local_current_epoch.load(Ordering::Acquire)
        }
    }

    /// Enter the protected region and drain pending actions
    #[inline]
    pub fn protect_and_drain(&self, thread_id: usize) -> u64 {
        let epoch = self.protect(thread_id);
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(epoch);
        }
        epoch
    }

    /// Check if the thread is currently protected
    #[inline]
    pub fn is_protected(&self, thread_id: usize) -> bool {
        debug_assert!(thread_id < MAX_THREADS);
        self.table[thread_id]
            .local_current_epoch
            .load(Ordering::Acquire)
            != UNPROTECTED
    }

    /// Exit one level of protection
    #[inline]
    pub fn unprotect(&self, thread_id: usize) {
        debug_assert!(thread_id < MAX_THREADS);
        let entry = &self.table[thread_id];

        if entry.reentrant.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        entry
            .local_current_epoch
            .store(UNPROTECTED, Ordering::Release);
    }

    /// Drain pending actions that are now safe to execute
    fn drain(&self, next_epoch: u64) {
        self.compute_safe_to_reclaim_epoch(next_epoch);
        let safe_epoch = self.safe_to_reclaim_epoch.load(Ordering::Acquire);

        for action in self.drain_list.iter() {
            let trigger_epoch = action.epoch.load(Ordering::Acquire);
            if trigger_epoch == EpochAction::FREE
                || trigger_epoch == EpochAction::LOCKED
                || trigger_epoch > safe_epoch
            {
                continue;
            }

            if action.try_pop(trigger_epoch) && self.drain_count.fetch_sub(1, Ordering::AcqRel) == 1
            {
                break;
            }
        }
    }

    /// Drain from an unprotected thread.
    ///
    /// Spin and await loops call this so deferred boundary shifts make
    /// progress even when no other thread is entering the epoch.
    #[inline]
    pub fn tick(&self) {
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(self.current_epoch.load(Ordering::Acquire));
        }
    }

    /// Increment the current epoch
    pub fn bump_current_epoch(&self) -> u64 {
        let next_epoch = self.current_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(next_epoch);
        }
        next_epoch
    }

    /// Increment the epoch and register a callback for when the old epoch is
    /// safe.
    pub fn bump_current_epoch_with_action<F>(&self, callback: F) -> u64
    where
        F: FnOnce() + Send + 'static,
    {
        const MAX_FULL_SCANS: usize = 500;

        let prior_epoch = self.bump_current_epoch() - 1;

        let mut callback = Some(callback);
        let mut i = 0;
        let mut full_scans = 0;
        loop {
            let action = &self.drain_list[i];
            let trigger_epoch = action.epoch.load(Ordering::Acquire);

            if trigger_epoch == EpochAction::FREE {
                if let Some(cb) = callback.take() {
                    match action.try_push(prior_epoch, cb) {
                        Ok(()) => {
                            self.drain_count.fetch_add(1, Ordering::AcqRel);
                            return prior_epoch + 1;
                        }
                        Err(returned_cb) => {
                            callback = Some(returned_cb);
                        }
                    }
                }
            } else if trigger_epoch != EpochAction::LOCKED
                && trigger_epoch <= self.safe_to_reclaim_epoch.load(Ordering::Acquire)
            {
                if let Some(cb) = callback.take() {
                    match action.try_swap(trigger_epoch, prior_epoch, cb) {
                        Ok(()) => return prior_epoch + 1,
                        Err(returned_cb) => {
                            callback = Some(returned_cb);
                        }
                    }
                }
            }

            i = (i + 1) % DRAIN_LIST_SIZE;
            if i == 0 {
                full_scans += 1;
                if full_scans >= MAX_FULL_SCANS {
                    tracing::warn!("drain list full after many scans; running action inline");
                    // Run the callback directly since it could not be deferred.
                    if let Some(cb) = callback.take() {
                        cb();
                    }
                    return prior_epoch + 1;
                }
                thread::yield_now();
            }
        }
    }

    /// Compute the new safe-to-reclaim epoch by scanning all threads
    pub fn compute_safe_to_reclaim_epoch(&self, current_epoch: u64) -> u64 {
        let mut oldest_ongoing = current_epoch;

        for entry in self.table.iter() {
            let entry_epoch = entry.local_current_epoch.load(Ordering::Acquire);
            if entry_epoch != UNPROTECTED && entry_epoch < oldest_ongoing {
                oldest_ongoing = entry_epoch;
            }
        }

        let safe = oldest_ongoing.saturating_sub(1);
        self.safe_to_reclaim_epoch.store(safe, Ordering::Release);
        safe
    }

    /// Check if an epoch is safe to reclaim
    #[inline]
    pub fn is_safe_to_reclaim(&self, epoch: u64) -> bool {
        epoch <= self.safe_to_reclaim_epoch.load(Ordering::Acquire)
    }
}

impl Default for LightEpoch {
    fn default() -> Self {
        Self::new()
    }
}

// Safety: LightEpoch uses only atomic operations for cross-thread state
unsafe impl Send for LightEpoch {}
unsafe impl Sync for LightEpoch {}

/// RAII guard for epoch protection
pub struct EpochGuard {
    epoch: Arc<LightEpoch>,
    thread_id: usize,
}

impl EpochGuard {
    /// Enter the epoch, draining pending actions on the way in
    pub fn enter(epoch: Arc<LightEpoch>, thread_id: usize) -> Self {
        epoch.protect_and_drain(thread_id);
        Self { epoch, thread_id }
    }

    /// Get the thread ID
    pub fn thread_id(&self) -> usize {
        self.thread_id
    }
}

impl Drop for EpochGuard {
    fn drop(&mut self) {
        self.epoch.unprotect(self.thread_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_basic_protection() {
        let epoch = LightEpoch::new();

        assert!(!epoch.is_protected(0));

        let e = epoch.protect(0);
        assert!(epoch.is_protected(0));
        assert_eq!(e, 1);

        epoch.unprotect(0);
        assert!(!epoch.is_protected(0));
    }

    #[test]
    fn test_nested_protection() {
        let epoch = LightEpoch::new();

        epoch.protect(0);
        epoch.protect(0);
        epoch.unprotect(0);
        assert!(epoch.is_protected(0));

        epoch.unprotect(0);
        assert!(!epoch.is_protected(0));
    }

    #[test]
    fn test_bump_epoch() {
        let epoch = LightEpoch::new();

        assert_eq!(epoch.current(), 1);

        let new_epoch = epoch.bump_current_epoch();
        assert_eq!(new_epoch, 2);
        assert_eq!(epoch.current(), 2);
    }

    #[test]
    fn test_safe_to_reclaim() {
        let epoch = LightEpoch::new();

        // No threads protected - all prior epochs are safe
        epoch.compute_safe_to_reclaim_epoch(10);
        assert!(epoch.is_safe_to_reclaim(9));

        // Protect thread 0 at epoch 5
        epoch.current_epoch.store(5, Ordering::Relaxed);
        epoch.protect(0);

        epoch.compute_safe_to_reclaim_epoch(10);
        assert!(epoch.is_safe_to_reclaim(4));
        assert!(!epoch.is_safe_to_reclaim(5));

        epoch.unprotect(0);
    }

    #[test]
    fn test_deferred_action_waits_for_quiescence() {
        use std::sync::atomic::AtomicBool;

        let epoch = Arc::new(LightEpoch::new());
        let fired = Arc::new(AtomicBool::new(false));

        epoch.protect(0);

        let fired_clone = fired.clone();
        epoch.bump_current_epoch_with_action(move || {
            fired_clone.store(true, Ordering::Release);
        });

        // Thread 0 still protects the prior epoch: the action must not run.
        epoch.tick();
        assert!(!fired.load(Ordering::Acquire));

        epoch.unprotect(0);
        epoch.tick();
        assert!(fired.load(Ordering::Acquire));
    }

    #[test]
    fn test_epoch_guard() {
        let epoch = Arc::new(LightEpoch::new());

        {
            let guard = EpochGuard::enter(epoch.clone(), 0);
            assert_eq!(guard.thread_id(), 0);
            assert!(epoch.is_protected(0));
        }

        assert!(!epoch.is_protected(0));
    }

    #[test]
    fn test_thread_id_does_not_exhaust_under_sequential_churn() {
        for _ in 0..(MAX_THREADS * 2) {
            std::thread::spawn(|| {
                let id = get_thread_id().unwrap();
                assert!(id < MAX_THREADS);
            })
            .join()
            .unwrap();
        }
    }
}
