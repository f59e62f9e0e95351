//! Commit coordination: serialized durability events and waiter release.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::address::{Address, AtomicAddress};
use crate::commit::{CommitManager, RecoveryInfo};
use crate::error::LogError;

/// Serializes commit events.
///
/// Every flush completion funnels through [`CommitCoordinator::commit`],
/// which persists recovery metadata and advances the committed frontier
/// under one briefly-held lock. Waiters observe progress through a watched
/// cell carrying the latest committed address.
pub(crate) struct CommitCoordinator {
    /// Committed frontier; entries below survive a crash
    committed_until: AtomicAddress,
    /// External commit-metadata store, accessed only under `commit_lock`
    manager: Box<dyn CommitManager>,
    /// Serializes metadata persistence and the committed-until advance
    commit_lock: Mutex<()>,
    /// First commit-store or flush failure, surfaced on the next explicit commit
    last_error: Mutex<Option<LogError>>,
    /// Broadcast cell: latest committed address
    watch_tx: watch::Sender<u64>,
    /// Live named cursors checkpointed with every commit
    cursors: Mutex<BTreeMap<String, Arc<AtomicAddress>>>,
}

impl CommitCoordinator {
    pub(crate) fn new(manager: Box<dyn CommitManager>, committed_until: Address) -> Self {
        let (watch_tx, _) = watch::channel(committed_until.control());
        Self {
            committed_until: AtomicAddress::new(committed_until),
            manager,
            commit_lock: Mutex::new(()),
            last_error: Mutex::new(None),
            watch_tx,
            cursors: Mutex::new(BTreeMap::new()),
        }
    }

    #[inline]
    pub(crate) fn committed_until(&self) -> Address {
        self.committed_until.load(Ordering::Acquire)
    }

    /// Record a durability event at `flush_address`.
    ///
    /// Monotonicity is enforced inside the lock, so stale callbacks never
    /// regress the committed frontier. At most one commit write is in flight.
    pub(crate) fn commit(&self, flush_address: Address, begin_address: Address) {
        {
            let _guard = self.commit_lock.lock();

            if flush_address > self.committed_until() {
                let info = RecoveryInfo {
                    begin_address,
                    flushed_until_address: flush_address,
                    cursors: self.snapshot_cursors(),
                };

                if let Err(e) = self.manager.commit(&info.encode()) {
                    tracing::error!(error = %e, address = flush_address.control(),
                        "commit metadata write failed");
                    self.record_error(LogError::commit(e.to_string()));
                    return;
                }
                self.committed_until.store(flush_address, Ordering::Release);
            }
        }

        // Wake every waiter outside the lock.
        self.watch_tx
            .send_replace(self.committed_until().control());
    }

    /// Subscribe to committed-frontier changes.
    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.watch_tx.subscribe()
    }

    /// Record a fatal flush or commit failure.
    pub(crate) fn record_error(&self, error: LogError) {
        let mut slot = self.last_error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    /// Take the recorded failure, if any, to surface on an explicit commit.
    pub(crate) fn take_error(&self) -> Option<LogError> {
        self.last_error.lock().take()
    }

    /// Register (or look up) a named cursor checkpointed with each commit.
    pub(crate) fn register_cursor(&self, name: &str, start: Address) -> Arc<AtomicAddress> {
        let mut cursors = self.cursors.lock();
        cursors
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicAddress::new(start)))
            .clone()
    }

    /// Look up a previously registered or recovered cursor.
    pub(crate) fn cursor(&self, name: &str) -> Option<Arc<AtomicAddress>> {
        self.cursors.lock().get(name).cloned()
    }

    fn snapshot_cursors(&self) -> Vec<(String, Address)> {
        self.cursors
            .lock()
            .iter()
            .map(|(name, addr)| (name.clone(), addr.load(Ordering::Acquire)))
            .collect()
    }
}
