use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use super::PageLog;
use crate::address::Address;
use crate::log::types::AppendOutcome;
use crate::device::NullDisk;
use crate::error::LogError;
use crate::settings::LogSettings;
use crate::utility::align4;

fn test_settings() -> LogSettings {
    LogSettings {
        memory_size_bits: 16, // 16 pages of 4 KiB
        page_size_bits: 12,
        segment_size_bits: 20,
        mutable_fraction: 0.5,
        ..Default::default()
    }
}

fn create_test_log() -> PageLog<NullDisk> {
    PageLog::open(test_settings(), NullDisk::new()).unwrap()
}

fn assert_boundary_invariants<D: crate::device::StorageDevice>(log: &PageLog<D>) {
    let stats = log.stats();
    assert!(stats.begin_address <= stats.head_address, "{stats}");
    assert!(stats.head_address <= stats.read_only_address, "{stats}");
    assert!(stats.read_only_address <= stats.tail_address, "{stats}");
    assert!(stats.flushed_until_address <= stats.tail_address, "{stats}");
    assert!(stats.committed_until_address <= stats.flushed_until_address, "{stats}");
}

#[test]
fn test_append_and_scan_roundtrip() {
    let log = create_test_log();

    let payload = b"Hello, World!";
    let address = log.append(payload).unwrap();
    assert_eq!(address, Address::FIRST_VALID);

    log.flush_and_commit(true).unwrap();

    let mut iter = log.scan(Address::ZERO, Address::MAX);
    let record = iter.get_next().unwrap().unwrap();
    assert_eq!(&record.payload, payload);
    assert_eq!(record.length as usize, payload.len());
    assert_eq!(record.current_address, address);
    assert_eq!(
        record.next_address,
        address + (4 + align4(payload.len())) as u64
    );
    assert!(iter.get_next().unwrap().is_none());

    log.close();
}

#[test]
fn test_append_addresses_strictly_increasing() {
    let log = create_test_log();

    let mut last = Address::ZERO;
    for i in 0..100 {
        let entry = format!("entry-{i}");
        let address = log.append(entry.as_bytes()).unwrap();
        assert!(address > last);
        last = address;
    }
    assert_boundary_invariants(&log);
    log.close();
}

#[test]
fn test_try_append_done() {
    let log = create_test_log();

    match log.try_append(b"payload").unwrap() {
        AppendOutcome::Done(address) => assert_eq!(address, Address::FIRST_VALID),
        other => panic!("expected Done, got {other:?}"),
    }
    log.close();
}

#[test]
fn test_entry_too_large_is_rejected() {
    let log = create_test_log();

    let oversized = vec![0u8; 4096];
    assert!(matches!(
        log.append(&oversized),
        Err(LogError::EntryTooLarge { .. })
    ));
    log.close();
}

#[test]
fn test_empty_payload_is_rejected() {
    let log = create_test_log();
    assert!(matches!(log.append(b""), Err(LogError::Config(_))));
    log.close();
}

#[test]
fn test_append_after_close_fails() {
    let log = create_test_log();
    assert!(!log.is_closed());
    log.close();
    assert!(log.is_closed());

    assert!(matches!(log.append(b"late"), Err(LogError::Closed)));
}

#[test]
fn test_idempotent_commit() {
    let log = create_test_log();

    log.append(b"data").unwrap();
    let first = log.flush_and_commit(true).unwrap();
    let committed = log.committed_until_address();
    assert_eq!(committed, first);

    let second = log.flush_and_commit(true).unwrap();
    assert_eq!(second, first);
    assert_eq!(log.committed_until_address(), committed);
    log.close();
}

#[test]
fn test_wait_for_commit_zero_means_current_tail() {
    let log = create_test_log();

    log.append(b"abc").unwrap();
    log.flush_and_commit(true).unwrap();
    log.wait_for_commit(Address::ZERO).unwrap();
    log.close();
}

#[test]
fn test_wait_for_commit_blocks_until_flush() {
    let log = Arc::new(create_test_log());

    let address = log.append(b"blocking entry").unwrap();
    let target = address + (4 + align4(14)) as u64;

    let (tx, rx) = mpsc::channel();
    let wait_log = Arc::clone(&log);
    let handle = thread::spawn(move || {
        wait_log.wait_for_commit(target).unwrap();
        let _ = tx.send(());
    });

    assert!(
        rx.recv_timeout(Duration::from_millis(50)).is_err(),
        "wait_for_commit returned before anything was committed"
    );

    log.flush_and_commit(true).unwrap();
    rx.recv_timeout(Duration::from_secs(5))
        .expect("wait_for_commit should complete after the commit");
    handle.join().unwrap();
    log.close();
}

#[test]
fn test_refresh_uncommitted_feeds_tailing_scan() {
    let log = create_test_log();

    let mut iter = log.scan_uncommitted(Address::ZERO, Address::MAX);
    assert!(iter.get_next().unwrap().is_none());

    log.append(b"first").unwrap();
    // Not yet published to uncommitted readers.
    assert!(iter.get_next().unwrap().is_none());

    log.refresh_uncommitted();
    let record = iter.get_next().unwrap().unwrap();
    assert_eq!(&record.payload, b"first");
    drop(iter);
    log.close();
}

#[test]
fn test_append_batch_preserves_order() {
    let log = create_test_log();

    let payloads: Vec<&[u8]> = vec![b"one", b"two", b"three"];
    let addresses = log.append_batch(&payloads).unwrap();
    assert_eq!(addresses.len(), 3);
    assert!(addresses[0] < addresses[1] && addresses[1] < addresses[2]);

    log.flush_and_commit(true).unwrap();
    let scanned: Vec<Vec<u8>> = log
        .scan(Address::ZERO, Address::MAX)
        .map(|r| r.payload)
        .collect();
    assert_eq!(scanned, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    log.close();
}

#[test]
fn test_invariants_across_ring_wrap() {
    // 4-page ring of 4 KiB; 2000 entries of ~100 bytes force several wraps.
    let settings = LogSettings {
        memory_size_bits: 14,
        page_size_bits: 12,
        segment_size_bits: 20,
        mutable_fraction: 0.5,
        ..Default::default()
    };
    let log = PageLog::open(settings, NullDisk::new()).unwrap();

    for i in 0..2000u32 {
        let entry = format!("wrap-entry-{i:05}");
        log.append(entry.as_bytes()).unwrap();
        if i % 500 == 0 {
            assert_boundary_invariants(&log);
        }
    }
    log.flush_and_commit(true).unwrap();
    assert_boundary_invariants(&log);
    assert!(log.head_address() > Address::FIRST_VALID);
    log.close();
}

#[test]
fn test_get_memory_hook_supplies_scan_buffers() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let calls = Arc::new(AtomicUsize::new(0));
    let hook_calls = Arc::clone(&calls);
    let settings = LogSettings {
        get_memory: Some(Arc::new(move |len| {
            hook_calls.fetch_add(1, Ordering::Relaxed);
            vec![0u8; len]
        })),
        ..test_settings()
    };
    let log = PageLog::open(settings, NullDisk::new()).unwrap();

    log.append(b"hooked-one").unwrap();
    log.append(b"hooked-two").unwrap();
    log.flush_and_commit(true).unwrap();

    let scanned = log.scan(Address::ZERO, Address::MAX).count();
    assert_eq!(scanned, 2);
    assert_eq!(calls.load(Ordering::Relaxed), 2);
    log.close();
}

#[test]
fn test_stats_reports_configuration() {
    let log = create_test_log();
    log.append(b"x").unwrap();

    let stats = log.stats();
    assert_eq!(stats.page_size, 4096);
    assert_eq!(stats.buffer_pages, 16);
    assert!(stats.tail_address > Address::FIRST_VALID);
    log.close();
}
