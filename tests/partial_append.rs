//! Partial-append resume: a try-append that crosses into a page whose ring
//! slot is still occupied goes pending, and resumes once flushes release it.

use pagelog::device::FileSystemDisk;
use pagelog::{Address, AppendOutcome, LogSettings, PageLog};
use tempfile::tempdir;

fn two_page_settings(commit_path: std::path::PathBuf) -> LogSettings {
    LogSettings {
        memory_size_bits: 13, // exactly two 4 KiB pages
        page_size_bits: 12,
        segment_size_bits: 20,
        mutable_fraction: 0.5,
        commit_path: Some(commit_path),
        ..Default::default()
    }
}

/// Fill a page completely with one append. The first page also absorbs the
/// reserved first-valid gap.
fn fill_page<D: pagelog::device::StorageDevice>(log: &PageLog<D>, room: usize) {
    // room = page bytes available; record = 4-byte header + payload
    log.append(&vec![0xAB; room - 4]).unwrap();
}

#[test]
fn test_pending_append_resumes_after_flush() {
    let dir = tempdir().unwrap();
    let device = FileSystemDisk::single_file(dir.path().join("log.dat")).unwrap();
    let log = PageLog::open(two_page_settings(dir.path().join("log.commit")), device).unwrap();

    // Page 0: [64, 4096), page 1: [4096, 8192). The third append must reuse
    // page 0's ring slot, which is still unflushed.
    fill_page(&log, 4096 - 64);
    fill_page(&log, 4096);

    let payload = b"resumed entry";
    let handle = match log.try_append(payload).unwrap() {
        AppendOutcome::Pending(handle) => {
            assert_eq!(handle.address(), Address::new(8192));
            handle
        }
        other => panic!("expected a pending append, got {other:?}"),
    };

    // While the turn is in flight, competing appends must restart.
    assert!(matches!(
        log.try_append(b"competitor").unwrap(),
        AppendOutcome::Restart
    ));

    // Drive the flush/eviction chain until the pending append completes.
    let mut handle = handle;
    let address = loop {
        match log.try_complete_append(handle, payload).unwrap() {
            AppendOutcome::Done(address) => break address,
            AppendOutcome::Pending(h) => {
                handle = h;
                std::thread::yield_now();
            }
            AppendOutcome::Restart => panic!("pending page slid below read-only"),
        }
    };
    assert_eq!(address, Address::new(8192));

    log.flush_and_commit(true).unwrap();

    let scanned: Vec<_> = log
        .scan(Address::ZERO, Address::MAX)
        .map(|r| (u64::from(r.current_address), r.payload))
        .collect();
    assert_eq!(scanned.len(), 3);
    assert_eq!(scanned[2], (8192, payload.to_vec()));
    log.close();
}

#[test]
fn test_sync_append_rides_out_the_page_turn() {
    let dir = tempdir().unwrap();
    let device = FileSystemDisk::single_file(dir.path().join("log.dat")).unwrap();
    let log = PageLog::open(two_page_settings(dir.path().join("log.commit")), device).unwrap();

    fill_page(&log, 4096 - 64);
    fill_page(&log, 4096);

    // The blocking append spins through the same pending path internally.
    let address = log.append(b"blocking append").unwrap();
    assert_eq!(address, Address::new(8192));
    log.close();
}

#[test]
fn test_mismatched_resume_payload_is_rejected() {
    let dir = tempdir().unwrap();
    let device = FileSystemDisk::single_file(dir.path().join("log.dat")).unwrap();
    let log = PageLog::open(two_page_settings(dir.path().join("log.commit")), device).unwrap();

    fill_page(&log, 4096 - 64);
    fill_page(&log, 4096);

    let handle = match log.try_append(b"sized-one-way").unwrap() {
        AppendOutcome::Pending(handle) => handle,
        other => panic!("expected pending, got {other:?}"),
    };

    // Resuming with a payload of a different reserved size is an error.
    let err = log
        .try_complete_append(handle, b"a much longer payload than before")
        .unwrap_err();
    assert!(matches!(err, pagelog::LogError::Config(_)));
    log.close();
}
