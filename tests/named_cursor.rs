//! Named persistent cursors: progress is checkpointed with each commit and
//! a reopened log resumes the scan where the consumer left off.

use pagelog::device::FileSystemDisk;
use pagelog::{Address, LogSettings, PageLog};
use tempfile::tempdir;

fn settings(commit_path: std::path::PathBuf) -> LogSettings {
    LogSettings {
        memory_size_bits: 16,
        page_size_bits: 12,
        segment_size_bits: 20,
        mutable_fraction: 0.5,
        commit_path: Some(commit_path),
        ..Default::default()
    }
}

#[test]
fn test_named_cursor_resumes_after_reopen() {
    let dir = tempdir().unwrap();
    let log_path = dir.path().join("log.dat");
    let commit_path = dir.path().join("log.commit");

    {
        let device = FileSystemDisk::single_file(&log_path).unwrap();
        let log = PageLog::open(settings(commit_path.clone()), device).unwrap();

        for i in 0..10u32 {
            log.append(format!("entry-{i}").as_bytes()).unwrap();
        }
        log.flush_and_commit(true).unwrap();

        let mut iter = log.scan_named("cursor", false).unwrap();
        let mut after_fifth = Address::ZERO;
        for _ in 0..5 {
            after_fifth = iter.get_next().unwrap().unwrap().next_address;
        }
        iter.complete_until(after_fifth);
        drop(iter);

        // Checkpoint the cursor alongside the commit metadata.
        log.append(b"tick").unwrap();
        log.flush_and_commit(true).unwrap();
        log.close();
    }

    let device = FileSystemDisk::single_file(&log_path).unwrap();
    let log = PageLog::open(settings(commit_path), device).unwrap();

    let mut iter = log.scan_named("cursor", true).unwrap();
    let record = iter.get_next().unwrap().expect("cursor should resume mid-log");
    assert_eq!(record.payload, b"entry-5");
    log.close();
}

#[test]
fn test_named_cursor_without_recover_starts_at_begin() {
    let dir = tempdir().unwrap();
    let device = FileSystemDisk::single_file(dir.path().join("log.dat")).unwrap();
    let log = PageLog::open(settings(dir.path().join("log.commit")), device).unwrap();

    for i in 0..5u32 {
        log.append(format!("entry-{i}").as_bytes()).unwrap();
    }
    log.flush_and_commit(true).unwrap();

    let mut iter = log.scan_named("cursor", false).unwrap();
    let mut last = Address::ZERO;
    for _ in 0..3 {
        last = iter.get_next().unwrap().unwrap().next_address;
    }
    iter.complete_until(last);
    drop(iter);

    // A fresh, non-recovering iterator with the same name starts over.
    let mut iter = log.scan_named("cursor", false).unwrap();
    let record = iter.get_next().unwrap().unwrap();
    assert_eq!(record.payload, b"entry-0");
    log.close();
}

#[test]
fn test_two_named_cursors_checkpoint_independently() {
    let dir = tempdir().unwrap();
    let log_path = dir.path().join("log.dat");
    let commit_path = dir.path().join("log.commit");

    {
        let device = FileSystemDisk::single_file(&log_path).unwrap();
        let log = PageLog::open(settings(commit_path.clone()), device).unwrap();

        for i in 0..6u32 {
            log.append(format!("entry-{i}").as_bytes()).unwrap();
        }
        log.flush_and_commit(true).unwrap();

        let mut fast = log.scan_named("fast", false).unwrap();
        for _ in 0..4 {
            let next = fast.get_next().unwrap().unwrap().next_address;
            fast.complete_until(next);
        }

        let mut slow = log.scan_named("slow", false).unwrap();
        let next = slow.get_next().unwrap().unwrap().next_address;
        slow.complete_until(next);

        drop(fast);
        drop(slow);
        log.append(b"tick").unwrap();
        log.flush_and_commit(true).unwrap();
        log.close();
    }

    let device = FileSystemDisk::single_file(&log_path).unwrap();
    let log = PageLog::open(settings(commit_path), device).unwrap();

    let mut fast = log.scan_named("fast", true).unwrap();
    assert_eq!(fast.get_next().unwrap().unwrap().payload, b"entry-4");

    let mut slow = log.scan_named("slow", true).unwrap();
    assert_eq!(slow.get_next().unwrap().unwrap().payload, b"entry-1");
    log.close();
}
