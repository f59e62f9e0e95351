//! Tailing scans over uncommitted data with small pages.

use pagelog::device::NullDisk;
use pagelog::{Address, LogSettings, PageLog};

fn small_page_settings() -> LogSettings {
    LogSettings {
        memory_size_bits: 12, // 8 pages of 512 bytes
        page_size_bits: 9,
        segment_size_bits: 20,
        mutable_fraction: 0.5,
        ..Default::default()
    }
}

#[test]
fn test_uncommitted_tailing_yields_all_entries() {
    let log = PageLog::open(small_page_settings(), NullDisk::new()).unwrap();

    let mut iter = log.scan_uncommitted(Address::ZERO, Address::MAX);

    for i in 0..10u32 {
        log.append(i.to_string().as_bytes()).unwrap();
        log.refresh_uncommitted();
    }

    // No commit has happened; the tailing scan still sees all ten entries.
    assert_eq!(log.committed_until_address(), Address::FIRST_VALID);

    let mut seen = Vec::new();
    while let Some(record) = iter.get_next().unwrap() {
        seen.push(String::from_utf8(record.payload).unwrap());
    }
    let expected: Vec<String> = (0..10u32).map(|i| i.to_string()).collect();
    assert_eq!(seen, expected);

    drop(iter);
    log.close();
}

#[test]
fn test_committed_scan_does_not_see_uncommitted_tail() {
    let log = PageLog::open(small_page_settings(), NullDisk::new()).unwrap();

    log.append(b"committed").unwrap();
    log.flush_and_commit(true).unwrap();

    log.append(b"uncommitted").unwrap();
    log.refresh_uncommitted();

    let committed: Vec<Vec<u8>> = log.scan(Address::ZERO, Address::MAX).map(|r| r.payload).collect();
    assert_eq!(committed, vec![b"committed".to_vec()]);

    let all: Vec<Vec<u8>> = log
        .scan_uncommitted(Address::ZERO, Address::MAX)
        .map(|r| r.payload)
        .collect();
    assert_eq!(all, vec![b"committed".to_vec(), b"uncommitted".to_vec()]);
    log.close();
}

#[test]
fn test_tailing_scan_follows_across_page_turns() {
    let log = PageLog::open(small_page_settings(), NullDisk::new()).unwrap();

    let mut iter = log.scan_uncommitted(Address::ZERO, Address::MAX);
    let mut yielded = 0;

    // 300-byte entries force a page turn every other append.
    for i in 0..8u32 {
        let entry = vec![b'a' + (i as u8); 300];
        log.append(&entry).unwrap();
        log.refresh_uncommitted();

        while let Some(record) = iter.get_next().unwrap() {
            assert_eq!(record.length, 300);
            yielded += 1;
        }
    }
    assert_eq!(yielded, 8);

    drop(iter);
    log.close();
}
