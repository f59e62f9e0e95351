//! Commit metadata: the recovery blob and the stores that persist it.
//!
//! On every commit event the log persists a small [`RecoveryInfo`] blob
//! through a [`CommitManager`]. The blob layout is stable across versions:
//!
//! ```text
//! [ i32 version ][ i64 begin_address ][ i64 flushed_until_address ]
//! [ i32 iterator_count ]
//!   repeated iterator_count times:
//!     [ u16 name_len ][ name_len bytes utf-8 ][ i64 completed_until ]
//! ```
//!
//! All integers are little-endian.

mod manager;

pub use manager::{CommitManager, LocalCommitManager, MemoryCommitManager};

use std::fmt;

use crate::address::Address;

/// Errors related to recovery-info parsing and validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryInfoError {
    /// Blob shorter than its fixed header or a declared entry.
    BufferTooSmall,
    /// Unknown format version.
    UnsupportedVersion(i32),
    /// An iterator name was not valid UTF-8.
    InvalidName,
    /// Negative or otherwise nonsensical field value.
    InvalidField(&'static str),
}

impl fmt::Display for RecoveryInfoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryInfoError::BufferTooSmall => write!(f, "recovery info buffer too small"),
            RecoveryInfoError::UnsupportedVersion(version) => {
                write!(f, "unsupported recovery info version {version}")
            }
            RecoveryInfoError::InvalidName => write!(f, "iterator name is not valid utf-8"),
            RecoveryInfoError::InvalidField(field) => {
                write!(f, "invalid recovery info field: {field}")
            }
        }
    }
}

impl std::error::Error for RecoveryInfoError {}

/// Recovery metadata persisted on every commit event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryInfo {
    /// First valid address of the log (advanced by truncation).
    pub begin_address: Address,
    /// Durable frontier; entries below this address survive a crash.
    pub flushed_until_address: Address,
    /// Named iterator checkpoints: `(name, completed_until)`.
    pub cursors: Vec<(String, Address)>,
}

impl RecoveryInfo {
    /// Current blob format version.
    pub const VERSION: i32 = 1;

    /// Fixed-size portion: version + two addresses + iterator count.
    const HEADER_SIZE: usize = 4 + 8 + 8 + 4;

    /// A fresh log's recovery info.
    pub fn fresh() -> Self {
        Self {
            begin_address: Address::FIRST_VALID,
            flushed_until_address: Address::FIRST_VALID,
            cursors: Vec::new(),
        }
    }

    /// Encode into the stable little-endian layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            Self::HEADER_SIZE
                + self
                    .cursors
                    .iter()
                    .map(|(name, _)| 2 + name.len() + 8)
                    .sum::<usize>(),
        );

        buf.extend_from_slice(&Self::VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.begin_address.control() as i64).to_le_bytes());
        buf.extend_from_slice(&(self.flushed_until_address.control() as i64).to_le_bytes());
        buf.extend_from_slice(&(self.cursors.len() as i32).to_le_bytes());

        for (name, completed_until) in &self.cursors {
            debug_assert!(name.len() <= u16::MAX as usize);
            buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(&(completed_until.control() as i64).to_le_bytes());
        }

        buf
    }

    /// Decode and validate a blob.
    pub fn decode(buf: &[u8]) -> Result<Self, RecoveryInfoError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(RecoveryInfoError::BufferTooSmall);
        }

        let version = i32::from_le_bytes(buf[0..4].try_into().unwrap());
        if version != Self::VERSION {
            return Err(RecoveryInfoError::UnsupportedVersion(version));
        }

        let begin = i64::from_le_bytes(buf[4..12].try_into().unwrap());
        let flushed = i64::from_le_bytes(buf[12..20].try_into().unwrap());
        if begin < 0 {
            return Err(RecoveryInfoError::InvalidField("begin_address"));
        }
        if flushed < begin {
            return Err(RecoveryInfoError::InvalidField("flushed_until_address"));
        }

        let count = i32::from_le_bytes(buf[20..24].try_into().unwrap());
        if count < 0 {
            return Err(RecoveryInfoError::InvalidField("iterator_count"));
        }

        let mut cursors = Vec::with_capacity(count as usize);
        let mut offset = Self::HEADER_SIZE;
        for _ in 0..count {
            if buf.len() < offset + 2 {
                return Err(RecoveryInfoError::BufferTooSmall);
            }
            let name_len = u16::from_le_bytes(buf[offset..offset + 2].try_into().unwrap()) as usize;
            offset += 2;

            if buf.len() < offset + name_len + 8 {
                return Err(RecoveryInfoError::BufferTooSmall);
            }
            let name = std::str::from_utf8(&buf[offset..offset + name_len])
                .map_err(|_| RecoveryInfoError::InvalidName)?
                .to_string();
            offset += name_len;

            let completed = i64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap());
            offset += 8;
            if completed < 0 {
                return Err(RecoveryInfoError::InvalidField("completed_until"));
            }

            cursors.push((name, Address::new(completed as u64)));
        }

        Ok(Self {
            begin_address: Address::new(begin as u64),
            flushed_until_address: Address::new(flushed as u64),
            cursors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_no_cursors() {
        let info = RecoveryInfo {
            begin_address: Address::new(64),
            flushed_until_address: Address::new(8192),
            cursors: Vec::new(),
        };

        let decoded = RecoveryInfo::decode(&info.encode()).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_roundtrip_with_cursors() {
        let info = RecoveryInfo {
            begin_address: Address::new(64),
            flushed_until_address: Address::new(10_000),
            cursors: vec![
                ("reader-a".to_string(), Address::new(512)),
                ("reader-b".to_string(), Address::new(4096)),
            ],
        };

        let decoded = RecoveryInfo::decode(&info.encode()).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_layout_is_bit_exact() {
        let info = RecoveryInfo {
            begin_address: Address::new(64),
            flushed_until_address: Address::new(128),
            cursors: vec![("c".to_string(), Address::new(96))],
        };

        let buf = info.encode();
        assert_eq!(&buf[0..4], &1i32.to_le_bytes());
        assert_eq!(&buf[4..12], &64i64.to_le_bytes());
        assert_eq!(&buf[12..20], &128i64.to_le_bytes());
        assert_eq!(&buf[20..24], &1i32.to_le_bytes());
        assert_eq!(&buf[24..26], &1u16.to_le_bytes());
        assert_eq!(buf[26], b'c');
        assert_eq!(&buf[27..35], &96i64.to_le_bytes());
        assert_eq!(buf.len(), 35);
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let info = RecoveryInfo {
            begin_address: Address::new(64),
            flushed_until_address: Address::new(128),
            cursors: vec![("cursor".to_string(), Address::new(96))],
        };
        let buf = info.encode();

        assert_eq!(
            RecoveryInfo::decode(&buf[..buf.len() - 1]).unwrap_err(),
            RecoveryInfoError::BufferTooSmall
        );
    }

    #[test]
    fn test_decode_rejects_bad_version() {
        let mut buf = RecoveryInfo::fresh().encode();
        buf[0] = 9;
        assert_eq!(
            RecoveryInfo::decode(&buf).unwrap_err(),
            RecoveryInfoError::UnsupportedVersion(9)
        );
    }

    #[test]
    fn test_decode_rejects_flushed_below_begin() {
        let info = RecoveryInfo {
            begin_address: Address::new(4096),
            flushed_until_address: Address::new(8192),
            cursors: Vec::new(),
        };
        let mut buf = info.encode();
        buf[12..20].copy_from_slice(&64i64.to_le_bytes());
        assert_eq!(
            RecoveryInfo::decode(&buf).unwrap_err(),
            RecoveryInfoError::InvalidField("flushed_until_address")
        );
    }
}
