//! File system storage devices.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::device::SyncStorageDevice;

/// File system file wrapper
///
/// Wraps a file with mutex protection for thread-safe positioned access.
pub struct FileSystemFile {
    /// Path to the file
    path: PathBuf,
    /// The underlying file
    file: Mutex<File>,
}

impl FileSystemFile {
    /// Open or create a file at the specified path
    pub fn open(path: impl AsRef<Path>, create: bool) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Get the path to the file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SyncStorageDevice for FileSystemFile {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut file = self.file.lock();

        file.seek(SeekFrom::Start(offset))?;

        // Fill the buffer completely; unwritten space past EOF reads as zeros.
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf[filled..].fill(0);
        Ok(buf.len())
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.file.lock();

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush_sync(&self) -> io::Result<()> {
        self.file.lock().sync_all()
    }

    fn size_sync(&self) -> io::Result<u64> {
        self.file.lock().metadata().map(|m| m.len())
    }
}

/// Segmented file for large storage
///
/// Maps the flat device offset space onto fixed-size segment files named
/// `<prefix>.<n>`, so a log can grow past any single-file limit and truncated
/// prefixes can eventually be unlinked segment by segment.
pub struct SegmentedFile {
    /// Base directory
    base_dir: PathBuf,
    /// File prefix
    prefix: String,
    /// Segment size in bytes
    segment_size: u64,
    /// Open segments
    segments: Mutex<Vec<Option<FileSystemFile>>>,
}

impl SegmentedFile {
    /// Create a new segmented file
    pub fn new(base_dir: impl AsRef<Path>, prefix: &str, segment_size: u64) -> io::Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;

        Ok(Self {
            base_dir,
            prefix: prefix.to_string(),
            segment_size,
            segments: Mutex::new(Vec::new()),
        })
    }

    /// Get the segment file path for a given segment index
    fn segment_path(&self, segment: u64) -> PathBuf {
        self.base_dir.join(format!("{}.{}", self.prefix, segment))
    }

    /// Run `op` against the segment containing `offset`, opening it on demand.
    fn with_segment<T>(
        &self,
        offset: u64,
        op: impl FnOnce(&FileSystemFile, u64) -> io::Result<T>,
    ) -> io::Result<T> {
        let segment = offset / self.segment_size;
        let segment_offset = offset % self.segment_size;

        let mut segments = self.segments.lock();
        while segments.len() <= segment as usize {
            segments.push(None);
        }
        if segments[segment as usize].is_none() {
            let file = FileSystemFile::open(self.segment_path(segment), true)?;
            segments[segment as usize] = Some(file);
        }

        op(segments[segment as usize].as_ref().unwrap(), segment_offset)
    }
}

impl SyncStorageDevice for SegmentedFile {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        // Split at segment boundaries; the log never issues requests larger
        // than a page, but a page range may still straddle two segments.
        let mut done = 0;
        while done < buf.len() {
            let at = offset + done as u64;
            let room = (self.segment_size - at % self.segment_size) as usize;
            let take = room.min(buf.len() - done);
            self.with_segment(at, |file, seg_off| {
                file.read_sync(seg_off, &mut buf[done..done + take])
            })?;
            done += take;
        }
        Ok(buf.len())
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let at = offset + done as u64;
            let room = (self.segment_size - at % self.segment_size) as usize;
            let take = room.min(buf.len() - done);
            self.with_segment(at, |file, seg_off| {
                file.write_sync(seg_off, &buf[done..done + take])
            })?;
            done += take;
        }
        Ok(buf.len())
    }

    fn flush_sync(&self) -> io::Result<()> {
        let segments = self.segments.lock();
        for segment in segments.iter().flatten() {
            segment.flush_sync()?;
        }
        Ok(())
    }

    fn size_sync(&self) -> io::Result<u64> {
        let segments = self.segments.lock();
        let mut total = 0u64;
        for segment in segments.iter().flatten() {
            total += segment.size_sync()?;
        }
        Ok(total)
    }
}

/// File system disk device
///
/// High-level abstraction for file-based storage, supporting both
/// single file and segmented storage modes.
pub struct FileSystemDisk {
    /// The underlying storage (either single file or segmented)
    inner: FileSystemDiskInner,
}

enum FileSystemDiskInner {
    SingleFile(FileSystemFile),
    Segmented(SegmentedFile),
}

impl FileSystemDisk {
    /// Create a single-file disk
    pub fn single_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = FileSystemFile::open(path, true)?;
        Ok(Self {
            inner: FileSystemDiskInner::SingleFile(file),
        })
    }

    /// Create a segmented disk
    pub fn segmented(
        base_dir: impl AsRef<Path>,
        prefix: &str,
        segment_size: u64,
    ) -> io::Result<Self> {
        let segments = SegmentedFile::new(base_dir, prefix, segment_size)?;
        Ok(Self {
            inner: FileSystemDiskInner::Segmented(segments),
        })
    }

    /// Default commit-metadata path for this disk: a `.commit` sibling of the
    /// backing file (or of the segment prefix).
    pub fn default_commit_path(&self) -> PathBuf {
        match &self.inner {
            FileSystemDiskInner::SingleFile(f) => {
                let mut name = f.path().as_os_str().to_os_string();
                name.push(".commit");
                PathBuf::from(name)
            }
            FileSystemDiskInner::Segmented(s) => {
                s.base_dir.join(format!("{}.commit", s.prefix))
            }
        }
    }
}

impl SyncStorageDevice for FileSystemDisk {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        match &self.inner {
            FileSystemDiskInner::SingleFile(f) => f.read_sync(offset, buf),
            FileSystemDiskInner::Segmented(s) => s.read_sync(offset, buf),
        }
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        match &self.inner {
            FileSystemDiskInner::SingleFile(f) => f.write_sync(offset, buf),
            FileSystemDiskInner::Segmented(s) => s.write_sync(offset, buf),
        }
    }

    fn flush_sync(&self) -> io::Result<()> {
        match &self.inner {
            FileSystemDiskInner::SingleFile(f) => f.flush_sync(),
            FileSystemDiskInner::Segmented(s) => s.flush_sync(),
        }
    }

    fn size_sync(&self) -> io::Result<u64> {
        match &self.inner {
            FileSystemDiskInner::SingleFile(f) => f.size_sync(),
            FileSystemDiskInner::Segmented(s) => s.size_sync(),
        }
    }
}
