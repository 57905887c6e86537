/*
 * SPDX-FileCopyrightText: 2024 The extstore developers
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Raw files: open modes and the unpooled variant that keeps its handle for
//! life.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use log::warn;
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// How a file is opened. Reopening an already-created file drops the
/// truncation so the data survives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    WriteTruncate,
    WriteAppend,
    ReadWriteTruncate,
    ReadWriteAppend,
}

impl OpenMode {
    pub fn readable(self) -> bool {
        matches!(
            self,
            OpenMode::Read | OpenMode::ReadWriteTruncate | OpenMode::ReadWriteAppend
        )
    }

    pub fn writable(self) -> bool {
        self != OpenMode::Read
    }

    fn truncates(self) -> bool {
        matches!(self, OpenMode::WriteTruncate | OpenMode::ReadWriteTruncate)
    }

    /// Open options for the first open (may create and truncate) or for a
    /// reopen (must not disturb existing data).
    pub(crate) fn options(self, first_open: bool) -> fs::OpenOptions {
        let mut opts = fs::OpenOptions::new();
        opts.read(self.readable());
        if self.writable() {
            opts.write(true);
            if first_open {
                opts.create(true);
                if self.truncates() {
                    opts.truncate(true);
                }
            }
        }
        opts
    }
}

impl std::fmt::Display for OpenMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OpenMode::Read => "read",
            OpenMode::WriteTruncate => "write-truncate",
            OpenMode::WriteAppend => "write-append",
            OpenMode::ReadWriteTruncate => "read-write-truncate",
            OpenMode::ReadWriteAppend => "read-write-append",
        };
        f.write_str(s)
    }
}

/// The operations the typed layers and the I/O workers need from a file.
///
/// `read_at` and `append` report the bytes actually transferred and never
/// fail: asynchronous jobs resolve their future with the transferred count
/// and the *caller* turns a shortfall into an error.
pub(crate) trait RawFile: Send + Sync {
    fn path(&self) -> &Path;
    /// Logical size: end of the written data, regardless of reservation.
    fn size(&self) -> u64;
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize;
    fn append(&self, buf: &[u8]) -> usize;
    fn flush(&self) -> Result<()>;
    /// Grows the on-disk allocation without changing the logical size.
    fn reserve(&self, bytes: u64) -> Result<()>;
    /// Shrinks the file and resets both size and capacity.
    fn truncate(&self, bytes: u64) -> Result<()>;
    fn is_pooled(&self) -> bool;
}

pub(crate) fn open_file(path: &Path, mode: OpenMode, first_open: bool) -> Result<fs::File> {
    mode.options(first_open)
        .open(path)
        .map_err(|source| Error::Open {
            path: path.to_owned(),
            mode,
            source,
        })
}

static OPEN_UNPOOLED_FILES: AtomicUsize = AtomicUsize::new(0);

/// A file that opens once and keeps its native handle until dropped.
///
/// A process-wide counter softly caps how many of these are open at a time
/// so that pooled files can still get a descriptor. The counter is relaxed
/// and advisory: racing opens may transiently exceed the limit.
pub(crate) struct UnpooledFile {
    path: PathBuf,
    handle: fs::File,
    io: Mutex<()>,
    size: AtomicU64,
    capacity: AtomicU64,
}

impl UnpooledFile {
    pub(crate) fn open(path: PathBuf, mode: OpenMode, limit: usize) -> Result<Self> {
        if OPEN_UNPOOLED_FILES.load(Ordering::Relaxed) >= limit {
            return Err(Error::OpenExhausted { path, limit });
        }

        let handle = open_file(&path, mode, true)?;
        let size = handle.metadata().map(|m| m.len()).unwrap_or(0);
        OPEN_UNPOOLED_FILES.fetch_add(1, Ordering::Relaxed);
        Ok(UnpooledFile {
            path,
            handle,
            io: Mutex::new(()),
            size: AtomicU64::new(size),
            capacity: AtomicU64::new(size),
        })
    }

    fn capacity(&self) -> u64 {
        self.capacity
            .load(Ordering::Relaxed)
            .max(self.size.load(Ordering::Relaxed))
    }
}

impl RawFile for UnpooledFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let _guard = self.io.lock();
        let mut handle = &self.handle;
        if handle.seek(SeekFrom::Start(offset)).is_err() {
            return 0;
        }
        read_fully(&mut handle, buf, &self.path)
    }

    fn append(&self, buf: &[u8]) -> usize {
        let _guard = self.io.lock();
        let mut handle = &self.handle;
        let size = self.size.load(Ordering::Relaxed);
        if handle.seek(SeekFrom::Start(size)).is_err() {
            return 0;
        }
        let written = write_fully(&mut handle, buf, &self.path);
        self.size.fetch_add(written as u64, Ordering::Relaxed);
        written
    }

    fn flush(&self) -> Result<()> {
        let _guard = self.io.lock();
        self.handle.sync_data().map_err(|source| Error::Io {
            path: self.path.clone(),
            source,
        })
    }

    fn reserve(&self, bytes: u64) -> Result<()> {
        let _guard = self.io.lock();
        if bytes <= self.capacity() {
            return Ok(());
        }
        self.handle.set_len(bytes).map_err(|source| Error::Io {
            path: self.path.clone(),
            source,
        })?;
        self.capacity.store(bytes, Ordering::Relaxed);
        Ok(())
    }

    fn truncate(&self, bytes: u64) -> Result<()> {
        let _guard = self.io.lock();
        if bytes >= self.capacity() {
            return Ok(());
        }
        self.handle.set_len(bytes).map_err(|source| Error::Io {
            path: self.path.clone(),
            source,
        })?;
        self.size.store(bytes, Ordering::Relaxed);
        self.capacity.store(bytes, Ordering::Relaxed);
        Ok(())
    }

    fn is_pooled(&self) -> bool {
        false
    }
}

impl Drop for UnpooledFile {
    fn drop(&mut self) {
        // give reserved space back before the handle goes away
        let size = self.size.load(Ordering::Relaxed);
        if self.capacity() > size {
            if let Err(e) = self.handle.set_len(size) {
                warn!("could not shrink {} to {} bytes: {}", self.path.display(), size, e);
            }
        }
        OPEN_UNPOOLED_FILES.fetch_sub(1, Ordering::Relaxed);
    }
}

pub(crate) fn read_fully(mut handle: impl Read, buf: &mut [u8], path: &Path) -> usize {
    let mut total = 0;
    while total < buf.len() {
        match handle.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("read from {} failed: {}", path.display(), e);
                break;
            }
        }
    }
    total
}

pub(crate) fn write_fully(mut handle: impl Write, buf: &[u8], path: &Path) -> usize {
    let mut total = 0;
    while total < buf.len() {
        match handle.write(&buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("write to {} failed: {}", path.display(), e);
                break;
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let file = UnpooledFile::open(path.clone(), OpenMode::WriteTruncate, 64).unwrap();
        assert_eq!(file.append(b"hello"), 5);
        assert_eq!(file.append(b" world"), 6);
        assert_eq!(file.size(), 11);
        drop(file);

        let file = UnpooledFile::open(path, OpenMode::Read, 64).unwrap();
        let mut buf = [0u8; 11];
        assert_eq!(file.read_at(&mut buf, 0), 11);
        assert_eq!(&buf, b"hello world");
        assert_eq!(file.read_at(&mut buf[..5], 6), 5);
        assert_eq!(&buf[..5], b"world");
    }

    #[test]
    fn reserve_is_invisible_and_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let file = UnpooledFile::open(path.clone(), OpenMode::WriteTruncate, 64).unwrap();
        file.append(b"abc");
        file.reserve(1024).unwrap();
        assert_eq!(file.size(), 3);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1024);
        drop(file);
        // the reservation is truncated away on close
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 3);
    }

    #[test]
    fn truncate_shortens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let file = UnpooledFile::open(path.clone(), OpenMode::WriteTruncate, 64).unwrap();
        file.append(b"0123456789");
        file.truncate(4).unwrap();
        assert_eq!(file.size(), 4);
        assert_eq!(file.append(b"x"), 1);
        drop(file);
        assert_eq!(std::fs::read(&path).unwrap(), b"0123x");
    }

    #[test]
    fn append_mode_continues() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        {
            let file = UnpooledFile::open(path.clone(), OpenMode::WriteTruncate, 64).unwrap();
            file.append(b"abc");
        }
        {
            let file = UnpooledFile::open(path.clone(), OpenMode::WriteAppend, 64).unwrap();
            assert_eq!(file.size(), 3);
            file.append(b"def");
        }
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
    }
}
