/*
 * SPDX-FileCopyrightText: 2024 The extstore developers
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The storage context and the byte-level file types the typed views wrap.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::file::{RawFile, UnpooledFile};
use super::pool::{FilePool, PooledFile};
use super::workers::{IoFuture, IoWorkers, Transfer, WorkerPool};
use super::OpenMode;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::record::Record;
use bytemuck::Zeroable;

/// The engine's system object: the file handle pool and the I/O worker
/// pools, built once from configuration and shared by every file.
///
/// There are no hidden globals; dropping the last [`Storage`] reference
/// shuts the workers down after their queues drain.
pub struct Storage {
    config: StoreConfig,
    pool: Arc<FilePool>,
    workers: IoWorkers,
}

impl Storage {
    pub fn new(config: StoreConfig) -> Arc<Self> {
        let pool = Arc::new(FilePool::new(config.pool.max_open_pooled_files));
        let workers = IoWorkers::new(&config.io);
        Arc::new(Storage {
            config,
            pool,
            workers,
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(StoreConfig::default())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn open_raw(
        self: &Arc<Self>,
        path: PathBuf,
        mode: OpenMode,
        pooled: bool,
    ) -> Result<Arc<dyn RawFile>> {
        if pooled {
            Ok(Arc::new(PooledFile::open(self.pool.clone(), path, mode)?))
        } else {
            Ok(Arc::new(UnpooledFile::open(
                path,
                mode,
                self.config.pool.max_open_unpooled_files,
            )?))
        }
    }

    pub(crate) fn pool_for(&self, path: &Path) -> &WorkerPool {
        self.workers.pool_for(path)
    }
}

/// Whether an output file starts empty or continues after existing data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Truncate,
    Append,
}

/// A read-only view of a file that is assumed not to change while open.
#[derive(Clone)]
pub struct ImmutableBinaryFile {
    store: Arc<Storage>,
    file: Arc<dyn RawFile>,
    size: u64,
}

impl ImmutableBinaryFile {
    pub fn open(store: &Arc<Storage>, path: impl Into<PathBuf>) -> Result<Self> {
        Self::open_impl(store, path.into(), false)
    }

    /// Opens through the handle pool, for workloads touching more files
    /// than the process may keep open.
    pub fn open_pooled(store: &Arc<Storage>, path: impl Into<PathBuf>) -> Result<Self> {
        Self::open_impl(store, path.into(), true)
    }

    fn open_impl(store: &Arc<Storage>, path: PathBuf, pooled: bool) -> Result<Self> {
        let file = store.open_raw(path, OpenMode::Read, pooled)?;
        let size = file.size();
        Ok(ImmutableBinaryFile {
            store: store.clone(),
            file,
            size,
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.store
    }

    /// Synchronous read; returns the bytes actually read.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        self.file.read_at(buf, offset)
    }

    /// Schedules a read of `count` elements at byte `offset` into `buffer`
    /// on the file's worker pool.
    pub fn read_async<T: Record>(
        &self,
        buffer: Vec<T>,
        offset: u64,
        count: usize,
    ) -> IoFuture<Transfer<T>> {
        self.store
            .pool_for(self.file.path())
            .schedule_read(self.file.clone(), buffer, offset, count)
    }
}

type Observer = Box<dyn Fn(&[u8]) + Send + Sync>;

/// An append-only file with synchronous and asynchronous writes.
pub struct BinaryOutputFile {
    store: Arc<Storage>,
    file: Arc<dyn RawFile>,
    observer: Option<Observer>,
}

impl BinaryOutputFile {
    pub fn create(
        store: &Arc<Storage>,
        path: impl Into<PathBuf>,
        mode: OutputMode,
    ) -> Result<Self> {
        Self::create_impl(store, path.into(), mode, false)
    }

    pub fn create_pooled(
        store: &Arc<Storage>,
        path: impl Into<PathBuf>,
        mode: OutputMode,
    ) -> Result<Self> {
        Self::create_impl(store, path.into(), mode, true)
    }

    fn create_impl(
        store: &Arc<Storage>,
        path: PathBuf,
        mode: OutputMode,
        pooled: bool,
    ) -> Result<Self> {
        let open_mode = match mode {
            OutputMode::Truncate => OpenMode::WriteTruncate,
            OutputMode::Append => OpenMode::WriteAppend,
        };
        let file = store.open_raw(path, open_mode, pooled)?;
        Ok(BinaryOutputFile {
            store: store.clone(),
            file,
            observer: None,
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn size(&self) -> u64 {
        self.file.size()
    }

    /// Synchronous append; returns the bytes actually written.
    pub fn append(&self, buf: &[u8]) -> usize {
        if let Some(observer) = &self.observer {
            observer(buf);
        }
        self.file.append(buf)
    }

    /// Schedules an append of `buffer` on the file's worker pool. The
    /// observer, if any, sees the bytes before the job is dispatched.
    pub fn append_async<T: Record>(&self, buffer: Vec<T>) -> IoFuture<Transfer<T>> {
        if let Some(observer) = &self.observer {
            observer(bytemuck::cast_slice(&buffer[..]));
        }
        self.store
            .pool_for(self.file.path())
            .schedule_append(self.file.clone(), buffer)
    }

    /// Pre-allocates on-disk space without changing the logical size.
    pub fn reserve(&self, bytes: u64) -> Result<()> {
        self.file.reserve(bytes)
    }

    pub fn truncate(&self, bytes: u64) -> Result<()> {
        self.file.truncate(bytes)
    }

    /// The durable flush; buffered writers call this before dropping.
    pub fn flush(&self) -> Result<()> {
        self.file.flush()
    }

    /// Flushes, drops the writing view and reopens the same path read-only.
    pub fn seal(self) -> Result<ImmutableBinaryFile> {
        self.file.flush()?;
        // give back any reservation before the read view measures the file
        self.file.truncate(self.file.size())?;
        let path = self.file.path().to_owned();
        let pooled = self.file.is_pooled();
        let store = self.store.clone();
        drop(self);
        if pooled {
            ImmutableBinaryFile::open_pooled(&store, path)
        } else {
            ImmutableBinaryFile::open(&store, path)
        }
    }
}

/// A [`BinaryOutputFile`] that synchronously shows every appended byte to a
/// callback before the write is dispatched. Used to build indexes while the
/// data file is still being written.
pub struct ObservableBinaryOutputFile {
    inner: BinaryOutputFile,
}

impl ObservableBinaryOutputFile {
    pub fn create(
        store: &Arc<Storage>,
        path: impl Into<PathBuf>,
        mode: OutputMode,
        observer: impl Fn(&[u8]) + Send + Sync + 'static,
    ) -> Result<Self> {
        let mut inner = BinaryOutputFile::create(store, path, mode)?;
        inner.observer = Some(Box::new(observer));
        Ok(ObservableBinaryOutputFile { inner })
    }

    pub fn seal(self) -> Result<ImmutableBinaryFile> {
        self.inner.seal()
    }
}

impl std::ops::Deref for ObservableBinaryOutputFile {
    type Target = BinaryOutputFile;

    fn deref(&self) -> &BinaryOutputFile {
        &self.inner
    }
}

/// A read/write file: the append surface of [`BinaryOutputFile`] plus
/// reads.
pub struct BinaryInputOutputFile {
    store: Arc<Storage>,
    file: Arc<dyn RawFile>,
}

impl BinaryInputOutputFile {
    pub fn create(
        store: &Arc<Storage>,
        path: impl Into<PathBuf>,
        mode: OutputMode,
    ) -> Result<Self> {
        Self::create_impl(store, path.into(), mode, false)
    }

    pub fn create_pooled(
        store: &Arc<Storage>,
        path: impl Into<PathBuf>,
        mode: OutputMode,
    ) -> Result<Self> {
        Self::create_impl(store, path.into(), mode, true)
    }

    fn create_impl(
        store: &Arc<Storage>,
        path: PathBuf,
        mode: OutputMode,
        pooled: bool,
    ) -> Result<Self> {
        let open_mode = match mode {
            OutputMode::Truncate => OpenMode::ReadWriteTruncate,
            OutputMode::Append => OpenMode::ReadWriteAppend,
        };
        let file = store.open_raw(path, open_mode, pooled)?;
        Ok(BinaryInputOutputFile {
            store: store.clone(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn size(&self) -> u64 {
        self.file.size()
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        self.file.read_at(buf, offset)
    }

    pub fn read_async<T: Record>(
        &self,
        buffer: Vec<T>,
        offset: u64,
        count: usize,
    ) -> IoFuture<Transfer<T>> {
        self.store
            .pool_for(self.file.path())
            .schedule_read(self.file.clone(), buffer, offset, count)
    }

    pub fn append(&self, buf: &[u8]) -> usize {
        self.file.append(buf)
    }

    pub fn append_async<T: Record>(&self, buffer: Vec<T>) -> IoFuture<Transfer<T>> {
        self.store
            .pool_for(self.file.path())
            .schedule_append(self.file.clone(), buffer)
    }

    pub fn truncate(&self, bytes: u64) -> Result<()> {
        self.file.truncate(bytes)
    }

    pub fn reserve(&self, bytes: u64) -> Result<()> {
        self.file.reserve(bytes)
    }

    pub fn flush(&self) -> Result<()> {
        self.file.flush()
    }

    pub fn seal(self) -> Result<ImmutableBinaryFile> {
        self.file.flush()?;
        self.file.truncate(self.file.size())?;
        let path = self.file.path().to_owned();
        let store = self.store.clone();
        drop(self);
        ImmutableBinaryFile::open(&store, path)
    }
}

/// Writes `data` to a fresh file at `path` and returns the element count
/// written.
pub fn write_file<T: Record>(
    store: &Arc<Storage>,
    path: impl Into<PathBuf>,
    data: &[T],
) -> Result<usize> {
    let file = BinaryOutputFile::create(store, path, OutputMode::Truncate)?;
    let written = file.append(bytemuck::cast_slice(data));
    let elements = written / std::mem::size_of::<T>();
    if elements != data.len() {
        return Err(Error::ShortAppend {
            path: file.path().to_owned(),
            requested: data.len(),
            actual: elements,
        });
    }
    file.flush()?;
    Ok(elements)
}

/// Reads a whole file of records into memory.
pub fn read_file<T: Record>(store: &Arc<Storage>, path: impl Into<PathBuf>) -> Result<Vec<T>> {
    let file = ImmutableBinaryFile::open(store, path)?;
    let elem_size = std::mem::size_of::<T>();
    if file.size() % elem_size as u64 != 0 {
        return Err(Error::MalformedFile {
            path: file.path().to_owned(),
            size: file.size(),
            record_size: elem_size,
        });
    }
    let count = (file.size() / elem_size as u64) as usize;
    let mut data = vec![T::zeroed(); count];
    let read = file.read_at(bytemuck::cast_slice_mut(&mut data), 0) / elem_size;
    if read != count {
        return Err(Error::ShortRead {
            path: file.path().to_owned(),
            offset: 0,
            requested: count,
            actual: read,
        });
    }
    Ok(data)
}
