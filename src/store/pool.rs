/*
 * SPDX-FileCopyrightText: 2024 The extstore developers
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The pooled file variant: handles are closed and reopened on demand so an
//! unbounded number of logical files can share a bounded number of
//! descriptors.
//!
//! The pool is an arena of slots under one mutex; a pooled file remembers
//! its slot id and validates it on every access, so eviction never has to
//! reach back into the file. Handles are reference-counted: evicting a slot
//! only drops the pool's reference, an operation still running on the
//! handle finishes undisturbed.

use std::fs;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::warn;
use parking_lot::Mutex;

use super::file::{open_file, read_fully, write_fully, OpenMode, RawFile};
use crate::error::{Error, Result};

pub(crate) struct FilePool {
    capacity: usize,
    slots: Mutex<PoolSlots>,
}

struct PoolSlots {
    entries: Vec<Option<Slot>>,
    clock: u64,
}

struct Slot {
    handle: Arc<fs::File>,
    owner: Weak<PooledShared>,
    last_used: u64,
}

impl FilePool {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        FilePool {
            capacity,
            slots: Mutex::new(PoolSlots {
                entries: Vec::new(),
                clock: 0,
            }),
        }
    }

    /// Returns the open handle for `file`, opening or reopening it first if
    /// its slot was reclaimed. Called with the file's own I/O mutex held.
    fn acquire(&self, file: &Arc<PooledShared>, state: &mut PooledState) -> Result<Arc<fs::File>> {
        let mut slots = self.slots.lock();
        slots.clock += 1;
        let now = slots.clock;

        if let Some(slot_id) = state.slot {
            if let Some(slot) = slots.entries[slot_id].as_mut() {
                if slot.owner.ptr_eq(&Arc::downgrade(file)) {
                    slot.last_used = now;
                    return Ok(slot.handle.clone());
                }
            }
            // the slot was reclaimed for another file
            state.slot = None;
        }

        let first_open = state.times_opened == 0;
        let handle = Arc::new(open_file(&file.path, file.mode, first_open)?);
        state.times_opened += 1;

        let slot_id = self.free_slot(&mut slots);
        slots.entries[slot_id] = Some(Slot {
            handle: handle.clone(),
            owner: Arc::downgrade(file),
            last_used: now,
        });
        state.slot = Some(slot_id);
        Ok(handle)
    }

    /// Picks an empty slot, evicting the least recently used handle when
    /// the pool is at capacity.
    fn free_slot(&self, slots: &mut PoolSlots) -> usize {
        if let Some(id) = slots.entries.iter().position(Option::is_none) {
            return id;
        }
        if slots.entries.len() < self.capacity {
            slots.entries.push(None);
            return slots.entries.len() - 1;
        }
        let victim = slots
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, slot)| slot.as_ref().map(|s| s.last_used).unwrap_or(0))
            .map(|(id, _)| id)
            .expect("pool capacity is positive");
        slots.entries[victim] = None;
        victim
    }

    fn release(&self, file: &Arc<PooledShared>, state: &mut PooledState) {
        if let Some(slot_id) = state.slot.take() {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.entries[slot_id].as_ref() {
                if slot.owner.ptr_eq(&Arc::downgrade(file)) {
                    slots.entries[slot_id] = None;
                }
            }
        }
    }
}

struct PooledState {
    slot: Option<usize>,
    /// Sequential (not concurrent) opens; decides open versus reopen.
    times_opened: u64,
}

struct PooledShared {
    path: PathBuf,
    mode: OpenMode,
    io: Mutex<PooledState>,
    size: AtomicU64,
    capacity: AtomicU64,
}

/// A file whose native handle lives in the [`FilePool`] and may be closed
/// and reopened behind its back.
///
/// Deleting the physical file while a pooled handle to it exists is
/// undefined behavior, exactly as with the unpooled variant.
pub(crate) struct PooledFile {
    shared: Arc<PooledShared>,
    pool: Arc<FilePool>,
}

impl PooledFile {
    pub(crate) fn open(pool: Arc<FilePool>, path: PathBuf, mode: OpenMode) -> Result<Self> {
        let file = PooledFile {
            shared: Arc::new(PooledShared {
                path,
                mode,
                io: Mutex::new(PooledState {
                    slot: None,
                    times_opened: 0,
                }),
                size: AtomicU64::new(0),
                capacity: AtomicU64::new(0),
            }),
            pool,
        };
        // force the first open (which may create or truncate) and learn the
        // on-disk size
        let size = file.with_handle(|handle| handle.metadata().map(|m| m.len()).unwrap_or(0))?;
        file.shared.size.store(size, Ordering::Relaxed);
        file.shared.capacity.store(size, Ordering::Relaxed);
        Ok(file)
    }

    /// Runs `f` on the native handle, holding the file's I/O mutex for the
    /// whole call.
    fn with_handle<R>(&self, f: impl FnOnce(&fs::File) -> R) -> Result<R> {
        let mut state = self.shared.io.lock();
        let handle = self.pool.acquire(&self.shared, &mut state)?;
        Ok(f(&handle))
    }

    fn capacity(&self) -> u64 {
        self.shared
            .capacity
            .load(Ordering::Relaxed)
            .max(self.shared.size.load(Ordering::Relaxed))
    }
}

impl RawFile for PooledFile {
    fn path(&self) -> &Path {
        &self.shared.path
    }

    fn size(&self) -> u64 {
        self.shared.size.load(Ordering::Relaxed)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        self.with_handle(|handle| {
            let mut handle = handle;
            if handle.seek(SeekFrom::Start(offset)).is_err() {
                return 0;
            }
            read_fully(handle, buf, &self.shared.path)
        })
        .unwrap_or_else(|e| {
            warn!("could not reopen {}: {}", self.shared.path.display(), e);
            0
        })
    }

    fn append(&self, buf: &[u8]) -> usize {
        let size = self.shared.size.load(Ordering::Relaxed);
        let written = self
            .with_handle(|handle| {
                let mut handle = handle;
                if handle.seek(SeekFrom::Start(size)).is_err() {
                    return 0;
                }
                write_fully(handle, buf, &self.shared.path)
            })
            .unwrap_or_else(|e| {
                warn!("could not reopen {}: {}", self.shared.path.display(), e);
                0
            });
        self.shared.size.fetch_add(written as u64, Ordering::Relaxed);
        written
    }

    fn flush(&self) -> Result<()> {
        let path = self.shared.path.clone();
        self.with_handle(|handle| handle.sync_data().map_err(|source| Error::Io { path, source }))?
    }

    fn reserve(&self, bytes: u64) -> Result<()> {
        if bytes <= self.capacity() {
            return Ok(());
        }
        let path = self.shared.path.clone();
        self.with_handle(|handle| {
            handle.set_len(bytes).map_err(|source| Error::Io { path, source })
        })??;
        self.shared.capacity.store(bytes, Ordering::Relaxed);
        Ok(())
    }

    fn truncate(&self, bytes: u64) -> Result<()> {
        if bytes >= self.capacity() {
            return Ok(());
        }
        let path = self.shared.path.clone();
        self.with_handle(|handle| {
            handle.set_len(bytes).map_err(|source| Error::Io { path, source })
        })??;
        self.shared.size.store(bytes, Ordering::Relaxed);
        self.shared.capacity.store(bytes, Ordering::Relaxed);
        Ok(())
    }

    fn is_pooled(&self) -> bool {
        true
    }
}

impl Drop for PooledFile {
    fn drop(&mut self) {
        let mut state = self.shared.io.lock();
        self.pool.release(&self.shared, &mut state);
        drop(state);

        // reservation is given back on final close, by path: the pooled
        // handle may already be gone
        let size = self.shared.size.load(Ordering::Relaxed);
        if self.capacity() > size {
            let shrink = fs::OpenOptions::new()
                .write(true)
                .open(&self.shared.path)
                .and_then(|f| f.set_len(size));
            if let Err(e) = shrink {
                warn!(
                    "could not shrink {} to {} bytes: {}",
                    self.shared.path.display(),
                    size,
                    e
                );
            }
        }
    }
}
