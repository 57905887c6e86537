/*
 * SPDX-FileCopyrightText: 2024 The extstore developers
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Buffered, double-buffered typed writers.

use bytemuck::Zeroable;
use log::warn;

use super::files::{BinaryInputOutputFile, BinaryOutputFile};
use super::workers::{IoFuture, Transfer};
use crate::error::{Error, Result};
use crate::record::Record;
use crate::utils::DoubleBuffer;

struct PendingWrite<T> {
    future: IoFuture<Transfer<T>>,
    requested: usize,
}

/// An append-only writer over a [`BinaryOutputFile`].
///
/// Records accumulate in the front buffer; when it fills, the buffers swap
/// and the full one is appended asynchronously. At most one append is in
/// flight, and each waits for the previous one, so writes reach the file in
/// push order.
///
/// Dropping the inserter flushes but swallows errors (they are logged);
/// call [`flush`](BackInserter::flush) when durability matters.
pub struct BackInserter<'a, T: Record> {
    file: &'a BinaryOutputFile,
    buffer: DoubleBuffer<T>,
    capacity: usize,
    pending: Option<PendingWrite<T>>,
}

impl<'a, T: Record> BackInserter<'a, T> {
    pub fn new(file: &'a BinaryOutputFile, buffer_elements: usize) -> Self {
        let capacity = buffer_elements.max(1);
        BackInserter {
            file,
            buffer: DoubleBuffer::new_empty(capacity),
            capacity,
            pending: None,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        self.file.path()
    }

    pub fn push(&mut self, value: T) -> Result<()> {
        self.buffer.front_mut().push(value);
        if self.buffer.front().len() == self.capacity {
            self.write_buffer()?;
        }
        Ok(())
    }

    /// Appends a whole slice. A slice that does not fit the remaining front
    /// buffer skips it: the pending buffers are flushed and the slice is
    /// written straight from the caller's memory.
    pub fn extend_from_slice(&mut self, data: &[T]) -> Result<()> {
        let space_left = self.capacity - self.buffer.front().len();
        if data.len() < space_left {
            self.buffer.front_mut().extend_from_slice(data);
            Ok(())
        } else {
            self.write_buffer()?;
            self.wait_pending()?;
            // this write bypasses the buffers, so it must be sequenced
            // after every one of their writes completed
            let written =
                self.file.append(bytemuck::cast_slice(data)) / std::mem::size_of::<T>();
            if written != data.len() {
                return Err(Error::ShortAppend {
                    path: self.path().to_owned(),
                    requested: data.len(),
                    actual: written,
                });
            }
            self.file.flush()
        }
    }

    /// Writes everything buffered, waits for it and flushes the file. The
    /// only durable path.
    pub fn flush(&mut self) -> Result<()> {
        self.write_buffer()?;
        self.wait_pending()?;
        self.file.flush()
    }

    fn write_buffer(&mut self) -> Result<()> {
        self.wait_pending()?;
        let spare = self
            .buffer
            .take_back()
            .expect("no append in flight after wait_pending");
        let full = self.buffer.swap_front(spare);
        if full.is_empty() {
            self.buffer.put_back(full);
            return Ok(());
        }
        let requested = full.len();
        self.pending = Some(PendingWrite {
            future: self.file.append_async(full),
            requested,
        });
        Ok(())
    }

    fn wait_pending(&mut self) -> Result<()> {
        if let Some(pending) = self.pending.take() {
            let mut transfer = pending.future.wait();
            transfer.buffer.clear();
            self.buffer.put_back(transfer.buffer);
            if transfer.elements != pending.requested {
                return Err(Error::ShortAppend {
                    path: self.path().to_owned(),
                    requested: pending.requested,
                    actual: transfer.elements,
                });
            }
        }
        Ok(())
    }
}

impl<T: Record> Drop for BackInserter<'_, T> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("discarding flush failure of {}: {}", self.path().display(), e);
        }
    }
}

/// A growable typed array backed by a read/write file, with the
/// [`BackInserter`] append semantics plus reads, `clear` and `truncate`.
pub struct ExtVec<T: Record> {
    file: BinaryInputOutputFile,
    buffer: DoubleBuffer<T>,
    capacity: usize,
    pending: Option<PendingWrite<T>>,
    len: u64,
}

impl<T: Record> ExtVec<T> {
    const ELEM: u64 = std::mem::size_of::<T>() as u64;

    /// Takes over `file`; existing contents count towards the length.
    pub fn new(file: BinaryInputOutputFile, buffer_elements: usize) -> Self {
        let capacity = buffer_elements.max(1);
        let len = file.size() / Self::ELEM;
        ExtVec {
            file,
            buffer: DoubleBuffer::new_empty(capacity),
            capacity,
            pending: None,
            len,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        self.file.path()
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size_bytes(&self) -> u64 {
        self.len * Self::ELEM
    }

    pub fn push(&mut self, value: T) -> Result<()> {
        self.len += 1;
        self.buffer.front_mut().push(value);
        if self.buffer.front().len() == self.capacity {
            self.write_buffer()?;
        }
        Ok(())
    }

    pub fn extend_from_slice(&mut self, data: &[T]) -> Result<()> {
        self.len += data.len() as u64;
        let space_left = self.capacity - self.buffer.front().len();
        if data.len() < space_left {
            self.buffer.front_mut().extend_from_slice(data);
            Ok(())
        } else {
            self.write_buffer()?;
            self.wait_pending()?;
            let written =
                self.file.append(bytemuck::cast_slice(data)) / std::mem::size_of::<T>();
            if written != data.len() {
                return Err(Error::ShortAppend {
                    path: self.path().to_owned(),
                    requested: data.len(),
                    actual: written,
                });
            }
            self.file.flush()
        }
    }

    /// Reads `dst.len()` records starting at `offset`, flushing buffered
    /// appends first so they are visible.
    pub fn read_into(&mut self, dst: &mut [T], offset: u64) -> Result<()> {
        self.flush()?;
        let got = self
            .file
            .read_at(bytemuck::cast_slice_mut(dst), offset * Self::ELEM)
            / Self::ELEM as usize;
        if got != dst.len() {
            return Err(Error::ShortRead {
                path: self.path().to_owned(),
                offset,
                requested: dst.len(),
                actual: got,
            });
        }
        Ok(())
    }

    pub fn get(&mut self, index: u64) -> Result<T> {
        if index >= self.len {
            return Err(Error::OutOfRange {
                index,
                len: self.len,
            });
        }
        let mut value = T::zeroed();
        self.read_into(std::slice::from_mut(&mut value), index)?;
        Ok(value)
    }

    pub fn front(&mut self) -> Result<T> {
        self.get(0)
    }

    pub fn back(&mut self) -> Result<T> {
        self.get(self.len.saturating_sub(1))
    }

    pub fn clear(&mut self) -> Result<()> {
        self.truncate(0)
    }

    /// Shrinks to `len` records; a no-op when already at most that long.
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        if len >= self.len {
            return Ok(());
        }
        self.flush()?;
        self.file.truncate(len * Self::ELEM)?;
        self.len = len;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.write_buffer()?;
        self.wait_pending()?;
        self.file.flush()
    }

    fn write_buffer(&mut self) -> Result<()> {
        if self.buffer.front().is_empty() {
            return Ok(());
        }
        self.wait_pending()?;
        let spare = self
            .buffer
            .take_back()
            .expect("no append in flight after wait_pending");
        let full = self.buffer.swap_front(spare);
        let requested = full.len();
        self.pending = Some(PendingWrite {
            future: self.file.append_async(full),
            requested,
        });
        Ok(())
    }

    fn wait_pending(&mut self) -> Result<()> {
        if let Some(pending) = self.pending.take() {
            let mut transfer = pending.future.wait();
            transfer.buffer.clear();
            self.buffer.put_back(transfer.buffer);
            if transfer.elements != pending.requested {
                return Err(Error::ShortAppend {
                    path: self.path().to_owned(),
                    requested: pending.requested,
                    actual: transfer.elements,
                });
            }
        }
        Ok(())
    }
}

impl<T: Record> Drop for ExtVec<T> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("discarding flush failure of {}: {}", self.path().display(), e);
        }
    }
}
