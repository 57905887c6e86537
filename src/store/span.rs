/*
 * SPDX-FileCopyrightText: 2024 The extstore developers
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Typed read-only views over an [`ImmutableBinaryFile`].

use std::marker::PhantomData;

use bytemuck::Zeroable;

use super::files::ImmutableBinaryFile;
use super::workers::{IoFuture, Transfer};
use crate::error::{Error, Result};
use crate::record::Record;
use crate::utils::DoubleBuffer;

/// A `[begin, end)` window of fixed-size records inside an immutable file.
///
/// Spans are cheap to clone and narrow; they share the underlying file.
pub struct ImmutableSpan<T: Record> {
    file: ImmutableBinaryFile,
    begin: u64,
    end: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Record> Clone for ImmutableSpan<T> {
    fn clone(&self) -> Self {
        ImmutableSpan {
            file: self.file.clone(),
            begin: self.begin,
            end: self.end,
            _marker: PhantomData,
        }
    }
}

impl<T: Record> ImmutableSpan<T> {
    const ELEM: u64 = std::mem::size_of::<T>() as u64;

    /// A span over the whole file. The file's byte length must be a
    /// multiple of the record size.
    pub fn new(file: ImmutableBinaryFile) -> Result<Self> {
        if file.size() % Self::ELEM != 0 {
            return Err(Error::MalformedFile {
                path: file.path().to_owned(),
                size: file.size(),
                record_size: Self::ELEM as usize,
            });
        }
        let end = file.size() / Self::ELEM;
        Ok(ImmutableSpan {
            file,
            begin: 0,
            end,
            _marker: PhantomData,
        })
    }

    pub fn path(&self) -> &std::path::Path {
        self.file.path()
    }

    pub fn file(&self) -> &ImmutableBinaryFile {
        &self.file
    }

    /// Number of records in the span.
    pub fn len(&self) -> u64 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn size_bytes(&self) -> u64 {
        self.len() * Self::ELEM
    }

    /// Narrows the view; `offset + len` must stay inside the span.
    pub fn subspan(&self, offset: u64, len: u64) -> Self {
        assert!(offset + len <= self.len(), "subspan out of bounds");
        ImmutableSpan {
            file: self.file.clone(),
            begin: self.begin + offset,
            end: self.begin + offset + len,
            _marker: PhantomData,
        }
    }

    /// Synchronously reads up to `dst.len()` records starting at `offset`;
    /// returns how many records arrived.
    pub fn read_into(&self, dst: &mut [T], offset: u64) -> usize {
        debug_assert!(offset + dst.len() as u64 <= self.len());
        let byte_offset = (self.begin + offset) * Self::ELEM;
        let bytes = self
            .file
            .read_at(bytemuck::cast_slice_mut(dst), byte_offset);
        bytes / Self::ELEM as usize
    }

    /// Reads exactly `dst.len()` records or fails with
    /// [`Error::ShortRead`].
    pub fn read_exact_into(&self, dst: &mut [T], offset: u64) -> Result<()> {
        let got = self.read_into(dst, offset);
        if got != dst.len() {
            return Err(Error::ShortRead {
                path: self.path().to_owned(),
                offset: self.begin + offset,
                requested: dst.len(),
                actual: got,
            });
        }
        Ok(())
    }

    /// One record by index.
    pub fn get(&self, index: u64) -> Result<T> {
        if index >= self.len() {
            return Err(Error::OutOfRange {
                index,
                len: self.len(),
            });
        }
        let mut value = T::zeroed();
        self.read_exact_into(std::slice::from_mut(&mut value), index)?;
        Ok(value)
    }

    pub fn front(&self) -> Result<T> {
        self.get(0)
    }

    pub fn back(&self) -> Result<T> {
        self.get(self.len().saturating_sub(1))
    }

    /// A pipelined sequential iterator holding two `buffer_elements`-sized
    /// buffers: while one is being consumed the refill of the other is
    /// already in flight.
    pub fn iter(&self, buffer_elements: usize) -> SpanIter<T> {
        SpanIter::new(self.clone(), buffer_elements.max(1))
    }

    /// A stateless reader caching the last record it fetched.
    pub fn random_reader(&self) -> RandomReader<T> {
        RandomReader {
            span: self.clone(),
            last: None,
        }
    }
}

/// Double-buffered forward reader over a span.
///
/// Construction fills the front buffer synchronously and leaves the refill
/// of the back buffer in flight; advancing past the front buffer waits for
/// that read, swaps and schedules the next one into the vacated buffer.
pub struct SpanIter<T: Record> {
    span: ImmutableSpan<T>,
    /// Element offset (into the span) of the first unscheduled record.
    scheduled: u64,
    buffer: DoubleBuffer<T>,
    front_len: usize,
    front_pos: usize,
    pending: Option<Pending<T>>,
}

struct Pending<T> {
    future: IoFuture<Transfer<T>>,
    offset: u64,
    requested: usize,
}

impl<T: Record> SpanIter<T> {
    fn new(span: ImmutableSpan<T>, buffer_elements: usize) -> Self {
        let buffer_elements = (buffer_elements as u64).min(span.len()).max(1) as usize;
        let mut iter = SpanIter {
            span,
            scheduled: 0,
            buffer: DoubleBuffer::new_filled(buffer_elements),
            front_len: 0,
            front_pos: 0,
            pending: None,
        };
        iter.schedule_next();
        iter
    }

    fn schedule_next(&mut self) {
        debug_assert!(self.pending.is_none());
        let remaining = self.span.len() - self.scheduled;
        if remaining == 0 {
            return;
        }
        let Some(buffer) = self.buffer.take_back() else {
            return;
        };
        let count = (buffer.len() as u64).min(remaining) as usize;
        let offset = self.scheduled;
        let byte_offset = (self.span.begin + offset) * ImmutableSpan::<T>::ELEM;
        let future = self.span.file.read_async(buffer, byte_offset, count);
        self.scheduled += count as u64;
        self.pending = Some(Pending {
            future,
            offset,
            requested: count,
        });
    }

    /// Waits for the in-flight read, makes it the new front and schedules
    /// the next refill.
    fn refill(&mut self) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            self.front_len = 0;
            self.front_pos = 0;
            return Ok(());
        };
        let transfer = pending.future.wait();
        if transfer.elements != pending.requested {
            // the span was validated against the file size, so a shortfall
            // is a real I/O failure
            let err = Error::ShortRead {
                path: self.span.path().to_owned(),
                offset: self.span.begin + pending.offset,
                requested: pending.requested,
                actual: transfer.elements,
            };
            self.buffer.put_back(transfer.buffer);
            return Err(err);
        }
        let vacated = self.buffer.swap_front(transfer.buffer);
        self.buffer.put_back(vacated);
        self.front_len = pending.requested;
        self.front_pos = 0;
        self.schedule_next();
        Ok(())
    }

    /// The next record, or `None` at the end of the span.
    pub fn try_next(&mut self) -> Result<Option<T>> {
        if self.front_pos == self.front_len {
            self.refill()?;
            if self.front_len == 0 {
                return Ok(None);
            }
        }
        let value = self.buffer.front()[self.front_pos];
        self.front_pos += 1;
        Ok(Some(value))
    }

    /// The rest of the current front buffer, refilling first if it is
    /// drained; `None` at the end of the span. The returned chunk counts as
    /// consumed.
    pub fn try_chunk(&mut self) -> Result<Option<&[T]>> {
        if self.front_pos == self.front_len {
            self.refill()?;
            if self.front_len == 0 {
                return Ok(None);
            }
        }
        let chunk = &self.buffer.front()[self.front_pos..self.front_len];
        self.front_pos = self.front_len;
        Ok(Some(chunk))
    }
}

impl<T: Record> Iterator for SpanIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Result<T>> {
        self.try_next().transpose()
    }
}

/// Random access over a span, one synchronous read per element, with a
/// cache of the last read so repeated probes of one index are free.
pub struct RandomReader<T: Record> {
    span: ImmutableSpan<T>,
    last: Option<(u64, T)>,
}

impl<T: Record> RandomReader<T> {
    pub fn get(&mut self, index: u64) -> Result<T> {
        if let Some((cached_index, value)) = self.last {
            if cached_index == index {
                return Ok(value);
            }
        }
        let value = self.span.get(index)?;
        self.last = Some((index, value));
        Ok(value)
    }

    pub fn len(&self) -> u64 {
        self.span.len()
    }

    pub fn is_empty(&self) -> bool {
        self.span.is_empty()
    }
}
