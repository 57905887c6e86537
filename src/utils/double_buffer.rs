/*
 * SPDX-FileCopyrightText: 2024 The extstore developers
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! A pair of equally sized buffers cycling between a consumer and an
//! in-flight asynchronous operation.
//!
//! The front buffer belongs to the caller; the back buffer is handed to the
//! I/O worker together with the job and travels back through the job's
//! future. At most one buffer is ever in flight.

use bytemuck::Zeroable;

use crate::record::Record;

#[derive(Debug)]
pub struct DoubleBuffer<T> {
    front: Vec<T>,
    back: Option<Vec<T>>,
}

impl<T: Record> DoubleBuffer<T> {
    /// Two zero-initialized buffers of `len` elements each, for readers.
    pub fn new_filled(len: usize) -> Self {
        debug_assert!(len > 0);
        DoubleBuffer {
            front: vec![T::zeroed(); len],
            back: Some(vec![T::zeroed(); len]),
        }
    }

    /// Two empty buffers of `capacity` elements each, for writers.
    pub fn new_empty(capacity: usize) -> Self {
        debug_assert!(capacity > 0);
        DoubleBuffer {
            front: Vec::with_capacity(capacity),
            back: Some(Vec::with_capacity(capacity)),
        }
    }
}

impl<T> DoubleBuffer<T> {
    pub fn front(&self) -> &[T] {
        &self.front
    }

    pub fn front_mut(&mut self) -> &mut Vec<T> {
        &mut self.front
    }

    /// Detaches the back buffer to hand it to an asynchronous operation.
    /// Returns `None` while one is already in flight.
    pub fn take_back(&mut self) -> Option<Vec<T>> {
        self.back.take()
    }

    /// Reattaches a buffer that travelled back through a completed future.
    pub fn put_back(&mut self, buffer: Vec<T>) {
        debug_assert!(self.back.is_none());
        self.back = Some(buffer);
    }

    /// Makes `buffer` the new front and returns the old front.
    pub fn swap_front(&mut self, buffer: Vec<T>) -> Vec<T> {
        std::mem::replace(&mut self.front, buffer)
    }
}
