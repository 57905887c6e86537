/*
 * SPDX-FileCopyrightText: 2024 The extstore developers
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The contract between the engine and the record types it stores.
//!
//! The engine never looks inside a record: it moves fixed-size bit patterns
//! between memory and disk, orders them with a caller-supplied comparator,
//! and projects them to keys for indexing and searching.

use crate::error::Result;

/// A fixed-size, trivially copyable on-disk record.
///
/// Blanket-implemented for every [`bytemuck::Pod`] type, which is exactly
/// the "any bit pattern is a valid value" guarantee the engine needs to read
/// records straight out of a byte buffer.
pub trait Record: bytemuck::Pod + Send + Sync + 'static {}

impl<T: bytemuck::Pod + Send + Sync + 'static> Record for T {}

/// A record keyed by a projection of its contents.
///
/// Equivalent records (same position, possibly different payload counters)
/// can be collapsed into one with [`combine`](StoreRecord::combine), which
/// must be associative and commutative.
pub trait StoreRecord: Record {
    type Key: Copy + Ord;

    /// Projects the record to its search key.
    fn key(&self) -> Self::Key;

    /// Equality ignoring the secondary payload, used to detect duplicates
    /// while merging.
    fn same_position(&self, other: &Self) -> bool;

    /// Folds an equivalent record into this one (e.g. summing counts).
    fn combine(&mut self, other: &Self);
}

/// A sink adapter that collapses runs of equivalent records.
///
/// Wrap the output function of a merge with this to deduplicate while the
/// merged stream is still sorted; call [`finish`](CombiningSink::finish) to
/// release the last pending record.
pub struct CombiningSink<T, F> {
    pending: Option<T>,
    sink: F,
}

impl<T: StoreRecord, F: FnMut(T) -> Result<()>> CombiningSink<T, F> {
    pub fn new(sink: F) -> Self {
        CombiningSink {
            pending: None,
            sink,
        }
    }

    pub fn push(&mut self, value: T) -> Result<()> {
        match &mut self.pending {
            Some(held) if held.same_position(&value) => {
                held.combine(&value);
                Ok(())
            }
            Some(held) => {
                let out = std::mem::replace(held, value);
                (self.sink)(out)
            }
            None => {
                self.pending = Some(value);
                Ok(())
            }
        }
    }

    /// Flushes the held record. Dropping the sink without calling this
    /// silently loses the last record.
    pub fn finish(mut self) -> Result<()> {
        if let Some(held) = self.pending.take() {
            (self.sink)(held)?;
        }
        Ok(())
    }
}
