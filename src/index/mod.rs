/*
 * SPDX-FileCopyrightText: 2024 The extstore developers
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! A sparse range index over a sorted run.
//!
//! Each entry summarizes one contiguous slice of the run as
//! `[low, high] → [low_key, high_key]`. Ranges start at the first
//! occurrence of a value, so no value's first occurrence appears in two
//! ranges; a value with more copies than the range limit gets one longer
//! range to itself instead of being split.

use std::cmp::Ordering;

use bytemuck::Zeroable;

use crate::error::Result;
use crate::record::Record;
use crate::store::ImmutableSpan;

/// One index entry: element indices `low..=high` of the run and the keys at
/// its ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangeEntry<K> {
    pub low: u64,
    pub high: u64,
    pub low_key: K,
    pub high_key: K,
}

/// An element index paired with the key known to live there; the search
/// layer seeds its bounds with these.
#[derive(Clone, Copy, Debug)]
pub struct KeyBound<K> {
    pub index: u64,
    pub key: K,
}

/// The sparse index: entries in run order, compared by the same comparator
/// that sorted the run.
#[derive(Clone, Debug)]
pub struct RangeIndex<K, C> {
    entries: Vec<RangeEntry<K>>,
    cmp: C,
}

impl<K: Copy, C: Fn(&K, &K) -> Ordering> RangeIndex<K, C> {
    pub fn new(entries: Vec<RangeEntry<K>>, cmp: C) -> Self {
        RangeIndex { entries, cmp }
    }

    pub fn entries(&self) -> &[RangeEntry<K>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The element range the key may live in: `low` is the first element of
    /// the first range whose span of keys reaches `key`, `high` one past
    /// the last element of the last such range. Both bounds equal the end
    /// index when no range straddles the key; the key fields are
    /// meaningless in that case.
    pub fn equal_range(&self, key: &K) -> (KeyBound<K>, KeyBound<K>) {
        let end = match self.entries.last() {
            Some(last) => last.high + 1,
            None => 0,
        };
        let absent = (
            KeyBound {
                index: end,
                key: *key,
            },
            KeyBound {
                index: end,
                key: *key,
            },
        );

        // first entry not entirely below the key...
        let a = self
            .entries
            .partition_point(|e| (self.cmp)(&e.high_key, key) == Ordering::Less);
        // ...and one past the last entry not entirely above it
        let b = self
            .entries
            .partition_point(|e| (self.cmp)(key, &e.low_key) != Ordering::Less);

        if b == 0 || a == self.entries.len() {
            // every range lies strictly above (or below) the key
            return absent;
        }

        let first = &self.entries[a];
        let last = &self.entries[b - 1];
        // a == b is possible: the key falls in the gap between two ranges
        if (self.cmp)(key, &first.low_key) == Ordering::Less
            || (self.cmp)(&last.high_key, key) == Ordering::Less
        {
            return absent;
        }

        (
            KeyBound {
                index: first.low,
                key: first.low_key,
            },
            KeyBound {
                index: last.high + 1,
                key: last.high_key,
            },
        )
    }
}

enum BuilderState {
    /// Nothing seen yet.
    Start,
    /// Take the first record of the next range.
    TakeFirst,
    /// Consume the run of records equal to the range's first key.
    EqualRun,
    /// Extend the range up to the limit, tracking where the next range
    /// would start.
    Extend,
    /// Close the range at the recorded boundary.
    Emit,
}

/// Streaming builder: feed it sorted records in chunks of any size and
/// [`finish`](IndexBuilder::finish) into a [`RangeIndex`].
pub struct IndexBuilder<T, K, C, X> {
    cmp: C,
    extract: X,
    max_entries_per_range: u64,
    entries: Vec<RangeEntry<K>>,
    state: BuilderState,
    start_value: T,
    end_value: T,
    first_of_next: T,
    prev_value: T,
    start_idx: u64,
    first_of_next_idx: u64,
    offset: u64,
}

impl<T, K, C, X> IndexBuilder<T, K, C, X>
where
    T: Record,
    K: Copy,
    C: Fn(&K, &K) -> Ordering + Copy,
    X: Fn(&T) -> K,
{
    pub fn new(max_entries_per_range: u64, cmp: C, extract: X) -> Self {
        assert!(max_entries_per_range > 0);
        IndexBuilder {
            cmp,
            extract,
            max_entries_per_range,
            entries: Vec::new(),
            state: BuilderState::Start,
            start_value: T::zeroed(),
            end_value: T::zeroed(),
            first_of_next: T::zeroed(),
            prev_value: T::zeroed(),
            start_idx: 0,
            first_of_next_idx: 0,
            offset: 0,
        }
    }

    fn less(&self, a: &T, b: &T) -> bool {
        (self.cmp)(&(self.extract)(a), &(self.extract)(b)) == Ordering::Less
    }

    pub fn append_one(&mut self, value: T) {
        self.append(std::slice::from_ref(&value));
    }

    /// Consumes the next chunk of the sorted run. State carries over, so
    /// chunk boundaries are invisible.
    pub fn append(&mut self, mut input: &[T]) {
        while !input.is_empty() {
            match self.state {
                BuilderState::Start => {
                    self.start_value = input[0];
                    self.end_value = self.start_value;
                    self.first_of_next = self.start_value;
                    self.prev_value = self.start_value;
                    self.start_idx = 0;
                    self.first_of_next_idx = 0;
                    self.offset = 0;
                    self.state = BuilderState::TakeFirst;
                }
                BuilderState::TakeFirst => {
                    self.prev_value = input[0];
                    input = &input[1..];
                    self.offset += 1;
                    self.state = BuilderState::EqualRun;
                }
                BuilderState::EqualRun => {
                    while let Some(value) = input.first() {
                        if self.less(&self.prev_value, value) {
                            break;
                        }
                        self.prev_value = *value;
                        self.offset += 1;
                        input = &input[1..];
                    }
                    if input.is_empty() {
                        return;
                    }
                    self.state = BuilderState::Extend;
                }
                BuilderState::Extend => {
                    while let Some(value) = input.first() {
                        // a value change moves the range boundary, even
                        // past the size limit: duplicates never split
                        if self.less(&self.prev_value, value) {
                            self.first_of_next = *value;
                            self.first_of_next_idx = self.start_idx + self.offset;
                            self.end_value = self.prev_value;
                        }
                        if self.offset >= self.max_entries_per_range {
                            break;
                        }
                        self.prev_value = *value;
                        self.offset += 1;
                        input = &input[1..];
                    }
                    if input.is_empty() {
                        return;
                    }
                    self.state = BuilderState::Emit;
                }
                BuilderState::Emit => {
                    self.entries.push(RangeEntry {
                        low: self.start_idx,
                        high: self.first_of_next_idx - 1,
                        low_key: (self.extract)(&self.start_value),
                        high_key: (self.extract)(&self.end_value),
                    });

                    // records already consumed past the boundary belong to
                    // the next range
                    self.offset -= self.first_of_next_idx - self.start_idx;
                    self.start_idx = self.first_of_next_idx;
                    self.start_value = self.first_of_next;
                    self.state = BuilderState::TakeFirst;
                }
            }
        }
    }

    /// Closes the last range and returns the finished index.
    pub fn finish(mut self) -> RangeIndex<K, C> {
        if self.offset != 0 {
            self.entries.push(RangeEntry {
                low: self.start_idx,
                high: self.start_idx + self.offset - 1,
                low_key: (self.extract)(&self.start_value),
                high_key: (self.extract)(&self.prev_value),
            });
        }
        RangeIndex::new(self.entries, self.cmp)
    }
}

/// Builds an index over an in-memory sorted slice.
pub fn build_index<T, K, C, X>(
    values: &[T],
    max_entries_per_range: u64,
    cmp: C,
    extract: X,
) -> RangeIndex<K, C>
where
    T: Record,
    K: Copy,
    C: Fn(&K, &K) -> Ordering + Copy,
    X: Fn(&T) -> K,
{
    let mut builder = IndexBuilder::new(max_entries_per_range, cmp, extract);
    builder.append(values);
    builder.finish()
}

/// Builds an index by streaming a sorted span through a scan buffer of
/// `buffer_elements` records.
pub fn build_index_from_span<T, K, C, X>(
    span: &ImmutableSpan<T>,
    max_entries_per_range: u64,
    cmp: C,
    extract: X,
    buffer_elements: usize,
) -> Result<RangeIndex<K, C>>
where
    T: Record,
    K: Copy,
    C: Fn(&K, &K) -> Ordering + Copy,
    X: Fn(&T) -> K,
{
    let mut builder = IndexBuilder::new(max_entries_per_range, cmp, extract);
    let mut iter = span.iter(buffer_elements);
    while let Some(chunk) = iter.try_chunk()? {
        builder.append(chunk);
    }
    Ok(builder.finish())
}
