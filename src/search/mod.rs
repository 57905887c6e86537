/*
 * SPDX-FileCopyrightText: 2024 The extstore developers
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Batched equal-range search over a sorted span.
//!
//! Every query key is bracketed by `(low, low_key)` and `(high, high_key)`
//! bounds, seeded from a [`RangeIndex`] when one is available, and narrowed
//! by reading sequential windows around a pivot until the equal range is
//! pinned down. Windows carry one sentinel record on each side so a range
//! continuing beyond the window is detected without another read.
//!
//! The cross-updating variants reuse every window that was read for one
//! query to narrow the bounds of all queries after it, which amortizes the
//! reads across a batch of correlated keys.

use std::cmp::Ordering;

use bytemuck::Zeroable;

use crate::error::Result;
use crate::index::{KeyBound, RangeIndex};
use crate::record::Record;
use crate::store::ImmutableSpan;

/// Picks the probe position inside `[low, high)`.
pub trait Midpoint<K> {
    fn pick(&self, low: u64, high: u64, low_key: &K, high_key: &K, key: &K) -> u64;
}

/// Plain bisection.
#[derive(Clone, Copy, Debug, Default)]
pub struct BinaryMidpoint;

impl<K> Midpoint<K> for BinaryMidpoint {
    fn pick(&self, low: u64, high: u64, _low_key: &K, _high_key: &K, _key: &K) -> u64 {
        debug_assert!(low != high);
        low + (high - low) / 2
    }
}

/// Linear interpolation between the bound keys.
///
/// `to_arithmetic` projects keys into a numeric domain (wide enough that
/// differences do not overflow); `to_size` maps an interpolated distance
/// back to an element offset. Both directions of key order are handled, so
/// reversed comparators interpolate too.
#[derive(Clone, Copy, Debug)]
pub struct InterpolateMidpoint<A, S> {
    to_arithmetic: A,
    to_size: S,
}

impl<A, S> InterpolateMidpoint<A, S> {
    pub fn new(to_arithmetic: A, to_size: S) -> Self {
        InterpolateMidpoint {
            to_arithmetic,
            to_size,
        }
    }
}

impl<K, A, S> Midpoint<K> for InterpolateMidpoint<A, S>
where
    A: Fn(&K) -> u128,
    S: Fn(u128) -> u64,
{
    fn pick(&self, low: u64, high: u64, low_key: &K, high_key: &K, key: &K) -> u64 {
        debug_assert!(low != high);
        let lo = (self.to_arithmetic)(low_key);
        let hi = (self.to_arithmetic)(high_key);
        let k = (self.to_arithmetic)(key);
        let span = (high - low - 1) as u128;

        let distance = if lo < hi {
            (self.to_size)(k.saturating_sub(lo).saturating_mul(span) / (hi - lo))
        } else if hi < lo {
            (self.to_size)(lo.saturating_sub(k).saturating_mul(span) / (lo - hi))
        } else {
            0
        };
        low + distance.min(high - low - 1)
    }
}

#[inline]
fn lower_bound_by<T, K>(
    slice: &[T],
    key: &K,
    cmp: impl Fn(&K, &K) -> Ordering,
    extract: impl Fn(&T) -> K,
) -> usize {
    slice.partition_point(|t| cmp(&extract(t), key) == Ordering::Less)
}

#[inline]
fn upper_bound_by<T, K>(
    slice: &[T],
    key: &K,
    cmp: impl Fn(&K, &K) -> Ordering,
    extract: impl Fn(&T) -> K,
) -> usize {
    slice.partition_point(|t| cmp(key, &extract(t)) != Ordering::Less)
}

#[inline]
fn equal_range_by<T, K>(
    slice: &[T],
    key: &K,
    cmp: impl Fn(&K, &K) -> Ordering + Copy,
    extract: impl Fn(&T) -> K + Copy,
) -> (usize, usize) {
    (
        lower_bound_by(slice, key, cmp, extract),
        upper_bound_by(slice, key, cmp, extract),
    )
}

/// Clamps a window of up to `size` records around `mid` into
/// `[begin, end)`.
fn neighbourhood(begin: u64, end: u64, mid: u64, size: u64) -> (u64, u64) {
    let left = mid - begin;
    let right = end - mid;
    if left + right <= size {
        return (begin, end);
    }

    let radius = size / 2;
    if left < radius {
        // align to the left edge and span right
        (begin, begin + size)
    } else if right < radius {
        (end - size, end)
    } else {
        (mid - radius, mid + radius)
    }
}

/// Uses a window already in memory to narrow the bounds of every pending
/// query after `current`. The window covers `[win_a, win_b)` of the run;
/// its first and last records act as sentinels.
#[allow(clippy::too_many_arguments)]
fn cross_update<T, K, C, X>(
    window: &[T],
    win_a: u64,
    current: usize,
    keys: &[K],
    bounds: &mut [(KeyBound<K>, KeyBound<K>)],
    completed: &mut [bool],
    end: u64,
    cmp: C,
    extract: X,
) where
    T: Record,
    K: Copy,
    C: Fn(&K, &K) -> Ordering + Copy,
    X: Fn(&T) -> K + Copy,
{
    if window.len() < 3 {
        return;
    }
    let interior = &window[1..window.len() - 1];
    let a = win_a + 1;
    let b = a + interior.len() as u64;

    for j in current + 1..keys.len() {
        if completed[j] {
            continue;
        }
        let key = keys[j];
        let (lb_off, ub_off) = equal_range_by(interior, &key, cmp, extract);
        let lb = a + lb_off as u64;
        let ub = a + ub_off as u64;
        let (low_bound, high_bound) = &mut bounds[j];

        if lb != a && ub != b {
            // the whole range (or its absence) is visible in this window
            if lb == ub {
                low_bound.index = end;
                high_bound.index = end;
            } else {
                low_bound.index = lb;
                high_bound.index = ub;
            }
            completed[j] = true;
            continue;
        }

        if lb != a || ub != b {
            // narrowed from one side; the sentinels make the adjacent
            // records addressable
            if lb != a && lb > low_bound.index {
                low_bound.index = lb;
                low_bound.key = extract(&window[(lb - win_a) as usize]);
            }
            if ub != b && ub < high_bound.index {
                high_bound.index = ub;
                high_bound.key = extract(&window[(ub - win_a - 1) as usize]);
            }
        }
    }
}

fn equal_range_multiple_with_bounds<const CROSS: bool, T, K, C, X, M>(
    data: &ImmutableSpan<T>,
    mut bounds: Vec<(KeyBound<K>, KeyBound<K>)>,
    keys: &[K],
    cmp: C,
    extract: X,
    midpoint: M,
) -> Result<Vec<(u64, u64)>>
where
    T: Record,
    K: Copy,
    C: Fn(&K, &K) -> Ordering + Copy,
    X: Fn(&T) -> K + Copy,
    M: Midpoint<K>,
{
    // about as much as one seek buys us in sequential records; kept
    // even so a centered pivot window always spans the full size
    let max_window = ((data.file().storage().config().search.max_seq_read_size
        / std::mem::size_of::<T>())
    .max(4))
        & !1;
    let end = data.len();

    let mut buffer = vec![T::zeroed(); max_window];
    let mut completed = vec![false; keys.len()];
    let mut results = Vec::with_capacity(keys.len());

    for i in 0..keys.len() {
        let (low_seed, high_seed) = bounds[i];
        let mut low = low_seed.index;
        let mut high = high_seed.index;

        // cross updates may have resolved this query already, or seeded it
        // empty
        if completed[i] {
            results.push((low, high));
            continue;
        }
        if low == high {
            completed[i] = true;
            results.push((end, end));
            continue;
        }

        let mut low_key = low_seed.key;
        let mut high_key = high_seed.key;
        let key = keys[i];

        while cmp(&low_key, &high_key) == Ordering::Less
            && cmp(&key, &low_key) != Ordering::Less
            && cmp(&high_key, &key) != Ordering::Less
        {
            debug_assert!(low < high);

            // when the remaining range fits one window, read it whole
            if high - low <= max_window as u64 {
                let window = &mut buffer[..(high - low) as usize];
                data.read_exact_into(window, low)?;
                if CROSS {
                    cross_update(
                        window, low, i, keys, &mut bounds, &mut completed, end, cmp, extract,
                    );
                }
                let (lb_off, ub_off) = equal_range_by(window, &key, cmp, extract);
                let lb = low + lb_off as u64;
                let ub = low + ub_off as u64;
                completed[i] = true;
                results.push(if lb == ub { (end, end) } else { (lb, ub) });
                break;
            }

            let mut mid = midpoint.pick(low, high, &low_key, &high_key, &key);
            debug_assert!(mid >= low && mid < high);

            {
                let (win_a, win_b) = neighbourhood(low, high, mid, max_window as u64);
                let window = &mut buffer[..(win_b - win_a) as usize];
                data.read_exact_into(window, win_a)?;
                if CROSS {
                    cross_update(
                        window, win_a, i, keys, &mut bounds, &mut completed, end, cmp, extract,
                    );
                }

                // the outermost record on each side is a sentinel
                let a = win_a + 1;
                let b = win_b - 1;
                let interior = &window[1..window.len() - 1];
                let (lb_off, ub_off) = equal_range_by(interior, &key, cmp, extract);
                let lb = a + lb_off as u64;
                let ub = a + ub_off as u64;

                if lb != a && ub != b {
                    // both ends of the range fell inside the window
                    completed[i] = true;
                    results.push(if lb == ub { (end, end) } else { (lb, ub) });
                    break;
                }

                if lb != a || ub != b {
                    // narrowed from exactly one side; iterate
                    if lb != a {
                        low = lb;
                        low_key = extract(&window[(lb - win_a) as usize]);
                    }
                    if ub != b {
                        high = ub;
                        high_key = extract(&window[(ub - win_a - 1) as usize]);
                    }
                    continue;
                }
            }

            // the window is equal to the key from sentinel to sentinel: the
            // run of equal records outgrows the window, bracket each end by
            // doubling steps. `mid` moves one past the probe so the lower
            // bound is still found when the probe was the last equal record.
            mid += 1;

            {
                // lower bound: bracket leftward, then narrow [low, low+count)
                let mut count = mid - low;
                let mut step = max_window as u64;
                let mut last = mid;
                while step < count {
                    let probe = (extract)(&data.get(mid - step)?);
                    if cmp(&probe, &key) == Ordering::Less {
                        low = mid - step;
                        mid = last;
                        count = mid - low;
                        break;
                    }
                    last = mid - step;
                    step *= 2;
                }

                while count > 0 {
                    if count <= max_window as u64 {
                        let window = &mut buffer[..count as usize];
                        data.read_exact_into(window, low)?;
                        if CROSS {
                            cross_update(
                                window, low, i, keys, &mut bounds, &mut completed, end, cmp,
                                extract,
                            );
                        }
                        low += lower_bound_by(window, &key, cmp, extract) as u64;
                        break;
                    }
                    let half = count / 2;
                    let probe = (extract)(&data.get(low + half)?);
                    if cmp(&probe, &key) == Ordering::Less {
                        low += half + 1;
                        count -= half + 1;
                    } else {
                        count = half;
                    }
                }
            }

            {
                // upper bound, mirrored: bracket rightward from mid
                let mut count = high - mid;
                let mut step = max_window as u64;
                let mut last = mid;
                while step < count {
                    let probe = (extract)(&data.get(mid + step)?);
                    if cmp(&key, &probe) == Ordering::Less {
                        high = mid + step;
                        mid = last;
                        count = high - mid;
                        break;
                    }
                    last = mid + step;
                    step *= 2;
                }

                while count > 0 {
                    if count <= max_window as u64 {
                        let window = &mut buffer[..count as usize];
                        data.read_exact_into(window, mid)?;
                        if CROSS {
                            cross_update(
                                window, mid, i, keys, &mut bounds, &mut completed, end, cmp,
                                extract,
                            );
                        }
                        mid += upper_bound_by(window, &key, cmp, extract) as u64;
                        break;
                    }
                    let half = count / 2;
                    let probe = (extract)(&data.get(mid + half)?);
                    if cmp(&key, &probe) != Ordering::Less {
                        mid += half + 1;
                        count -= half + 1;
                    } else {
                        count = half;
                    }
                }
            }

            debug_assert!(low < mid);
            completed[i] = true;
            results.push((low, mid));
            break;
        }

        if !completed[i] {
            // the loop condition failed outright: either the whole
            // remaining range is one value, or the key is out of bounds
            completed[i] = true;
            if cmp(&key, &low_key) != Ordering::Less && cmp(&low_key, &key) != Ordering::Less {
                results.push((low, high));
            } else {
                results.push((end, end));
            }
        }
    }

    Ok(results)
}

/// Seeds every query with the ends of the span.
fn span_bounds<T, K, X>(
    data: &ImmutableSpan<T>,
    keys: &[K],
    extract: X,
) -> Result<Vec<(KeyBound<K>, KeyBound<K>)>>
where
    T: Record,
    K: Copy,
    X: Fn(&T) -> K,
{
    let end = data.len();
    let low_key = extract(&data.front()?);
    let high_key = if end == 1 {
        low_key
    } else {
        extract(&data.back()?)
    };
    Ok(keys
        .iter()
        .map(|_| {
            (
                KeyBound {
                    index: 0,
                    key: low_key,
                },
                KeyBound {
                    index: end,
                    key: high_key,
                },
            )
        })
        .collect())
}

fn index_bounds<K, C>(index: &RangeIndex<K, C>, keys: &[K]) -> Vec<(KeyBound<K>, KeyBound<K>)>
where
    K: Copy,
    C: Fn(&K, &K) -> Ordering,
{
    keys.iter().map(|key| index.equal_range(key)).collect()
}

fn all_absent<K>(keys: &[K], end: u64) -> Vec<(u64, u64)> {
    keys.iter().map(|_| (end, end)).collect()
}

macro_rules! run_plain {
    ($cross:expr, $data:expr, $keys:expr, $cmp:expr, $extract:expr, $midpoint:expr) => {{
        if $data.is_empty() {
            return Ok(all_absent($keys, $data.len()));
        }
        let bounds = span_bounds($data, $keys, $extract)?;
        equal_range_multiple_with_bounds::<{ $cross }, _, _, _, _, _>(
            $data, bounds, $keys, $cmp, $extract, $midpoint,
        )
    }};
}

macro_rules! run_indexed {
    ($cross:expr, $data:expr, $index:expr, $keys:expr, $cmp:expr, $extract:expr, $midpoint:expr) => {{
        if $data.is_empty() {
            return Ok(all_absent($keys, $data.len()));
        }
        let bounds = index_bounds($index, $keys);
        equal_range_multiple_with_bounds::<{ $cross }, _, _, _, _, _>(
            $data, bounds, $keys, $cmp, $extract, $midpoint,
        )
    }};
}

pub fn equal_range_multiple_bin<T, K, C, X>(
    data: &ImmutableSpan<T>,
    keys: &[K],
    cmp: C,
    extract: X,
) -> Result<Vec<(u64, u64)>>
where
    T: Record,
    K: Copy,
    C: Fn(&K, &K) -> Ordering + Copy,
    X: Fn(&T) -> K + Copy,
{
    run_plain!(false, data, keys, cmp, extract, BinaryMidpoint)
}

pub fn equal_range_multiple_bin_cross<T, K, C, X>(
    data: &ImmutableSpan<T>,
    keys: &[K],
    cmp: C,
    extract: X,
) -> Result<Vec<(u64, u64)>>
where
    T: Record,
    K: Copy,
    C: Fn(&K, &K) -> Ordering + Copy,
    X: Fn(&T) -> K + Copy,
{
    run_plain!(true, data, keys, cmp, extract, BinaryMidpoint)
}

pub fn equal_range_multiple_bin_indexed<T, K, C, X>(
    data: &ImmutableSpan<T>,
    index: &RangeIndex<K, C>,
    keys: &[K],
    cmp: C,
    extract: X,
) -> Result<Vec<(u64, u64)>>
where
    T: Record,
    K: Copy,
    C: Fn(&K, &K) -> Ordering + Copy,
    X: Fn(&T) -> K + Copy,
{
    run_indexed!(false, data, index, keys, cmp, extract, BinaryMidpoint)
}

pub fn equal_range_multiple_bin_indexed_cross<T, K, C, X>(
    data: &ImmutableSpan<T>,
    index: &RangeIndex<K, C>,
    keys: &[K],
    cmp: C,
    extract: X,
) -> Result<Vec<(u64, u64)>>
where
    T: Record,
    K: Copy,
    C: Fn(&K, &K) -> Ordering + Copy,
    X: Fn(&T) -> K + Copy,
{
    run_indexed!(true, data, index, keys, cmp, extract, BinaryMidpoint)
}

pub fn equal_range_multiple_interp<T, K, C, X, A, S>(
    data: &ImmutableSpan<T>,
    keys: &[K],
    cmp: C,
    extract: X,
    to_arithmetic: A,
    to_size: S,
) -> Result<Vec<(u64, u64)>>
where
    T: Record,
    K: Copy,
    C: Fn(&K, &K) -> Ordering + Copy,
    X: Fn(&T) -> K + Copy,
    A: Fn(&K) -> u128,
    S: Fn(u128) -> u64,
{
    run_plain!(
        false,
        data,
        keys,
        cmp,
        extract,
        InterpolateMidpoint::new(to_arithmetic, to_size)
    )
}

pub fn equal_range_multiple_interp_cross<T, K, C, X, A, S>(
    data: &ImmutableSpan<T>,
    keys: &[K],
    cmp: C,
    extract: X,
    to_arithmetic: A,
    to_size: S,
) -> Result<Vec<(u64, u64)>>
where
    T: Record,
    K: Copy,
    C: Fn(&K, &K) -> Ordering + Copy,
    X: Fn(&T) -> K + Copy,
    A: Fn(&K) -> u128,
    S: Fn(u128) -> u64,
{
    run_plain!(
        true,
        data,
        keys,
        cmp,
        extract,
        InterpolateMidpoint::new(to_arithmetic, to_size)
    )
}

pub fn equal_range_multiple_interp_indexed<T, K, C, X, A, S>(
    data: &ImmutableSpan<T>,
    index: &RangeIndex<K, C>,
    keys: &[K],
    cmp: C,
    extract: X,
    to_arithmetic: A,
    to_size: S,
) -> Result<Vec<(u64, u64)>>
where
    T: Record,
    K: Copy,
    C: Fn(&K, &K) -> Ordering + Copy,
    X: Fn(&T) -> K + Copy,
    A: Fn(&K) -> u128,
    S: Fn(u128) -> u64,
{
    run_indexed!(
        false,
        data,
        index,
        keys,
        cmp,
        extract,
        InterpolateMidpoint::new(to_arithmetic, to_size)
    )
}

pub fn equal_range_multiple_interp_indexed_cross<T, K, C, X, A, S>(
    data: &ImmutableSpan<T>,
    index: &RangeIndex<K, C>,
    keys: &[K],
    cmp: C,
    extract: X,
    to_arithmetic: A,
    to_size: S,
) -> Result<Vec<(u64, u64)>>
where
    T: Record,
    K: Copy,
    C: Fn(&K, &K) -> Ordering + Copy,
    X: Fn(&T) -> K + Copy,
    A: Fn(&K) -> u128,
    S: Fn(u128) -> u64,
{
    run_indexed!(
        true,
        data,
        index,
        keys,
        cmp,
        extract,
        InterpolateMidpoint::new(to_arithmetic, to_size)
    )
}

/// Batched lookup tuned for large, uncorrelated batches: sorts the keys so
/// neighbouring queries share windows, runs the cross-updating indexed
/// search, and hands the results back in the caller's key order.
pub fn equal_range_multiple_sorted<T, K, C, X>(
    data: &ImmutableSpan<T>,
    index: &RangeIndex<K, C>,
    keys: &[K],
    cmp: C,
    extract: X,
) -> Result<Vec<(u64, u64)>>
where
    T: Record,
    K: Copy,
    C: Fn(&K, &K) -> Ordering + Copy,
    X: Fn(&T) -> K + Copy,
{
    let mut sorted = keys.to_vec();
    let unsorter = crate::utils::reversible_sort(&mut sorted, cmp);
    let mut results = equal_range_multiple_bin_indexed_cross(data, index, &sorted, cmp, extract)?;
    unsorter.unsort(&mut results);
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neighbourhood_clamps_and_centers() {
        // everything fits
        assert_eq!(neighbourhood(0, 10, 5, 16), (0, 10));
        // centered
        assert_eq!(neighbourhood(0, 100, 50, 10), (45, 55));
        // clamped left
        assert_eq!(neighbourhood(0, 100, 2, 10), (0, 10));
        // clamped right
        assert_eq!(neighbourhood(0, 100, 98, 10), (90, 100));
    }

    #[test]
    fn interpolation_stays_in_range() {
        let mid = InterpolateMidpoint::new(|k: &u64| *k as u128, |d: u128| d as u64);
        for key in [0u64, 10, 55, 99, 100, 500] {
            let m = mid.pick(0, 100, &0, &1000, &key);
            assert!(m < 100, "key {}", key);
        }
        // a key equal to the high bound lands at the top
        assert_eq!(mid.pick(0, 101, &0, &100, &100), 100);
        // reversed key order interpolates too
        let m = mid.pick(0, 100, &1000, &0, &900);
        assert!(m < 100);
    }

    #[test]
    fn bounds_helpers() {
        let values = [1u64, 2, 2, 2, 5, 7];
        let cmp = |a: &u64, b: &u64| a.cmp(b);
        let id = |v: &u64| *v;
        assert_eq!(equal_range_by(&values, &2, cmp, id), (1, 4));
        assert_eq!(equal_range_by(&values, &4, cmp, id), (4, 4));
        assert_eq!(equal_range_by(&values, &0, cmp, id), (0, 0));
        assert_eq!(equal_range_by(&values, &9, cmp, id), (6, 6));
    }
}
