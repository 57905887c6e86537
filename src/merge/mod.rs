/*
 * SPDX-FileCopyrightText: 2024 The extstore developers
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Multi-pass, bounded fan-in k-way merging of sorted runs.
//!
//! The merge is stable: among equal records the one from the earlier input
//! is emitted first, so merging preserves insertion order across runs.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use dary_heap::QuaternaryHeap;
use dsi_progress_logger::prelude::*;
use log::debug;
use rayon::prelude::*;

use crate::config::MergeConfig;
use crate::error::{Error, Result};
use crate::record::Record;
use crate::store::{
    BackInserter, BinaryOutputFile, ImmutableSpan, OutputMode, SpanIter, Storage, TempPaths,
};
use crate::utils::ceil_div;

/// Work progress in record units.
#[derive(Clone, Copy, Debug)]
pub struct Progress {
    pub done: u64,
    pub total: u64,
}

impl Progress {
    pub fn ratio(&self) -> f64 {
        self.done as f64 / self.total as f64
    }
}

/// Observers of a running merge.
///
/// `pass_finished` fires once the on-disk state of a pass is materialized
/// and before the next pass starts; after pass 0 the caller may delete the
/// original inputs.
#[derive(Default)]
pub struct MergeCallbacks<'a> {
    pub progress: Option<Box<dyn FnMut(Progress) + 'a>>,
    pub pass_finished: Option<Box<dyn FnMut(u32) + 'a>>,
}

impl MergeCallbacks<'_> {
    pub fn none() -> Self {
        Self::default()
    }
}

struct ProgressTracker<'a, 'b, 'p> {
    progress: Progress,
    callback: &'a mut Option<Box<dyn FnMut(Progress) + 'b>>,
    pl: &'p mut ProgressLogger,
}

impl ProgressTracker<'_, '_, '_> {
    fn on_work_done(&mut self, records: u64) {
        self.progress.done += records;
        self.pl.update_with_count(records as usize);
        if let Some(callback) = self.callback.as_mut() {
            callback(self.progress);
        }
    }
}

/// One pass of a [`MergePlan`]: where this pass reads its temporary inputs
/// and where it writes its outputs. The read directory is a hint; the first
/// pass actually reads the caller's runs wherever they live.
#[derive(Clone, Debug)]
pub struct MergePass {
    pub read_dir: PathBuf,
    pub write_dir: PathBuf,
}

impl MergePass {
    pub fn new(read_dir: impl Into<PathBuf>, write_dir: impl Into<PathBuf>) -> Self {
        MergePass {
            read_dir: read_dir.into(),
            write_dir: write_dir.into(),
        }
    }

    pub fn invert(&mut self) {
        std::mem::swap(&mut self.read_dir, &mut self.write_dir);
    }
}

#[derive(Clone, Debug, Default)]
pub struct MergePlan {
    pub passes: Vec<MergePass>,
}

impl MergePlan {
    pub fn num_passes(&self) -> usize {
        self.passes.len()
    }

    pub fn invert(&mut self) {
        for pass in &mut self.passes {
            pass.invert();
        }
    }

    /// The write directory for `pass`; passes beyond the planned count keep
    /// alternating the last pair of directories.
    pub fn write_dir_for_pass(&self, pass: usize) -> PathBuf {
        let planned = self.passes.len();
        if planned == 0 {
            return PathBuf::from(".");
        }
        if pass < planned {
            self.passes[pass].write_dir.clone()
        } else if (pass - planned) % 2 == 0 {
            self.passes[planned - 1].read_dir.clone()
        } else {
            self.passes[planned - 1].write_dir.clone()
        }
    }
}

/// Plans the passes for merging `num_inputs` runs, alternating between two
/// temporary directories.
pub fn make_merge_plan(
    num_inputs: usize,
    temp1: impl Into<PathBuf>,
    temp2: impl Into<PathBuf>,
    max_batch_size: usize,
) -> MergePlan {
    let mut plan = MergePlan::default();
    if num_inputs > 1 {
        let mut num_passes = 1;
        let mut remaining = num_inputs;
        while remaining > max_batch_size {
            num_passes += 1;
            remaining /= max_batch_size;
        }

        let mut temp1 = temp1.into();
        let mut temp2 = temp2.into();
        for _ in 0..num_passes {
            plan.passes.push(MergePass::new(&temp1, &temp2));
            std::mem::swap(&mut temp1, &mut temp2);
        }
    }
    plan
}

/// Total merge work in records: every record is touched once per pass, and
/// there is at least one pass even for a single run.
pub fn assess_work(sizes: &[u64], max_batch_size: usize) -> u64 {
    let total: u64 = sizes.iter().sum();
    let mut num_inputs = sizes.len();
    let mut work = 0;
    while num_inputs > max_batch_size {
        work += total;
        num_inputs = ceil_div(num_inputs, max_batch_size);
    }
    work + total
}

pub fn assess_merge_work<T: Record>(inputs: &[ImmutableSpan<T>], max_batch_size: usize) -> u64 {
    let sizes: Vec<u64> = inputs.iter().map(ImmutableSpan::len).collect();
    assess_work(&sizes, max_batch_size)
}

/// Packs consecutive spans into groups of at most `max_group_bytes` each.
///
/// A span larger than the limit gets a group of its own; that is the only
/// case in which a group exceeds the limit. Callers use this to bound how
/// much data a single merge invocation touches.
pub fn group_spans_by_size<T: Record>(
    spans: Vec<ImmutableSpan<T>>,
    max_group_bytes: u64,
) -> Vec<Vec<ImmutableSpan<T>>> {
    let mut groups: Vec<Vec<ImmutableSpan<T>>> = Vec::new();

    // pretend the last group is full so the first span opens a new one
    let mut last_group_bytes = max_group_bytes + 1;
    for span in spans {
        let span_bytes = span.size_bytes();
        if last_group_bytes + span_bytes > max_group_bytes {
            groups.push(Vec::new());
            last_group_bytes = 0;
        }
        last_group_bytes += span_bytes;
        groups
            .last_mut()
            .expect("a group was just opened")
            .push(span);
    }

    groups
}

// A heap entry ordering inverted twice over: the max-heap must pop the
// smallest record, and among equal records the lowest input index, to keep
// the merge stable.
struct HeapEntry<T, C> {
    value: T,
    source: usize,
    cmp: C,
}

impl<T, C: Fn(&T, &T) -> Ordering> PartialEq for HeapEntry<T, C> {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && (self.cmp)(&self.value, &other.value) == Ordering::Equal
    }
}

impl<T, C: Fn(&T, &T) -> Ordering> Eq for HeapEntry<T, C> {}

impl<T, C: Fn(&T, &T) -> Ordering> PartialOrd for HeapEntry<T, C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(Ord::cmp(self, other))
    }
}

impl<T, C: Fn(&T, &T) -> Ordering> Ord for HeapEntry<T, C> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.cmp)(&self.value, &other.value)
            .reverse()
            .then_with(|| self.source.cmp(&other.source).reverse())
    }
}

/// Merges one batch of at most `max_batch_size` runs into `sink`.
///
/// While many inputs are active they go through a quaternary min-heap; once
/// few enough remain a linear scan over the front records is faster.
fn merge_batch_for_each<T, C, F>(
    cfg: &MergeConfig,
    inputs: &[ImmutableSpan<T>],
    sink: &mut F,
    cmp: C,
    tracker: &mut ProgressTracker<'_, '_, '_>,
) -> Result<()>
where
    T: Record,
    C: Fn(&T, &T) -> Ordering + Copy,
    F: FnMut(T) -> Result<()>,
{
    let input_buffer_elements = cfg.input_buffer_size / std::mem::size_of::<T>() / 2 + 1;
    let progress_threshold = (cfg.output_buffer_size / std::mem::size_of::<T>() / 2 + 1) as u64;

    // front record + iterator per non-empty input, in input order
    let mut fronts: Vec<(T, SpanIter<T>)> = Vec::with_capacity(inputs.len());
    for span in inputs {
        if span.is_empty() {
            continue;
        }
        let mut iter = span.iter(input_buffer_elements.min(span.len() as usize));
        if let Some(first) = iter.try_next()? {
            fronts.push((first, iter));
        }
    }

    let mut emitted = 0u64;

    if fronts.len() > cfg.priority_queue_threshold {
        let mut sources: Vec<Option<SpanIter<T>>> = Vec::with_capacity(fronts.len());
        let mut heap = QuaternaryHeap::with_capacity(fronts.len());
        for (source, (value, iter)) in fronts.drain(..).enumerate() {
            sources.push(Some(iter));
            heap.push(HeapEntry { value, source, cmp });
        }

        while heap.len() > cfg.priority_queue_threshold {
            let entry = heap.pop().expect("heap outnumbers the threshold");
            sink(entry.value)?;

            let iter = sources[entry.source]
                .as_mut()
                .expect("active heap entries keep their iterator");
            if let Some(next) = iter.try_next()? {
                heap.push(HeapEntry {
                    value: next,
                    source: entry.source,
                    cmp,
                });
            }

            emitted += 1;
            if emitted >= progress_threshold {
                tracker.on_work_done(emitted);
                emitted = 0;
            }
        }

        // hand the survivors to the linear stage, in input order
        let mut rest: Vec<(T, usize)> = heap
            .into_iter()
            .map(|entry| (entry.value, entry.source))
            .collect();
        rest.sort_by_key(|&(_, source)| source);
        fronts = rest
            .into_iter()
            .map(|(value, source)| {
                let iter = sources[source]
                    .take()
                    .expect("every surviving entry has its iterator");
                (value, iter)
            })
            .collect();
    }

    while !fronts.is_empty() {
        let mut min_idx = 0;
        for i in 1..fronts.len() {
            if cmp(&fronts[i].0, &fronts[min_idx].0) == Ordering::Less {
                min_idx = i;
            }
        }

        sink(fronts[min_idx].0)?;

        match fronts[min_idx].1.try_next()? {
            Some(next) => fronts[min_idx].0 = next,
            None => {
                // removal keeps the relative order of the remaining inputs
                fronts.remove(min_idx);
            }
        }

        emitted += 1;
        if emitted >= progress_threshold {
            tracker.on_work_done(emitted);
            emitted = 0;
        }
    }

    tracker.on_work_done(emitted);
    Ok(())
}

fn merge_batch_into<T, C>(
    store: &Arc<Storage>,
    cfg: &MergeConfig,
    inputs: &[ImmutableSpan<T>],
    out_path: PathBuf,
    cmp: C,
    tracker: &mut ProgressTracker<'_, '_, '_>,
) -> Result<ImmutableSpan<T>>
where
    T: Record,
    C: Fn(&T, &T) -> Ordering + Copy,
{
    let out_file = BinaryOutputFile::create(store, out_path, OutputMode::Truncate)?;
    let output_buffer_elements = cfg.output_buffer_size / std::mem::size_of::<T>() / 2 + 1;
    let mut inserter = BackInserter::new(&out_file, output_buffer_elements);
    merge_batch_for_each(cfg, inputs, &mut |value| inserter.push(value), cmp, tracker)?;
    inserter.flush()?;
    drop(inserter);
    ImmutableSpan::new(out_file.seal()?)
}

fn merge_for_each_impl<T, C, F>(
    store: &Arc<Storage>,
    plan: &MergePlan,
    pass_finished: &mut Option<Box<dyn FnMut(u32) + '_>>,
    inputs: &[ImmutableSpan<T>],
    sink: &mut F,
    cmp: C,
    tracker: &mut ProgressTracker<'_, '_, '_>,
) -> Result<u32>
where
    T: Record,
    C: Fn(&T, &T) -> Ordering + Copy,
    F: FnMut(T) -> Result<()>,
{
    let cfg = store.config().merge.clone();
    let max_batch = cfg.max_batch_size.max(2);

    let mut current: Vec<ImmutableSpan<T>> = inputs.to_vec();
    // keeps the previous pass's temporary files alive until the pass that
    // reads them has been fully written
    let mut temp_read: Option<TempPaths> = None;
    let mut pass_id: u32 = 0;

    while current.len() > max_batch {
        let write_dir = plan.write_dir_for_pass(pass_id as usize);
        let mut temp_write = TempPaths::new(&write_dir).map_err(|source| Error::Io {
            path: write_dir,
            source,
        })?;

        let mut next = Vec::with_capacity(current.len() / max_batch + 1);
        for group in current.chunks(max_batch) {
            next.push(merge_batch_into(
                store,
                &cfg,
                group,
                temp_write.next(),
                cmp,
                tracker,
            )?);
        }
        debug!(
            "merge pass {} reduced {} runs to {}",
            pass_id,
            current.len(),
            next.len()
        );

        // the files of the pass before last are deleted here
        temp_read = Some(temp_write);
        current = next;

        if let Some(callback) = pass_finished.as_mut() {
            callback(pass_id);
        }
        pass_id += 1;
    }

    merge_batch_for_each(&cfg, &current, sink, cmp, tracker)?;
    drop(temp_read);
    Ok(pass_id)
}

/// Merges sorted `inputs` into one sorted file at `out_path`.
///
/// Invokes `pass_finished` once more after the output file itself is
/// written, so the caller can clean up the inputs of the final pass.
pub fn merge<T, C>(
    store: &Arc<Storage>,
    plan: &MergePlan,
    callbacks: &mut MergeCallbacks<'_>,
    inputs: &[ImmutableSpan<T>],
    out_path: &Path,
    cmp: C,
) -> Result<()>
where
    T: Record,
    C: Fn(&T, &T) -> Ordering + Copy,
{
    let MergeCallbacks {
        progress,
        pass_finished,
    } = callbacks;

    let total = assess_merge_work(inputs, store.config().merge.max_batch_size.max(2));
    let mut pl = progress_logger!(
        item_name = "records",
        expected_updates = Some(total as usize)
    );
    pl.start("merging sorted runs");

    let next_pass = {
        let mut tracker = ProgressTracker {
            progress: Progress { done: 0, total },
            callback: progress,
            pl: &mut pl,
        };

        let out_file = BinaryOutputFile::create(store, out_path, OutputMode::Truncate)?;
        let output_buffer_elements =
            store.config().merge.output_buffer_size / std::mem::size_of::<T>() / 2 + 1;
        let mut inserter = BackInserter::new(&out_file, output_buffer_elements);
        let next_pass = merge_for_each_impl(
            store,
            plan,
            pass_finished,
            inputs,
            &mut |value| inserter.push(value),
            cmp,
            &mut tracker,
        )?;
        inserter.flush()?;
        next_pass
    };
    pl.done();

    if let Some(callback) = pass_finished.as_mut() {
        callback(next_pass);
    }
    Ok(())
}

/// Merges sorted `inputs` into `sink`, one record at a time, in order.
pub fn merge_for_each<T, C, F>(
    store: &Arc<Storage>,
    plan: &MergePlan,
    callbacks: &mut MergeCallbacks<'_>,
    inputs: &[ImmutableSpan<T>],
    mut sink: F,
    cmp: C,
) -> Result<()>
where
    T: Record,
    C: Fn(&T, &T) -> Ordering + Copy,
    F: FnMut(T) -> Result<()>,
{
    let MergeCallbacks {
        progress,
        pass_finished,
    } = callbacks;

    let total = assess_merge_work(inputs, store.config().merge.max_batch_size.max(2));
    let mut pl = progress_logger!(
        item_name = "records",
        expected_updates = Some(total as usize)
    );
    pl.start("merging sorted runs");
    {
        let mut tracker = ProgressTracker {
            progress: Progress { done: 0, total },
            callback: progress,
            pl: &mut pl,
        };
        merge_for_each_impl(store, plan, pass_finished, inputs, &mut sink, cmp, &mut tracker)?;
    }
    pl.done();
    Ok(())
}

/// Sorts an in-memory batch and writes it out as a run, returning the
/// sealed span over it.
pub fn store_sorted_run<T, C>(
    store: &Arc<Storage>,
    path: impl Into<PathBuf>,
    records: &mut [T],
    cmp: C,
) -> Result<ImmutableSpan<T>>
where
    T: Record,
    C: Fn(&T, &T) -> Ordering + Sync,
{
    let start = Instant::now();
    records.par_sort_unstable_by(|a, b| cmp(a, b));
    debug!(
        "sorted a batch of {} records in {:?}",
        records.len(),
        start.elapsed()
    );

    let out_file = BinaryOutputFile::create(store, path, OutputMode::Truncate)?;
    let output_buffer_elements =
        store.config().merge.output_buffer_size / std::mem::size_of::<T>() / 2 + 1;
    let mut inserter = BackInserter::new(&out_file, output_buffer_elements);
    inserter.extend_from_slice(records)?;
    inserter.flush()?;
    drop(inserter);
    ImmutableSpan::new(out_file.seal()?)
}
