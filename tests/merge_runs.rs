use std::sync::Arc;

use anyhow::Result;
use bytemuck::{Pod, Zeroable};

use extstore::config::{MergeConfig, StoreConfig};
use extstore::merge::{
    assess_work, group_spans_by_size, make_merge_plan, merge, merge_for_each, store_sorted_run,
    MergeCallbacks,
};
use extstore::record::{CombiningSink, StoreRecord};
use itertools::Itertools;
use extstore::store::{write_file, ImmutableBinaryFile, ImmutableSpan, Storage};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
struct Tagged {
    value: u64,
    run: u64,
    count: u64,
}

impl StoreRecord for Tagged {
    type Key = u64;

    fn key(&self) -> u64 {
        self.value
    }

    fn same_position(&self, other: &Self) -> bool {
        self.value == other.value
    }

    fn combine(&mut self, other: &Self) {
        self.count += other.count;
    }
}

fn tagged(value: u64, run: u64) -> Tagged {
    Tagged {
        value,
        run,
        count: 1,
    }
}

fn by_value(a: &Tagged, b: &Tagged) -> std::cmp::Ordering {
    a.value.cmp(&b.value)
}

fn tiny_store() -> Arc<Storage> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = StoreConfig::default();
    // small buffers so every code path in the merge actually buffers
    config.merge = MergeConfig {
        max_batch_size: 2,
        output_buffer_size: 96,
        input_buffer_size: 96,
        priority_queue_threshold: 4,
    };
    Storage::new(config)
}

fn write_run(
    store: &Arc<Storage>,
    dir: &std::path::Path,
    name: &str,
    values: &[Tagged],
) -> Result<ImmutableSpan<Tagged>> {
    let path = dir.join(name);
    write_file(store, &path, values)?;
    Ok(ImmutableSpan::new(ImmutableBinaryFile::open(store, path)?)?)
}

#[test]
fn three_runs_merge_stably() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = tiny_store();

    let runs = vec![
        write_run(&store, dir.path(), "r0", &[tagged(1, 0), tagged(3, 0), tagged(5, 0)])?,
        write_run(&store, dir.path(), "r1", &[tagged(2, 1), tagged(4, 1)])?,
        write_run(&store, dir.path(), "r2", &[tagged(2, 2), tagged(6, 2), tagged(7, 2)])?,
    ];

    let plan = make_merge_plan(runs.len(), dir.path().join("t1"), dir.path().join("t2"), 2);
    let out = dir.path().join("merged");
    merge(
        &store,
        &plan,
        &mut MergeCallbacks::none(),
        &runs,
        &out,
        by_value,
    )?;

    let merged: Vec<Tagged> = extstore::store::read_file(&store, &out)?;
    let values: Vec<u64> = merged.iter().map(|r| r.value).collect();
    assert_eq!(values, vec![1, 2, 2, 3, 4, 5, 6, 7]);
    // the merge is stable: the 2 from the earlier input comes first
    let twos: Vec<u64> = merged
        .iter()
        .filter(|r| r.value == 2)
        .map(|r| r.run)
        .collect();
    assert_eq!(twos, vec![1, 2]);
    Ok(())
}

#[test]
fn empty_inputs_merge_to_an_empty_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = tiny_store();

    let runs = vec![
        write_run(&store, dir.path(), "e0", &[])?,
        write_run(&store, dir.path(), "e1", &[])?,
    ];
    let plan = make_merge_plan(runs.len(), dir.path().join("t1"), dir.path().join("t2"), 2);
    let out = dir.path().join("merged");

    let mut passes = Vec::new();
    let mut callbacks = MergeCallbacks {
        progress: None,
        pass_finished: Some(Box::new(|pass| passes.push(pass))),
    };
    merge(&store, &plan, &mut callbacks, &runs, &out, by_value)?;
    drop(callbacks);

    let merged: Vec<Tagged> = extstore::store::read_file(&store, &out)?;
    assert_eq!(merged, vec![]);
    // one (final) pass even when there is nothing to do
    assert_eq!(passes, vec![0]);
    Ok(())
}

#[test]
fn single_run_copies_through() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = tiny_store();
    let data: Vec<Tagged> = (0..100).map(|i| tagged(i, 0)).collect();
    let runs = vec![write_run(&store, dir.path(), "solo", &data)?];

    let plan = make_merge_plan(runs.len(), dir.path().join("t1"), dir.path().join("t2"), 2);
    let out = dir.path().join("merged");
    merge(
        &store,
        &plan,
        &mut MergeCallbacks::none(),
        &runs,
        &out,
        by_value,
    )?;
    let merged: Vec<Tagged> = extstore::store::read_file(&store, &out)?;
    assert_eq!(merged, data);
    Ok(())
}

#[test]
fn multi_pass_merge_matches_a_stable_sort() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = tiny_store();

    // 9 runs at fan-in 2 need several passes
    let mut runs = Vec::new();
    let mut everything = Vec::new();
    for run_id in 0..9u64 {
        let mut values: Vec<Tagged> = (0..(40 + run_id * 7))
            .map(|i| tagged((i * (run_id + 3)) % 97, run_id))
            .collect();
        values.sort_by(by_value);
        everything.extend_from_slice(&values);
        runs.push(write_run(
            &store,
            dir.path(),
            &format!("run{}", run_id),
            &values,
        )?);
    }

    // the reference: a stable sort by value of the runs in input order
    everything.sort_by(|a, b| by_value(a, b).then(a.run.cmp(&b.run)));

    let plan = make_merge_plan(runs.len(), dir.path().join("t1"), dir.path().join("t2"), 2);
    let out = dir.path().join("merged");

    let total = assess_work(
        &runs.iter().map(|r| r.len()).collect::<Vec<_>>(),
        2,
    );
    let mut last_progress = 0;
    let mut seen_total = 0;
    let mut passes = Vec::new();
    let mut callbacks = MergeCallbacks {
        progress: Some(Box::new(|p: extstore::merge::Progress| {
            assert!(p.done >= last_progress, "progress went backwards");
            assert!(p.done <= p.total);
            last_progress = p.done;
            seen_total = p.total;
        })),
        pass_finished: Some(Box::new(|pass| passes.push(pass))),
    };
    merge(&store, &plan, &mut callbacks, &runs, &out, by_value)?;
    drop(callbacks);

    assert_eq!(seen_total, total);
    assert_eq!(last_progress, total);
    // passes come in order and the extra final callback follows
    let expected_passes: Vec<u32> = (0..passes.len() as u32).collect();
    assert_eq!(passes, expected_passes);
    assert!(passes.len() >= 2);

    let merged: Vec<Tagged> = extstore::store::read_file(&store, &out)?;
    assert_eq!(merged, everything);

    // the temporary directories are cleaned out
    for temp in ["t1", "t2"] {
        let dir = dir.path().join(temp);
        if dir.exists() {
            assert_eq!(std::fs::read_dir(dir)?.count(), 0);
        }
    }
    Ok(())
}

#[test]
fn wide_final_batch_goes_through_the_heap() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = StoreConfig::default();
    config.merge = MergeConfig {
        max_batch_size: 16,
        output_buffer_size: 96,
        input_buffer_size: 96,
        priority_queue_threshold: 4,
    };
    let store = Storage::new(config);

    let mut runs = Vec::new();
    let mut everything = Vec::new();
    for run_id in 0..12u64 {
        let values: Vec<Tagged> = (0..30).map(|i| tagged(i * 2 + run_id % 3, run_id)).collect();
        everything.extend_from_slice(&values);
        runs.push(write_run(
            &store,
            dir.path(),
            &format!("wide{}", run_id),
            &values,
        )?);
    }
    everything.sort_by(|a, b| by_value(a, b).then(a.run.cmp(&b.run)));

    let plan = make_merge_plan(runs.len(), dir.path().join("t1"), dir.path().join("t2"), 16);
    let out = dir.path().join("merged");
    merge(
        &store,
        &plan,
        &mut MergeCallbacks::none(),
        &runs,
        &out,
        by_value,
    )?;
    let merged: Vec<Tagged> = extstore::store::read_file(&store, &out)?;
    assert_eq!(merged, everything);
    Ok(())
}

#[test]
fn merge_for_each_with_a_combining_sink_collapses_duplicates() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = tiny_store();

    let runs = vec![
        write_run(&store, dir.path(), "c0", &[tagged(1, 0), tagged(2, 0), tagged(2, 0)])?,
        write_run(&store, dir.path(), "c1", &[tagged(2, 1), tagged(3, 1)])?,
        write_run(&store, dir.path(), "c2", &[tagged(3, 2), tagged(3, 2), tagged(9, 2)])?,
    ];
    let plan = make_merge_plan(runs.len(), dir.path().join("t1"), dir.path().join("t2"), 2);

    let mut collapsed: Vec<Tagged> = Vec::new();
    {
        let mut sink = CombiningSink::new(|record: Tagged| {
            collapsed.push(record);
            Ok(())
        });
        merge_for_each(
            &store,
            &plan,
            &mut MergeCallbacks::none(),
            &runs,
            |record| sink.push(record),
            by_value,
        )?;
        sink.finish()?;
    }

    let summary: Vec<(u64, u64)> = collapsed.iter().map(|r| (r.value, r.count)).collect();
    assert_eq!(summary, vec![(1, 1), (2, 3), (3, 3), (9, 1)]);
    Ok(())
}

#[test]
fn sorted_runs_come_back_sorted() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = tiny_store();

    let mut batch: Vec<Tagged> = (0..500u64).map(|i| tagged((i * 37) % 101, i)).collect();
    let span = store_sorted_run(&store, dir.path().join("batch"), &mut batch, by_value)?;
    assert_eq!(span.len(), 500);

    let mut iter = span.iter(64);
    let mut keys = Vec::new();
    while let Some(record) = iter.try_next()? {
        keys.push(record.value);
    }
    assert_eq!(keys.len(), 500);
    assert!(keys.iter().tuple_windows().all(|(a, b)| a <= b));
    Ok(())
}

#[test]
fn spans_group_by_byte_size() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = tiny_store();
    let record_size = std::mem::size_of::<Tagged>() as u64;

    let mut spans = Vec::new();
    for (i, len) in [2u64, 2, 2, 9, 1, 1, 1].iter().enumerate() {
        let values: Vec<Tagged> = (0..*len).map(|v| tagged(v, i as u64)).collect();
        spans.push(write_run(&store, dir.path(), &format!("g{}", i), &values)?);
    }

    // groups of at most four records' worth of bytes
    let groups = group_spans_by_size(spans, 4 * record_size);
    let lens: Vec<Vec<u64>> = groups
        .iter()
        .map(|g| g.iter().map(|s| s.len()).collect())
        .collect();
    // the 9-record span exceeds the limit and sits alone
    assert_eq!(lens, vec![vec![2, 2], vec![2], vec![9], vec![1, 1, 1]]);
    Ok(())
}
