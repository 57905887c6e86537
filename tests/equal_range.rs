use std::cmp::Ordering;
use std::sync::Arc;

use anyhow::Result;
use bytemuck::{Pod, Zeroable};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use extstore::config::{SearchConfig, StoreConfig};
use extstore::index::{build_index_from_span, RangeIndex};
use extstore::search::{
    equal_range_multiple_bin, equal_range_multiple_bin_cross, equal_range_multiple_bin_indexed,
    equal_range_multiple_bin_indexed_cross, equal_range_multiple_interp,
    equal_range_multiple_interp_cross, equal_range_multiple_interp_indexed,
    equal_range_multiple_interp_indexed_cross, equal_range_multiple_sorted,
};
use extstore::store::{write_file, ImmutableBinaryFile, ImmutableSpan, Storage};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
struct Entry {
    key: u64,
    seq: u64,
}

fn entry(key: u64, seq: u64) -> Entry {
    Entry { key, seq }
}

fn cmp_keys(a: &u64, b: &u64) -> Ordering {
    a.cmp(b)
}

fn key_of(e: &Entry) -> u64 {
    e.key
}

fn to_arith(k: &u64) -> u128 {
    *k as u128
}

fn to_size(d: u128) -> u64 {
    d.min(u64::MAX as u128) as u64
}

/// A store whose pivot windows hold only a handful of entries, so every
/// search path (windowing, narrowing, exponential bracketing) really runs.
fn small_window_store() -> Arc<Storage> {
    let mut config = StoreConfig::default();
    config.search = SearchConfig {
        max_seq_read_size: 6 * std::mem::size_of::<Entry>(),
    };
    Storage::new(config)
}

fn store_span(
    store: &Arc<Storage>,
    dir: &std::path::Path,
    values: &[Entry],
) -> Result<ImmutableSpan<Entry>> {
    let path = dir.join("sorted");
    write_file(store, &path, values)?;
    Ok(ImmutableSpan::new(ImmutableBinaryFile::open(store, path)?)?)
}

fn reference_results(values: &[Entry], keys: &[u64]) -> Vec<(u64, u64)> {
    let end = values.len() as u64;
    keys.iter()
        .map(|&key| {
            let lb = values.partition_point(|e| e.key < key) as u64;
            let ub = values.partition_point(|e| e.key <= key) as u64;
            if lb == ub {
                (end, end)
            } else {
                (lb, ub)
            }
        })
        .collect()
}

fn index_over(
    span: &ImmutableSpan<Entry>,
    max_per_range: u64,
) -> Result<RangeIndex<u64, fn(&u64, &u64) -> Ordering>> {
    Ok(build_index_from_span(
        span,
        max_per_range,
        cmp_keys as fn(&u64, &u64) -> Ordering,
        key_of,
        8,
    )?)
}

/// Runs all eight search variants and checks them against the in-memory
/// reference.
fn check_all_variants(
    span: &ImmutableSpan<Entry>,
    index: &RangeIndex<u64, fn(&u64, &u64) -> Ordering>,
    keys: &[u64],
    expected: &[(u64, u64)],
) -> Result<()> {
    let cmp = cmp_keys as fn(&u64, &u64) -> Ordering;
    assert_eq!(
        equal_range_multiple_bin(span, keys, cmp, key_of)?,
        expected,
        "bin"
    );
    assert_eq!(
        equal_range_multiple_bin_cross(span, keys, cmp, key_of)?,
        expected,
        "bin cross"
    );
    assert_eq!(
        equal_range_multiple_bin_indexed(span, index, keys, cmp, key_of)?,
        expected,
        "bin indexed"
    );
    assert_eq!(
        equal_range_multiple_bin_indexed_cross(span, index, keys, cmp, key_of)?,
        expected,
        "bin indexed cross"
    );
    assert_eq!(
        equal_range_multiple_interp(span, keys, cmp, key_of, to_arith, to_size)?,
        expected,
        "interp"
    );
    assert_eq!(
        equal_range_multiple_interp_cross(span, keys, cmp, key_of, to_arith, to_size)?,
        expected,
        "interp cross"
    );
    assert_eq!(
        equal_range_multiple_interp_indexed(span, index, keys, cmp, key_of, to_arith, to_size)?,
        expected,
        "interp indexed"
    );
    assert_eq!(
        equal_range_multiple_interp_indexed_cross(
            span, index, keys, cmp, key_of, to_arith, to_size
        )?,
        expected,
        "interp indexed cross"
    );
    Ok(())
}

#[test]
fn small_array_with_duplicates() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = small_window_store();

    let values: Vec<Entry> = [1, 1, 1, 2, 3, 3, 4, 5, 5, 5, 5, 5, 6]
        .iter()
        .enumerate()
        .map(|(i, &k)| entry(k, i as u64))
        .collect();
    let span = store_span(&store, dir.path(), &values)?;
    let index = index_over(&span, 3)?;

    let keys = [1u64, 5, 9];
    let end = values.len() as u64;
    let expected = vec![(0, 3), (7, 12), (end, end)];
    assert_eq!(reference_results(&values, &keys), expected);
    check_all_variants(&span, &index, &keys, &expected)?;

    // absent keys inside and outside the key range
    let keys = [0u64, 1, 2, 3, 4, 5, 6, 7, 8];
    let expected = reference_results(&values, &keys);
    check_all_variants(&span, &index, &keys, &expected)?;
    Ok(())
}

#[test]
fn runs_longer_than_the_window_are_bracketed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = small_window_store();

    // one value occupies far more than a pivot window
    let mut values = Vec::new();
    for i in 0..20u64 {
        values.push(entry(3, i));
    }
    for i in 0..500u64 {
        values.push(entry(10, i));
    }
    for i in 0..7u64 {
        values.push(entry(25, i));
    }
    let span = store_span(&store, dir.path(), &values)?;
    let index = index_over(&span, 16)?;

    let keys = [3u64, 10, 25, 0, 5, 11, 30];
    let expected = reference_results(&values, &keys);
    check_all_variants(&span, &index, &keys, &expected)?;

    // the long run occupies exactly one index range
    let ten = index
        .entries()
        .iter()
        .filter(|e| e.low_key == 10 && e.high_key == 10)
        .count();
    assert_eq!(ten, 1);
    Ok(())
}

#[test]
fn randomized_queries_match_the_reference() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = small_window_store();
    let mut rng = SmallRng::seed_from_u64(0x5EED);

    let mut values = Vec::new();
    let mut key = 0u64;
    let mut seq = 0u64;
    while values.len() < 5000 {
        key += rng.random_range(1..6);
        for _ in 0..rng.random_range(1..12) {
            values.push(entry(key, seq));
            seq += 1;
        }
    }
    let span = store_span(&store, dir.path(), &values)?;
    let index = index_over(&span, 32)?;

    let max_key = values.last().unwrap().key;
    for round in 0..10 {
        let keys: Vec<u64> = (0..40)
            .map(|_| rng.random_range(0..max_key + 10))
            .collect();
        let expected = reference_results(&values, &keys);
        check_all_variants(&span, &index, &keys, &expected)
            .map_err(|e| e.context(format!("round {}", round)))?;
    }

    // correlated keys profit from cross updates but must stay correct
    let base = values[2500].key;
    let keys: Vec<u64> = (0..30).map(|i| base.saturating_sub(5) + i / 3).collect();
    let expected = reference_results(&values, &keys);
    check_all_variants(&span, &index, &keys, &expected)?;
    Ok(())
}

#[test]
fn empty_and_single_element_spans() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = small_window_store();

    let span = store_span(&store, dir.path(), &[])?;
    let cmp = cmp_keys as fn(&u64, &u64) -> Ordering;
    assert_eq!(
        equal_range_multiple_bin(&span, &[1, 2, 3], cmp, key_of)?,
        vec![(0, 0), (0, 0), (0, 0)]
    );

    let dir2 = tempfile::tempdir()?;
    let span = store_span(&store, dir2.path(), &[entry(42, 0)])?;
    let index = index_over(&span, 4)?;
    let keys = [41u64, 42, 43];
    let expected = vec![(1, 1), (0, 1), (1, 1)];
    assert_eq!(reference_results(&[entry(42, 0)], &keys), expected);
    check_all_variants(&span, &index, &keys, &expected)?;
    Ok(())
}

#[test]
fn sorted_batch_lookup_returns_results_in_key_order() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = small_window_store();
    let mut rng = SmallRng::seed_from_u64(7);

    let mut values = Vec::new();
    for key in 0..800u64 {
        for copy in 0..(key % 4 + 1) {
            values.push(entry(key * 2, copy));
        }
    }
    let span = store_span(&store, dir.path(), &values)?;
    let index = index_over(&span, 16)?;
    let cmp = cmp_keys as fn(&u64, &u64) -> Ordering;

    // a shuffled batch: the helper sorts internally but answers in order
    let keys: Vec<u64> = (0..100).map(|_| rng.random_range(0..1700)).collect();
    let expected = reference_results(&values, &keys);
    assert_eq!(
        equal_range_multiple_sorted(&span, &index, &keys, cmp, key_of)?,
        expected
    );
    Ok(())
}
