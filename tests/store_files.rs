use std::sync::Arc;

use anyhow::Result;
use bytemuck::{Pod, Zeroable};

use extstore::config::{PoolConfig, StoreConfig};
use extstore::store::{
    read_file, write_file, BackInserter, BinaryInputOutputFile, BinaryOutputFile, ExtVec,
    ImmutableBinaryFile, ImmutableSpan, ObservableBinaryOutputFile, OutputMode, Storage,
};
use extstore::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
struct Rec {
    key: u64,
    payload: u64,
}

fn rec(key: u64) -> Rec {
    Rec {
        key,
        payload: key.wrapping_mul(0x9E37_79B9_7F4A_7C15),
    }
}

#[test]
fn back_inserter_round_trips() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Storage::with_defaults();
    let path = dir.path().join("run");

    let file = BinaryOutputFile::create(&store, &path, OutputMode::Truncate)?;
    {
        // a buffer much smaller than the data forces many async appends
        let mut inserter = BackInserter::new(&file, 7);
        for i in 0..1000 {
            inserter.push(rec(i))?;
        }
        inserter.flush()?;
    }
    let span: ImmutableSpan<Rec> = ImmutableSpan::new(file.seal()?)?;
    assert_eq!(span.len(), 1000);

    // element access
    assert_eq!(span.front()?, rec(0));
    assert_eq!(span.back()?, rec(999));
    assert_eq!(span.get(123)?, rec(123));

    // sequential iteration with a buffer that does not divide the length
    let mut iter = span.iter(13);
    for i in 0..1000 {
        assert_eq!(iter.try_next()?, Some(rec(i)), "at {}", i);
    }
    assert_eq!(iter.try_next()?, None);
    Ok(())
}

#[test]
fn large_appends_write_through() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Storage::with_defaults();
    let path = dir.path().join("big");

    let data: Vec<Rec> = (0..500).map(rec).collect();
    let file = BinaryOutputFile::create(&store, &path, OutputMode::Truncate)?;
    {
        let mut inserter = BackInserter::new(&file, 8);
        inserter.push(rec(10_000))?;
        // larger than the whole buffer: flushed and written directly
        inserter.extend_from_slice(&data)?;
        inserter.push(rec(10_001))?;
        inserter.flush()?;
    }
    let span: ImmutableSpan<Rec> = ImmutableSpan::new(file.seal()?)?;
    assert_eq!(span.len(), 502);
    assert_eq!(span.get(0)?, rec(10_000));
    assert_eq!(span.get(1)?, rec(0));
    assert_eq!(span.get(500)?, rec(499));
    assert_eq!(span.get(501)?, rec(10_001));
    Ok(())
}

#[test]
fn subspans_narrow_the_view() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Storage::with_defaults();
    let path = dir.path().join("sub");
    let data: Vec<Rec> = (0..100).map(rec).collect();
    write_file(&store, &path, &data)?;

    let span: ImmutableSpan<Rec> = ImmutableSpan::new(ImmutableBinaryFile::open(&store, &path)?)?;
    let sub = span.subspan(10, 20);
    assert_eq!(sub.len(), 20);
    assert_eq!(sub.front()?, rec(10));
    assert_eq!(sub.back()?, rec(29));

    let mut seen = Vec::new();
    for r in sub.iter(6) {
        seen.push(r?.key);
    }
    assert_eq!(seen, (10..30).collect::<Vec<u64>>());
    Ok(())
}

#[test]
fn whole_file_helpers_round_trip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Storage::with_defaults();
    let path = dir.path().join("whole");
    let data: Vec<Rec> = (0..321).map(rec).collect();
    assert_eq!(write_file(&store, &path, &data)?, 321);
    let back: Vec<Rec> = read_file(&store, &path)?;
    assert_eq!(back, data);
    Ok(())
}

#[test]
fn truncated_record_file_is_malformed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Storage::with_defaults();
    let path = dir.path().join("odd");
    std::fs::write(&path, [0u8; 17])?;

    let file = ImmutableBinaryFile::open(&store, &path)?;
    match ImmutableSpan::<Rec>::new(file) {
        Err(Error::MalformedFile { size, .. }) => assert_eq!(size, 17),
        other => panic!("expected MalformedFile, got {:?}", other.map(|s| s.len())),
    }
    Ok(())
}

#[test]
fn out_of_range_access_fails() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Storage::with_defaults();
    let path = dir.path().join("short");
    write_file(&store, &path, &[rec(1), rec(2)])?;

    let span: ImmutableSpan<Rec> = ImmutableSpan::new(ImmutableBinaryFile::open(&store, &path)?)?;
    assert!(matches!(span.get(2), Err(Error::OutOfRange { .. })));
    assert!(span.get(1).is_ok());
    Ok(())
}

#[test]
fn ext_vec_reads_its_own_writes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Storage::with_defaults();
    let path = dir.path().join("vec");

    let file = BinaryInputOutputFile::create(&store, &path, OutputMode::Truncate)?;
    let mut vec: ExtVec<Rec> = ExtVec::new(file, 5);
    for i in 0..57 {
        vec.push(rec(i))?;
    }
    assert_eq!(vec.len(), 57);
    // reads flush the buffered tail first
    assert_eq!(vec.get(56)?, rec(56));
    assert_eq!(vec.front()?, rec(0));

    vec.truncate(10)?;
    assert_eq!(vec.len(), 10);
    vec.push(rec(77))?;
    assert_eq!(vec.get(10)?, rec(77));

    vec.clear()?;
    assert!(vec.is_empty());
    drop(vec);

    // reopening in append mode picks the length up from disk
    let file = BinaryInputOutputFile::create(&store, &path, OutputMode::Append)?;
    let mut vec: ExtVec<Rec> = ExtVec::new(file, 5);
    assert_eq!(vec.len(), 0);
    vec.extend_from_slice(&(0..20).map(rec).collect::<Vec<_>>())?;
    vec.flush()?;
    assert_eq!(vec.len(), 20);
    assert_eq!(vec.back()?, rec(19));
    Ok(())
}

#[test]
fn observable_output_sees_every_byte() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Storage::with_defaults();
    let path = dir.path().join("observed");

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let observer = seen.clone();
    let file = ObservableBinaryOutputFile::create(
        &store,
        &path,
        OutputMode::Truncate,
        move |bytes: &[u8]| observer.lock().unwrap().extend_from_slice(bytes),
    )?;
    {
        let mut inserter = BackInserter::new(&file, 4);
        for i in 0..33 {
            inserter.push(rec(i))?;
        }
        inserter.flush()?;
    }
    let sealed = file.seal()?;
    assert_eq!(*seen.lock().unwrap(), std::fs::read(sealed.path())?);
    Ok(())
}

#[test]
fn pooled_files_share_few_handles() -> Result<()> {
    let mut config = StoreConfig::default();
    config.pool = PoolConfig {
        max_open_pooled_files: 2,
        max_open_unpooled_files: 128,
    };
    let store = Storage::new(config);
    let dir = tempfile::tempdir()?;

    // interleave writes across more files than the pool can keep open
    let files: Vec<BinaryOutputFile> = (0..6)
        .map(|i| {
            BinaryOutputFile::create_pooled(
                &store,
                dir.path().join(format!("part{}", i)),
                OutputMode::Truncate,
            )
        })
        .collect::<Result<_, _>>()?;
    for round in 0..10u64 {
        for (i, file) in files.iter().enumerate() {
            let value = [rec(round * 100 + i as u64)];
            let written = file.append(bytemuck::cast_slice(&value));
            assert_eq!(written, std::mem::size_of::<Rec>());
        }
    }

    for (i, file) in files.into_iter().enumerate() {
        let span: ImmutableSpan<Rec> = ImmutableSpan::new(file.seal()?)?;
        assert_eq!(span.len(), 10);
        for round in 0..10u64 {
            assert_eq!(span.get(round)?, rec(round * 100 + i as u64));
        }
    }
    Ok(())
}

#[test]
fn sealing_preserves_reserved_files() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Storage::with_defaults();
    let path = dir.path().join("reserved");

    let file = BinaryOutputFile::create(&store, &path, OutputMode::Truncate)?;
    file.reserve(1 << 16)?;
    let data: Vec<Rec> = (0..10).map(rec).collect();
    file.append(bytemuck::cast_slice(&data));
    // sealing gives the reservation back before the read view measures
    let span: ImmutableSpan<Rec> = ImmutableSpan::new(file.seal()?)?;
    assert_eq!(span.len(), 10);
    assert_eq!(span.back()?, rec(9));
    Ok(())
}

#[test]
fn random_reader_caches_the_last_read() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Storage::with_defaults();
    let path = dir.path().join("rand");
    let data: Vec<Rec> = (0..50).map(rec).collect();
    write_file(&store, &path, &data)?;

    let span: ImmutableSpan<Rec> = ImmutableSpan::new(ImmutableBinaryFile::open(&store, &path)?)?;
    let mut reader = span.random_reader();
    for index in [0u64, 49, 25, 25, 25, 0, 1] {
        assert_eq!(reader.get(index)?, rec(index));
    }
    Ok(())
}
