//! Tests for Engine
//!
//! These tests verify:
//! - Coalesced inserts (early trip, timer, flush)
//! - Generation numbering
//! - Queries through the public API, including generation 0 = latest
//! - Concurrent writers on one stream
//! - Engine lifecycle (open/close/reopen)
//! - Commit failures reach sync callers and never wedge a stream

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use strata::bstore::{
    BlockStore, MemorySuperblockStore, Superblock, SuperblockStore, LATEST_GENERATION,
};
use strata::coalesce::Coalescer;
use strata::config::{Config, SyncStrategy};
use strata::engine::Engine;
use strata::{ChangedRange, Record, StrataError, Uuid, MAXIMUM_TIME, MINIMUM_TIME};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn test_config(temp_dir: &TempDir) -> Config {
    Config::builder()
        .data_dir(temp_dir.path())
        .sync_strategy(SyncStrategy::OsBuffered)
        .transaction_coalesce_interval_ms(60_000) // Only flush / early trip commit
        .transaction_coalesce_early_trip(100)
        .build()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn setup_temp_engine() -> (TempDir, Engine) {
    init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(test_config(&temp_dir)).unwrap();
    (temp_dir, engine)
}

fn setup_temp_engine_without_coalescing() -> (TempDir, Engine) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .sync_strategy(SyncStrategy::OsBuffered)
        .transaction_coalesce_enable(false)
        .build();
    let engine = Engine::open(config).unwrap();
    (temp_dir, engine)
}

fn ramp(start: i64, count: i64) -> Vec<Record> {
    (start..start + count)
        .map(|t| Record::new(t, t as f64))
        .collect()
}

fn all_values(engine: &Engine, stream: Uuid) -> Vec<Record> {
    engine
        .query_values(stream, MINIMUM_TIME, MAXIMUM_TIME + 1, 0)
        .unwrap()
        .0
}

/// In-memory superblocks whose publishes fail while `failing` is set
struct FailingSuperblocks {
    inner: MemorySuperblockStore,
    failing: Arc<AtomicBool>,
}

impl SuperblockStore for FailingSuperblocks {
    fn load(&self, stream: &Uuid, generation: u64) -> strata::Result<Option<Superblock>> {
        self.inner.load(stream, generation)
    }

    fn publish(&self, superblock: Superblock) -> strata::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StrataError::Storage("superblock registry offline".to_string()));
        }
        self.inner.publish(superblock)
    }

    fn unlink(&self, stream: &Uuid, from: u64, to: u64) -> strata::Result<u64> {
        self.inner.unlink(stream, from, to)
    }

    fn generations(&self, stream: &Uuid) -> strata::Result<Vec<Superblock>> {
        self.inner.generations(stream)
    }

    fn live(&self) -> strata::Result<Vec<Superblock>> {
        self.inner.live()
    }
}

fn setup_failing_engine(config: Config) -> (Engine, Arc<AtomicBool>) {
    init_tracing();
    let failing = Arc::new(AtomicBool::new(false));
    let superblocks = FailingSuperblocks {
        inner: MemorySuperblockStore::new(),
        failing: Arc::clone(&failing),
    };
    let engine = Engine::with_superblock_store(config, Box::new(superblocks)).unwrap();
    (engine, failing)
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_engine_open_creates_files() {
    let temp_dir = TempDir::new().unwrap();
    let data_dir = temp_dir.path().join("tsdb");

    let config = Config::builder().data_dir(&data_dir).build();
    let _engine = Engine::open(config).unwrap();

    assert!(data_dir.join("blocks.dat").exists());
    assert!(data_dir.join("superblocks.log").exists());
}

#[test]
fn test_engine_open_rejects_invalid_config() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .datablock_cache_size(0)
        .build();

    let err = Engine::open(config).err().unwrap();
    assert!(matches!(err, StrataError::Config(_)));
}

#[test]
fn test_close_flushes_buffers() {
    let temp_dir = TempDir::new().unwrap();
    let stream = Uuid::new_v4();

    let engine = Engine::open(test_config(&temp_dir)).unwrap();
    engine.insert_values(stream, &ramp(0, 10), false).unwrap();
    assert_eq!(engine.buffered_streams(), 1);
    engine.close().unwrap();

    let engine = Engine::open(test_config(&temp_dir)).unwrap();
    assert_eq!(engine.query_generation(stream).unwrap(), 1);
    assert_eq!(all_values(&engine, stream), ramp(0, 10));
}

#[test]
fn test_reopen_recovers_all_generations() {
    let temp_dir = TempDir::new().unwrap();
    let stream = Uuid::new_v4();

    {
        let engine = Engine::open(test_config(&temp_dir)).unwrap();
        for batch in 0..3 {
            engine
                .insert_values(stream, &ramp(batch * 10, 10), true)
                .unwrap();
        }
        engine.close().unwrap();
    }

    let engine = Engine::open(test_config(&temp_dir)).unwrap();
    assert_eq!(engine.query_generation(stream).unwrap(), 3);
    for generation in 1..=3u64 {
        let (values, resolved) = engine
            .query_values(stream, 0, 1000, generation)
            .unwrap();
        assert_eq!(resolved, generation);
        assert_eq!(values.len(), 10 * generation as usize);
    }
}

#[test]
fn test_engine_with_memory_superblocks() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::with_superblock_store(
        test_config(&temp_dir),
        Box::new(MemorySuperblockStore::new()),
    )
    .unwrap();
    let stream = Uuid::new_v4();

    engine.insert_values(stream, &ramp(0, 5), true).unwrap();

    assert_eq!(all_values(&engine, stream), ramp(0, 5));
}

// =============================================================================
// Coalescing Tests
// =============================================================================

#[test]
fn test_monotonic_generations() {
    let (_temp, engine) = setup_temp_engine();
    let stream = Uuid::new_v4();

    for n in 1..=4u64 {
        engine
            .insert_values(stream, &[Record::new(n as i64, 1.0)], true)
            .unwrap();
        assert_eq!(engine.query_generation(stream).unwrap(), n);
    }
}

#[test]
fn test_query_generation_unknown_stream() {
    let (_temp, engine) = setup_temp_engine();
    let stream = Uuid::new_v4();

    assert!(matches!(
        engine.query_generation(stream),
        Err(StrataError::NoSuchStream(s)) if s == stream
    ));
}

#[test]
fn test_early_trip_commits_synchronously() {
    let (_temp, engine) = setup_temp_engine();
    let stream = Uuid::new_v4();

    engine.insert_values(stream, &ramp(0, 99), false).unwrap();
    assert!(engine.query_generation(stream).is_err());

    engine.insert_values(stream, &ramp(99, 1), false).unwrap();

    assert_eq!(engine.query_generation(stream).unwrap(), 1);
    assert_eq!(all_values(&engine, stream), ramp(0, 100));
    assert_eq!(engine.buffered_streams(), 0);
}

#[test]
fn test_oversized_batch_commits_immediately() {
    let (_temp, engine) = setup_temp_engine();
    let stream = Uuid::new_v4();

    engine.insert_values(stream, &ramp(0, 250), false).unwrap();

    assert_eq!(engine.query_generation(stream).unwrap(), 1);
    assert_eq!(all_values(&engine, stream).len(), 250);
}

#[test]
fn test_buffered_records_invisible_until_commit() {
    let (_temp, engine) = setup_temp_engine();
    let stream = Uuid::new_v4();

    engine.insert_values(stream, &ramp(0, 10), false).unwrap();
    assert!(all_values(&engine, stream).is_empty());

    engine.flush(stream).unwrap();
    assert_eq!(all_values(&engine, stream).len(), 10);
}

#[test]
fn test_flush_is_idempotent() {
    let (_temp, engine) = setup_temp_engine();
    let stream = Uuid::new_v4();
    engine.insert_values(stream, &ramp(0, 10), false).unwrap();

    engine.flush(stream).unwrap();
    engine.flush(stream).unwrap();

    assert_eq!(engine.query_generation(stream).unwrap(), 1);
}

#[test]
fn test_flush_unknown_stream() {
    let (_temp, engine) = setup_temp_engine();

    assert!(matches!(
        engine.flush(Uuid::new_v4()),
        Err(StrataError::NoSuchStream(_))
    ));
}

#[test]
fn test_sync_insert_is_visible_on_return() {
    let (_temp, engine) = setup_temp_engine();
    let stream = Uuid::new_v4();

    engine.insert_values(stream, &ramp(0, 3), true).unwrap();

    assert_eq!(all_values(&engine, stream), ramp(0, 3));
}

#[test]
fn test_timer_commits_open_buffer() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .sync_strategy(SyncStrategy::OsBuffered)
        .transaction_coalesce_interval_ms(20)
        .build();
    let engine = Engine::open(config).unwrap();
    let stream = Uuid::new_v4();

    engine.insert_values(stream, &ramp(0, 10), false).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while engine.query_generation(stream).is_err() {
        assert!(Instant::now() < deadline, "timer never committed");
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(engine.query_generation(stream).unwrap(), 1);
    assert_eq!(all_values(&engine, stream), ramp(0, 10));
}

#[test]
fn test_early_trip_cancels_timer() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .sync_strategy(SyncStrategy::OsBuffered)
        .transaction_coalesce_interval_ms(50)
        .transaction_coalesce_early_trip(10)
        .build();
    let engine = Engine::open(config).unwrap();
    let stream = Uuid::new_v4();

    engine.insert_values(stream, &ramp(0, 5), false).unwrap();
    engine.insert_values(stream, &ramp(5, 5), false).unwrap();
    assert_eq!(engine.query_generation(stream).unwrap(), 1);

    thread::sleep(Duration::from_millis(200));
    assert_eq!(engine.query_generation(stream).unwrap(), 1);
}

#[test]
fn test_out_of_range_insert_rejected() {
    let (_temp, engine) = setup_temp_engine();
    let stream = Uuid::new_v4();

    let err = engine
        .insert_values(stream, &[Record::new(0, 1.0), Record::new(MINIMUM_TIME - 1, 1.0)], true)
        .unwrap_err();

    assert!(matches!(err, StrataError::InvalidArgument(_)));
    assert_eq!(engine.buffered_streams(), 0);
    assert!(engine.query_generation(stream).is_err());
}

#[test]
fn test_coalescing_disabled_commits_each_insert() {
    let (_temp, engine) = setup_temp_engine_without_coalescing();
    let stream = Uuid::new_v4();

    engine.insert_values(stream, &ramp(0, 5), false).unwrap();
    engine.insert_values(stream, &ramp(5, 5), false).unwrap();

    assert_eq!(engine.query_generation(stream).unwrap(), 2);
    assert_eq!(engine.buffered_streams(), 0);
    assert_eq!(all_values(&engine, stream), ramp(0, 10));
}

#[test]
fn test_concurrent_writers_same_stream() {
    let (_temp, engine) = setup_temp_engine();
    let stream = Uuid::new_v4();

    thread::scope(|s| {
        for w in 0..8i64 {
            let engine = &engine;
            s.spawn(move || {
                for chunk in 0..25i64 {
                    let base = w * 10_000 + chunk * 20;
                    engine.insert_values(stream, &ramp(base, 20), false).unwrap();
                }
            });
        }
    });
    let _ = engine.flush(stream);

    let values = all_values(&engine, stream);
    assert_eq!(values.len(), 8 * 25 * 20);
    assert!(values.windows(2).all(|w| w[0].time < w[1].time));
}

#[test]
fn test_concurrent_writers_distinct_streams() {
    let (_temp, engine) = setup_temp_engine();
    let streams: Vec<Uuid> = (0..6).map(|_| Uuid::new_v4()).collect();

    thread::scope(|s| {
        for stream in &streams {
            let engine = &engine;
            s.spawn(move || {
                for batch in 0..5 {
                    engine
                        .insert_values(*stream, &ramp(batch * 30, 30), true)
                        .unwrap();
                }
            });
        }
    });

    for stream in &streams {
        assert_eq!(all_values(&engine, *stream), ramp(0, 150));
        assert_eq!(engine.query_generation(*stream).unwrap(), 5);
    }
}

// =============================================================================
// Query Tests
// =============================================================================

#[test]
fn test_query_values_at_older_generation() {
    let (_temp, engine) = setup_temp_engine();
    let stream = Uuid::new_v4();
    engine.insert_values(stream, &ramp(0, 5), true).unwrap();
    engine.insert_values(stream, &ramp(5, 5), true).unwrap();

    let (old, generation) = engine.query_values(stream, 0, 100, 1).unwrap();
    assert_eq!(generation, 1);
    assert_eq!(old, ramp(0, 5));

    let (new, generation) = engine.query_values(stream, 0, 100, 0).unwrap();
    assert_eq!(generation, 2);
    assert_eq!(new, ramp(0, 10));
}

#[test]
fn test_query_missing_generation() {
    let (_temp, engine) = setup_temp_engine();
    let stream = Uuid::new_v4();
    engine.insert_values(stream, &ramp(0, 5), true).unwrap();

    assert!(matches!(
        engine.query_values(stream, 0, 100, 9),
        Err(StrataError::NoSuchGeneration { generation: 9, .. })
    ));
}

#[test]
fn test_query_statistical_values() {
    let (_temp, engine) = setup_temp_engine();
    let stream = Uuid::new_v4();
    engine
        .insert_values(
            stream,
            &[
                Record::new(0, 1.0),
                Record::new(1, 2.0),
                Record::new(2, 3.0),
                Record::new(3, 4.0),
            ],
            true,
        )
        .unwrap();

    let (stats, generation) = engine
        .query_statistical_values(stream, 0, 4, 0, 2)
        .unwrap();

    assert_eq!(generation, 1);
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].count, 4);
    assert_eq!(stats[0].min, 1.0);
    assert_eq!(stats[0].mean, 2.5);
    assert_eq!(stats[0].max, 4.0);
}

#[test]
fn test_query_nearest_value() {
    let (_temp, engine) = setup_temp_engine();
    let stream = Uuid::new_v4();
    engine
        .insert_values(stream, &[Record::new(10, 1.0), Record::new(20, 2.0)], true)
        .unwrap();

    let (record, generation) = engine.query_nearest_value(stream, 15, false, 0).unwrap();
    assert_eq!(record, Record::new(20, 2.0));
    assert_eq!(generation, 1);

    assert!(matches!(
        engine.query_nearest_value(stream, 5, true, 0),
        Err(StrataError::NoSuchPoint)
    ));
}

#[test]
fn test_query_changed_ranges() {
    let (_temp, engine) = setup_temp_engine();
    let stream = Uuid::new_v4();
    engine.insert_values(stream, &ramp(0, 10), true).unwrap();
    engine
        .insert_values(stream, &[Record::new(50, 0.0)], true)
        .unwrap();

    let (ranges, generation) = engine.query_changed_ranges(stream, 1, 0, 0).unwrap();

    assert_eq!(generation, 2);
    assert_eq!(ranges, vec![ChangedRange { start: 50, end: 51 }]);
}

// =============================================================================
// Delete Tests
// =============================================================================

#[test]
fn test_delete_range() {
    let (_temp, engine) = setup_temp_engine();
    let stream = Uuid::new_v4();
    engine.insert_values(stream, &ramp(0, 20), true).unwrap();

    let generation = engine.delete_range(stream, 5, 15).unwrap();

    assert_eq!(generation, 2);
    let times: Vec<i64> = all_values(&engine, stream).iter().map(|r| r.time).collect();
    assert_eq!(times, vec![0, 1, 2, 3, 4, 15, 16, 17, 18, 19]);
}

#[test]
fn test_delete_range_commits_pending_inserts_first() {
    let (_temp, engine) = setup_temp_engine();
    let stream = Uuid::new_v4();
    engine.insert_values(stream, &ramp(0, 20), false).unwrap();

    let generation = engine.delete_range(stream, 0, 10).unwrap();

    assert_eq!(generation, 2);
    assert_eq!(all_values(&engine, stream), ramp(10, 10));
    assert_eq!(engine.buffered_streams(), 0);
}

#[test]
fn test_timer_commits_many_streams() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .sync_strategy(SyncStrategy::OsBuffered)
        .transaction_coalesce_interval_ms(20)
        .build();
    let engine = Engine::open(config).unwrap();
    let streams: Vec<Uuid> = (0..50).map(|_| Uuid::new_v4()).collect();

    for (i, stream) in streams.iter().enumerate() {
        engine
            .insert_values(*stream, &ramp(i as i64, 3), false)
            .unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while engine.buffered_streams() > 0 {
        assert!(Instant::now() < deadline, "timers never committed");
        thread::sleep(Duration::from_millis(10));
    }
    for (i, stream) in streams.iter().enumerate() {
        assert_eq!(engine.query_generation(*stream).unwrap(), 1);
        assert_eq!(all_values(&engine, *stream), ramp(i as i64, 3));
    }
}

// =============================================================================
// Failure Tests
// =============================================================================

#[test]
fn test_sync_insert_reports_failed_commit() {
    let temp_dir = TempDir::new().unwrap();
    let (engine, failing) = setup_failing_engine(test_config(&temp_dir));
    let stream = Uuid::new_v4();
    engine.insert_values(stream, &ramp(0, 5), true).unwrap();

    failing.store(true, Ordering::SeqCst);
    let result = engine.insert_values(stream, &ramp(5, 5), true);

    assert!(result.is_err());
    assert_eq!(engine.query_generation(stream).unwrap(), 1);
    assert_eq!(all_values(&engine, stream), ramp(0, 5));
    assert_eq!(engine.buffered_streams(), 0);
}

#[test]
fn test_sync_insert_racing_background_commits_never_acks_lost_records() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .sync_strategy(SyncStrategy::OsBuffered)
        .transaction_coalesce_interval_ms(1)
        .transaction_coalesce_early_trip(100)
        .build();
    let (engine, failing) = setup_failing_engine(config);
    let engine = Arc::new(engine);
    let stream = Uuid::new_v4();
    engine.insert_values(stream, &ramp(0, 1), true).unwrap();
    failing.store(true, Ordering::SeqCst);

    let stop = Arc::new(AtomicBool::new(false));
    let background = {
        let engine = Arc::clone(&engine);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut t = 1_000_000i64;
            while !stop.load(Ordering::Relaxed) {
                let _ = engine.insert_values(stream, &[Record::new(t, 0.0)], false);
                t += 1;
            }
        })
    };

    let mut acked = 0;
    for i in 1..5_000i64 {
        if engine
            .insert_values(stream, &[Record::new(i, i as f64)], true)
            .is_ok()
        {
            acked += 1;
        }
    }

    stop.store(true, Ordering::SeqCst);
    background.join().unwrap();
    assert_eq!(acked, 0);
    assert_eq!(engine.query_generation(stream).unwrap(), 1);
    assert_eq!(all_values(&engine, stream), ramp(0, 1));
}

#[test]
fn test_panicking_writer_does_not_wedge_stream() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir);
    let bs = Arc::new(BlockStore::open(&config).unwrap());
    let coalescer = Coalescer::new(Arc::clone(&bs), &config).unwrap();
    let stream = Uuid::new_v4();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        coalescer.with_stream_exclusive(stream, || -> strata::Result<()> {
            panic!("writer blew up")
        })
    }));

    assert!(outcome.is_err());
    assert_eq!(coalescer.buffered_streams(), 0);

    let pending = coalescer
        .insert_values(stream, &ramp(0, 5))
        .unwrap()
        .expect("records should be buffered");
    coalescer.commit_pending(stream, pending).unwrap();
    let latest = bs
        .load_superblock(&stream, LATEST_GENERATION)
        .unwrap()
        .unwrap()
        .generation;
    assert_eq!(latest, 1);
}
