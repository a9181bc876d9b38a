//! Blockwise export integration tests.
//!
//! Tests verify:
//! - Exports round-trip through memory and raw file stores
//! - Progress is monotonic and ends at 100
//! - Concurrency stays within the in-flight limit
//! - Cancellation stops dispatching promptly and failures win over cancellation

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use blockflow::{
    BlockStore, FlowError, MemoryStore, OpBlockwiseWriter, OpStoreReader, RawFileBackend,
    RawFileStore,
};

use super::test_utils::{patterned_u16, patterned_u8, CountingSource};

fn writer_for(source: &CountingSource, max_in_flight: usize, block_shape: &[usize]) -> Arc<OpBlockwiseWriter> {
    let writer = OpBlockwiseWriter::new(max_in_flight, 1 << 30);
    writer.input().connect(source.output()).unwrap();
    writer.block_shape().set_value(block_shape.to_vec()).unwrap();
    writer
}

fn record_progress(writer: &OpBlockwiseWriter) -> Arc<Mutex<Vec<u8>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    writer.progress().subscribe(move |percent| sink.lock().push(*percent));
    seen
}

// =============================================================================
// Round Trip
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_export_round_trip_through_memory_store() {
    let shape = [1, 1, 100, 100, 100];
    let source = CountingSource::new(patterned_u8(&shape));
    let writer = writer_for(&source, 4, &[1, 1, 32, 32, 32]);

    let store = Arc::new(MemoryStore::new("mem", writer.store_metadata().unwrap()));
    let summary = writer.run_export(store.clone()).await.unwrap();
    assert_eq!(summary.total_blocks, 64);
    assert_eq!(summary.block_shape, vec![1, 1, 32, 32, 32]);
    assert_eq!(summary.bytes_written, 1_000_000);
    assert_eq!(source.total_calls(), 64);

    let reader = OpStoreReader::new(store, None).unwrap();
    assert_eq!(reader.block_shape(), &[1, 1, 32, 32, 32]);
    let read_back = reader.output().get_all().wait().await.unwrap();
    assert_eq!(read_back, source.data());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_export_round_trip_through_raw_file() {
    let dir = tempfile::tempdir().unwrap();
    let partial = dir.path().join("volume.raw.partial");
    let output = dir.path().join("volume.raw");

    let shape = [1, 1, 100, 100, 100];
    let source = CountingSource::new(patterned_u8(&shape));
    let writer = writer_for(&source, 4, &[1, 1, 32, 32, 32]);

    let meta = writer.store_metadata().unwrap();
    let store = Arc::new(RawFileStore::create(&partial, &meta).await.unwrap());
    writer.run_export(store).await.unwrap();

    let backend = RawFileBackend::new();
    backend.commit(&partial, &output).await.unwrap();
    assert!(!partial.exists());
    assert!(output.exists());

    let store = Arc::new(RawFileStore::open(&output).await.unwrap());
    assert_eq!(store.metadata().shape, shape.to_vec());
    let reader = OpStoreReader::new(store, None).unwrap();
    let read_back = reader.output().get_all().wait().await.unwrap();
    assert_eq!(read_back, source.data());
}

// =============================================================================
// Progress
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_progress_is_monotonic_and_complete() {
    let source = CountingSource::new(patterned_u16(&[64, 16]));
    source.set_delay(Duration::from_millis(1));
    let writer = writer_for(&source, 3, &[1, 16]);
    let seen = record_progress(&writer);

    let store = Arc::new(MemoryStore::new("mem", writer.store_metadata().unwrap()));
    writer.run_export(store.clone()).await.unwrap();

    let seen = seen.lock().clone();
    assert_eq!(seen.first(), Some(&0));
    assert_eq!(seen.last(), Some(&100));
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "{seen:?}");
    // 64 blocks move the percentage on every completion
    assert_eq!(seen.len(), 65);

    assert!(source.max_concurrent() <= 3);
    assert_eq!(store.snapshot().unwrap(), source.data());
}

// =============================================================================
// Cancellation and Failure
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_stops_dispatching_blocks() {
    let source = CountingSource::new(patterned_u16(&[64, 16]));
    source.set_delay(Duration::from_millis(2));
    let writer = writer_for(&source, 2, &[1, 16]);

    let completed = Arc::new(AtomicUsize::new(0));
    {
        let completed = completed.clone();
        let weak: Weak<OpBlockwiseWriter> = Arc::downgrade(&writer);
        writer.progress().subscribe(move |percent| {
            if *percent == 0 {
                return;
            }
            if completed.fetch_add(1, Ordering::SeqCst) + 1 == 16 {
                if let Some(writer) = weak.upgrade() {
                    writer.cancel();
                }
            }
        });
    }

    let store = Arc::new(MemoryStore::new("mem", writer.store_metadata().unwrap()));
    let result = writer.run_export(store).await;
    assert!(matches!(result, Err(FlowError::Cancelled)));
    assert!(source.total_calls() <= 16 + 2, "{} blocks computed", source.total_calls());
    assert!(completed.load(Ordering::SeqCst) < 64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failure_is_reported_instead_of_cancellation() {
    let source = CountingSource::new(patterned_u16(&[32, 8]));
    source.set_failing(true);
    let writer = writer_for(&source, 4, &[4, 8]);

    let store = Arc::new(MemoryStore::new("mem", writer.store_metadata().unwrap()));
    let err = writer.run_export(store).await.unwrap_err();
    assert!(matches!(err, FlowError::Compute { .. }), "{err:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_at_first_progress_stops_before_any_block() {
    let source = CountingSource::new(patterned_u16(&[16, 8]));
    let writer = writer_for(&source, 2, &[2, 8]);
    {
        let weak: Weak<OpBlockwiseWriter> = Arc::downgrade(&writer);
        writer.progress().subscribe(move |percent| {
            if *percent == 0 {
                if let Some(writer) = weak.upgrade() {
                    writer.cancel();
                }
            }
        });
    }

    let store = Arc::new(MemoryStore::new("mem", writer.store_metadata().unwrap()));
    let result = writer.run_export(store).await;
    assert!(matches!(result, Err(FlowError::Cancelled)));
    assert_eq!(source.total_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_writer_can_export_again_after_cancel() {
    let source = CountingSource::new(patterned_u16(&[8, 8]));
    let writer = writer_for(&source, 2, &[2, 8]);
    writer.cancel();

    // A cancel before the export starts does not carry over
    let store = Arc::new(MemoryStore::new("mem", writer.store_metadata().unwrap()));
    let summary = writer.run_export(store.clone()).await.unwrap();
    assert_eq!(summary.total_blocks, 4);
    assert_eq!(store.snapshot().unwrap(), source.data());
}
