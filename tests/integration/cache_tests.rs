//! Blocked cache integration tests.
//!
//! Tests verify:
//! - Reading through the cache equals reading upstream directly
//! - Repeated reads compute every block once
//! - Dirty regions recompute only the blocks they touch
//! - Blocks dirtied mid-computation are delivered but not kept
//! - Concurrent overlapping reads never compute a block twice
//! - Fixed mode, eviction and failure recovery

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use blockflow::{
    FlowError, OpArraySource, OpBlockedArrayCache, Roi, DEFAULT_CACHE_MEMORY,
};

use super::test_utils::{patterned_u16, patterned_u8, roi, CountingSource};

fn cached(source: &CountingSource, block_shape: &[usize]) -> Arc<OpBlockedArrayCache> {
    let cache = OpBlockedArrayCache::new(DEFAULT_CACHE_MEMORY);
    cache.input().connect(source.output()).unwrap();
    cache.block_shape().set_value(block_shape.to_vec()).unwrap();
    cache
}

// =============================================================================
// Round Trip
// =============================================================================

#[tokio::test]
async fn test_five_axis_round_trip() {
    let shape = [2, 50, 64, 64, 3];
    let data = patterned_u8(&shape);
    let source = OpArraySource::new(Some(data.clone())).unwrap();

    let cache = OpBlockedArrayCache::new(DEFAULT_CACHE_MEMORY);
    cache.input().connect(source.output()).unwrap();
    cache.block_shape().set_value(vec![1usize, 16, 16, 16, 3]).unwrap();

    let through_cache = cache.output().get_all().wait().await.unwrap();
    assert_eq!(through_cache, data);

    // 2 x ceil(50/16) x 4 x 4 x 1
    assert_eq!(cache.stats().ready_blocks, 2 * 4 * 4 * 4);

    let part = roi(&[1, 10, 5, 40, 1], &[2, 45, 60, 64, 3]);
    let direct = source.output().get(part.clone()).wait().await.unwrap();
    assert_eq!(cache.output().get(part).wait().await.unwrap(), direct);
}

// =============================================================================
// Idempotence
// =============================================================================

#[tokio::test]
async fn test_repeated_read_computes_once() {
    let source = CountingSource::new(patterned_u16(&[40, 40]));
    let cache = cached(&source, &[10, 10]);
    let region = roi(&[5, 5], &[35, 25]);

    let first = cache.output().get(region.clone()).wait().await.unwrap();
    let after_first = source.total_calls();
    // Block rows 0..4, block columns 0..3
    assert_eq!(after_first, 4 * 3);

    let second = cache.output().get(region).wait().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(source.total_calls(), after_first);
    assert!(source.calls().values().all(|&n| n == 1));
}

// =============================================================================
// Dirty Propagation
// =============================================================================

#[tokio::test]
async fn test_dirty_region_recomputes_only_touched_blocks() {
    let source = CountingSource::new(patterned_u16(&[30, 30]));
    let cache = cached(&source, &[10, 10]);
    cache.output().get_all().wait().await.unwrap();
    assert_eq!(source.total_calls(), 9);

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        cache.output().notify_dirty(move |roi| seen.lock().push(roi.clone()));
    }

    source.reset_tracking();
    let dirty = roi(&[12, 12], &[18, 25]);
    source.output().set_dirty(&dirty);
    assert_eq!(*seen.lock(), vec![dirty]);
    assert_eq!(cache.stats().ready_blocks, 7);

    cache.output().get_all().wait().await.unwrap();
    assert_eq!(source.total_calls(), 2);
    assert_eq!(source.calls_for(&roi(&[10, 10], &[20, 20])), 1);
    assert_eq!(source.calls_for(&roi(&[10, 20], &[20, 30])), 1);
    assert_eq!(source.calls_for(&roi(&[0, 0], &[10, 10])), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_block_dirtied_while_computing_is_discarded() {
    let source = CountingSource::new(patterned_u16(&[20, 10]));
    source.set_delay(Duration::from_millis(100));
    let cache = cached(&source, &[10, 10]);
    let block = roi(&[0, 0], &[10, 10]);

    let first = cache.output().get(block.clone());
    first.submit().unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while source.calls_for(&block) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(cache.stats().computing_blocks, 1);

    source.output().set_dirty(&roi(&[2, 2], &[4, 4]));

    // The waiter that started the computation still gets its result
    let data = first.wait().await.unwrap();
    assert_eq!(data, source.data().extract(&block).unwrap());
    // but it is not kept
    let stats = cache.stats();
    assert_eq!(stats.ready_blocks, 0);
    assert_eq!(stats.computing_blocks, 0);

    source.set_delay(Duration::ZERO);
    cache.output().get(block.clone()).wait().await.unwrap();
    assert_eq!(source.calls_for(&block), 2);
    assert_eq!(cache.stats().ready_blocks, 1);
}

#[tokio::test]
async fn test_dirty_outside_array_is_ignored() {
    let source = CountingSource::new(patterned_u16(&[10, 10]));
    let cache = cached(&source, &[5, 5]);
    cache.output().get_all().wait().await.unwrap();

    source.output().set_dirty(&roi(&[20, 20], &[30, 30]));
    assert_eq!(cache.stats().ready_blocks, 4);
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_overlapping_reads_compute_each_block_once() {
    let shape = [64usize, 64];
    let source = CountingSource::new(patterned_u16(&shape));
    source.set_delay(Duration::from_millis(2));
    let cache = cached(&source, &[8, 8]);

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut requests = Vec::new();
    let mut regions = Vec::new();
    for _ in 0..100 {
        let start: Vec<i64> = shape.iter().map(|&s| rng.gen_range(0..s as i64 - 1)).collect();
        let stop: Vec<i64> = start
            .iter()
            .zip(&shape)
            .map(|(&a, &s)| rng.gen_range(a + 1..=s as i64))
            .collect();
        let region = Roi::new(start, stop).unwrap();
        let request = cache.output().get(region.clone());
        request.submit().unwrap();
        requests.push(request);
        regions.push(region);
    }

    let reference = source.data();
    for (request, region) in requests.iter().zip(&regions) {
        let data = request.wait().await.unwrap();
        assert_eq!(data, reference.extract(region).unwrap());
    }

    let calls = source.calls();
    assert!(!calls.is_empty());
    for (block, count) in &calls {
        assert_eq!(*count, 1, "block {block} computed {count} times");
    }
    assert_eq!(cache.stats().computing_blocks, 0);
}

// =============================================================================
// Fixed Mode
// =============================================================================

#[tokio::test]
async fn test_fixed_cache_defers_dirty_until_released() {
    let source = CountingSource::new(patterned_u16(&[20, 20]));
    let cache = cached(&source, &[10, 10]);
    let before = cache.output().get(roi(&[0, 0], &[10, 20])).wait().await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        cache.output().notify_dirty(move |roi| seen.lock().push(roi.clone()));
    }

    cache.fix_at_current().set_value(true).unwrap();
    source.reset_tracking();
    source.output().set_dirty(&roi(&[0, 0], &[5, 5]));
    assert!(seen.lock().is_empty());

    // Cached blocks are served as they were; missing ones read as zeros
    let frozen = cache.output().get_all().wait().await.unwrap();
    assert_eq!(source.total_calls(), 0);
    assert_eq!(frozen.extract(&roi(&[0, 0], &[10, 20])).unwrap(), before);
    assert_eq!(frozen.get_f64(&[15, 15]), Some(0.0));

    cache.fix_at_current().set_value(false).unwrap();
    // Bounding box of the dirtied block and the two blocks read as zeros
    assert_eq!(*seen.lock(), vec![roi(&[0, 0], &[20, 20])]);

    let thawed = cache.output().get_all().wait().await.unwrap();
    assert_eq!(thawed, source.data());
    assert_eq!(source.total_calls(), 3);
}

// =============================================================================
// Memory
// =============================================================================

#[tokio::test]
async fn test_eviction_respects_budget() {
    let source = CountingSource::new(patterned_u16(&[32, 32]));
    // Each 8x8 u16 block is 128 bytes; room for four of them
    let cache = OpBlockedArrayCache::new(4 * 128);
    cache.input().connect(source.output()).unwrap();
    cache.block_shape().set_value(vec![8usize, 8]).unwrap();

    let all = cache.output().get_all().wait().await.unwrap();
    assert_eq!(all, source.data());
    let stats = cache.stats();
    assert!(stats.bytes <= stats.max_bytes);
    assert_eq!(stats.ready_blocks, 4);

    // Evicted blocks are recomputed on demand, resident ones are not
    source.reset_tracking();
    let again = cache.output().get_all().wait().await.unwrap();
    assert_eq!(again, all);
    assert_eq!(source.total_calls(), 12);
}

// =============================================================================
// Failure Recovery
// =============================================================================

#[tokio::test]
async fn test_failed_block_can_be_retried() {
    let source = CountingSource::new(patterned_u16(&[10, 10]));
    let cache = cached(&source, &[10, 10]);

    source.set_failing(true);
    let err = cache.output().get_all().wait().await.unwrap_err();
    assert!(matches!(err, FlowError::Compute { .. }));
    assert_eq!(cache.stats().ready_blocks, 0);
    assert_eq!(cache.stats().computing_blocks, 0);

    source.set_failing(false);
    let data = cache.output().get_all().wait().await.unwrap();
    assert_eq!(data, source.data());
    assert_eq!(source.total_calls(), 2);
}
