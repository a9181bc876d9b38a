//! Request integration tests.
//!
//! Tests verify:
//! - Nested waits deeper than the worker pool do not deadlock
//! - Cancelling a root cancels its running children
//! - Notifications fire exactly once per terminal event
//! - Blocking waits from outside the runtime

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use blockflow::{FlowError, Phase, Request, RequestContext, RequestPool};

fn countdown(ctx: RequestContext, depth: usize) -> BoxFuture<'static, Result<usize, FlowError>> {
    Box::pin(async move {
        if depth == 0 {
            return Ok(0);
        }
        let child = ctx.child(move |ctx| countdown(ctx, depth - 1));
        Ok(child.wait().await? + 1)
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_nested_waits_exceed_worker_count() {
    let requests: Vec<_> = (0..8)
        .map(|_| Request::new(|ctx| countdown(ctx, 40)))
        .collect();
    for request in &requests {
        request.submit().unwrap();
    }
    for request in &requests {
        assert_eq!(request.wait().await.unwrap(), 40);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_root_stops_children() {
    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));

    let root = {
        let started = started.clone();
        let finished = finished.clone();
        Request::new(move |ctx| async move {
            let mut pool = RequestPool::new();
            for _ in 0..4 {
                let started = started.clone();
                let finished = finished.clone();
                pool.add(ctx.child(move |ctx| async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    for _ in 0..100 {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        ctx.check_cancelled()?;
                    }
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }));
            }
            pool.wait_all().await.map(|_| ())
        })
    };

    root.submit().unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    root.cancel();

    assert!(matches!(root.wait().await, Err(FlowError::Cancelled)));
    assert_eq!(root.phase(), Phase::Cancelled);
    // Give cooperative children time to observe the flag
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 0);
    assert!(started.load(Ordering::SeqCst) <= 4);
}

#[tokio::test]
async fn test_notifications_fire_once() {
    let finished = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let cancelled = Arc::new(AtomicUsize::new(0));

    let request = Request::new(|_| async { Ok(5u32) });
    {
        let finished = finished.clone();
        request.notify_finished(move |value| {
            assert_eq!(*value, 5);
            finished.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let failed = failed.clone();
        request.notify_failed(move |_| {
            failed.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let cancelled = cancelled.clone();
        request.notify_cancelled(move || {
            cancelled.fetch_add(1, Ordering::SeqCst);
        });
    }

    assert_eq!(request.wait().await.unwrap(), 5);
    assert_eq!(request.wait().await.unwrap(), 5);
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(failed.load(Ordering::SeqCst), 0);
    assert_eq!(cancelled.load(Ordering::SeqCst), 0);

    // Registering after completion runs the callback immediately
    {
        let finished = finished.clone();
        request.notify_finished(move |_| {
            finished.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert_eq!(finished.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failure_reaches_every_waiter() {
    let request: Request<u8> = Request::new(|_| async { Err(FlowError::compute("OpTest", "boom")) });
    let other = request.clone();
    let (a, b) = tokio::join!(request.wait(), other.wait());
    assert_eq!(a, b);
    assert!(matches!(a, Err(FlowError::Compute { .. })));
    assert_eq!(request.phase(), Phase::Failed);
}

#[tokio::test]
async fn test_pool_failure_cancels_siblings() {
    let mut pool = RequestPool::new();
    let slow = Request::new(|ctx| async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        ctx.check_cancelled()?;
        Ok(1u8)
    });
    pool.add(slow.clone());
    pool.add(Request::new(|_| async { Err(FlowError::compute("OpTest", "fast failure")) }));

    let started = std::time::Instant::now();
    let err = pool.wait_all().await.unwrap_err();
    assert!(matches!(err, FlowError::Compute { .. }));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(slow.is_cancelled());
}

#[test]
fn test_wait_blocking_outside_runtime() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    let request = Request::on_runtime(runtime.handle().clone(), |ctx| async move {
        let child = ctx.child(|_| async { Ok(20u64) });
        Ok(child.wait().await? * 2 + 2)
    });
    assert_eq!(request.wait_blocking().unwrap(), 42);
}

#[test]
fn test_submit_without_runtime_fails() {
    let request = Request::new(|_| async { Ok(()) });
    assert!(matches!(request.submit(), Err(FlowError::NoRuntime)));
}
