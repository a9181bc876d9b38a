//! Test utilities for integration tests.
//!
//! This module provides a mock upstream operator that records every region it
//! computes, plus helpers for building test arrays.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use blockflow::{
    configure, ArrayBuffer, FlowError, InputSlot, MetadataError, Metadata, Operator, OutputSlot,
    RequestContext, Roi,
};

// =============================================================================
// Counting Source with Request Tracking
// =============================================================================

/// A source operator that tracks every `execute` call.
///
/// This is useful for verifying that caches compute each block once and only
/// recompute what was dirtied.
pub struct CountingSource {
    data: RwLock<ArrayBuffer>,
    ideal_block_shape: Option<Vec<usize>>,
    output: OutputSlot,
    calls: Mutex<HashMap<Roi, usize>>,
    total: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    failing: AtomicBool,
}

impl CountingSource {
    pub fn new(data: ArrayBuffer) -> Arc<Self> {
        Self::build(data, None)
    }

    /// Advertise `block_shape` as the ideal block shape.
    pub fn with_ideal_block_shape(data: ArrayBuffer, block_shape: Vec<usize>) -> Arc<Self> {
        Self::build(data, Some(block_shape))
    }

    fn build(data: ArrayBuffer, ideal_block_shape: Option<Vec<usize>>) -> Arc<Self> {
        let op = Arc::new_cyclic(|weak: &Weak<Self>| {
            let op: Weak<dyn Operator> = weak.clone();
            Self {
                data: RwLock::new(data),
                ideal_block_shape,
                output: OutputSlot::new("Output", &op),
                calls: Mutex::new(HashMap::new()),
                total: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
                delay: Mutex::new(None),
                failing: AtomicBool::new(false),
            }
        });
        configure(op.as_ref()).unwrap();
        op
    }

    pub fn output(&self) -> &OutputSlot {
        &self.output
    }

    pub fn data(&self) -> ArrayBuffer {
        self.data.read().clone()
    }

    /// Sleep this long inside every `execute`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Make every `execute` fail until switched off again.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, roi: &Roi) -> usize {
        self.calls.lock().get(roi).copied().unwrap_or(0)
    }

    /// Every region computed so far with its call count.
    pub fn calls(&self) -> HashMap<Roi, usize> {
        self.calls.lock().clone()
    }

    /// Highest number of `execute` calls observed running at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    pub fn reset_tracking(&self) {
        self.calls.lock().clear();
        self.total.store(0, Ordering::SeqCst);
        self.max_running.store(0, Ordering::SeqCst);
    }
}

struct Running<'a>(&'a AtomicUsize);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Operator for CountingSource {
    fn name(&self) -> &str {
        "CountingSource"
    }

    fn inputs(&self) -> Vec<InputSlot> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<OutputSlot> {
        vec![self.output.clone()]
    }

    fn setup_outputs(&self) -> Result<(), MetadataError> {
        let data = self.data.read();
        let mut meta = Metadata::new(data.shape().to_vec(), data.dtype());
        meta.ideal_block_shape = self.ideal_block_shape.clone();
        self.output.set_meta(Some(meta));
        Ok(())
    }

    async fn execute(
        &self,
        _slot: &OutputSlot,
        roi: &Roi,
        ctx: &RequestContext,
    ) -> Result<ArrayBuffer, FlowError> {
        self.total.fetch_add(1, Ordering::SeqCst);
        *self.calls.lock().entry(roi.clone()).or_insert(0) += 1;

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        let _running = Running(&self.running);
        self.max_running.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        ctx.check_cancelled()?;

        if self.failing.load(Ordering::SeqCst) {
            return Err(FlowError::compute("CountingSource", "injected failure"));
        }
        let data = self.data.read().clone();
        Ok(data.extract(roi)?)
    }
}

// =============================================================================
// Array Helpers
// =============================================================================

/// A `u16` array whose value at each index is a hash of its coordinates.
pub fn patterned_u16(shape: &[usize]) -> ArrayBuffer {
    ArrayBuffer::from_fn(shape, |idx| {
        idx.iter()
            .fold(7u32, |acc, &i| acc.wrapping_mul(31).wrapping_add(i as u32)) as u16
    })
}

/// A `u8` array holding the low byte of each element's flat index.
pub fn patterned_u8(shape: &[usize]) -> ArrayBuffer {
    let mut flat = 0usize;
    ArrayBuffer::from_fn(shape, |_| {
        let value = flat as u8;
        flat += 1;
        value
    })
}

/// Shorthand for a region in tests.
pub fn roi(start: &[i64], stop: &[i64]) -> Roi {
    Roi::new(start.to_vec(), stop.to_vec()).unwrap()
}
