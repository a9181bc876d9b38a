use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use futures::future::try_join_all;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use super::table::{CacheStats, CacheTable, Lookup};
use crate::array::{ArrayBuffer, ArrayBuilder, DType};
use crate::error::{FlowError, MetadataError};
use crate::graph::{InputSlot, Operator, OutputSlot};
use crate::request::{Request, RequestContext};
use crate::roi::{clip_block_shape, determine_block_shape, BlockIndex, Roi};

/// Default memory budget: 256MB
pub const DEFAULT_CACHE_MEMORY: usize = 256 * 1024 * 1024;

/// Block volume (in pixels) used when neither a block shape nor an ideal
/// block shape is available.
const DEFAULT_BLOCK_VOLUME: f64 = 256.0 * 1024.0;

#[derive(Debug, Clone, PartialEq)]
struct Layout {
    shape: Vec<usize>,
    dtype: DType,
    block_shape: Vec<usize>,
}

/// Memoizes its input block by block.
///
/// Requests are decomposed into the blocks they overlap. Cached blocks are
/// served directly, blocks being computed by another requester are awaited,
/// and only missing blocks trigger an upstream request. Each block has at
/// most one computation in flight.
///
/// # Inputs
/// * `Input` - the array to cache
/// * `BlockShape` - optional shape value; defaults to the input's ideal
///   block shape, else a near-isometric block of about 256K pixels
/// * `FixAtCurrent` - bool, default `false`; while `true`, dirty
///   notifications are recorded instead of applied and missing blocks read
///   as zeros
///
/// # Memory
/// Ready blocks are evicted least-recently-used first once their total size
/// exceeds the budget. Evicted blocks are recomputed on demand.
pub struct OpBlockedArrayCache {
    input: InputSlot,
    block_shape: InputSlot,
    fix_at_current: InputSlot,
    output: OutputSlot,
    table: Arc<Mutex<CacheTable>>,
    layout: RwLock<Option<Layout>>,
}

impl OpBlockedArrayCache {
    pub fn new(max_bytes: usize) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let op: Weak<dyn Operator> = weak.clone();
            Self {
                input: InputSlot::new("Input", &op),
                block_shape: InputSlot::optional("BlockShape", &op),
                fix_at_current: InputSlot::with_default("FixAtCurrent", &op, false),
                output: OutputSlot::new("Output", &op),
                table: Arc::new(Mutex::new(CacheTable::new(max_bytes))),
                layout: RwLock::new(None),
            }
        })
    }

    pub fn input(&self) -> &InputSlot {
        &self.input
    }

    pub fn block_shape(&self) -> &InputSlot {
        &self.block_shape
    }

    pub fn fix_at_current(&self) -> &InputSlot {
        &self.fix_at_current
    }

    pub fn output(&self) -> &OutputSlot {
        &self.output
    }

    /// The block shape in effect, once configured.
    pub fn effective_block_shape(&self) -> Option<Vec<usize>> {
        self.layout.read().as_ref().map(|l| l.block_shape.clone())
    }

    pub fn stats(&self) -> CacheStats {
        self.table.lock().stats()
    }

    /// Drop every cached block. Running computations finish but are not stored.
    pub fn clear(&self) {
        self.table.lock().clear();
    }

    pub fn set_max_bytes(&self, max_bytes: usize) {
        self.table.lock().set_max_bytes(max_bytes);
    }

    fn current_layout(&self) -> Result<Layout, FlowError> {
        self.layout.read().clone().ok_or_else(|| FlowError::NotReady {
            slot: self.output.name().to_string(),
        })
    }

    fn resolve_block_shape(&self, shape: &[usize], ideal: Option<&[usize]>) -> Result<Vec<usize>, MetadataError> {
        let block_shape = if self.block_shape.value().is_some() {
            self.block_shape.require_shape()?
        } else if let Some(ideal) = ideal {
            ideal
                .iter()
                .zip(shape)
                .map(|(&b, &s)| if b == 0 { s } else { b })
                .collect()
        } else {
            determine_block_shape(shape, DEFAULT_BLOCK_VOLUME)
        };

        if block_shape.len() != shape.len() {
            return Err(MetadataError::BlockShapeMismatch {
                block_shape,
                ndim: shape.len(),
            });
        }
        if block_shape.iter().any(|&b| b == 0) {
            return Err(MetadataError::InvalidBlockShape(block_shape));
        }
        Ok(clip_block_shape(&block_shape, shape))
    }

    /// Serve one block from the table, joining or starting its computation.
    async fn fetch_block(&self, index: &BlockIndex, layout: &Layout, ctx: &RequestContext) -> Result<ArrayBuffer, FlowError> {
        let block_roi = index.roi(&layout.block_shape, &layout.shape);
        loop {
            ctx.check_cancelled()?;
            let lookup = self
                .table
                .lock()
                .lookup(index, || self.block_request(block_roi.clone()));

            match lookup {
                Lookup::Ready(data) => {
                    trace!(block = %index, "Cache hit");
                    return Ok(data);
                }
                Lookup::Zeros => return Ok(ArrayBuffer::zeros(&block_roi.shape(), layout.dtype)),
                Lookup::Pending(request) => return request.wait().await,
                Lookup::Stale(request) => {
                    // Only its result is stale; wait for it to clear the slot
                    let _ = request.wait().await;
                    continue;
                }
                Lookup::Claimed { ticket, request } => {
                    let table = Arc::downgrade(&self.table);
                    let block = index.clone();
                    request.notify_done(move |outcome| {
                        if let Some(table) = table.upgrade() {
                            table.lock().complete(&block, ticket, outcome);
                        }
                    });
                    if let Err(err) = request.submit() {
                        request.cancel();
                        return Err(err);
                    }
                    return request.wait().await;
                }
            }
        }
    }

    /// A detached request computing `block_roi` upstream.
    ///
    /// Detached so one requester going away never cancels a computation
    /// other requesters are waiting on.
    fn block_request(&self, block_roi: Roi) -> Request<ArrayBuffer> {
        let input = self.input.clone();
        Request::new(move |ctx| async move {
            let started = Instant::now();
            let data = input.get_within(&ctx, block_roi.clone()).wait().await?;
            debug!(
                roi = %block_roi,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Computed cache block"
            );
            Ok(data)
        })
    }
}

#[async_trait]
impl Operator for OpBlockedArrayCache {
    fn name(&self) -> &str {
        "OpBlockedArrayCache"
    }

    fn inputs(&self) -> Vec<InputSlot> {
        vec![
            self.input.clone(),
            self.block_shape.clone(),
            self.fix_at_current.clone(),
        ]
    }

    fn outputs(&self) -> Vec<OutputSlot> {
        vec![self.output.clone()]
    }

    fn setup_outputs(&self) -> Result<(), MetadataError> {
        let mut meta = self.input.require_meta()?;
        self.fix_at_current.require_bool()?;
        let block_shape = self.resolve_block_shape(&meta.shape, meta.ideal_block_shape.as_deref())?;

        let layout = Layout {
            shape: meta.shape.clone(),
            dtype: meta.dtype,
            block_shape: block_shape.clone(),
        };
        {
            let mut current = self.layout.write();
            if current.as_ref() != Some(&layout) {
                debug!(shape = ?layout.shape, block_shape = ?layout.block_shape, "Cache layout changed");
                self.table.lock().reset();
                *current = Some(layout);
            }
        }

        meta.ram_usage_per_requested_pixel = Some(meta.ram_per_pixel());
        meta.ideal_block_shape = Some(block_shape);
        self.output.set_meta(Some(meta));
        Ok(())
    }

    async fn execute(
        &self,
        _slot: &OutputSlot,
        roi: &Roi,
        ctx: &RequestContext,
    ) -> Result<ArrayBuffer, FlowError> {
        let layout = self.current_layout()?;
        let indices = roi.to_block_indices(&layout.block_shape);

        let blocks = try_join_all(
            indices
                .iter()
                .map(|index| self.fetch_block(index, &layout, ctx)),
        )
        .await?;

        let mut out = ArrayBuilder::zeros(&roi.shape(), layout.dtype);
        for (index, data) in indices.iter().zip(&blocks) {
            let block_roi = index.roi(&layout.block_shape, &layout.shape);
            let Some(overlap) = block_roi.intersect(roi) else {
                continue;
            };
            let dst: Vec<usize> = overlap
                .start()
                .iter()
                .zip(roi.start())
                .map(|(o, r)| (o - r) as usize)
                .collect();
            out.paste(&dst, data, &overlap.relative_to(block_roi.start()))?;
        }
        Ok(out.freeze())
    }

    fn propagate_dirty(&self, slot: &InputSlot, roi: &Roi) {
        let Some(layout) = self.layout.read().clone() else {
            return;
        };

        if slot.is(&self.input) {
            let full = Roi::from_shape(&layout.shape);
            let Some(clipped) = roi.intersect(&full) else {
                return;
            };
            let covers_all = clipped == full;
            let indices = if covers_all {
                Vec::new()
            } else {
                clipped.to_block_indices(&layout.block_shape)
            };
            let applied = self.table.lock().dirty(&indices, covers_all);
            if applied {
                self.output.set_dirty(&clipped);
            } else {
                trace!(roi = %clipped, "Dirty region deferred while fixed");
            }
        } else if slot.is(&self.fix_at_current) {
            let Ok(fixed) = self.fix_at_current.require_bool() else {
                return;
            };
            let dirty = self
                .table
                .lock()
                .set_fixed(fixed, &layout.block_shape, &layout.shape);
            if let Some(dirty) = dirty {
                debug!(roi = %dirty, "Releasing deferred dirty region");
                self.output.set_dirty(&dirty);
            }
        }
        // BlockShape changes reset the table in setup_outputs; data is unchanged
    }
}
