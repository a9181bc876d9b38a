use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::trace;

use super::store::BlockStore;
use crate::array::{ArrayBuffer, ArrayBuilder};
use crate::error::{FlowError, MetadataError};
use crate::graph::{configure, InputSlot, Operator, OutputSlot};
use crate::request::{RequestContext, RequestPool};
use crate::roi::{clip_block_shape, determine_block_shape, Roi};

/// Block volume (in pixels) when the store records no block shape.
const DEFAULT_READ_BLOCK_VOLUME: f64 = 1024.0 * 1024.0;

/// Serves the contents of a [`BlockStore`].
///
/// A request is split into the store blocks it overlaps; each block is read
/// by its own child request and the pieces are assembled into the result.
pub struct OpStoreReader {
    store: Arc<dyn BlockStore>,
    block_shape: Vec<usize>,
    output: OutputSlot,
}

impl OpStoreReader {
    /// Read `store` in blocks of `block_shape`, or of the block shape the
    /// store was written with.
    pub fn new(
        store: Arc<dyn BlockStore>,
        block_shape: Option<Vec<usize>>,
    ) -> Result<Arc<Self>, MetadataError> {
        let meta = store.metadata();
        meta.validate()?;
        let block_shape = block_shape
            .or_else(|| meta.ideal_block_shape.clone())
            .unwrap_or_else(|| determine_block_shape(&meta.shape, DEFAULT_READ_BLOCK_VOLUME));
        if block_shape.len() != meta.ndim() {
            return Err(MetadataError::BlockShapeMismatch {
                block_shape,
                ndim: meta.ndim(),
            });
        }
        if block_shape.iter().any(|&b| b == 0) {
            return Err(MetadataError::InvalidBlockShape(block_shape));
        }
        let block_shape = clip_block_shape(&block_shape, &meta.shape);

        let op = Arc::new_cyclic(|weak: &Weak<Self>| {
            let op: Weak<dyn Operator> = weak.clone();
            Self {
                store,
                block_shape,
                output: OutputSlot::new("Output", &op),
            }
        });
        configure(op.as_ref())?;
        Ok(op)
    }

    pub fn output(&self) -> &OutputSlot {
        &self.output
    }

    pub fn block_shape(&self) -> &[usize] {
        &self.block_shape
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }
}

#[async_trait]
impl Operator for OpStoreReader {
    fn name(&self) -> &str {
        "OpStoreReader"
    }

    fn inputs(&self) -> Vec<InputSlot> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<OutputSlot> {
        vec![self.output.clone()]
    }

    fn setup_outputs(&self) -> Result<(), MetadataError> {
        let meta = self
            .store
            .metadata()
            .clone()
            .with_ideal_block_shape(self.block_shape.clone());
        self.output.set_meta(Some(meta));
        Ok(())
    }

    async fn execute(
        &self,
        _slot: &OutputSlot,
        roi: &Roi,
        ctx: &RequestContext,
    ) -> Result<ArrayBuffer, FlowError> {
        let meta = self.store.metadata();
        let pieces = roi.block_rois(&meta.shape, &self.block_shape, true);
        trace!(store = self.store.identifier(), roi = %roi, blocks = pieces.len(), "Reading from store");

        let mut pool = RequestPool::new();
        for piece in &pieces {
            let store = self.store.clone();
            let piece = piece.clone();
            pool.add(ctx.child(move |ctx| async move {
                ctx.check_cancelled()?;
                Ok(store.read(&piece).await?)
            }));
        }
        let blocks = pool.wait_all().await?;

        let mut out = ArrayBuilder::zeros(&roi.shape(), meta.dtype);
        for (piece, data) in pieces.iter().zip(&blocks) {
            let dst: Vec<usize> = piece
                .start()
                .iter()
                .zip(roi.start())
                .map(|(p, r)| (p - r) as usize)
                .collect();
            out.paste(&dst, data, &Roi::from_shape(data.shape()))?;
        }
        Ok(out.freeze())
    }
}
