use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::progress::{ProgressSignal, ProgressTracker};
use super::store::BlockStore;
use crate::array::ArrayBuffer;
use crate::error::{FlowError, MetadataError, StoreError};
use crate::graph::{InputSlot, Metadata, Operator, OutputSlot};
use crate::request::{Request, RequestContext};
use crate::roi::{clip_block_shape, determine_optimal_request_blockshape, Roi};

/// Default number of block requests in flight during an export.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 8;

/// Default RAM budget shared by the in-flight blocks: 512MB
pub const DEFAULT_EXPORT_MEMORY: usize = 512 * 1024 * 1024;

/// Outcome of a completed export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub total_blocks: usize,
    pub block_shape: Vec<usize>,
    pub bytes_written: u64,
}

/// Streams its input into a [`BlockStore`] one block at a time.
///
/// The whole array is never materialised: at most `max_in_flight` blocks are
/// requested from upstream at once, and each is written to the store as soon
/// as it arrives. Progress is reported on [`progress`](Self::progress) in
/// whole percent, only when the value changes.
///
/// # Inputs
/// * `Input` - the array to export
/// * `BlockShape` - optional shape value; defaults to the input's ideal block
///   shape, else a shape derived from the memory budget
///
/// # Cancellation
/// [`cancel`](Self::cancel) stops dispatching new blocks and cancels the ones
/// still running. Blocks already written stay in the store; a cancelled or
/// failed export leaves it incomplete.
pub struct OpBlockwiseWriter {
    input: InputSlot,
    block_shape: InputSlot,
    progress: Arc<ProgressSignal>,
    max_in_flight: usize,
    memory_budget: usize,
    token: Mutex<CancellationToken>,
}

impl OpBlockwiseWriter {
    /// # Arguments
    /// * `max_in_flight` - upper bound on concurrently running block requests
    /// * `memory_budget` - bytes the in-flight blocks may use together, used
    ///   to size blocks when upstream advertises no ideal block shape
    pub fn new(max_in_flight: usize, memory_budget: usize) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let op: Weak<dyn Operator> = weak.clone();
            Self {
                input: InputSlot::new("Input", &op),
                block_shape: InputSlot::optional("BlockShape", &op),
                progress: Arc::new(ProgressSignal::new()),
                max_in_flight: max_in_flight.max(1),
                memory_budget,
                token: Mutex::new(CancellationToken::new()),
            }
        })
    }

    pub fn input(&self) -> &InputSlot {
        &self.input
    }

    pub fn block_shape(&self) -> &InputSlot {
        &self.block_shape
    }

    /// Percent-complete notifications of the running export.
    pub fn progress(&self) -> &ProgressSignal {
        &self.progress
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Cancel the export in progress, if any.
    ///
    /// Every [`run_export`](Self::run_export) starts with a fresh token, so a
    /// cancel issued before the export has started, or racing with its
    /// start, is lost. Callers that cancel from another thread should wait
    /// for the first progress notification (0%) before relying on it.
    pub fn cancel(&self) {
        self.token.lock().cancel();
    }

    /// The block shape an export would use right now.
    pub fn effective_block_shape(&self) -> Result<Vec<usize>, MetadataError> {
        let meta = self.input.require_meta()?;
        let shape = &meta.shape;

        let block_shape = if self.block_shape.value().is_some() {
            self.block_shape.require_shape()?
        } else if let Some(ideal) = meta.ideal_block_shape.clone() {
            if ideal.len() == shape.len() {
                // 0 stands for the whole axis
                ideal
                    .iter()
                    .zip(shape)
                    .map(|(&b, &s)| if b == 0 { s } else { b })
                    .collect()
            } else {
                ideal
            }
        } else {
            determine_optimal_request_blockshape(
                shape,
                &vec![0; shape.len()],
                meta.ram_per_pixel(),
                self.max_in_flight,
                self.memory_budget as f64,
            )
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

    /// Metadata a target store should be created with.
    ///
    /// The effective block shape is recorded as the store's ideal block
    /// shape, so reading the export back uses the same partitioning.
    pub fn store_metadata(&self) -> Result<Metadata, MetadataError> {
        let block_shape = self.effective_block_shape()?;
        let mut meta = self.input.require_meta()?;
        meta.ideal_block_shape = Some(block_shape);
        meta.ram_usage_per_requested_pixel = None;
        Ok(meta)
    }

    /// Export the whole input into `store`.
    ///
    /// Resolves once every block is written, or with the first failure, or
    /// with [`FlowError::Cancelled`]. The store is closed only on success.
    pub async fn run_export(&self, store: Arc<dyn BlockStore>) -> Result<ExportSummary, FlowError> {
        let meta = self.input.meta().ok_or_else(|| FlowError::NotReady {
            slot: self.input.name().to_string(),
        })?;
        let block_shape = self.effective_block_shape()?;
        check_target(&meta, store.metadata())?;

        let token = {
            let mut current = self.token.lock();
            *current = CancellationToken::new();
            current.clone()
        };

        let blocks = Roi::from_shape(&meta.shape).block_rois(&meta.shape, &block_shape, false);
        let total_blocks = blocks.len();
        let tracker = Arc::new(ProgressTracker::new(total_blocks, self.progress.clone()));
        let semaphore = Arc::new(Semaphore::new(self.max_in_flight));
        let started = Instant::now();

        info!(
            store = store.identifier(),
            shape = ?meta.shape,
            block_shape = ?block_shape,
            blocks = total_blocks,
            max_in_flight = self.max_in_flight,
            "Starting blockwise export"
        );
        tracker.start();

        let mut requests = Vec::with_capacity(total_blocks);
        let mut failure = None;
        for roi in blocks {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        failure = Some(FlowError::Internal("export semaphore closed".into()));
                        token.cancel();
                        break;
                    }
                },
            };

            let request = self.block_request(&token, roi, store.clone(), permit);
            {
                let tracker = tracker.clone();
                request.notify_finished(move |_| tracker.block_done());
            }
            {
                let token = token.clone();
                request.notify_failed(move |_| token.cancel());
            }
            if let Err(err) = request.submit() {
                failure = Some(err);
                token.cancel();
                break;
            }
            requests.push(request);
        }

        let mut bytes_written = 0u64;
        for request in &requests {
            match request.wait().await {
                Ok(bytes) => bytes_written += bytes,
                Err(FlowError::Cancelled) => {}
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }

        if let Some(err) = failure {
            warn!(store = store.identifier(), error = %err, "Blockwise export failed");
            return Err(err);
        }
        if token.is_cancelled() {
            warn!(
                store = store.identifier(),
                completed = tracker.completed(),
                total = total_blocks,
                "Blockwise export cancelled"
            );
            return Err(FlowError::Cancelled);
        }

        store.close().await?;
        info!(
            store = store.identifier(),
            blocks = total_blocks,
            bytes = bytes_written,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Blockwise export finished"
        );
        Ok(ExportSummary {
            total_blocks,
            block_shape,
            bytes_written,
        })
    }

    /// Run [`run_export`](Self::run_export) to completion on the calling thread.
    ///
    /// Block requests execute on `handle`'s workers. Must not be called from
    /// inside one of those workers.
    pub fn run_export_blocking(
        &self,
        handle: &Handle,
        store: Arc<dyn BlockStore>,
    ) -> Result<ExportSummary, FlowError> {
        let _guard = handle.enter();
        futures::executor::block_on(self.run_export(store))
    }

    /// Read one block from upstream and write it out, holding an in-flight
    /// permit until done.
    fn block_request(
        &self,
        token: &CancellationToken,
        roi: Roi,
        store: Arc<dyn BlockStore>,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) -> Request<u64> {
        let input = self.input.clone();
        Request::with_token(token.child_token(), move |ctx| async move {
            let _permit = permit;
            let started = Instant::now();
            let data = input.get_within(&ctx, roi.clone()).wait().await?;
            ctx.check_cancelled()?;
            store.write(&roi, &data).await?;
            debug!(
                roi = %roi,
                bytes = data.byte_len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Wrote block"
            );
            Ok(data.byte_len() as u64)
        })
    }
}

fn check_target(source: &Metadata, target: &Metadata) -> Result<(), StoreError> {
    if source.shape != target.shape {
        return Err(StoreError::ShapeMismatch {
            expected: source.shape.clone(),
            actual: target.shape.clone(),
        });
    }
    if source.dtype != target.dtype {
        return Err(StoreError::DtypeMismatch {
            expected: source.dtype,
            actual: target.dtype,
        });
    }
    Ok(())
}

#[async_trait]
impl Operator for OpBlockwiseWriter {
    fn name(&self) -> &str {
        "OpBlockwiseWriter"
    }

    fn inputs(&self) -> Vec<InputSlot> {
        vec![self.input.clone(), self.block_shape.clone()]
    }

    fn outputs(&self) -> Vec<OutputSlot> {
        Vec::new()
    }

    fn setup_outputs(&self) -> Result<(), MetadataError> {
        if !self.input.ready() {
            return Ok(());
        }
        let block_shape = self.effective_block_shape()?;
        debug!(block_shape = ?block_shape, "Export block shape");
        Ok(())
    }

    async fn execute(
        &self,
        slot: &OutputSlot,
        _roi: &Roi,
        _ctx: &RequestContext,
    ) -> Result<ArrayBuffer, FlowError> {
        Err(FlowError::Internal(format!(
            "OpBlockwiseWriter has no output '{}'",
            slot.name()
        )))
    }

    fn propagate_dirty(&self, _slot: &InputSlot, _roi: &Roi) {}
}
