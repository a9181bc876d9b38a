use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::slot::{InputSlot, OutputSlot, Reconfiguring};
use crate::array::ArrayBuffer;
use crate::error::{FlowError, MetadataError};
use crate::request::RequestContext;
use crate::roi::Roi;

// =============================================================================
// Operator trait
// =============================================================================

/// A node of the dataflow graph.
///
/// Operators are shared as `Arc<dyn Operator>` between the graph, their
/// slots (weakly) and running requests, so every method takes `&self` and
/// mutable state lives behind locks.
///
/// Construct operators with [`Arc::new_cyclic`] so the slots can hold a weak
/// back-reference, then call [`configure`] once if the operator has no
/// required inputs.
#[async_trait]
pub trait Operator: Send + Sync + 'static {
    /// Human-readable name used in errors and logs.
    fn name(&self) -> &str;

    fn inputs(&self) -> Vec<InputSlot>;

    fn outputs(&self) -> Vec<OutputSlot>;

    /// Recompute output metadata from the current input metadata.
    ///
    /// Called only when every required input is ready. Must be deterministic
    /// and must return an error instead of publishing wrong metadata.
    fn setup_outputs(&self) -> Result<(), MetadataError>;

    /// Produce exactly the data of `roi` for `slot`.
    ///
    /// May run concurrently for overlapping regions on any worker.
    async fn execute(
        &self,
        slot: &OutputSlot,
        roi: &Roi,
        ctx: &RequestContext,
    ) -> Result<ArrayBuffer, FlowError>;

    /// React to a change of `roi` on `slot`.
    ///
    /// The default marks every output dirty in full. Operators that map
    /// regions one to one should forward the precise region instead.
    fn propagate_dirty(&self, slot: &InputSlot, roi: &Roi) {
        let _ = (slot, roi);
        for output in self.outputs() {
            output.set_dirty_all();
        }
    }

    /// Release upstream subscriptions and backing resources.
    fn clean_up(&self) {
        for input in self.inputs() {
            if let Err(err) = input.disconnect() {
                debug!(operator = self.name(), slot = input.name(), error = %err, "Disconnect during clean-up failed");
            }
        }
    }
}

/// Re-run metadata propagation for `operator`.
///
/// If a required input is not ready, every output becomes not-ready.
/// Otherwise `setup_outputs` runs; on failure all outputs are cleared and the
/// error returned. Outputs whose metadata changed notify their meta-changed
/// listeners and are then reported dirty in full. Those notifications leave
/// every slot they reach in [`SlotState::Ready`](super::SlotState::Ready).
pub fn configure(operator: &dyn Operator) -> Result<(), MetadataError> {
    let _transition = Reconfiguring::enter();
    let outputs = operator.outputs();
    let before: Vec<_> = outputs.iter().map(OutputSlot::meta).collect();

    let inputs_ready = operator
        .inputs()
        .iter()
        .all(|input| input.is_optional() || input.ready());

    let result = if inputs_ready {
        operator.setup_outputs()
    } else {
        Ok(())
    };

    match &result {
        Ok(()) if inputs_ready => {
            for output in &outputs {
                output.mark_clean();
            }
        }
        Ok(()) => {
            for output in &outputs {
                output.set_meta(None);
            }
        }
        Err(err) => {
            warn!(operator = operator.name(), error = %err, "setup_outputs failed");
            for output in &outputs {
                output.set_meta(None);
            }
        }
    }

    for (output, before) in outputs.iter().zip(before) {
        if output.meta() != before {
            output.emit_meta_changed();
            output.set_dirty_all();
        }
    }
    result
}

// =============================================================================
// Graph
// =============================================================================

/// Owns a set of operators and tears them down in reverse insertion order.
///
/// Dropping the graph runs [`clean_up`](Operator::clean_up) on every operator.
#[derive(Default)]
pub struct Graph {
    operators: Vec<Arc<dyn Operator>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take shared ownership of `operator` and hand it back.
    pub fn add<O: Operator>(&mut self, operator: Arc<O>) -> Arc<O> {
        self.operators.push(operator.clone());
        operator
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    pub fn operators(&self) -> &[Arc<dyn Operator>] {
        &self.operators
    }

    pub fn clean_up(&mut self) {
        while let Some(operator) = self.operators.pop() {
            debug!(operator = operator.name(), "Cleaning up operator");
            operator.clean_up();
        }
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        self.clean_up();
    }
}
