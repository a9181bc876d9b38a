//! Structural operators: pass-through, crop and per-element maps.

use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::array::{ArrayBuffer, DType};
use crate::error::{FlowError, MetadataError};
use crate::graph::{InputSlot, Operator, OutputSlot};
use crate::request::RequestContext;
use crate::roi::Roi;

// =============================================================================
// OpArrayPiper
// =============================================================================

/// Forwards its input unchanged.
///
/// Useful as a stable connection point: downstream operators connect to the
/// piper's output while the piper's input is rewired.
pub struct OpArrayPiper {
    input: InputSlot,
    output: OutputSlot,
}

impl OpArrayPiper {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let op: Weak<dyn Operator> = weak.clone();
            Self {
                input: InputSlot::new("Input", &op),
                output: OutputSlot::new("Output", &op),
            }
        })
    }

    pub fn input(&self) -> &InputSlot {
        &self.input
    }

    pub fn output(&self) -> &OutputSlot {
        &self.output
    }
}

#[async_trait]
impl Operator for OpArrayPiper {
    fn name(&self) -> &str {
        "OpArrayPiper"
    }

    fn inputs(&self) -> Vec<InputSlot> {
        vec![self.input.clone()]
    }

    fn outputs(&self) -> Vec<OutputSlot> {
        vec![self.output.clone()]
    }

    fn setup_outputs(&self) -> Result<(), MetadataError> {
        self.output.set_meta(Some(self.input.require_meta()?));
        Ok(())
    }

    async fn execute(
        &self,
        _slot: &OutputSlot,
        roi: &Roi,
        ctx: &RequestContext,
    ) -> Result<ArrayBuffer, FlowError> {
        self.input.get_within(ctx, roi.clone()).wait().await
    }

    fn propagate_dirty(&self, _slot: &InputSlot, roi: &Roi) {
        self.output.set_dirty(roi);
    }
}

// =============================================================================
// OpSubRegion
// =============================================================================

/// Crops its input to the region given on the `Region` input.
///
/// Output coordinates start at zero. Dirty regions of the input are clipped
/// to the crop and translated into output coordinates.
pub struct OpSubRegion {
    input: InputSlot,
    region: InputSlot,
    output: OutputSlot,
}

impl OpSubRegion {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let op: Weak<dyn Operator> = weak.clone();
            Self {
                input: InputSlot::new("Input", &op),
                region: InputSlot::new("Region", &op),
                output: OutputSlot::new("Output", &op),
            }
        })
    }

    pub fn input(&self) -> &InputSlot {
        &self.input
    }

    pub fn region(&self) -> &InputSlot {
        &self.region
    }

    pub fn output(&self) -> &OutputSlot {
        &self.output
    }

    fn current_region(&self) -> Result<Roi, MetadataError> {
        let value = self.region.value().ok_or_else(|| MetadataError::InputNotReady {
            operator: self.name().to_string(),
            slot: self.region.name().to_string(),
        })?;
        value
            .as_region()
            .cloned()
            .ok_or_else(|| MetadataError::UnexpectedValue {
                slot: self.region.name().to_string(),
                expected: "region",
                actual: value.kind().to_string(),
            })
    }
}

#[async_trait]
impl Operator for OpSubRegion {
    fn name(&self) -> &str {
        "OpSubRegion"
    }

    fn inputs(&self) -> Vec<InputSlot> {
        vec![self.input.clone(), self.region.clone()]
    }

    fn outputs(&self) -> Vec<OutputSlot> {
        vec![self.output.clone()]
    }

    fn setup_outputs(&self) -> Result<(), MetadataError> {
        let mut meta = self.input.require_meta()?;
        let region = self.current_region()?;
        if !region.fits_in(&meta.shape) {
            return Err(MetadataError::IncompatibleShapes {
                operator: self.name().to_string(),
                reason: format!("region {} exceeds input shape {:?}", region, meta.shape),
            });
        }
        meta.shape = region.shape();
        if let Some(ideal) = &meta.ideal_block_shape {
            let clipped = ideal
                .iter()
                .zip(&meta.shape)
                .map(|(&b, &s)| if b == 0 { 0 } else { b.min(s.max(1)) })
                .collect();
            meta.ideal_block_shape = Some(clipped);
        }
        self.output.set_meta(Some(meta));
        Ok(())
    }

    async fn execute(
        &self,
        _slot: &OutputSlot,
        roi: &Roi,
        ctx: &RequestContext,
    ) -> Result<ArrayBuffer, FlowError> {
        let region = self.current_region()?;
        let source_roi = roi.translate(region.start());
        self.input.get_within(ctx, source_roi).wait().await
    }

    fn propagate_dirty(&self, slot: &InputSlot, roi: &Roi) {
        if !slot.is(&self.input) {
            self.output.set_dirty_all();
            return;
        }
        let Ok(region) = self.current_region() else {
            return;
        };
        if let Some(overlap) = roi.intersect(&region) {
            self.output.set_dirty(&overlap.relative_to(region.start()));
        }
    }
}

// =============================================================================
// OpElementwise
// =============================================================================

type ElementFn = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

/// Applies a function to every element.
///
/// Regions map one to one, so dirty notifications are forwarded unchanged.
/// The output element type defaults to the input's.
pub struct OpElementwise {
    name: String,
    function: ElementFn,
    out_dtype: Option<DType>,
    input: InputSlot,
    output: OutputSlot,
}

impl OpElementwise {
    pub fn new(
        name: impl Into<String>,
        out_dtype: Option<DType>,
        function: impl Fn(f64) -> f64 + Send + Sync + 'static,
    ) -> Arc<Self> {
        let name = name.into();
        let function: ElementFn = Arc::new(function);
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let op: Weak<dyn Operator> = weak.clone();
            Self {
                name,
                function,
                out_dtype,
                input: InputSlot::new("Input", &op),
                output: OutputSlot::new("Output", &op),
            }
        })
    }

    /// Multiply every element by `factor`.
    pub fn scale(factor: f64) -> Arc<Self> {
        Self::new("OpScale", None, move |v| v * factor)
    }

    pub fn input(&self) -> &InputSlot {
        &self.input
    }

    pub fn output(&self) -> &OutputSlot {
        &self.output
    }
}

#[async_trait]
impl Operator for OpElementwise {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<InputSlot> {
        vec![self.input.clone()]
    }

    fn outputs(&self) -> Vec<OutputSlot> {
        vec![self.output.clone()]
    }

    fn setup_outputs(&self) -> Result<(), MetadataError> {
        let mut meta = self.input.require_meta()?;
        if let Some(dtype) = self.out_dtype {
            meta.dtype = dtype;
        }
        // Value range is no longer known after an arbitrary map
        meta.drange = None;
        self.output.set_meta(Some(meta));
        Ok(())
    }

    async fn execute(
        &self,
        _slot: &OutputSlot,
        roi: &Roi,
        ctx: &RequestContext,
    ) -> Result<ArrayBuffer, FlowError> {
        let data = self.input.get_within(ctx, roi.clone()).wait().await?;
        ctx.check_cancelled()?;
        let dtype = self.out_dtype.unwrap_or(data.dtype());
        let function = &self.function;
        Ok(data.map_f64(dtype, |v| function(v)))
    }

    fn propagate_dirty(&self, _slot: &InputSlot, roi: &Roi) {
        self.output.set_dirty(roi);
    }
}
