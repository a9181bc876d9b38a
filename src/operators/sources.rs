//! Operators without inputs that originate array data.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::RwLock;

use crate::array::{strides, ArrayBuffer, ArrayBuilder, DType};
use crate::error::{BufferError, FlowError, MetadataError};
use crate::graph::{configure, InputSlot, Metadata, Operator, OutputSlot};
use crate::request::RequestContext;
use crate::roi::Roi;

// =============================================================================
// OpArraySource
// =============================================================================

/// Serves an in-memory array.
///
/// Replacing the array or writing into a region notifies downstream
/// operators with the exact region that changed.
pub struct OpArraySource {
    array: RwLock<Option<ArrayBuffer>>,
    axis_order: Option<String>,
    output: OutputSlot,
}

impl OpArraySource {
    pub fn new(array: Option<ArrayBuffer>) -> Result<Arc<Self>, MetadataError> {
        Self::build(array, None)
    }

    /// Like [`new`](Self::new) with explicit axis keys.
    pub fn with_axis_order(
        array: ArrayBuffer,
        axis_order: impl Into<String>,
    ) -> Result<Arc<Self>, MetadataError> {
        Self::build(Some(array), Some(axis_order.into()))
    }

    fn build(
        array: Option<ArrayBuffer>,
        axis_order: Option<String>,
    ) -> Result<Arc<Self>, MetadataError> {
        let op = Arc::new_cyclic(|weak: &Weak<Self>| {
            let op: Weak<dyn Operator> = weak.clone();
            Self {
                array: RwLock::new(array),
                axis_order,
                output: OutputSlot::new("Output", &op),
            }
        });
        configure(op.as_ref())?;
        Ok(op)
    }

    pub fn output(&self) -> &OutputSlot {
        &self.output
    }

    /// Current contents.
    pub fn array(&self) -> Option<ArrayBuffer> {
        self.array.read().clone()
    }

    /// Replace the whole array and report it dirty.
    pub fn set_array(&self, array: ArrayBuffer) -> Result<(), MetadataError> {
        let before = self.output.meta();
        *self.array.write() = Some(array);
        configure(self)?;
        // configure only reports dirty when the metadata changed
        if self.output.meta() == before {
            self.output.set_dirty_all();
        }
        Ok(())
    }

    /// Overwrite `roi` with `data` and report exactly that region dirty.
    pub fn write_region(&self, roi: &Roi, data: &ArrayBuffer) -> Result<(), FlowError> {
        {
            let mut guard = self.array.write();
            let current = guard.as_ref().ok_or_else(|| FlowError::NotReady {
                slot: self.output.name().to_string(),
            })?;
            let patched = patch_region(current, roi, data)?;
            *guard = Some(patched);
        }
        self.output.set_dirty(roi);
        Ok(())
    }
}

fn patch_region(current: &ArrayBuffer, roi: &Roi, data: &ArrayBuffer) -> Result<ArrayBuffer, FlowError> {
    roi.check_bounds(current.shape())?;
    if data.shape() != roi.shape().as_slice() {
        return Err(BufferError::RegionOutOfBounds {
            roi: roi.to_string(),
            shape: data.shape().to_vec(),
        }
        .into());
    }
    let mut builder = ArrayBuilder::from(current.clone());
    let origin: Vec<usize> = roi.start().iter().map(|&s| s as usize).collect();
    builder.paste(&origin, data, &Roi::from_shape(data.shape()))?;
    Ok(builder.freeze())
}

#[async_trait]
impl Operator for OpArraySource {
    fn name(&self) -> &str {
        "OpArraySource"
    }

    fn inputs(&self) -> Vec<InputSlot> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<OutputSlot> {
        vec![self.output.clone()]
    }

    fn setup_outputs(&self) -> Result<(), MetadataError> {
        let meta = self.array.read().as_ref().map(|array| {
            let meta = Metadata::new(array.shape().to_vec(), array.dtype());
            match &self.axis_order {
                Some(order) => meta.with_axis_order(order.clone()),
                None => meta,
            }
        });
        if let Some(meta) = &meta {
            meta.validate()?;
        }
        self.output.set_meta(meta);
        Ok(())
    }

    async fn execute(
        &self,
        _slot: &OutputSlot,
        roi: &Roi,
        _ctx: &RequestContext,
    ) -> Result<ArrayBuffer, FlowError> {
        let array = self.array().ok_or_else(|| FlowError::NotReady {
            slot: self.output.name().to_string(),
        })?;
        Ok(array.extract(roi)?)
    }
}

// =============================================================================
// OpRampSource
// =============================================================================

/// Value of the ramp at C-order flat index `flat` for `dtype`.
///
/// Integer types narrower than 64 bits wrap at their positive range so the
/// ramp stays exactly representable.
pub fn ramp_value(flat: u64, dtype: DType) -> f64 {
    let wrapped = match dtype {
        DType::U8 => flat % (1 << 8),
        DType::I8 => flat % (1 << 7),
        DType::U16 => flat % (1 << 16),
        DType::I16 => flat % (1 << 15),
        DType::U32 | DType::I32 => flat % (1 << 31),
        DType::F32 => flat % (1 << 24),
        DType::U64 | DType::I64 | DType::F64 => flat,
    };
    wrapped as f64
}

/// Synthesises a deterministic array whose value is its flat index.
///
/// Nothing is materialised: every request computes its region on the fly,
/// so the ramp can stand in for arrays far larger than memory.
pub struct OpRampSource {
    meta: Metadata,
    output: OutputSlot,
}

impl OpRampSource {
    pub fn new(shape: Vec<usize>, dtype: DType) -> Result<Arc<Self>, MetadataError> {
        Self::with_metadata(Metadata::new(shape, dtype))
    }

    pub fn with_metadata(meta: Metadata) -> Result<Arc<Self>, MetadataError> {
        let op = Arc::new_cyclic(|weak: &Weak<Self>| {
            let op: Weak<dyn Operator> = weak.clone();
            Self {
                meta,
                output: OutputSlot::new("Output", &op),
            }
        });
        configure(op.as_ref())?;
        Ok(op)
    }

    pub fn output(&self) -> &OutputSlot {
        &self.output
    }

    /// Compute `roi` of a ramp over `shape`.
    pub fn generate(shape: &[usize], dtype: DType, roi: &Roi) -> Result<ArrayBuffer, FlowError> {
        roi.check_bounds(shape)?;
        let extent = roi.shape();
        let full_strides = strides(shape);
        let itemsize = dtype.itemsize();
        let mut data = BytesMut::zeroed(roi.volume() * itemsize);

        let mut index = vec![0usize; extent.len()];
        for chunk in data.chunks_exact_mut(itemsize) {
            let flat: u64 = index
                .iter()
                .zip(roi.start())
                .zip(&full_strides)
                .map(|((&i, &s), &stride)| (i as u64 + s as u64) * stride as u64)
                .sum();
            dtype.write_f64(ramp_value(flat, dtype), chunk);

            for axis in (0..extent.len()).rev() {
                index[axis] += 1;
                if index[axis] < extent[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }
        Ok(ArrayBuffer::new(extent, dtype, data.freeze())?)
    }
}

#[async_trait]
impl Operator for OpRampSource {
    fn name(&self) -> &str {
        "OpRampSource"
    }

    fn inputs(&self) -> Vec<InputSlot> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<OutputSlot> {
        vec![self.output.clone()]
    }

    fn setup_outputs(&self) -> Result<(), MetadataError> {
        self.meta.validate()?;
        self.output.set_meta(Some(self.meta.clone()));
        Ok(())
    }

    async fn execute(
        &self,
        _slot: &OutputSlot,
        roi: &Roi,
        ctx: &RequestContext,
    ) -> Result<ArrayBuffer, FlowError> {
        ctx.check_cancelled()?;
        Self::generate(&self.meta.shape, self.meta.dtype, roi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_array_source_serves_regions() {
        let array = ArrayBuffer::from_elements(&[2, 3], &[0u8, 1, 2, 3, 4, 5]).unwrap();
        let source = OpArraySource::new(Some(array)).unwrap();
        assert!(source.output().ready());
        assert_eq!(source.output().meta().unwrap().axis_order, "yx");

        let roi = Roi::new(vec![0, 1], vec![2, 3]).unwrap();
        let data = source.output().get(roi).wait().await.unwrap();
        assert_eq!(data.to_vec::<u8>().unwrap(), vec![1, 2, 4, 5]);
    }

    #[tokio::test]
    async fn test_empty_array_source_is_not_ready() {
        let source = OpArraySource::new(None).unwrap();
        assert!(!source.output().ready());
        let err = source.output().get(Roi::from_shape(&[1])).wait().await.unwrap_err();
        assert!(matches!(err, FlowError::NotReady { .. }));
    }

    #[test]
    fn test_write_region_reports_exact_roi() {
        let source = OpArraySource::new(Some(ArrayBuffer::zeros(&[4, 4], DType::U8))).unwrap();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            source.output().notify_dirty(move |roi| seen.lock().push(roi.clone()));
        }
        let roi = Roi::new(vec![1, 1], vec![3, 2]).unwrap();
        let patch = ArrayBuffer::from_elements(&[2, 1], &[7u8, 9]).unwrap();
        source.write_region(&roi, &patch).unwrap();

        assert_eq!(*seen.lock(), vec![roi]);
        let array = source.array().unwrap();
        assert_eq!(array.get_f64(&[1, 1]), Some(7.0));
        assert_eq!(array.get_f64(&[2, 1]), Some(9.0));
        assert_eq!(array.get_f64(&[0, 0]), Some(0.0));
    }

    #[test]
    fn test_write_region_out_of_bounds_keeps_array() {
        let source = OpArraySource::new(Some(ArrayBuffer::zeros(&[2, 2], DType::U8))).unwrap();
        let roi = Roi::new(vec![1, 1], vec![3, 3]).unwrap();
        let patch = ArrayBuffer::zeros(&[2, 2], DType::U8);
        assert!(source.write_region(&roi, &patch).is_err());
        assert!(source.array().is_some());
    }

    #[test]
    fn test_ramp_values() {
        let data = OpRampSource::generate(&[3, 4], DType::U16, &Roi::new(vec![1, 1], vec![3, 3]).unwrap())
            .unwrap();
        assert_eq!(data.to_vec::<u16>().unwrap(), vec![5, 6, 9, 10]);

        assert_eq!(ramp_value(300, DType::U8), 44.0);
        assert_eq!(ramp_value(300, DType::F64), 300.0);
    }

    #[test]
    fn test_ramp_rejects_bad_axis_order() {
        let meta = Metadata::new(vec![4, 4], DType::U8).with_axis_order("zyx");
        assert!(OpRampSource::with_metadata(meta).is_err());
    }
}
