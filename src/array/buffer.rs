use std::fmt;

use bytes::{Bytes, BytesMut};

use super::dtype::{DType, Element};
use crate::error::BufferError;
use crate::roi::Roi;

// =============================================================================
// ArrayBuffer
// =============================================================================

/// An immutable, dense, C-ordered N-dimensional array.
///
/// The payload is a [`Bytes`] handle, so cloning a buffer never copies the
/// element data. Cached blocks and request results are shared this way.
#[derive(Clone, PartialEq, Eq)]
pub struct ArrayBuffer {
    shape: Vec<usize>,
    dtype: DType,
    data: Bytes,
}

impl ArrayBuffer {
    /// Wrap raw little-endian bytes.
    pub fn new(shape: Vec<usize>, dtype: DType, data: Bytes) -> Result<Self, BufferError> {
        let expected = shape.iter().product::<usize>() * dtype.itemsize();
        if data.len() != expected {
            return Err(BufferError::LengthMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { shape, dtype, data })
    }

    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        ArrayBuilder::zeros(shape, dtype).freeze()
    }

    /// Build a buffer from a C-ordered slice of elements.
    pub fn from_elements<T: Element>(shape: &[usize], values: &[T]) -> Result<Self, BufferError> {
        let expected = shape.iter().product::<usize>();
        if values.len() != expected {
            return Err(BufferError::LengthMismatch {
                expected: expected * T::DTYPE.itemsize(),
                actual: values.len() * T::DTYPE.itemsize(),
            });
        }
        let itemsize = T::DTYPE.itemsize();
        let mut data = BytesMut::zeroed(values.len() * itemsize);
        for (chunk, value) in data.chunks_exact_mut(itemsize).zip(values) {
            value.write_le(chunk);
        }
        Ok(Self {
            shape: shape.to_vec(),
            dtype: T::DTYPE,
            data: data.freeze(),
        })
    }

    /// Build a buffer by evaluating `f` at every index, in C order.
    pub fn from_fn<T: Element>(shape: &[usize], mut f: impl FnMut(&[usize]) -> T) -> Self {
        let itemsize = T::DTYPE.itemsize();
        let count = shape.iter().product::<usize>();
        let mut data = BytesMut::zeroed(count * itemsize);
        let mut index = vec![0usize; shape.len()];
        for chunk in data.chunks_exact_mut(itemsize) {
            f(&index).write_le(chunk);
            for axis in (0..shape.len()).rev() {
                index[axis] += 1;
                if index[axis] < shape[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }
        Self {
            shape: shape.to_vec(),
            dtype: T::DTYPE,
            data: data.freeze(),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    /// Copy the elements out as a typed vector.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, BufferError> {
        if T::DTYPE != self.dtype {
            return Err(BufferError::DtypeMismatch {
                expected: self.dtype,
                actual: T::DTYPE,
            });
        }
        Ok(self
            .data
            .chunks_exact(self.dtype.itemsize())
            .map(T::read_le)
            .collect())
    }

    /// Read one element as `f64`, or `None` if `index` is out of range.
    pub fn get_f64(&self, index: &[usize]) -> Option<f64> {
        if index.len() != self.ndim() || index.iter().zip(&self.shape).any(|(i, s)| i >= s) {
            return None;
        }
        let offset: usize = index
            .iter()
            .zip(strides(&self.shape))
            .map(|(i, s)| i * s)
            .sum();
        let itemsize = self.dtype.itemsize();
        Some(
            self.dtype
                .read_f64(&self.data[offset * itemsize..(offset + 1) * itemsize]),
        )
    }

    /// Copy out a sub-region given in this buffer's local coordinates.
    pub fn extract(&self, region: &Roi) -> Result<ArrayBuffer, BufferError> {
        check_region(region, &self.shape)?;
        if region.fits_in(&self.shape) && region.shape() == self.shape {
            return Ok(self.clone());
        }
        let mut out = ArrayBuilder::zeros(&region.shape(), self.dtype);
        let origin = vec![0; self.ndim()];
        out.paste(&origin, self, region)?;
        Ok(out.freeze())
    }

    /// Apply `f` to every element, producing a buffer of `dtype`.
    pub fn map_f64(&self, dtype: DType, f: impl Fn(f64) -> f64) -> ArrayBuffer {
        let src_size = self.dtype.itemsize();
        let dst_size = dtype.itemsize();
        let mut data = BytesMut::zeroed(self.len() * dst_size);
        for (src, dst) in self
            .data
            .chunks_exact(src_size)
            .zip(data.chunks_exact_mut(dst_size))
        {
            dtype.write_f64(f(self.dtype.read_f64(src)), dst);
        }
        ArrayBuffer {
            shape: self.shape.clone(),
            dtype,
            data: data.freeze(),
        }
    }
}

impl fmt::Debug for ArrayBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayBuffer")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("bytes", &self.data.len())
            .finish()
    }
}

// =============================================================================
// ArrayBuilder
// =============================================================================

/// A mutable buffer used to assemble a result from several pieces.
pub struct ArrayBuilder {
    shape: Vec<usize>,
    dtype: DType,
    data: BytesMut,
}

impl ArrayBuilder {
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let len = shape.iter().product::<usize>() * dtype.itemsize();
        Self {
            shape: shape.to_vec(),
            dtype,
            data: BytesMut::zeroed(len),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Copy `src_region` of `src` into this buffer at `dst_origin`.
    ///
    /// Both coordinates are local: `src_region` is relative to `src`, and
    /// `dst_origin` is relative to the builder.
    pub fn paste(
        &mut self,
        dst_origin: &[usize],
        src: &ArrayBuffer,
        src_region: &Roi,
    ) -> Result<(), BufferError> {
        if src.dtype != self.dtype {
            return Err(BufferError::DtypeMismatch {
                expected: self.dtype,
                actual: src.dtype,
            });
        }
        if dst_origin.len() != self.shape.len() {
            return Err(BufferError::DimensionMismatch {
                expected: self.shape.len(),
                actual: dst_origin.len(),
            });
        }
        check_region(src_region, &src.shape)?;

        let extent = src_region.shape();
        let fits = dst_origin
            .iter()
            .zip(&extent)
            .zip(&self.shape)
            .all(|((o, e), s)| o + e <= *s);
        if !fits {
            return Err(BufferError::RegionOutOfBounds {
                roi: format!("{:?}+{:?}", dst_origin, extent),
                shape: self.shape.clone(),
            });
        }

        let src_origin: Vec<usize> = src_region.start().iter().map(|&s| s as usize).collect();
        copy_region(
            &src.data,
            &src.shape,
            &src_origin,
            &mut self.data,
            &self.shape,
            dst_origin,
            &extent,
            self.dtype.itemsize(),
        );
        Ok(())
    }

    /// Overwrite one element.
    pub fn set_f64(&mut self, index: &[usize], value: f64) -> Result<(), BufferError> {
        if index.len() != self.shape.len() || index.iter().zip(&self.shape).any(|(i, s)| i >= s) {
            return Err(BufferError::RegionOutOfBounds {
                roi: format!("{:?}", index),
                shape: self.shape.clone(),
            });
        }
        let offset: usize = index
            .iter()
            .zip(strides(&self.shape))
            .map(|(i, s)| i * s)
            .sum();
        let itemsize = self.dtype.itemsize();
        self.dtype
            .write_f64(value, &mut self.data[offset * itemsize..(offset + 1) * itemsize]);
        Ok(())
    }

    pub fn freeze(self) -> ArrayBuffer {
        ArrayBuffer {
            shape: self.shape,
            dtype: self.dtype,
            data: self.data.freeze(),
        }
    }
}

impl From<ArrayBuffer> for ArrayBuilder {
    fn from(buffer: ArrayBuffer) -> Self {
        Self {
            shape: buffer.shape,
            dtype: buffer.dtype,
            data: BytesMut::from(&buffer.data[..]),
        }
    }
}

// =============================================================================
// Layout helpers
// =============================================================================

fn check_region(region: &Roi, shape: &[usize]) -> Result<(), BufferError> {
    if region.ndim() != shape.len() {
        return Err(BufferError::DimensionMismatch {
            expected: shape.len(),
            actual: region.ndim(),
        });
    }
    if !region.fits_in(shape) {
        return Err(BufferError::RegionOutOfBounds {
            roi: region.to_string(),
            shape: shape.to_vec(),
        });
    }
    Ok(())
}

/// C-order strides in elements.
pub(crate) fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    strides
}

/// Copy an `extent`-shaped box between two C-ordered byte buffers.
#[allow(clippy::too_many_arguments)]
pub(crate) fn copy_region(
    src: &[u8],
    src_shape: &[usize],
    src_origin: &[usize],
    dst: &mut [u8],
    dst_shape: &[usize],
    dst_origin: &[usize],
    extent: &[usize],
    itemsize: usize,
) {
    let ndim = extent.len();
    if extent.iter().any(|&e| e == 0) {
        return;
    }
    if ndim == 0 {
        dst[..itemsize].copy_from_slice(&src[..itemsize]);
        return;
    }

    let src_strides = strides(src_shape);
    let dst_strides = strides(dst_shape);
    let run = extent[ndim - 1] * itemsize;
    let mut counter = vec![0usize; ndim - 1];

    loop {
        let mut s = src_origin[ndim - 1] * src_strides[ndim - 1];
        let mut d = dst_origin[ndim - 1] * dst_strides[ndim - 1];
        for axis in 0..ndim - 1 {
            s += (src_origin[axis] + counter[axis]) * src_strides[axis];
            d += (dst_origin[axis] + counter[axis]) * dst_strides[axis];
        }
        let (s, d) = (s * itemsize, d * itemsize);
        dst[d..d + run].copy_from_slice(&src[s..s + run]);

        let mut axis = ndim - 1;
        loop {
            if axis == 0 {
                return;
            }
            axis -= 1;
            counter[axis] += 1;
            if counter[axis] < extent[axis] {
                break;
            }
            counter[axis] = 0;
        }
    }
}

/// A contiguous stretch of a region inside a larger C-ordered array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Run {
    /// Element offset inside the full array
    pub array_offset: usize,
    /// Number of elements
    pub len: usize,
}

/// Split the region `[start, start + extent)` of an array into maximal
/// contiguous runs.
///
/// Trailing axes covered in full are merged into a single run, so a region
/// spanning whole rows becomes one run per outer index. Runs are returned in
/// the region's own C order, so the n-th run starts at element
/// `n * run.len` of a buffer holding just the region.
pub(crate) fn contiguous_runs(array_shape: &[usize], start: &[usize], extent: &[usize]) -> Vec<Run> {
    let ndim = extent.len();
    if extent.iter().any(|&e| e == 0) {
        return Vec::new();
    }
    if ndim == 0 {
        return vec![Run {
            array_offset: 0,
            len: 1,
        }];
    }

    let strides = strides(array_shape);
    let mut k = ndim - 1;
    while k > 0 && extent[k] == array_shape[k] {
        k -= 1;
    }
    let len = extent[k] * strides[k];

    let mut runs = Vec::new();
    let mut counter = vec![0usize; k];
    loop {
        let mut offset = start[k] * strides[k];
        for axis in 0..k {
            offset += (start[axis] + counter[axis]) * strides[axis];
        }
        runs.push(Run {
            array_offset: offset,
            len,
        });

        let mut axis = k;
        loop {
            if axis == 0 {
                return runs;
            }
            axis -= 1;
            counter[axis] += 1;
            if counter[axis] < extent[axis] {
                break;
            }
            counter[axis] = 0;
        }
    }
}
