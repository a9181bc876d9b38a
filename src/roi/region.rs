use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RoiError;

// =============================================================================
// Roi
// =============================================================================

/// An N-dimensional half-open coordinate range `[start, stop)`.
///
/// Regions are immutable values: every operation returns a new region.
/// Equality and hashing are structural, so a `Roi` can be used directly as a
/// map key (the cache test helpers count computations per region this way).
///
/// Coordinates are signed so that translation into a local frame and block
/// arithmetic on negative offsets behave like integer floor division.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Roi {
    start: Vec<i64>,
    stop: Vec<i64>,
}

impl Roi {
    /// Create a region, checking `start[i] <= stop[i]` on every axis.
    pub fn new(start: Vec<i64>, stop: Vec<i64>) -> Result<Self, RoiError> {
        if start.len() != stop.len() {
            return Err(RoiError::DimensionMismatch {
                expected: start.len(),
                actual: stop.len(),
            });
        }
        if start.iter().zip(&stop).any(|(a, b)| a > b) {
            return Err(RoiError::InvalidBounds { start, stop });
        }
        Ok(Self { start, stop })
    }

    /// The region covering an entire array of the given shape.
    pub fn from_shape(shape: &[usize]) -> Self {
        Self {
            start: vec![0; shape.len()],
            stop: shape.iter().map(|&s| s as i64).collect(),
        }
    }

    /// A zero-dimensional region, used to address scalar values.
    pub fn scalar() -> Self {
        Self {
            start: Vec::new(),
            stop: Vec::new(),
        }
    }

    pub fn start(&self) -> &[i64] {
        &self.start
    }

    pub fn stop(&self) -> &[i64] {
        &self.stop
    }

    /// Number of axes.
    pub fn ndim(&self) -> usize {
        self.start.len()
    }

    /// Extent along every axis (`stop - start`).
    pub fn shape(&self) -> Vec<usize> {
        self.start
            .iter()
            .zip(&self.stop)
            .map(|(a, b)| (b - a) as usize)
            .collect()
    }

    /// Number of elements covered.
    pub fn volume(&self) -> usize {
        self.shape().iter().product()
    }

    /// True if at least one axis has zero extent.
    pub fn is_empty(&self) -> bool {
        self.start.iter().zip(&self.stop).any(|(a, b)| a == b)
    }

    /// Overlap of two regions, or `None` if they are disjoint on any axis.
    pub fn intersect(&self, other: &Roi) -> Option<Roi> {
        if self.ndim() != other.ndim() {
            return None;
        }
        let start: Vec<i64> = self
            .start
            .iter()
            .zip(&other.start)
            .map(|(a, b)| *a.max(b))
            .collect();
        let stop: Vec<i64> = self
            .stop
            .iter()
            .zip(&other.stop)
            .map(|(a, b)| *a.min(b))
            .collect();
        if start.iter().zip(&stop).any(|(a, b)| a >= b) {
            return None;
        }
        Some(Roi { start, stop })
    }

    /// Shift the region by `offset` on every axis.
    ///
    /// # Panics
    /// Panics if `offset` does not have one entry per axis.
    pub fn translate(&self, offset: &[i64]) -> Roi {
        assert_eq!(offset.len(), self.ndim(), "offset dimensionality mismatch");
        Roi {
            start: self.start.iter().zip(offset).map(|(a, o)| a + o).collect(),
            stop: self.stop.iter().zip(offset).map(|(a, o)| a + o).collect(),
        }
    }

    /// Express this region relative to `origin` (translation by `-origin`).
    pub fn relative_to(&self, origin: &[i64]) -> Roi {
        let negated: Vec<i64> = origin.iter().map(|o| -o).collect();
        self.translate(&negated)
    }

    /// True if `other` lies entirely inside this region.
    pub fn contains(&self, other: &Roi) -> bool {
        self.ndim() == other.ndim()
            && self.start.iter().zip(&other.start).all(|(a, b)| a <= b)
            && self.stop.iter().zip(&other.stop).all(|(a, b)| a >= b)
    }

    /// True if the region lies inside `[0, shape)`.
    pub fn fits_in(&self, shape: &[usize]) -> bool {
        self.ndim() == shape.len()
            && self.start.iter().all(|&s| s >= 0)
            && self.stop.iter().zip(shape).all(|(&s, &m)| s <= m as i64)
    }

    /// Check that the region lies inside `[0, shape)`.
    pub fn check_bounds(&self, shape: &[usize]) -> Result<(), RoiError> {
        if self.ndim() != shape.len() {
            return Err(RoiError::DimensionMismatch {
                expected: shape.len(),
                actual: self.ndim(),
            });
        }
        if !self.fits_in(shape) {
            return Err(RoiError::OutOfBounds {
                roi: self.to_string(),
                shape: shape.to_vec(),
            });
        }
        Ok(())
    }

    /// Smallest region containing both `self` and `other`.
    pub fn union_bounds(&self, other: &Roi) -> Roi {
        Roi {
            start: self
                .start
                .iter()
                .zip(&other.start)
                .map(|(a, b)| *a.min(b))
                .collect(),
            stop: self
                .stop
                .iter()
                .zip(&other.stop)
                .map(|(a, b)| *a.max(b))
                .collect(),
        }
    }

    /// Enumerate every block whose extent intersects this region.
    ///
    /// Uses floor division of `start` and ceil division of `stop` by
    /// `block_shape` on each axis. Indices are produced in C order (last axis
    /// fastest). An empty region intersects no block.
    ///
    /// # Panics
    /// Panics if `block_shape` has the wrong length or contains a zero.
    pub fn to_block_indices(&self, block_shape: &[usize]) -> Vec<BlockIndex> {
        assert_eq!(
            block_shape.len(),
            self.ndim(),
            "block shape dimensionality mismatch"
        );
        assert!(
            block_shape.iter().all(|&b| b > 0),
            "block shape must not contain zeros"
        );
        if self.is_empty() {
            return Vec::new();
        }

        let first: Vec<i64> = self
            .start
            .iter()
            .zip(block_shape)
            .map(|(&s, &b)| s.div_euclid(b as i64))
            .collect();
        let last: Vec<i64> = self
            .stop
            .iter()
            .zip(block_shape)
            .map(|(&s, &b)| (s + b as i64 - 1).div_euclid(b as i64))
            .collect();

        let mut indices = Vec::new();
        let mut current = first.clone();
        loop {
            indices.push(BlockIndex(current.clone()));

            // Odometer increment, last axis fastest
            let mut axis = current.len();
            loop {
                if axis == 0 {
                    return indices;
                }
                axis -= 1;
                current[axis] += 1;
                if current[axis] < last[axis] {
                    break;
                }
                current[axis] = first[axis];
            }
        }
    }

    /// Bounds of every block overlapping this region, clipped to the array.
    ///
    /// With `clip_to_roi` the bounds are additionally clipped to this region,
    /// which yields exactly the pieces a blockwise reader has to fetch.
    pub fn block_rois(
        &self,
        array_shape: &[usize],
        block_shape: &[usize],
        clip_to_roi: bool,
    ) -> Vec<Roi> {
        self.to_block_indices(block_shape)
            .into_iter()
            .filter_map(|index| {
                let bounds = index.roi(block_shape, array_shape);
                if clip_to_roi {
                    bounds.intersect(self)
                } else if bounds.is_empty() {
                    None
                } else {
                    Some(bounds)
                }
            })
            .collect()
    }
}

impl fmt::Display for Roi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}, {:?})", self.start, self.stop)
    }
}

// =============================================================================
// BlockIndex
// =============================================================================

/// Position of a block in block-grid coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockIndex(pub Vec<i64>);

impl BlockIndex {
    /// Coordinate of the block's first element.
    pub fn origin(&self, block_shape: &[usize]) -> Vec<i64> {
        self.0
            .iter()
            .zip(block_shape)
            .map(|(&i, &b)| i * b as i64)
            .collect()
    }

    /// The block's extent, clipped to the array's total shape.
    ///
    /// Blocks touching the array boundary come out smaller than the nominal
    /// block shape.
    pub fn roi(&self, block_shape: &[usize], array_shape: &[usize]) -> Roi {
        let start = self.origin(block_shape);
        let stop: Vec<i64> = start
            .iter()
            .zip(block_shape)
            .zip(array_shape)
            .map(|((&s, &b), &m)| (s + b as i64).min(m as i64))
            .collect();
        let start: Vec<i64> = start
            .iter()
            .zip(&stop)
            .map(|(&s, &e)| s.min(e))
            .collect();
        Roi { start, stop }
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}
