use serde::{Deserialize, Serialize};

use crate::array::{ArrayBuffer, DType};
use crate::error::MetadataError;
use crate::roi::Roi;

const DEFAULT_AXES: &str = "tczyx";

// =============================================================================
// Metadata
// =============================================================================

/// Shape and semantics of the array behind an output slot.
///
/// Metadata is owned by the output slot and recomputed by the operator's
/// `setup_outputs` whenever its inputs change. Downstream consumers only read
/// it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub shape: Vec<usize>,
    pub dtype: DType,

    /// One key per axis, e.g. `"tzyxc"`
    pub axis_order: String,

    /// Display or value range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drange: Option<(f64, f64)>,

    /// Preferred request granularity; a `0` entry means "whole axis"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ideal_block_shape: Option<Vec<usize>>,

    /// Bytes of memory a request consumes per output pixel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_usage_per_requested_pixel: Option<f64>,
}

impl Metadata {
    /// Metadata with a default axis order (the trailing keys of `"tczyx"`).
    pub fn new(shape: Vec<usize>, dtype: DType) -> Self {
        let axis_order = Self::default_axis_order(shape.len());
        Self {
            shape,
            dtype,
            axis_order,
            drange: None,
            ideal_block_shape: None,
            ram_usage_per_requested_pixel: None,
        }
    }

    pub fn default_axis_order(ndim: usize) -> String {
        if ndim <= DEFAULT_AXES.len() {
            DEFAULT_AXES[DEFAULT_AXES.len() - ndim..].to_string()
        } else {
            (0..ndim).map(|i| (b'a' + (i % 26) as u8) as char).collect()
        }
    }

    pub fn with_axis_order(mut self, axis_order: impl Into<String>) -> Self {
        self.axis_order = axis_order.into();
        self
    }

    pub fn with_drange(mut self, low: f64, high: f64) -> Self {
        self.drange = Some((low, high));
        self
    }

    pub fn with_ideal_block_shape(mut self, block_shape: Vec<usize>) -> Self {
        self.ideal_block_shape = Some(block_shape);
        self
    }

    pub fn with_ram_usage_per_requested_pixel(mut self, bytes: f64) -> Self {
        self.ram_usage_per_requested_pixel = Some(bytes);
        self
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Region covering the whole array.
    pub fn roi(&self) -> Roi {
        Roi::from_shape(&self.shape)
    }

    /// Memory per requested pixel, falling back to the element size.
    pub fn ram_per_pixel(&self) -> f64 {
        self.ram_usage_per_requested_pixel
            .unwrap_or(self.dtype.itemsize() as f64)
    }

    /// Check that the axis keys line up with the shape.
    pub fn validate(&self) -> Result<(), MetadataError> {
        let keys: Vec<char> = self.axis_order.chars().collect();
        let mut unique = keys.clone();
        unique.sort_unstable();
        unique.dedup();
        if keys.len() != self.ndim() || unique.len() != keys.len() {
            return Err(MetadataError::AxisOrderMismatch {
                axis_order: self.axis_order.clone(),
                ndim: self.ndim(),
            });
        }
        if let Some(ideal) = &self.ideal_block_shape {
            if ideal.len() != self.ndim() {
                return Err(MetadataError::BlockShapeMismatch {
                    block_shape: ideal.clone(),
                    ndim: self.ndim(),
                });
            }
        }
        Ok(())
    }

    /// Position of `key` in the axis order.
    pub fn axis_index(&self, key: char) -> Option<usize> {
        self.axis_order.chars().position(|c| c == key)
    }
}

// =============================================================================
// Value
// =============================================================================

/// A value fed directly into an input slot with `set_value`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Array(ArrayBuffer),
    Shape(Vec<usize>),
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Region(Roi),
}

impl Value {
    /// Name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Array(_) => "array",
            Value::Shape(_) => "shape",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Region(_) => "region",
        }
    }

    pub fn as_array(&self) -> Option<&ArrayBuffer> {
        match self {
            Value::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_shape(&self) -> Option<&[usize]> {
        match self {
            Value::Shape(shape) => Some(shape),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_region(&self) -> Option<&Roi> {
        match self {
            Value::Region(roi) => Some(roi),
            _ => None,
        }
    }

    /// Metadata describing an array value; `None` for scalars.
    pub fn meta(&self) -> Option<Metadata> {
        self.as_array()
            .map(|array| Metadata::new(array.shape().to_vec(), array.dtype()))
    }
}

impl From<ArrayBuffer> for Value {
    fn from(array: ArrayBuffer) -> Self {
        Value::Array(array)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<Vec<usize>> for Value {
    fn from(shape: Vec<usize>) -> Self {
        Value::Shape(shape)
    }
}

impl From<Roi> for Value {
    fn from(roi: Roi) -> Self {
        Value::Region(roi)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}
