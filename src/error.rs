use thiserror::Error;

use crate::array::DType;

/// Errors produced while constructing or combining regions of interest.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoiError {
    /// `start` is greater than `stop` on at least one axis
    #[error("Invalid region bounds: start {start:?} exceeds stop {stop:?}")]
    InvalidBounds { start: Vec<i64>, stop: Vec<i64> },

    /// Two operands disagree on the number of axes
    #[error("Dimension mismatch: expected {expected} axes, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Region reaches outside of the array it addresses
    #[error("Region {roi} is out of bounds for shape {shape:?}")]
    OutOfBounds { roi: String, shape: Vec<usize> },
}

/// Errors raised by array buffer construction and copies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    /// Byte length does not match `shape` and `dtype`
    #[error("Buffer length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// Typed access with the wrong element type
    #[error("Data type mismatch: expected {expected}, got {actual}")]
    DtypeMismatch { expected: DType, actual: DType },

    /// Shape has the wrong number of axes
    #[error("Dimension mismatch: expected {expected} axes, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Copy source or destination region does not fit
    #[error("Region {roi} does not fit in buffer of shape {shape:?}")]
    RegionOutOfBounds { roi: String, shape: Vec<usize> },
}

/// Errors raised while (re)computing operator metadata.
///
/// These are fatal for the operator until its inputs are reconfigured: the
/// affected outputs stay not-ready.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetadataError {
    /// A required input has neither a value nor a ready upstream
    #[error("Input slot '{slot}' of {operator} is not ready")]
    InputNotReady { operator: String, slot: String },

    /// Inputs cannot be combined
    #[error("Incompatible inputs for {operator}: {reason}")]
    IncompatibleShapes { operator: String, reason: String },

    /// Block shape has the wrong number of axes
    #[error("Block shape {block_shape:?} does not match array dimensionality {ndim}")]
    BlockShapeMismatch { block_shape: Vec<usize>, ndim: usize },

    /// Block shape contains a zero-length axis
    #[error("Invalid block shape {0:?}: every axis must be positive")]
    InvalidBlockShape(Vec<usize>),

    /// A value slot was fed the wrong kind of value
    #[error("Slot '{slot}' expects {expected}, got {actual}")]
    UnexpectedValue {
        slot: String,
        expected: &'static str,
        actual: String,
    },

    /// Connecting the slot would close a loop in the graph
    #[error("Connecting '{slot}' would create a cycle through {operator}")]
    Cycle { operator: String, slot: String },

    /// Axis keys do not line up with the shape
    #[error("Axis order '{axis_order}' does not match {ndim} dimensions")]
    AxisOrderMismatch { axis_order: String, ndim: usize },
}

/// Errors from the backing block store.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// Store does not exist at the given location
    #[error("Store not found: {0}")]
    NotFound(String),

    /// Underlying read/write/open failure
    #[error("Store I/O error: {0}")]
    Io(String),

    /// Region exceeds the store's extent
    #[error("Region {roi} is out of bounds for store shape {shape:?}")]
    RegionOutOfBounds { roi: String, shape: Vec<usize> },

    /// Written data does not match the addressed region
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Written data does not match the store's element type
    #[error("Data type mismatch: expected {expected}, got {actual}")]
    DtypeMismatch { expected: DType, actual: DType },

    /// Header is missing fields or cannot be parsed
    #[error("Invalid store header: {0}")]
    InvalidHeader(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            StoreError::NotFound(err.to_string())
        } else {
            StoreError::Io(err.to_string())
        }
    }
}

/// Top-level error delivered to every waiter of a request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FlowError {
    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    /// Failure inside an operator's `execute`
    #[error("Compute error in {operator}: {message}")]
    Compute { operator: String, message: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Region error: {0}")]
    Roi(#[from] RoiError),

    /// Terminal state distinct from success and failure
    #[error("Request was cancelled")]
    Cancelled,

    /// Slot has no metadata yet
    #[error("Slot '{slot}' is not ready")]
    NotReady { slot: String },

    /// The operator behind an output slot no longer exists
    #[error("Operator owning slot '{0}' has been dropped")]
    OperatorDropped(String),

    /// `submit()` was called outside of a tokio runtime without a handle
    #[error("No async runtime available to run the request")]
    NoRuntime,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FlowError {
    /// Build a compute error attributed to `operator`.
    pub fn compute(operator: impl Into<String>, message: impl Into<String>) -> Self {
        FlowError::Compute {
            operator: operator.into(),
            message: message.into(),
        }
    }

    /// Whether this is the cancellation terminal state rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FlowError::Cancelled)
    }
}
