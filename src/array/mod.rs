//! Dense N-dimensional array buffers.
//!
//! Every value that flows through the graph is an [`ArrayBuffer`]: a shape, an
//! element type and a shared little-endian byte payload in C order.

mod buffer;
mod dtype;

pub use buffer::{ArrayBuffer, ArrayBuilder};
pub use dtype::{DType, Element};

pub(crate) use buffer::{contiguous_runs, copy_region, strides, Run};
