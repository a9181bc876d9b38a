//! Regions of interest and block partitioning.
//!
//! A [`Roi`] addresses an N-dimensional sub-array as a half-open range. The
//! blocked cache and the streaming writer partition arrays into fixed-shape
//! blocks addressed by [`BlockIndex`]; blocks at the array boundary are
//! clipped to the remainder.
//!
//! ```text
//!   array shape 100, block shape 32
//!   ┌────────┬────────┬────────┬────┐
//!   │ [0,32) │[32,64) │[64,96) │[96,│100)
//!   └────────┴────────┴────────┴────┘
//!     block 0  block 1  block 2  block 3 (clipped to 4)
//! ```

mod blockshape;
mod region;

pub use blockshape::{clip_block_shape, determine_block_shape, determine_optimal_request_blockshape};
pub use region::{BlockIndex, Roi};
