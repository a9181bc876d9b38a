//! Ready-made operators.
//!
//! - [`OpArraySource`], [`OpRampSource`] - data origins without inputs
//! - [`OpArrayPiper`] - identity, a stable connection point
//! - [`OpSubRegion`] - crop to a fixed region
//! - [`OpElementwise`] - per-element map with one-to-one dirty forwarding
//!
//! The blocked cache and the streaming operators live in
//! [`cache`](crate::cache) and [`streaming`](crate::streaming).

mod generic;
mod sources;

pub use generic::{OpArrayPiper, OpElementwise, OpSubRegion};
pub use sources::{ramp_value, OpArraySource, OpRampSource};
