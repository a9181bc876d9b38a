//! Asynchronous, cancellable requests.
//!
//! A [`Request`] is the unit of lazy computation in the engine: reading an
//! output slot for a region returns a request, and operators fan out into
//! child requests for the upstream data they need.
//!
//! Requests run on tokio. Waiting is an `.await`, so a producer blocked on
//! its children gives its worker thread back to the pool. Cancellation is
//! cooperative and flows top-down through [`CancellationToken`] hierarchies:
//! every child request holds a child token of its parent's.

mod pool;
#[allow(clippy::module_inception)]
mod request;

pub use pool::RequestPool;
pub use request::{Outcome, Phase, Request, RequestContext};
pub use tokio_util::sync::CancellationToken;
