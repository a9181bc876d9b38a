//! Operators, slots and metadata propagation.
//!
//! # Wiring
//!
//! ```text
//!   OpArraySource            OpElementwise             OpBlockedArrayCache
//!   ┌───────────┐          ┌────────────────┐          ┌──────────────────┐
//!   │    Output ├─────────►│ Input   Output ├─────────►│ Input     Output ├──► get(roi)
//!   └───────────┘  dirty   └────────────────┘  dirty   │ BlockShape       │
//!                  meta ◄──                    meta ◄──│ FixAtCurrent     │
//!                                                      └──────────────────┘
//! ```
//!
//! Connecting an input subscribes it to the upstream output's dirty and
//! meta-changed signals. A metadata change re-runs [`configure`] downstream;
//! a dirty notification calls the downstream operator's
//! [`Operator::propagate_dirty`]. Data only moves when someone requests a
//! region, and then as a tree of [`Request`](crate::request::Request)s.

mod metadata;
mod operator;
mod signal;
mod slot;

pub use metadata::{Metadata, Value};
pub use operator::{configure, Graph, Operator};
pub use signal::{Signal, SubscriptionId};
pub use slot::{InputSlot, OutputSlot, SlotState};
