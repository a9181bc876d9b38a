//! # blockflow
//!
//! A lazy dataflow engine for N-dimensional arrays.
//!
//! Operators are wired into a graph through typed slots. Nothing is computed
//! until someone requests a region of an output; the request then fans out
//! upstream as a tree of cancellable [`Request`]s running on a tokio runtime.
//! Changes upstream travel downstream as dirty regions, so caches drop
//! exactly the blocks that went stale.
//!
//! ## Features
//!
//! - **Blockwise caching**: [`OpBlockedArrayCache`] memoizes its input block by
//!   block, computes each block at most once at a time, and evicts under a
//!   byte budget
//! - **Streaming export**: [`OpBlockwiseWriter`] moves arrays larger than
//!   memory into a [`BlockStore`] with bounded concurrency, progress reporting
//!   and cancellation
//! - **Region algebra**: [`Roi`] intersection, translation and block
//!   partitioning, plus block-shape heuristics
//!
//! ## Architecture
//!
//! - [`roi`] - regions of interest and block partitioning
//! - [`array`] - element types and immutable array buffers
//! - [`request`] - the request/cancellation primitive
//! - [`graph`] - slots, operators, metadata and dirty propagation
//! - [`operators`] - sources and generic operators
//! - [`cache`] - the blocked array cache
//! - [`streaming`] - block stores, writer and reader
//! - [`config`] - engine tunables and the CLI
//!
//! ## Example
//!
//! ```rust
//! use blockflow::{ArrayBuffer, OpArraySource, OpBlockedArrayCache, Roi, DEFAULT_CACHE_MEMORY};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let data = ArrayBuffer::from_fn(&[64, 64], |idx| (idx[0] + idx[1]) as u16);
//! let source = OpArraySource::new(Some(data)).unwrap();
//!
//! let cache = OpBlockedArrayCache::new(DEFAULT_CACHE_MEMORY);
//! cache.input().connect(source.output()).unwrap();
//! cache.block_shape().set_value(vec![16usize, 16]).unwrap();
//!
//! let roi = Roi::new(vec![10, 10], vec![30, 20]).unwrap();
//! let region = cache.output().get(roi).wait().await.unwrap();
//! assert_eq!(region.shape(), &[20, 10]);
//! assert_eq!(cache.stats().ready_blocks, 4);
//! # }
//! ```

pub mod array;
pub mod cache;
pub mod config;
pub mod error;
pub mod graph;
pub mod operators;
pub mod request;
pub mod roi;
pub mod streaming;

// Re-export commonly used types
pub use array::{ArrayBuffer, ArrayBuilder, DType, Element};
pub use cache::{CacheStats, OpBlockedArrayCache, DEFAULT_CACHE_MEMORY};
pub use config::{Cli, Command, EngineConfig, ExportConfig, InspectConfig, RuntimeArgs};
pub use error::{BufferError, FlowError, MetadataError, RoiError, StoreError};
pub use graph::{configure, Graph, InputSlot, Metadata, Operator, OutputSlot, Signal, SlotState, Value};
pub use operators::{OpArrayPiper, OpArraySource, OpElementwise, OpRampSource, OpSubRegion};
pub use request::{CancellationToken, Outcome, Phase, Request, RequestContext, RequestPool};
pub use roi::{BlockIndex, Roi};
pub use streaming::{
    BlockStore, ExportSummary, MemoryBackend, MemoryStore, OpBlockwiseWriter, OpStoreReader,
    ProgressSignal, RawFileBackend, RawFileStore, StoreBackend,
};
