//! Moving arrays between the graph and block-addressable stores.
//!
//! - [`BlockStore`] / [`StoreBackend`] - the persistence surface
//! - [`MemoryStore`], [`RawFileStore`] - in-process and on-disk stores
//! - [`OpBlockwiseWriter`] - exports an input block by block with bounded
//!   concurrency, progress reporting and cancellation
//! - [`OpStoreReader`] - serves a store's contents as an operator output
//!
//! Exports that must not leave a half-written file behind write to a
//! temporary location and [`RawFileBackend::commit`] it on success.

mod progress;
mod raw_file;
mod reader;
mod store;
mod writer;

pub use progress::{ProgressSignal, ProgressTracker};
pub use raw_file::{header_path, read_header, RawFileBackend, RawFileStore, StoreHeader, RAW_FORMAT_VERSION};
pub use reader::OpStoreReader;
pub use store::{BlockStore, MemoryBackend, MemoryStore, StoreBackend};
pub use writer::{ExportSummary, OpBlockwiseWriter, DEFAULT_EXPORT_MEMORY, DEFAULT_MAX_IN_FLIGHT};
