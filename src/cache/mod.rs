//! Block-addressed caching.
//!
//! [`OpBlockedArrayCache`] partitions its input into fixed-shape blocks and
//! memoizes them. The block table is owned by the cache instance; there is
//! no process-wide cache state.

mod blocked;
mod table;

pub use blocked::{OpBlockedArrayCache, DEFAULT_CACHE_MEMORY};
pub use table::CacheStats;
