//! Block state table of the blocked array cache.
//!
//! A block is in exactly one of three states:
//!
//! - **Empty**: in neither map
//! - **Computing**: in `in_flight`, with the request producing it
//! - **Ready**: in `ready`, with its payload
//!
//! All transitions happen under the table's mutex, which is never held
//! across an `.await`.

use std::collections::{BTreeSet, HashMap};

use lru::LruCache;
use tracing::trace;

use crate::array::ArrayBuffer;
use crate::error::FlowError;
use crate::request::{Outcome, Request};
use crate::roi::{BlockIndex, Roi};

/// Result of looking up a block.
pub(crate) enum Lookup {
    /// Payload is cached
    Ready(ArrayBuffer),
    /// Frozen cache and the block was never computed
    Zeros,
    /// Another requester is computing the block
    Pending(Request<ArrayBuffer>),
    /// A computation is running but was invalidated; wait for it, then retry
    Stale(Request<ArrayBuffer>),
    /// The caller now owns the computation and must submit `request`
    Claimed {
        ticket: u64,
        request: Request<ArrayBuffer>,
    },
}

struct InFlight {
    ticket: u64,
    request: Request<ArrayBuffer>,
    stale: bool,
}

/// Snapshot of a cache's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub ready_blocks: usize,
    pub computing_blocks: usize,
    pub bytes: usize,
    pub max_bytes: usize,
    pub fixed: bool,
    pub deferred_blocks: usize,
}

pub(crate) struct CacheTable {
    ready: LruCache<BlockIndex, ArrayBuffer>,
    in_flight: HashMap<BlockIndex, InFlight>,
    bytes: usize,
    max_bytes: usize,
    next_ticket: u64,

    fixed: bool,
    deferred: BTreeSet<BlockIndex>,
    deferred_all: bool,
}

impl CacheTable {
    pub(crate) fn new(max_bytes: usize) -> Self {
        Self {
            ready: LruCache::unbounded(),
            in_flight: HashMap::new(),
            bytes: 0,
            max_bytes,
            next_ticket: 0,
            fixed: false,
            deferred: BTreeSet::new(),
            deferred_all: false,
        }
    }

    /// Find the block, or claim its computation with a request from `make`.
    ///
    /// This is the single atomic step that keeps at most one computation per
    /// block in flight.
    pub(crate) fn lookup(
        &mut self,
        index: &BlockIndex,
        make: impl FnOnce() -> Request<ArrayBuffer>,
    ) -> Lookup {
        if let Some(data) = self.ready.get(index) {
            return Lookup::Ready(data.clone());
        }
        if let Some(entry) = self.in_flight.get(index) {
            return if entry.stale {
                Lookup::Stale(entry.request.clone())
            } else {
                Lookup::Pending(entry.request.clone())
            };
        }
        if self.fixed {
            self.deferred.insert(index.clone());
            return Lookup::Zeros;
        }

        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let request = make();
        self.in_flight.insert(
            index.clone(),
            InFlight {
                ticket,
                request: request.clone(),
                stale: false,
            },
        );
        Lookup::Claimed { ticket, request }
    }

    /// Record the end of the computation identified by `ticket`.
    ///
    /// Success stores the payload unless the block was invalidated meanwhile.
    /// Failure and cancellation return the block to Empty.
    pub(crate) fn complete(&mut self, index: &BlockIndex, ticket: u64, outcome: &Outcome<ArrayBuffer>) {
        match self.in_flight.get(index) {
            Some(entry) if entry.ticket == ticket => {}
            _ => return,
        }
        let Some(entry) = self.in_flight.remove(index) else {
            return;
        };
        match outcome {
            Ok(data) if !entry.stale => {
                self.bytes += data.byte_len();
                if let Some(old) = self.ready.put(index.clone(), data.clone()) {
                    self.bytes -= old.byte_len();
                }
                self.evict();
            }
            Ok(_) => trace!(block = %index, "Discarding stale block"),
            Err(FlowError::Cancelled) => trace!(block = %index, "Block computation cancelled"),
            Err(err) => trace!(block = %index, error = %err, "Block computation failed"),
        }
    }

    /// Drop payloads and mark running computations stale.
    pub(crate) fn invalidate<'a>(&mut self, indices: impl IntoIterator<Item = &'a BlockIndex>) {
        for index in indices {
            if let Some(old) = self.ready.pop(index) {
                self.bytes -= old.byte_len();
            }
            if let Some(entry) = self.in_flight.get_mut(index) {
                entry.stale = true;
            }
        }
    }

    /// Handle a dirty region: invalidate now, or remember it while frozen.
    /// `covers_all` stands for every block, whatever `indices` holds.
    ///
    /// Returns `true` if the blocks were invalidated immediately.
    pub(crate) fn dirty(&mut self, indices: &[BlockIndex], covers_all: bool) -> bool {
        if self.fixed {
            if covers_all {
                self.deferred_all = true;
            } else {
                self.deferred.extend(indices.iter().cloned());
            }
            return false;
        }
        if covers_all {
            self.clear();
        } else {
            self.invalidate(indices);
        }
        true
    }

    /// Freeze or unfreeze.
    ///
    /// Unfreezing invalidates every block recorded while frozen and returns
    /// the region downstream must be told about: the bounding box of those
    /// blocks, or the whole array if everything was dirtied.
    pub(crate) fn set_fixed(
        &mut self,
        fixed: bool,
        block_shape: &[usize],
        array_shape: &[usize],
    ) -> Option<Roi> {
        if fixed == self.fixed {
            return None;
        }
        self.fixed = fixed;
        if fixed {
            return None;
        }

        let deferred = std::mem::take(&mut self.deferred);
        if std::mem::take(&mut self.deferred_all) {
            self.clear();
            return Some(Roi::from_shape(array_shape));
        }
        self.invalidate(deferred.iter());
        deferred
            .iter()
            .map(|index| index.roi(block_shape, array_shape))
            .reduce(|a, b| a.union_bounds(&b))
    }

    /// Forget every payload and mark running computations stale.
    pub(crate) fn clear(&mut self) {
        self.ready.clear();
        self.bytes = 0;
        for entry in self.in_flight.values_mut() {
            entry.stale = true;
        }
    }

    /// Drop everything including the frozen bookkeeping, for a new layout.
    pub(crate) fn reset(&mut self) {
        self.clear();
        self.deferred.clear();
        self.deferred_all = false;
    }

    pub(crate) fn set_max_bytes(&mut self, max_bytes: usize) {
        self.max_bytes = max_bytes;
        self.evict();
    }

    fn evict(&mut self) {
        while self.bytes > self.max_bytes {
            match self.ready.pop_lru() {
                Some((index, data)) => {
                    trace!(block = %index, bytes = data.byte_len(), "Evicting block");
                    self.bytes -= data.byte_len();
                }
                None => break,
            }
        }
    }

    pub(crate) fn is_ready(&self, index: &BlockIndex) -> bool {
        self.ready.contains(index)
    }

    pub(crate) fn stats(&self) -> CacheStats {
        CacheStats {
            ready_blocks: self.ready.len(),
            computing_blocks: self.in_flight.len(),
            bytes: self.bytes,
            max_bytes: self.max_bytes,
            fixed: self.fixed,
            deferred_blocks: self.deferred.len(),
        }
    }
}
