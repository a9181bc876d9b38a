use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};

use crate::array::{copy_region, ArrayBuffer};
use crate::error::StoreError;
use crate::graph::Metadata;
use crate::roi::Roi;

// =============================================================================
// Traits
// =============================================================================

/// A block-addressable array store.
///
/// The engine treats every persistence format as this surface: regions are
/// read and written as whole arrays, and nothing else about the layout is
/// visible. Implementations must be thread-safe; concurrent writes to
/// disjoint regions are allowed.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Shape, element type and axis order of the stored array.
    fn metadata(&self) -> &Metadata;

    /// Location of the store, for logging.
    fn identifier(&self) -> &str;

    /// Read `roi` into a new buffer.
    async fn read(&self, roi: &Roi) -> Result<ArrayBuffer, StoreError>;

    /// Write `data` at `roi`. `data` must have the region's shape.
    async fn write(&self, roi: &Roi, data: &ArrayBuffer) -> Result<(), StoreError>;

    /// Flush pending writes.
    async fn close(&self) -> Result<(), StoreError>;
}

/// Creates and opens stores of one kind.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Create a new store, replacing any existing one at `location`.
    async fn create(&self, location: &str, meta: &Metadata) -> Result<Arc<dyn BlockStore>, StoreError>;

    async fn open(&self, location: &str) -> Result<Arc<dyn BlockStore>, StoreError>;
}

/// Validate a region against a store's shape.
pub(crate) fn check_region(meta: &Metadata, roi: &Roi) -> Result<(), StoreError> {
    if roi.fits_in(&meta.shape) {
        Ok(())
    } else {
        Err(StoreError::RegionOutOfBounds {
            roi: roi.to_string(),
            shape: meta.shape.clone(),
        })
    }
}

/// Validate a write against a store's shape and element type.
pub(crate) fn check_write(meta: &Metadata, roi: &Roi, data: &ArrayBuffer) -> Result<(), StoreError> {
    check_region(meta, roi)?;
    if data.shape() != roi.shape().as_slice() {
        return Err(StoreError::ShapeMismatch {
            expected: roi.shape(),
            actual: data.shape().to_vec(),
        });
    }
    if data.dtype() != meta.dtype {
        return Err(StoreError::DtypeMismatch {
            expected: meta.dtype,
            actual: data.dtype(),
        });
    }
    Ok(())
}

// =============================================================================
// MemoryStore
// =============================================================================

/// A store held entirely in process memory.
pub struct MemoryStore {
    name: String,
    meta: Metadata,
    data: RwLock<Vec<u8>>,
}

impl MemoryStore {
    /// A zero-filled store.
    pub fn new(name: impl Into<String>, meta: Metadata) -> Self {
        let len = meta.shape.iter().product::<usize>() * meta.dtype.itemsize();
        Self {
            name: name.into(),
            meta,
            data: RwLock::new(vec![0; len]),
        }
    }

    /// Copy of the whole stored array.
    pub fn snapshot(&self) -> Result<ArrayBuffer, StoreError> {
        let data = self.data.read().clone();
        ArrayBuffer::new(self.meta.shape.clone(), self.meta.dtype, data.into())
            .map_err(|err| StoreError::Io(err.to_string()))
    }
}

#[async_trait]
impl BlockStore for MemoryStore {
    fn metadata(&self) -> &Metadata {
        &self.meta
    }

    fn identifier(&self) -> &str {
        &self.name
    }

    async fn read(&self, roi: &Roi) -> Result<ArrayBuffer, StoreError> {
        check_region(&self.meta, roi)?;
        let extent = roi.shape();
        let itemsize = self.meta.dtype.itemsize();
        let mut out = BytesMut::zeroed(roi.volume() * itemsize);
        let start: Vec<usize> = roi.start().iter().map(|&s| s as usize).collect();
        copy_region(
            &self.data.read(),
            &self.meta.shape,
            &start,
            &mut out,
            &extent,
            &vec![0; extent.len()],
            &extent,
            itemsize,
        );
        ArrayBuffer::new(extent, self.meta.dtype, out.freeze())
            .map_err(|err| StoreError::Io(err.to_string()))
    }

    async fn write(&self, roi: &Roi, data: &ArrayBuffer) -> Result<(), StoreError> {
        check_write(&self.meta, roi, data)?;
        let extent = roi.shape();
        let start: Vec<usize> = roi.start().iter().map(|&s| s as usize).collect();
        copy_region(
            data.as_bytes(),
            &extent,
            &vec![0; extent.len()],
            &mut self.data.write(),
            &self.meta.shape,
            &start,
            &extent,
            self.meta.dtype.itemsize(),
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Keeps named [`MemoryStore`]s for the lifetime of the backend.
#[derive(Default)]
pub struct MemoryBackend {
    stores: Mutex<HashMap<String, Arc<MemoryStore>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The concrete store at `location`, for inspection in tests.
    pub fn get(&self, location: &str) -> Option<Arc<MemoryStore>> {
        self.stores.lock().get(location).cloned()
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn create(&self, location: &str, meta: &Metadata) -> Result<Arc<dyn BlockStore>, StoreError> {
        let store = Arc::new(MemoryStore::new(location, meta.clone()));
        self.stores.lock().insert(location.to_string(), store.clone());
        Ok(store)
    }

    async fn open(&self, location: &str) -> Result<Arc<dyn BlockStore>, StoreError> {
        match self.get(location) {
            Some(store) => Ok(store),
            None => Err(StoreError::NotFound(location.to_string())),
        }
    }
}
