//! Raw little-endian array files with a JSON header sidecar.
//!
//! # Layout
//!
//! ```text
//! export.raw        C-ordered element data, no padding
//! export.raw.json   {"format_version": 1, "metadata": {shape, dtype, axis_order, ...}}
//! ```
//!
//! Regions are transferred as runs of contiguous elements: trailing axes
//! covered in full collapse into a single run, so whole-row blocks cost one
//! seek per outer index.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;
use tracing::debug;

use super::store::{check_region, check_write, BlockStore, StoreBackend};
use crate::array::{contiguous_runs, ArrayBuffer};
use crate::error::StoreError;
use crate::graph::Metadata;
use crate::roi::Roi;

/// Current header format version.
pub const RAW_FORMAT_VERSION: u32 = 1;

/// Contents of the `.json` sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreHeader {
    pub format_version: u32,
    pub metadata: Metadata,
}

/// Path of the header belonging to `data_path`.
pub fn header_path(data_path: &Path) -> PathBuf {
    let mut name = data_path.as_os_str().to_os_string();
    name.push(".json");
    PathBuf::from(name)
}

/// Read and validate the header of a raw store.
pub async fn read_header(data_path: &Path) -> Result<StoreHeader, StoreError> {
    let raw = tokio::fs::read(header_path(data_path)).await?;
    let header: StoreHeader =
        serde_json::from_slice(&raw).map_err(|err| StoreError::InvalidHeader(err.to_string()))?;
    if header.format_version != RAW_FORMAT_VERSION {
        return Err(StoreError::InvalidHeader(format!(
            "unsupported format version {}",
            header.format_version
        )));
    }
    header
        .metadata
        .validate()
        .map_err(|err| StoreError::InvalidHeader(err.to_string()))?;
    Ok(header)
}

// =============================================================================
// RawFileStore
// =============================================================================

/// A [`BlockStore`] backed by one raw data file.
///
/// All I/O goes through a single file handle guarded by an async mutex, so
/// concurrent block writes are serialized at the handle.
pub struct RawFileStore {
    path: PathBuf,
    identifier: String,
    meta: Metadata,
    file: Mutex<File>,
}

impl RawFileStore {
    /// Create the data file (preallocated to full size) and its header.
    pub async fn create(path: impl AsRef<Path>, meta: &Metadata) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        meta.validate()
            .map_err(|err| StoreError::InvalidHeader(err.to_string()))?;

        let header = StoreHeader {
            format_version: RAW_FORMAT_VERSION,
            metadata: meta.clone(),
        };
        let json = serde_json::to_vec_pretty(&header)
            .map_err(|err| StoreError::InvalidHeader(err.to_string()))?;
        tokio::fs::write(header_path(&path), json).await?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.set_len(data_len(meta)).await?;

        debug!(path = %path.display(), shape = ?meta.shape, dtype = %meta.dtype, "Created raw store");
        Ok(Self::from_parts(path, meta.clone(), file))
    }

    /// Open an existing store and check the data file against its header.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let header = read_header(&path).await?;
        let file = OpenOptions::new().read(true).write(true).open(&path).await?;

        let expected = data_len(&header.metadata);
        let actual = file.metadata().await?.len();
        if actual != expected {
            return Err(StoreError::InvalidHeader(format!(
                "data file holds {} bytes, header describes {}",
                actual, expected
            )));
        }
        Ok(Self::from_parts(path, header.metadata, file))
    }

    fn from_parts(path: PathBuf, meta: Metadata, file: File) -> Self {
        Self {
            identifier: path.display().to_string(),
            path,
            meta,
            file: Mutex::new(file),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn start_of(roi: &Roi) -> Vec<usize> {
        roi.start().iter().map(|&s| s as usize).collect()
    }
}

fn data_len(meta: &Metadata) -> u64 {
    meta.shape.iter().product::<usize>() as u64 * meta.dtype.itemsize() as u64
}

#[async_trait]
impl BlockStore for RawFileStore {
    fn metadata(&self) -> &Metadata {
        &self.meta
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn read(&self, roi: &Roi) -> Result<ArrayBuffer, StoreError> {
        check_region(&self.meta, roi)?;
        let itemsize = self.meta.dtype.itemsize();
        let mut out = BytesMut::zeroed(roi.volume() * itemsize);

        let runs = contiguous_runs(&self.meta.shape, &Self::start_of(roi), &roi.shape());
        let mut file = self.file.lock().await;
        let mut cursor = 0;
        for run in runs {
            let len = run.len * itemsize;
            file.seek(SeekFrom::Start((run.array_offset * itemsize) as u64))
                .await?;
            file.read_exact(&mut out[cursor..cursor + len]).await?;
            cursor += len;
        }
        drop(file);

        ArrayBuffer::new(roi.shape(), self.meta.dtype, out.freeze())
            .map_err(|err| StoreError::Io(err.to_string()))
    }

    async fn write(&self, roi: &Roi, data: &ArrayBuffer) -> Result<(), StoreError> {
        check_write(&self.meta, roi, data)?;
        let itemsize = self.meta.dtype.itemsize();
        let bytes = data.as_bytes();

        let runs = contiguous_runs(&self.meta.shape, &Self::start_of(roi), &roi.shape());
        let mut file = self.file.lock().await;
        let mut cursor = 0;
        for run in runs {
            let len = run.len * itemsize;
            file.seek(SeekFrom::Start((run.array_offset * itemsize) as u64))
                .await?;
            file.write_all(&bytes[cursor..cursor + len]).await?;
            cursor += len;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
}

// =============================================================================
// RawFileBackend
// =============================================================================

/// Creates and opens [`RawFileStore`]s by path.
#[derive(Debug, Clone, Default)]
pub struct RawFileBackend;

impl RawFileBackend {
    pub fn new() -> Self {
        Self
    }

    /// Move a finished store (data and header) from `from` to `to`.
    ///
    /// Exports write to a temporary location and commit on success, so a
    /// store at `to` is never partially written.
    pub async fn commit(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<(), StoreError> {
        let (from, to) = (from.as_ref(), to.as_ref());
        tokio::fs::rename(from, to).await?;
        tokio::fs::rename(header_path(from), header_path(to)).await?;
        debug!(from = %from.display(), to = %to.display(), "Committed raw store");
        Ok(())
    }

    /// Delete a store's data file and header, ignoring missing files.
    pub async fn remove(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let path = path.as_ref();
        for file in [path.to_path_buf(), header_path(path)] {
            match tokio::fs::remove_file(&file).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StoreBackend for RawFileBackend {
    async fn create(&self, location: &str, meta: &Metadata) -> Result<Arc<dyn BlockStore>, StoreError> {
        Ok(Arc::new(RawFileStore::create(location, meta).await?))
    }

    async fn open(&self, location: &str) -> Result<Arc<dyn BlockStore>, StoreError> {
        Ok(Arc::new(RawFileStore::open(location).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::DType;

    #[test]
    fn test_header_path() {
        assert_eq!(
            header_path(Path::new("/tmp/out.raw")),
            PathBuf::from("/tmp/out.raw.json")
        );
    }

    #[tokio::test]
    async fn test_create_write_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.raw");
        let meta = Metadata::new(vec![3, 4, 5], DType::I16);

        let store = RawFileStore::create(&path, &meta).await.unwrap();
        let roi = Roi::new(vec![1, 1, 0], vec![3, 3, 5]).unwrap();
        let data = ArrayBuffer::from_fn(&[2, 2, 5], |idx| (idx[0] * 100 + idx[1] * 10 + idx[2]) as i16 - 50);
        store.write(&roi, &data).await.unwrap();
        store.close().await.unwrap();
        drop(store);

        let reopened = RawFileStore::open(&path).await.unwrap();
        assert_eq!(reopened.metadata(), &meta);
        assert_eq!(reopened.read(&roi).await.unwrap(), data);

        let untouched = reopened
            .read(&Roi::new(vec![0, 0, 0], vec![1, 4, 5]).unwrap())
            .await
            .unwrap();
        assert!(untouched.to_vec::<i16>().unwrap().iter().all(|&v| v == 0));
    }

    #[tokio::test]
    async fn test_open_rejects_truncated_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.raw");
        RawFileStore::create(&path, &Metadata::new(vec![10], DType::U32))
            .await
            .unwrap();
        tokio::fs::write(&path, [0u8; 7]).await.unwrap();
        assert!(matches!(
            RawFileStore::open(&path).await,
            Err(StoreError::InvalidHeader(_))
        ));
    }

    #[tokio::test]
    async fn test_open_missing_store() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            RawFileStore::open(dir.path().join("absent.raw")).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_commit_moves_header() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("out.raw.partial");
        let dst = dir.path().join("out.raw");
        let backend = RawFileBackend::new();
        let store = backend
            .create(tmp.to_str().unwrap(), &Metadata::new(vec![2], DType::U8))
            .await
            .unwrap();
        store.close().await.unwrap();
        drop(store);

        backend.commit(&tmp, &dst).await.unwrap();
        assert!(!tmp.exists());
        assert!(header_path(&dst).exists());
        assert_eq!(read_header(&dst).await.unwrap().metadata.shape, vec![2]);
    }
}
