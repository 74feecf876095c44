use async_trait::async_trait;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tokio::io::AsyncRead;

use crate::error::Result;

/// Byte source handed to the store on writes and returned on reads
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// An open blob ready to be streamed
pub struct Blob {
    pub reader: BlobReader,
    pub size: u64,
}

/// Bytes fully written under a temporary name, not yet visible to lookups
#[derive(Debug)]
pub struct StagedBlob {
    pub(crate) identifier: String,
    pub(crate) size: u64,
    pub(crate) temp_path: PathBuf,
    pub(crate) final_path: PathBuf,
}

impl StagedBlob {
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// A replacement that is live under the final name while the copy it
/// displaced is parked next to its old location
#[derive(Debug)]
pub struct BlobSwap {
    pub(crate) identifier: String,
    pub(crate) current: PathBuf,
    /// Original location and parked location of the displaced copy
    pub(crate) previous: Option<(PathBuf, PathBuf)>,
}

/// A blob found while listing the store
#[derive(Debug, Clone)]
pub struct BlobEntry {
    pub identifier: String,
    pub modified: SystemTime,
}

/// Blob store trait
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write the whole stream under a temporary name
    async fn stage(&self, identifier: &str, reader: BlobReader) -> Result<StagedBlob>;

    /// Atomically move a staged blob to its final name.
    /// The temporary file is removed when this fails.
    async fn publish(&self, staged: StagedBlob) -> Result<()>;

    /// Publish a staged blob over the existing copy of the same identifier.
    /// The displaced copy is kept until [`BlobStore::confirm_swap`] or
    /// [`BlobStore::revert_swap`] settles the swap.
    async fn swap(&self, staged: StagedBlob) -> Result<BlobSwap>;

    /// Drop the copy displaced by a swap
    async fn confirm_swap(&self, swap: BlobSwap);

    /// Remove the new blob and move the displaced copy back
    async fn revert_swap(&self, swap: BlobSwap) -> Result<()>;

    /// Throw away a staged blob
    async fn discard(&self, staged: StagedBlob);

    /// Write a blob, returning the number of bytes stored
    async fn save(&self, identifier: &str, reader: BlobReader) -> Result<u64> {
        let staged = self.stage(identifier, reader).await?;
        let size = staged.size();
        self.publish(staged).await?;
        Ok(size)
    }

    /// Open a blob for streaming
    async fn open(&self, identifier: &str) -> Result<Blob>;

    /// Delete a blob
    async fn delete(&self, identifier: &str) -> Result<()>;

    /// Every published blob in the store
    async fn list(&self) -> Result<Vec<BlobEntry>>;

    /// Remove temporary files left by interrupted writes, returning how many were removed
    async fn sweep_temp(&self, older_than: Duration) -> Result<usize>;

    /// Get the storage type name
    fn storage_type(&self) -> &'static str;
}
