use std::io;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::dpth::Location;

/// Where block data lives once a location has been allocated for it.
#[async_trait::async_trait]
pub trait BlockStore: Send + Sync {
    /// Durably writes `data` to `location`. Once this returns the reservation
    /// for the location may be released.
    async fn store_block(&self, location: Location, data: &[u8]) -> io::Result<u64>;

    async fn fetch_block(&self, location: Location) -> io::Result<Vec<u8>>;

    async fn delete_block(&self, location: Location) -> io::Result<()>;
}

/// Stores every block as its own zstd-compressed file under the data root.
#[derive(Debug, Clone)]
pub struct FsBlockStore {
    root: PathBuf,
    level: i32,
}

impl FsBlockStore {
    pub fn new(root: impl Into<PathBuf>, level: i32) -> Self {
        Self {
            root: root.into(),
            level,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait::async_trait]
impl BlockStore for FsBlockStore {
    async fn store_block(&self, location: Location, data: &[u8]) -> io::Result<u64> {
        let path = location.path(&self.root);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let compressed = zstd::bulk::compress(data, self.level)?;

        let tmp = path.with_extension("tmp");
        if let Err(err) = write_then_rename(&tmp, &path, &compressed).await {
            let _ = remove_if_present(&tmp).await;
            return Err(err);
        }

        Ok(compressed.len() as u64)
    }

    async fn fetch_block(&self, location: Location) -> io::Result<Vec<u8>> {
        let compressed = tokio::fs::read(location.path(&self.root)).await?;
        zstd::stream::decode_all(&compressed[..])
    }

    async fn delete_block(&self, location: Location) -> io::Result<()> {
        let path = location.path(&self.root);
        remove_if_present(&path.with_extension("tmp")).await?;
        remove_if_present(&path).await
    }
}

async fn write_then_rename(tmp: &Path, path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = tokio::fs::File::create(tmp).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(tmp, path).await
}

async fn remove_if_present(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
