//! # Asset Sources
//!
//! The readiness gate obtains module binaries through `AssetSource`. Whether
//! the bytes come from disk, a cache, or the network is not the bridge's
//! concern; the only failure it understands is "could not fetch".

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Nothing is stored under this id.
    NotFound(String),
    /// The location exists but reading it failed.
    Io { asset: String, details: String },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(asset) => write!(f, "asset '{}' not found", asset),
            Self::Io { asset, details } => write!(f, "failed to read asset '{}': {}", asset, details),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// An opaque provider of bytes keyed by asset id.
#[async_trait::async_trait]
pub trait AssetSource: Send + Sync + 'static {
    async fn fetch_bytes(&self, asset: &str) -> Result<Vec<u8>>;
}

/// Serves assets from files under a root directory.
#[derive(Clone, Debug)]
pub struct FsAssets {
    root: PathBuf,
}

impl FsAssets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait::async_trait]
impl AssetSource for FsAssets {
    async fn fetch_bytes(&self, asset: &str) -> Result<Vec<u8>> {
        let path = self.root.join(asset.trim_start_matches('/'));
        tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(asset.to_string()),
            _ => Error::Io {
                asset: asset.to_string(),
                details: e.to_string(),
            },
        })
    }
}

/// Serves assets from memory. Cheap to clone; clones share contents.
#[derive(Clone, Debug, Default)]
pub struct MemoryAssets {
    assets: Arc<DashMap<String, Arc<[u8]>>>,
}

impl MemoryAssets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, asset: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.assets.insert(asset.into(), Arc::from(bytes.into()));
    }

    /// Builder-style variant of `insert`.
    pub fn with(self, asset: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(asset, bytes);
        self
    }
}

#[async_trait::async_trait]
impl AssetSource for MemoryAssets {
    async fn fetch_bytes(&self, asset: &str) -> Result<Vec<u8>> {
        self.assets
            .get(asset)
            .map(|entry| entry.value().to_vec())
            .ok_or_else(|| Error::NotFound(asset.to_string()))
    }
}
