//! Chunked transfer of files through the GitHub Actions cache services.

pub mod azure;
pub mod chunks;
pub mod download;
pub mod file_cache;
pub mod http;
pub mod key;
pub mod local;
pub mod v1;
pub mod v2;

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::config::{CacheConfig, CacheProtocol};
use crate::transfer::RetryPolicy;

pub use crate::error::{CacheError, ServiceRequestError};
pub use file_cache::GithubFileCache;
pub use key::{fix_key, CacheKey, KEY_PART_SEPARATOR};
pub use local::{DirectoryCacheOptions, DirectoryFileCache};
pub use v1::{ArtifactCacheEntry, GithubCacheServiceV1Client};
pub use v2::{GithubCacheServiceV2Client, V2CacheEntry};

/// A lookup hit, tied to the protocol that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEntry {
    V1(ArtifactCacheEntry),
    V2(V2CacheEntry),
}

#[async_trait]
pub trait CacheClient: Send + Sync {
    async fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>>;

    async fn download_file(&self, entry: &CacheEntry, out_file: &Path) -> Result<()>;

    async fn upload_file(&self, key: &str, in_file: &Path) -> Result<()>;
}

/// Key-value store of whole files.
#[async_trait]
pub trait FileCache: Send + Sync {
    async fn get_file(&self, key: &str) -> Result<Option<PathBuf>>;

    async fn put_file(&self, key: &str, file_path: &Path, steal: bool) -> Result<PathBuf>;
}

#[async_trait]
impl CacheClient for GithubCacheServiceV1Client {
    async fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.get_cache_entry(key).await?.map(CacheEntry::V1))
    }

    async fn download_file(&self, entry: &CacheEntry, out_file: &Path) -> Result<()> {
        match entry {
            CacheEntry::V1(entry) => self.download_cache_entry(entry, out_file).await.map(|_| ()),
            CacheEntry::V2(_) => Err(CacheError::EntryMismatch.into()),
        }
    }

    async fn upload_file(&self, key: &str, in_file: &Path) -> Result<()> {
        self.upload(key, in_file).await
    }
}

#[async_trait]
impl CacheClient for GithubCacheServiceV2Client {
    async fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.get_cache_entry(key).await?.map(CacheEntry::V2))
    }

    async fn download_file(&self, entry: &CacheEntry, out_file: &Path) -> Result<()> {
        match entry {
            CacheEntry::V2(entry) => self.download_cache_entry(entry, out_file).await.map(|_| ()),
            CacheEntry::V1(_) => Err(CacheError::EntryMismatch.into()),
        }
    }

    async fn upload_file(&self, key: &str, in_file: &Path) -> Result<()> {
        self.upload(key, in_file).await
    }
}

/// Protocol-agnostic client selected from configuration.
#[derive(Debug, Clone)]
pub enum GithubCacheClient {
    V1(GithubCacheServiceV1Client),
    V2(GithubCacheServiceV2Client),
}

impl GithubCacheClient {
    pub fn from_config(config: CacheConfig) -> Result<Self> {
        Ok(match config.protocol {
            CacheProtocol::V1 => Self::V1(GithubCacheServiceV1Client::new(config)?),
            CacheProtocol::V2 => Self::V2(GithubCacheServiceV2Client::new(config)?),
        })
    }

    pub fn with_retry_policy(self, retry: RetryPolicy) -> Self {
        match self {
            Self::V1(client) => Self::V1(client.with_retry_policy(retry)),
            Self::V2(client) => Self::V2(client.with_retry_policy(retry)),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        match self {
            Self::V1(client) => client.config(),
            Self::V2(client) => client.config(),
        }
    }
}

#[async_trait]
impl CacheClient for GithubCacheClient {
    async fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        match self {
            Self::V1(client) => client.get_entry(key).await,
            Self::V2(client) => client.get_entry(key).await,
        }
    }

    async fn download_file(&self, entry: &CacheEntry, out_file: &Path) -> Result<()> {
        match self {
            Self::V1(client) => client.download_file(entry, out_file).await,
            Self::V2(client) => client.download_file(entry, out_file).await,
        }
    }

    async fn upload_file(&self, key: &str, in_file: &Path) -> Result<()> {
        match self {
            Self::V1(client) => client.upload_file(key, in_file).await,
            Self::V2(client) => client.upload_file(key, in_file).await,
        }
    }
}
