use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::download::remove_if_exists;
use super::local::DirectoryFileCache;
use super::{CacheClient, FileCache};

/// Local directory cache in front of a remote cache client. Reads fill the
/// local directory; writes go to both.
#[derive(Debug)]
pub struct GithubFileCache<C> {
    local: DirectoryFileCache,
    client: C,
}

impl<C: CacheClient> GithubFileCache<C> {
    pub fn new(local: DirectoryFileCache, client: C) -> Self {
        Self { local, client }
    }

    pub fn local(&self) -> &DirectoryFileCache {
        &self.local
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

#[async_trait]
impl<C: CacheClient> FileCache for GithubFileCache<C> {
    async fn get_file(&self, key: &str) -> Result<Option<PathBuf>> {
        if let Some(path) = self.local.get_file(key).await? {
            log::debug!("Local cache hit for {}", key);
            return Ok(Some(path));
        }

        let Some(entry) = self.client.get_entry(key).await? else {
            return Ok(None);
        };

        let local_file = self.local.cache_file_path(key);
        let incomplete = self.local.incomplete_file_path(key);
        remove_if_exists(&incomplete).await?;

        let downloaded = async {
            self.client.download_file(&entry, &incomplete).await?;
            tokio::fs::rename(&incomplete, &local_file)
                .await
                .with_context(|| format!("Failed to move download into {}", local_file.display()))
        }
        .await;
        if let Err(err) = downloaded {
            if let Err(cleanup) = remove_if_exists(&incomplete).await {
                log::warn!("Failed to remove {}: {}", incomplete.display(), cleanup);
            }
            return Err(err);
        }

        Ok(Some(local_file))
    }

    async fn put_file(&self, key: &str, file_path: &Path, steal: bool) -> Result<PathBuf> {
        let cached = self.local.put_file(key, file_path, steal).await?;
        self.client.upload_file(key, &cached).await?;
        Ok(cached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheEntry;
    use crate::cache::v1::ArtifactCacheEntry;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryClient {
        entries: Mutex<HashMap<String, Vec<u8>>>,
        fail_download: bool,
    }

    #[async_trait]
    impl CacheClient for MemoryClient {
        async fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>> {
            let entries = self.entries.lock().unwrap();
            Ok(entries.contains_key(key).then(|| {
                CacheEntry::V1(ArtifactCacheEntry {
                    cache_key: Some(key.to_string()),
                    ..Default::default()
                })
            }))
        }

        async fn download_file(&self, entry: &CacheEntry, out_file: &Path) -> Result<()> {
            let CacheEntry::V1(entry) = entry else {
                anyhow::bail!("unexpected entry");
            };
            let data = self.entries.lock().unwrap()[entry.cache_key.as_deref().unwrap()].clone();
            std::fs::write(out_file, &data[..data.len() / 2])?;
            if self.fail_download {
                anyhow::bail!("connection reset");
            }
            std::fs::write(out_file, data)?;
            Ok(())
        }

        async fn upload_file(&self, key: &str, in_file: &Path) -> Result<()> {
            let data = std::fs::read(in_file)?;
            self.entries.lock().unwrap().insert(key.to_string(), data);
            Ok(())
        }
    }

    #[tokio::test]
    async fn put_uploads_and_get_fills_local() {
        let root = tempfile::tempdir().unwrap();
        let writer = GithubFileCache::new(
            DirectoryFileCache::open(root.path().join("a"), 1).unwrap(),
            MemoryClient::default(),
        );

        let src = root.path().join("src");
        std::fs::write(&src, b"layer bytes").unwrap();
        writer.put_file("img", &src, false).await.unwrap();
        let uploaded = writer.client().entries.lock().unwrap().clone();

        let reader = GithubFileCache::new(
            DirectoryFileCache::open(root.path().join("b"), 1).unwrap(),
            MemoryClient {
                entries: Mutex::new(uploaded),
                fail_download: false,
            },
        );
        let path = reader.get_file("img").await.unwrap().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"layer bytes");
        assert!(!reader.local().incomplete_file_path("img").exists());
        assert!(reader.get_file("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_download_leaves_no_files() {
        let root = tempfile::tempdir().unwrap();
        let mut entries = HashMap::new();
        entries.insert("img".to_string(), b"layer bytes".to_vec());
        let cache = GithubFileCache::new(
            DirectoryFileCache::open(root.path(), 1).unwrap(),
            MemoryClient {
                entries: Mutex::new(entries),
                fail_download: true,
            },
        );

        assert!(cache.get_file("img").await.is_err());
        assert!(!cache.local().incomplete_file_path("img").exists());
        assert!(!cache.local().cache_file_path("img").exists());
    }
}
