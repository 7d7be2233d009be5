use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use super::download::remove_if_exists;
use super::FileCache;

pub const VERSION_FILE_NAME: &str = ".layercache-version";

#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryCacheOptions {
    /// Fail instead of creating a missing cache directory.
    pub no_create: bool,
    /// Fail instead of purging a directory stamped with another version.
    pub no_purge: bool,
}

/// Version-stamped directory of cached files, one file per key.
#[derive(Debug, Clone)]
pub struct DirectoryFileCache {
    dir: PathBuf,
    version: u64,
}

impl DirectoryFileCache {
    pub fn open(dir: impl Into<PathBuf>, version: u64) -> Result<Self> {
        Self::open_with(dir, version, DirectoryCacheOptions::default())
    }

    /// Opens `dir`, creating it or purging stale files so its version stamp
    /// matches `version`.
    pub fn open_with(dir: impl Into<PathBuf>, version: u64, options: DirectoryCacheOptions) -> Result<Self> {
        let cache = Self {
            dir: dir.into(),
            version,
        };
        cache.setup(options)?;
        Ok(cache)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    fn version_file(&self) -> PathBuf {
        self.dir.join(VERSION_FILE_NAME)
    }

    fn write_version(&self) -> Result<()> {
        let path = self.version_file();
        fs::write(&path, self.version.to_string()).with_context(|| format!("Failed to write {}", path.display()))
    }

    fn setup(&self, options: DirectoryCacheOptions) -> Result<()> {
        if !self.dir.is_dir() {
            anyhow::ensure!(
                !options.no_create,
                "Cache directory {} does not exist",
                self.dir.display()
            );
            fs::create_dir_all(&self.dir)
                .with_context(|| format!("Failed to create cache directory {}", self.dir.display()))?;
            return self.write_version();
        }

        let version_file = self.version_file();
        let dir_version = match fs::read_to_string(&version_file) {
            Ok(raw) => raw.trim().parse::<u64>().ok(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err).with_context(|| format!("Failed to read {}", version_file.display())),
        };
        if dir_version == Some(self.version) {
            return Ok(());
        }

        anyhow::ensure!(
            !options.no_purge,
            "Cache directory {} has version {:?}, expected {}",
            self.dir.display(),
            dir_version,
            self.version
        );
        self.purge()?;
        self.write_version()
    }

    fn purge(&self) -> Result<()> {
        let mut names = Vec::new();
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.dir).with_context(|| format!("Failed to list {}", self.dir.display()))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_dir() {
                dirs.push(name);
            } else if !name.starts_with('.') {
                names.push(name);
            }
        }

        if !dirs.is_empty() {
            dirs.sort();
            anyhow::bail!(
                "Refusing to purge stale cache directory {} containing directories: {}",
                self.dir.display(),
                dirs.join(", ")
            );
        }

        names.sort();
        for name in names {
            let path = self.dir.join(&name);
            log::debug!("Purging stale cache file {}", path.display());
            fs::remove_file(&path).with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        Ok(())
    }

    pub fn cache_file_path(&self, key: &str) -> PathBuf {
        self.dir.join(sanitize_key(key))
    }

    /// Temporary sibling used while a file for `key` is being written.
    pub fn incomplete_file_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("_{}.incomplete", sanitize_key(key)))
    }
}

#[async_trait]
impl FileCache for DirectoryFileCache {
    async fn get_file(&self, key: &str) -> Result<Option<PathBuf>> {
        let path = self.cache_file_path(key);
        Ok(tokio::fs::try_exists(&path).await?.then_some(path))
    }

    async fn put_file(&self, key: &str, file_path: &Path, steal: bool) -> Result<PathBuf> {
        let path = self.cache_file_path(key);
        if steal && tokio::fs::rename(file_path, &path).await.is_ok() {
            return Ok(path);
        }

        let incomplete = self.incomplete_file_path(key);
        let stored = async {
            tokio::fs::copy(file_path, &incomplete)
                .await
                .with_context(|| format!("Failed to copy {} into cache", file_path.display()))?;
            tokio::fs::rename(&incomplete, &path)
                .await
                .with_context(|| format!("Failed to move {} into place", incomplete.display()))
        }
        .await;
        if let Err(err) = stored {
            if let Err(cleanup) = remove_if_exists(&incomplete).await {
                log::warn!("Failed to remove {}: {}", incomplete.display(), cleanup);
            }
            return Err(err);
        }

        if steal {
            tokio::fs::remove_file(file_path)
                .await
                .with_context(|| format!("Failed to remove {}", file_path.display()))?;
        }
        Ok(path)
    }
}

/// Maps a cache key onto a single safe file name. Keys that had to be
/// rewritten get a short digest of the original key appended, so distinct
/// keys never share a file.
pub fn sanitize_key(key: &str) -> String {
    let mut name: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() || name.starts_with('.') {
        name.insert(0, '_');
    }
    if name != key {
        let digest = Sha256::digest(key.as_bytes());
        name.push('-');
        name.push_str(&hex::encode(&digest[..4]));
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_safe_names() {
        assert_eq!(sanitize_key("docker-img-latest"), "docker-img-latest");
        assert!(sanitize_key("a/b:c").starts_with("a_b_c-"));
        assert!(sanitize_key(".hidden").starts_with("_.hidden-"));
        assert!(sanitize_key("").starts_with("_-"));
    }

    #[test]
    fn rewritten_keys_do_not_collide() {
        assert_eq!(sanitize_key("a_b"), "a_b");
        let slashed = sanitize_key("a/b");
        assert_ne!(slashed, "a_b");
        assert_ne!(slashed, sanitize_key("a:b"));
        assert_eq!(slashed, sanitize_key("a/b"));
        assert_eq!(slashed.len(), "a_b-".len() + 8);
    }

    #[test]
    fn new_directory_is_stamped() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("cache");
        let cache = DirectoryFileCache::open(&dir, 3).unwrap();
        assert_eq!(fs::read_to_string(dir.join(VERSION_FILE_NAME)).unwrap(), "3");
        assert_eq!(cache.incomplete_file_path("k"), dir.join("_k.incomplete"));
    }

    #[test]
    fn version_change_purges_files() {
        let root = tempfile::tempdir().unwrap();
        DirectoryFileCache::open(root.path(), 1).unwrap();
        fs::write(root.path().join("stale"), b"x").unwrap();
        fs::write(root.path().join(".keep"), b"x").unwrap();

        DirectoryFileCache::open(root.path(), 1).unwrap();
        assert!(root.path().join("stale").exists());

        DirectoryFileCache::open(root.path(), 2).unwrap();
        assert!(!root.path().join("stale").exists());
        assert!(root.path().join(".keep").exists());
        assert_eq!(fs::read_to_string(root.path().join(VERSION_FILE_NAME)).unwrap(), "2");
    }

    #[test]
    fn purge_refuses_directories_and_honours_options() {
        let root = tempfile::tempdir().unwrap();
        DirectoryFileCache::open(root.path(), 1).unwrap();
        fs::create_dir(root.path().join("nested")).unwrap();

        let err = DirectoryFileCache::open(root.path(), 2).unwrap_err();
        assert!(err.to_string().contains("nested"));

        let no_purge = DirectoryCacheOptions {
            no_purge: true,
            ..Default::default()
        };
        assert!(DirectoryFileCache::open_with(root.path(), 5, no_purge).is_err());

        let no_create = DirectoryCacheOptions {
            no_create: true,
            ..Default::default()
        };
        assert!(DirectoryFileCache::open_with(root.path().join("missing"), 1, no_create).is_err());
    }

    #[tokio::test]
    async fn put_copies_or_steals() {
        let root = tempfile::tempdir().unwrap();
        let cache = DirectoryFileCache::open(root.path().join("cache"), 1).unwrap();
        assert!(cache.get_file("k").await.unwrap().is_none());

        let src = root.path().join("src");
        fs::write(&src, b"payload").unwrap();

        let copied = cache.put_file("k", &src, false).await.unwrap();
        assert!(src.exists());
        assert_eq!(fs::read(&copied).unwrap(), b"payload");
        assert_eq!(cache.get_file("k").await.unwrap(), Some(copied));

        let stolen = cache.put_file("other", &src, true).await.unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(stolen).unwrap(), b"payload");
        assert!(!cache.incomplete_file_path("k").exists());
    }

    #[tokio::test]
    async fn failed_copy_leaves_no_entry() {
        let root = tempfile::tempdir().unwrap();
        let cache = DirectoryFileCache::open(root.path().join("cache"), 1).unwrap();

        let missing = root.path().join("missing");
        assert!(cache.put_file("k", &missing, false).await.is_err());
        assert!(cache.put_file("k", &missing, true).await.is_err());

        assert!(cache.get_file("k").await.unwrap().is_none());
        assert!(!cache.incomplete_file_path("k").exists());
    }

    #[tokio::test]
    async fn stale_incomplete_file_is_not_a_hit() {
        let root = tempfile::tempdir().unwrap();
        let cache = DirectoryFileCache::open(root.path().join("cache"), 1).unwrap();
        fs::write(cache.incomplete_file_path("k"), b"trunc").unwrap();

        assert!(cache.get_file("k").await.unwrap().is_none());

        let src = root.path().join("src");
        fs::write(&src, b"whole").unwrap();
        let stored = cache.put_file("k", &src, false).await.unwrap();
        assert_eq!(fs::read(stored).unwrap(), b"whole");
        assert!(!cache.incomplete_file_path("k").exists());
    }
}
