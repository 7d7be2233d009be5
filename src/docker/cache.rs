use anyhow::{Context, Result};

use super::DockerImageRepositoryOpener;
use crate::archive::{create_tar_archive, extract_tar_archive};
use crate::cache::FileCache;
use crate::oci::{repack_layout, MediaTypeRegistry, RepackOptions};
use crate::progress::Timing;

const ARCHIVE_NAME: &str = "image.oci.tar.zst";

/// Stores Docker images in a file cache as repacked, archived OCI layouts.
#[derive(Debug)]
pub struct DockerCache<F, O> {
    file_cache: F,
    opener: O,
    registry: MediaTypeRegistry,
    repack: RepackOptions,
}

impl<F: FileCache, O: DockerImageRepositoryOpener> DockerCache<F, O> {
    pub fn new(file_cache: F, opener: O) -> Self {
        Self {
            file_cache,
            opener,
            registry: MediaTypeRegistry::standard(),
            repack: RepackOptions::default(),
        }
    }

    pub fn with_repack_options(mut self, repack: RepackOptions) -> Self {
        self.repack = repack;
        self
    }

    pub fn with_registry(mut self, registry: MediaTypeRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn opener(&self) -> &O {
        &self.opener
    }

    pub fn file_cache(&self) -> &F {
        &self.file_cache
    }

    /// Loads the image cached under `key` into Docker, returning its id, or
    /// `None` when nothing is cached.
    pub async fn load_cache_docker_image(&self, key: &str) -> Result<Option<String>> {
        let Some(cache_file) = self.file_cache.get_file(key).await? else {
            log::debug!("No cached image for {}", key);
            return Ok(None);
        };
        let _timing = Timing::start(format!("Load cached image {key}"));

        let work = tempfile::tempdir().context("Failed to create image load work dir")?;
        let layout = work.path().join("layout");
        extract_tar_archive(&cache_file, &layout).await?;

        let image_id = self
            .opener
            .load_image(&layout)
            .await
            .with_context(|| format!("Failed to load cached image {key}"))?;
        log::info!("Loaded {} from cache as {}", key, image_id);
        Ok(Some(image_id))
    }

    /// Saves `image`, repacks its layers and stores the layout under `key`.
    pub async fn save_cache_docker_image(&self, key: &str, image: &str) -> Result<()> {
        let _timing = Timing::start(format!("Save image {image} as {key}"));
        let work = tempfile::tempdir().context("Failed to create image save work dir")?;

        let saved = work.path().join("saved");
        tokio::fs::create_dir_all(&saved).await?;
        self.opener
            .save_image(image, &saved)
            .await
            .with_context(|| format!("Failed to save image {image}"))?;

        let repacked = work.path().join("repacked");
        let registry = self.registry.clone();
        let options = self.repack.clone();
        let saved_dir = saved.clone();
        let repacked_dir = repacked.clone();
        tokio::task::spawn_blocking(move || repack_layout(&saved_dir, &repacked_dir, &registry, &options))
            .await
            .context("Repack task failed")??;

        let archive = work.path().join(ARCHIVE_NAME);
        create_tar_archive(&repacked, &archive).await?;

        self.file_cache
            .put_file(key, &archive, true)
            .await
            .with_context(|| format!("Failed to store image {image} as {key}"))?;
        log::info!("Cached image {} as {}", image, key);
        Ok(())
    }
}
