use anyhow::Result;
use std::future::Future;

use super::cache::DockerCache;
use super::{docker_image_cache_key, DockerImageRepositoryOpener};
use crate::cache::{CacheKey, FileCache};
use crate::progress::Timing;
use crate::ui;

/// Skips image builds and pulls whose results are already cached.
///
/// Cache loads are best effort: any failure is logged and handled as a miss.
/// Cache saves are not, since a half-written entry must not go unnoticed.
#[derive(Debug)]
pub struct DockerBuildCaching<F, O> {
    cache: DockerCache<F, O>,
    service: String,
    always_build: bool,
    always_pull: bool,
}

impl<F: FileCache, O: DockerImageRepositoryOpener> DockerBuildCaching<F, O> {
    pub fn new(cache: DockerCache<F, O>, service: impl Into<String>) -> Self {
        Self {
            cache,
            service: service.into(),
            always_build: false,
            always_pull: false,
        }
    }

    pub fn with_always_build(mut self, always_build: bool) -> Self {
        self.always_build = always_build;
        self
    }

    pub fn with_always_pull(mut self, always_pull: bool) -> Self {
        self.always_pull = always_pull;
        self
    }

    pub fn cache(&self) -> &DockerCache<F, O> {
        &self.cache
    }

    async fn try_load(&self, key: &str) -> Option<String> {
        match self.cache.load_cache_docker_image(key).await {
            Ok(image_id) => image_id,
            Err(err) => {
                log::warn!("Ignoring cache load failure for {}: {:#}", key, err);
                None
            }
        }
    }

    /// Resolves `<service>:<key>`: an image already present is reused, then a
    /// cached image is loaded and tagged, and only then is `build` called with
    /// the tag to produce a new image, which is saved to the cache.
    pub async fn cached_build_docker_image<B, Fut>(&self, key: &CacheKey, build: B) -> Result<String>
    where
        B: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let key = key.to_string();
        let image_tag = format!("{}:{}", self.service, key);
        let _timing = Timing::start(format!("Resolve image {image_tag}"));

        if !self.always_build && self.cache.opener().is_image_present(&image_tag).await? {
            log::debug!("Image {} already present", image_tag);
            return Ok(image_tag);
        }

        if let Some(image_id) = self.try_load(&key).await {
            self.cache.opener().tag_image(&image_id, &image_tag).await?;
            ui::cache_summary("build", &key, true);
            return Ok(image_tag);
        }

        ui::cache_summary("build", &key, false);
        let image_id = build(image_tag.clone()).await?;
        self.cache.save_cache_docker_image(&key, &image_id).await?;
        Ok(image_tag)
    }

    /// Makes a third-party `image` available, preferring the cache over a
    /// registry pull. Pulled images are saved for next time.
    pub async fn cached_pull_docker_image(&self, image: &str) -> Result<()> {
        if !self.always_pull && self.cache.opener().is_image_present(image).await? {
            return Ok(());
        }

        let key = docker_image_cache_key(image);
        if let Some(image_id) = self.try_load(&key).await {
            if image_id != image {
                self.cache.opener().tag_image(&image_id, image).await?;
            }
            ui::cache_summary("pull", &key, true);
            return Ok(());
        }

        ui::cache_summary("pull", &key, false);
        self.cache.opener().pull_image(image).await?;
        self.cache.save_cache_docker_image(&key, image).await
    }
}
