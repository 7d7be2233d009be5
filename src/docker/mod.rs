//! Docker image caching on top of the repack pipeline and file caches.

pub mod build_caching;
pub mod cache;
pub mod cli;

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

pub use build_caching::DockerBuildCaching;
pub use cache::DockerCache;
pub use cli::{parse_load_output, DockerCliOpener};

/// Moves images between a Docker engine and OCI layout directories.
#[async_trait]
pub trait DockerImageRepositoryOpener: Send + Sync {
    async fn is_image_present(&self, image: &str) -> Result<bool>;

    /// Writes `image` as an OCI layout into the existing directory `dir`.
    async fn save_image(&self, image: &str, dir: &Path) -> Result<()>;

    /// Loads the OCI layout at `dir` and returns the loaded image id.
    async fn load_image(&self, dir: &Path) -> Result<String>;

    async fn tag_image(&self, image: &str, tag: &str) -> Result<()>;

    async fn pull_image(&self, image: &str) -> Result<()>;
}

/// Cache key for a third-party image: `docker-` plus the reference with
/// separators flattened to `-`.
pub fn docker_image_cache_key(image: &str) -> String {
    let suffix: String = image
        .chars()
        .map(|c| if matches!(c, '/' | ':' | '.' | '-' | '_') { '-' } else { c })
        .collect();
    format!("docker-{suffix}")
}
