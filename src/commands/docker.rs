use anyhow::Result;
use std::path::PathBuf;

use super::cache_key_from_parts;
use crate::cache::{DirectoryFileCache, GithubCacheClient, GithubFileCache};
use crate::config::CacheConfig;
use crate::docker::{DockerBuildCaching, DockerCache, DockerCliOpener};
use crate::oci::RepackOptions;
use crate::ui;

type CliDockerCache = DockerCache<GithubFileCache<GithubCacheClient>, DockerCliOpener>;

fn docker_cache() -> Result<CliDockerCache> {
    let config = CacheConfig::from_env()?;
    let local_dir = config
        .local_cache_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("layercache"));
    let local = DirectoryFileCache::open(local_dir, config.cache_version)?;
    let file_cache = GithubFileCache::new(local, GithubCacheClient::from_config(config)?);
    Ok(DockerCache::new(file_cache, DockerCliOpener::default()))
}

pub async fn load(key: Vec<String>) -> Result<()> {
    let key = cache_key_from_parts(&key)?.to_string();
    match docker_cache()?.load_cache_docker_image(&key).await? {
        Some(image_id) => {
            ui::cache_summary("loaded", &key, true);
            println!("{image_id}");
        }
        None => ui::cache_summary("loaded", &key, false),
    }
    Ok(())
}

pub async fn save(image: String, key: Vec<String>, layers: usize) -> Result<()> {
    let key = cache_key_from_parts(&key)?.to_string();
    let options = RepackOptions {
        layers,
        ..Default::default()
    };
    docker_cache()?
        .with_repack_options(options)
        .save_cache_docker_image(&key, &image)
        .await?;
    ui::info(&format!("Saved {image} as {key}"));
    Ok(())
}

pub async fn build(
    file: PathBuf,
    context: PathBuf,
    service: String,
    always_build: bool,
    key: Vec<String>,
) -> Result<()> {
    let key = cache_key_from_parts(&key)?;
    let opener = DockerCliOpener::default();
    let caching = DockerBuildCaching::new(docker_cache()?, service).with_always_build(always_build);

    let tag = caching
        .cached_build_docker_image(&key, |tag| async move { opener.build_image(&file, &tag, &context).await })
        .await?;
    println!("{tag}");
    Ok(())
}

pub async fn pull(image: String, always_pull: bool) -> Result<()> {
    DockerBuildCaching::new(docker_cache()?, "")
        .with_always_pull(always_pull)
        .cached_pull_docker_image(&image)
        .await
}
