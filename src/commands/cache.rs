use anyhow::Result;
use std::path::PathBuf;

use crate::cache::{CacheClient, CacheEntry, GithubCacheClient};
use crate::config::CacheConfig;
use crate::ui;

fn client() -> Result<GithubCacheClient> {
    GithubCacheClient::from_config(CacheConfig::from_env()?)
}

pub async fn get(key: String) -> Result<()> {
    let Some(entry) = client()?.get_entry(&key).await? else {
        ui::cache_summary("lookup", &key, false);
        return Ok(());
    };

    let json = match &entry {
        CacheEntry::V1(entry) => serde_json::to_string_pretty(entry)?,
        CacheEntry::V2(entry) => serde_json::to_string_pretty(&entry.response)?,
    };
    println!("{json}");
    Ok(())
}

pub async fn upload(key: String, file: PathBuf) -> Result<()> {
    client()?.upload_file(&key, &file).await?;
    ui::info(&format!("Uploaded {} as {}", file.display(), key));
    Ok(())
}

pub async fn download(key: String, file: PathBuf) -> Result<()> {
    let client = client()?;
    let Some(entry) = client.get_entry(&key).await? else {
        anyhow::bail!("No cache entry for {key}");
    };
    client.download_file(&entry, &file).await?;
    ui::info(&format!("Downloaded {} to {}", key, file.display()));
    Ok(())
}
