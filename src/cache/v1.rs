use anyhow::{Context, Result};
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::chunks::{read_range, run_chunks};
use super::download::download_ranged;
use super::http::{build_http_client, ensure_status, ServiceClient};
use super::key::fix_key;
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::progress::{format_bytes, throughput_mb_per_sec, Timing};
use crate::transfer::RetryPolicy;
use crate::types::{partition, ByteRange};

pub const API_VERSION: &str = "6.0-preview.1";
pub const SERVICE_PATH: &str = "_apis/artifactcache";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactCacheEntry {
    #[serde(default)]
    pub cache_key: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub cache_version: Option<String>,
    #[serde(default)]
    pub creation_time: Option<String>,
    #[serde(default)]
    pub archive_location: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReserveCacheRequest<'a> {
    key: &'a str,
    cache_size: Option<u64>,
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReserveCacheResponse {
    #[serde(default)]
    cache_id: Option<u64>,
}

#[derive(Debug, Serialize)]
struct CommitCacheRequest {
    size: u64,
}

/// Client for the REST flavoured cache service (`_apis/artifactcache`).
#[derive(Debug, Clone)]
pub struct GithubCacheServiceV1Client {
    config: CacheConfig,
    service: ServiceClient,
    retry: RetryPolicy,
}

impl GithubCacheServiceV1Client {
    pub fn service_url(base_url: &str) -> String {
        format!("{}/{}", base_url.trim_end_matches('/'), SERVICE_PATH)
    }

    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let service = ServiceClient::new(
            build_http_client()?,
            Self::service_url(&config.base_url),
            config.auth_token.clone(),
        )
        .with_accept(format!("application/json;api-version={API_VERSION}"));

        Ok(Self {
            config,
            service,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn fix_key(&self, key: &str, partial_suffix: bool) -> String {
        fix_key(
            self.config.key_prefix.as_deref(),
            key,
            &self.config.key_suffix,
            partial_suffix,
        )
    }

    /// Looks up the newest entry whose key starts with `key` from any run.
    pub async fn get_cache_entry(&self, key: &str) -> Result<Option<ArtifactCacheEntry>> {
        let fixed_key = self.fix_key(key, true);
        let version = self.config.cache_version.to_string();
        log::debug!("Looking up V1 cache entry {} (version {})", fixed_key, version);

        let request = self
            .service
            .request(Method::GET, "cache")
            .query(&[("keys", fixed_key.as_str()), ("version", version.as_str())]);
        self.service
            .execute(request, &[200, 204])
            .await
            .with_context(|| format!("Cache lookup for {fixed_key} failed"))
    }

    pub async fn download_cache_entry(&self, entry: &ArtifactCacheEntry, out_file: &Path) -> Result<u64> {
        let url = entry
            .archive_location
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or(CacheError::MissingField {
                operation: "GetCacheEntry",
                field: "archiveLocation",
            })?;

        download_ranged(
            self.service.http(),
            url,
            out_file,
            self.config.download_chunk_size,
            self.config.concurrency,
        )
        .await
    }

    /// Reserve, upload every chunk, then commit. The commit is only sent once
    /// all chunks have been accepted.
    pub async fn upload(&self, key: &str, in_file: &Path) -> Result<()> {
        let fixed_key = self.fix_key(key, false);
        let size = tokio::fs::metadata(in_file)
            .await
            .with_context(|| format!("Failed to stat {}", in_file.display()))?
            .len();
        let timing = Timing::start(format!("Upload {fixed_key}"));

        let reserved: Option<ReserveCacheResponse> = self
            .service
            .post_json(
                "caches",
                &ReserveCacheRequest {
                    key: &fixed_key,
                    cache_size: Some(size),
                    version: Some(self.config.cache_version.to_string()),
                },
                &[201],
            )
            .await
            .with_context(|| format!("Failed to reserve cache entry {fixed_key}"))?;
        let cache_id = reserved
            .and_then(|response| response.cache_id)
            .ok_or(CacheError::MissingField {
                operation: "ReserveCache",
                field: "cacheId",
            })?;
        log::debug!("Reserved cache id {} for {}", cache_id, fixed_key);

        let ranges = partition(size, self.config.upload_chunk_size);
        let path = in_file.to_path_buf();
        run_chunks(&ranges, self.config.concurrency, |index, range| {
            let service = self.service.clone();
            let retry = self.retry;
            let path = path.clone();
            async move { upload_chunk(service, retry, path, cache_id, index, range).await }
        })
        .await?;

        let request = self
            .service
            .request(Method::POST, &format!("caches/{cache_id}"))
            .json(&CommitCacheRequest { size });
        self.service
            .execute::<serde_json::Value>(request, &[204])
            .await
            .with_context(|| format!("Failed to commit cache entry {fixed_key}"))?;

        log::info!(
            "Uploaded {} as {} ({:.1} MB/s)",
            format_bytes(size),
            fixed_key,
            throughput_mb_per_sec(size, timing.elapsed())
        );
        Ok(())
    }
}

async fn upload_chunk(
    service: ServiceClient,
    retry: RetryPolicy,
    path: PathBuf,
    cache_id: u64,
    index: usize,
    range: ByteRange,
) -> Result<()> {
    let _timing = Timing::start(format!("Chunk {} ({}-{})", index, range.offset, range.end()));
    let data = read_range(&path, range).await?;
    let resource = format!("caches/{cache_id}");

    retry
        .run(&format!("Upload chunk {index}"), || {
            let request = service
                .request(Method::PATCH, &resource)
                .header(CONTENT_TYPE, "application/octet-stream")
                .header(CONTENT_RANGE, range.content_range_header())
                .body(data.clone());
            async move {
                let response = request
                    .send()
                    .await
                    .with_context(|| format!("Chunk {index} upload request failed"))?;
                ensure_status(response, &[204]).await.map(|_| ())
            }
        })
        .await
}
