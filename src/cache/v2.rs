use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::azure::AzureBlockBlobUploader;
use super::download::download_ranged;
use super::http::{build_http_client, ServiceClient};
use super::key::fix_key;
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::transfer::RetryPolicy;

pub const SERVICE_NAME: &str = "github.actions.results.api.v1.CacheService";

/// Versions are sent as 64 characters, left padded with zeros.
pub fn format_version(version: u64) -> String {
    format!("{version:0>64}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetCacheEntryDownloadUrlRequest {
    pub key: String,
    pub restore_keys: Vec<String>,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetCacheEntryDownloadUrlResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub signed_download_url: String,
    #[serde(default)]
    pub matched_key: String,
}

#[derive(Debug, Serialize)]
struct CreateCacheEntryRequest<'a> {
    key: &'a str,
    version: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateCacheEntryResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    signed_upload_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FinalizeCacheEntryUploadRequest<'a> {
    key: &'a str,
    size_bytes: u64,
    version: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinalizeCacheEntryUploadResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    entry_id: Option<serde_json::Value>,
}

/// A lookup hit: the request that produced it and the signed download URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V2CacheEntry {
    pub request: GetCacheEntryDownloadUrlRequest,
    pub response: GetCacheEntryDownloadUrlResponse,
}

/// Client for the Twirp cache service, storing bytes in Azure Block Blob.
#[derive(Debug, Clone)]
pub struct GithubCacheServiceV2Client {
    config: CacheConfig,
    service: ServiceClient,
    uploader: AzureBlockBlobUploader,
}

impl GithubCacheServiceV2Client {
    pub fn service_url(base_url: &str) -> String {
        format!("{}/twirp/{}", base_url.trim_end_matches('/'), SERVICE_NAME)
    }

    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let http = build_http_client()?;
        let service = ServiceClient::new(
            http.clone(),
            Self::service_url(&config.base_url),
            config.auth_token.clone(),
        )
        .with_accept("application/json");
        let uploader = AzureBlockBlobUploader::new(http, config.concurrency, config.upload_chunk_size);

        Ok(Self {
            config,
            service,
            uploader,
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.uploader = self.uploader.with_retry_policy(retry);
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

    fn version(&self) -> String {
        format_version(self.config.cache_version)
    }

    /// Looks up `key`, falling back to any run's entry via the partial key.
    /// Not found, an empty response, and `ok: false` are all misses.
    pub async fn get_cache_entry(&self, key: &str) -> Result<Option<V2CacheEntry>> {
        let request = GetCacheEntryDownloadUrlRequest {
            key: self.fix_key(key, false),
            restore_keys: vec![self.fix_key(key, true)],
            version: self.version(),
        };
        log::debug!("Looking up V2 cache entry {}", request.key);

        let result = self
            .service
            .post_json::<_, GetCacheEntryDownloadUrlResponse>("GetCacheEntryDownloadURL", &request, &[200])
            .await;
        let response = match result {
            Ok(Some(response)) if response.ok => response,
            Ok(_) => return Ok(None),
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(err.context(format!("Cache lookup for {} failed", request.key))),
        };

        if response.signed_download_url.is_empty() {
            return Err(CacheError::MissingField {
                operation: "GetCacheEntryDownloadURL",
                field: "signedDownloadUrl",
            }
            .into());
        }

        Ok(Some(V2CacheEntry { request, response }))
    }

    pub async fn download_cache_entry(&self, entry: &V2CacheEntry, out_file: &Path) -> Result<u64> {
        download_ranged(
            self.service.http(),
            &entry.response.signed_download_url,
            out_file,
            self.config.download_chunk_size,
            self.config.concurrency,
        )
        .await
    }

    pub async fn upload(&self, key: &str, in_file: &Path) -> Result<()> {
        let fixed_key = self.fix_key(key, false);
        let version = self.version();

        let created: CreateCacheEntryResponse = self
            .service
            .post_json(
                "CreateCacheEntry",
                &CreateCacheEntryRequest {
                    key: &fixed_key,
                    version: &version,
                },
                &[200],
            )
            .await
            .with_context(|| format!("Failed to create cache entry {fixed_key}"))?
            .unwrap_or_default();
        if !created.ok {
            return Err(CacheError::NotOk {
                operation: "CreateCacheEntry",
            }
            .into());
        }
        if created.signed_upload_url.is_empty() {
            return Err(CacheError::MissingField {
                operation: "CreateCacheEntry",
                field: "signedUploadUrl",
            }
            .into());
        }

        let size = self
            .uploader
            .upload_file(&created.signed_upload_url, in_file)
            .await
            .with_context(|| format!("Failed to upload blob for {fixed_key}"))?;

        let finalized: FinalizeCacheEntryUploadResponse = self
            .service
            .post_json(
                "FinalizeCacheEntryUpload",
                &FinalizeCacheEntryUploadRequest {
                    key: &fixed_key,
                    size_bytes: size,
                    version: &version,
                },
                &[200],
            )
            .await
            .with_context(|| format!("Failed to finalize cache entry {fixed_key}"))?
            .unwrap_or_default();
        if !finalized.ok {
            return Err(CacheError::NotOk {
                operation: "FinalizeCacheEntryUpload",
            }
            .into());
        }

        log::debug!("Finalized cache entry {} ({:?})", fixed_key, finalized.entry_id);
        Ok(())
    }
}

fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<CacheError>(),
        Some(CacheError::ServiceRequest(service)) if service.status_code == 404
    )
}
