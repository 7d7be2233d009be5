use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use std::path::{Path, PathBuf};

use super::chunks::{read_range, run_chunks};
use super::http::ensure_status;
use crate::progress::{format_bytes, Timing};
use crate::transfer::RetryPolicy;
use crate::types::{partition, ByteRange};

pub const AZURE_API_VERSION: &str = "2020-04-08";

/// Block id for chunk `index`: base64 of the zero-padded 8 digit index, so
/// every id in a blob has the same length.
pub fn block_id(index: usize) -> String {
    STANDARD.encode(format!("{index:08}"))
}

pub fn block_list_xml(block_ids: &[String]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>");
    for id in block_ids {
        xml.push_str("<Latest>");
        xml.push_str(id);
        xml.push_str("</Latest>");
    }
    xml.push_str("</BlockList>");
    xml
}

fn rfc1123_now() -> String {
    chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Two-phase Block Blob upload against a SAS-signed URL: stage blocks
/// concurrently, then commit the block list in chunk order.
#[derive(Debug, Clone)]
pub struct AzureBlockBlobUploader {
    http: Client,
    retry: RetryPolicy,
    concurrency: usize,
    chunk_size: u64,
}

impl AzureBlockBlobUploader {
    pub fn new(http: Client, concurrency: usize, chunk_size: u64) -> Self {
        Self {
            http,
            retry: RetryPolicy::default(),
            concurrency,
            chunk_size,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn upload_file(&self, signed_url: &str, in_file: &Path) -> Result<u64> {
        let url = Url::parse(signed_url).context("Invalid signed upload URL")?;
        let size = tokio::fs::metadata(in_file)
            .await
            .with_context(|| format!("Failed to stat {}", in_file.display()))?
            .len();
        let _timing = Timing::start(format!("Blob upload of {}", format_bytes(size)));

        let ranges = partition(size, self.chunk_size);
        let path = in_file.to_path_buf();
        let block_ids = run_chunks(&ranges, self.concurrency, |index, range| {
            let stage = StageBlock {
                http: self.http.clone(),
                retry: self.retry,
                url: url.clone(),
                path: path.clone(),
                index,
                range,
            };
            async move { stage.run().await }
        })
        .await?;

        self.commit(&url, &block_ids).await?;
        Ok(size)
    }

    async fn commit(&self, url: &Url, block_ids: &[String]) -> Result<()> {
        let mut url = url.clone();
        url.query_pairs_mut().append_pair("comp", "blocklist");

        let response = self
            .http
            .put(url)
            .header("x-ms-date", rfc1123_now())
            .header("x-ms-version", AZURE_API_VERSION)
            .header(CONTENT_TYPE, "application/xml")
            .body(block_list_xml(block_ids))
            .send()
            .await
            .context("Block list commit request failed")?;
        ensure_status(response, &[200, 201])
            .await
            .with_context(|| format!("Failed to commit {} blocks", block_ids.len()))?;
        Ok(())
    }
}

struct StageBlock {
    http: Client,
    retry: RetryPolicy,
    url: Url,
    path: PathBuf,
    index: usize,
    range: ByteRange,
}

impl StageBlock {
    async fn run(self) -> Result<String> {
        let _timing = Timing::start(format!(
            "Block {} ({}-{})",
            self.index,
            self.range.offset,
            self.range.end()
        ));
        let data = read_range(&self.path, self.range).await?;
        let id = block_id(self.index);

        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair("comp", "block")
            .append_pair("blockid", &id);

        self.retry
            .run(&format!("Stage block {}", self.index), || {
                let request = self
                    .http
                    .put(url.clone())
                    .header("x-ms-date", rfc1123_now())
                    .header("x-ms-version", AZURE_API_VERSION)
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(data.clone());
                let index = self.index;
                async move {
                    let response = request
                        .send()
                        .await
                        .with_context(|| format!("Block {index} request failed"))?;
                    ensure_status(response, &[201, 202]).await.map(|_| ())
                }
            })
            .await?;

        Ok(id)
    }
}
