use anyhow::{Context, Result};
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::Client;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::chunks::run_chunks;
use super::http::ensure_status;
use crate::error::CacheError;
use crate::progress::{format_bytes, throughput_mb_per_sec, Timing};
use crate::types::{partition, ByteRange};

/// Size of the resource at `url`, read from the `Content-Length` of a HEAD.
pub async fn content_length(http: &Client, url: &str) -> Result<u64> {
    let response = http
        .head(url)
        .send()
        .await
        .context("Cache download HEAD request failed")?;
    let response = ensure_status(response, &[200]).await?;

    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .ok_or(CacheError::MissingField {
            operation: "HEAD",
            field: "Content-Length",
        })
        .map_err(Into::into)
}

/// Downloads `url` into the new file `out_file` with concurrent ranged GETs.
/// Chunks land in a sibling `.incomplete` file that is renamed into place
/// only once every chunk succeeded; on failure nothing is left behind.
pub async fn download_ranged(
    http: &Client,
    url: &str,
    out_file: &Path,
    chunk_size: u64,
    concurrency: usize,
) -> Result<u64> {
    let timing = Timing::start(format!("Download to {}", out_file.display()));
    if tokio::fs::try_exists(out_file).await.unwrap_or(false) {
        return Err(std::io::Error::from(std::io::ErrorKind::AlreadyExists))
            .with_context(|| format!("Failed to create {}", out_file.display()));
    }
    let size = content_length(http, url).await?;

    let partial = incomplete_path(out_file)?;
    remove_if_exists(&partial).await?;

    let fetched = fetch_chunks(http, url, &partial, size, chunk_size, concurrency).await;
    let finished = match fetched {
        Ok(()) => tokio::fs::rename(&partial, out_file)
            .await
            .with_context(|| format!("Failed to move download into {}", out_file.display())),
        Err(err) => Err(err),
    };
    if let Err(err) = finished {
        if let Err(cleanup) = remove_if_exists(&partial).await {
            log::warn!("Failed to remove {}: {}", partial.display(), cleanup);
        }
        return Err(err);
    }

    log::info!(
        "Downloaded {} to {} ({:.1} MB/s)",
        format_bytes(size),
        out_file.display(),
        throughput_mb_per_sec(size, timing.elapsed())
    );
    Ok(size)
}

fn incomplete_path(out_file: &Path) -> Result<PathBuf> {
    let name = out_file
        .file_name()
        .with_context(|| format!("Download target {} has no file name", out_file.display()))?;
    let mut name = name.to_os_string();
    name.push(".incomplete");
    Ok(out_file.with_file_name(name))
}

pub(crate) async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

async fn fetch_chunks(
    http: &Client,
    url: &str,
    partial: &Path,
    size: u64,
    chunk_size: u64,
    concurrency: usize,
) -> Result<()> {
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(partial)
        .with_context(|| format!("Failed to create {}", partial.display()))?;
    file.set_len(size)
        .with_context(|| format!("Failed to size {}", partial.display()))?;
    let file = Arc::new(file);

    let ranges = partition(size, chunk_size);
    log::debug!(
        "Downloading {} in {} chunks of up to {}",
        format_bytes(size),
        ranges.len(),
        format_bytes(chunk_size)
    );

    run_chunks(&ranges, concurrency, |index, range| {
        let http = http.clone();
        let url = url.to_string();
        let file = file.clone();
        async move { download_chunk(&http, &url, file, index, range).await }
    })
    .await?;
    Ok(())
}

async fn download_chunk(http: &Client, url: &str, file: Arc<File>, index: usize, range: ByteRange) -> Result<()> {
    let _timing = Timing::start(format!("Chunk {} ({}-{})", index, range.offset, range.end()));

    let response = http
        .get(url)
        .header(RANGE, range.range_header())
        .send()
        .await
        .with_context(|| format!("Chunk {index} request failed"))?;
    let response = ensure_status(response, &[200, 206]).await?;
    let body = response
        .bytes()
        .await
        .with_context(|| format!("Chunk {index} body read failed"))?;

    if body.len() as u64 != range.size {
        return Err(CacheError::SizeMismatch {
            offset: range.offset,
            expected: range.size,
            actual: body.len() as u64,
        }
        .into());
    }

    tokio::task::spawn_blocking(move || write_at(&file, &body, range.offset))
        .await
        .context("Chunk write task panicked")?
        .with_context(|| format!("Failed to write chunk {index}"))
}

#[cfg(unix)]
fn write_at(file: &File, data: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn write_at(file: &File, mut data: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        let written = file.seek_write(data, offset)?;
        if written == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        data = &data[written..];
        offset += written as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::http::build_http_client;

    async fn head_mock(server: &mut mockito::Server, length: usize) -> mockito::Mock {
        server
            .mock("HEAD", "/blob")
            .with_status(200)
            .with_header("content-length", length.to_string().as_str())
            .with_body("x".repeat(length))
            .create_async()
            .await
    }

    #[tokio::test]
    async fn chunks_are_assembled_in_order() {
        let mut server = mockito::Server::new_async().await;
        let _head = head_mock(&mut server, 25).await;
        let mut gets = Vec::new();
        for (range, body) in [("bytes=0-9", "0123456789"), ("bytes=10-19", "abcdefghij"), ("bytes=20-24", "KLMNO")] {
            gets.push(
                server
                    .mock("GET", "/blob")
                    .match_header("range", range)
                    .with_status(206)
                    .with_body(body)
                    .create_async()
                    .await,
            );
        }

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let size = download_ranged(&build_http_client().unwrap(), &format!("{}/blob", server.url()), &out, 10, 2)
            .await
            .unwrap();

        assert_eq!(size, 25);
        assert_eq!(std::fs::read(&out).unwrap(), b"0123456789abcdefghijKLMNO");
        assert!(!dir.path().join("out.incomplete").exists());
    }

    #[tokio::test]
    async fn short_chunk_is_fatal() {
        let mut server = mockito::Server::new_async().await;
        let _head = head_mock(&mut server, 20).await;
        let _get = server
            .mock("GET", "/blob")
            .with_status(206)
            .with_body("short")
            .expect_at_least(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let err = download_ranged(
            &build_http_client().unwrap(),
            &format!("{}/blob", server.url()),
            &out,
            10,
            2,
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<CacheError>(),
            Some(CacheError::SizeMismatch { expected: 10, actual: 5, .. })
        ));
    }

    #[tokio::test]
    async fn failed_download_leaves_nothing_behind() {
        let mut server = mockito::Server::new_async().await;
        let _head = head_mock(&mut server, 20).await;
        let _get = server
            .mock("GET", "/blob")
            .with_status(500)
            .expect_at_least(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let url = format!("{}/blob", server.url());
        let http = build_http_client().unwrap();

        assert!(download_ranged(&http, &url, &out, 10, 2).await.is_err());
        assert!(!out.exists());
        assert!(!dir.path().join("out.incomplete").exists());

        let err = download_ranged(&http, &url, &out, 10, 2).await.unwrap_err();
        assert!(!format!("{err:#}").contains("Failed to create"));
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn existing_output_is_not_clobbered() {
        let mut server = mockito::Server::new_async().await;
        let _head = head_mock(&mut server, 3).await;
        let _get = server
            .mock("GET", "/blob")
            .with_status(206)
            .with_body("abc")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        std::fs::write(&out, b"keep").unwrap();

        let err = download_ranged(
            &build_http_client().unwrap(),
            &format!("{}/blob", server.url()),
            &out,
            10,
            2,
        )
        .await
        .unwrap_err();

        assert!(format!("{err:#}").contains("Failed to create"));
        assert!(err
            .chain()
            .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
            .any(|io| io.kind() == std::io::ErrorKind::AlreadyExists));
        assert_eq!(std::fs::read(&out).unwrap(), b"keep");
    }
}
