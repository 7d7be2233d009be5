use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::compression::{Compressor, OciCompression};
use super::tar_entry::{append_entry, SourceReaders, TarSourceEntry};

const FILE_BUFFER_SIZE: usize = 1024 * 1024;

/// Sizes and digests of one written layer stream. The uncompressed digest is
/// the layer's diff id, the compressed digest addresses the blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedStreamInfo {
    pub compressed_size: u64,
    pub compressed_sha256: String,
    pub uncompressed_size: u64,
    pub uncompressed_sha256: String,
}

struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: Arc<AtomicU64>,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: Arc::new(AtomicU64::new(0)),
        }
    }

    fn counter(&self) -> Arc<AtomicU64> {
        self.written.clone()
    }

    fn into_parts(self) -> (W, String, u64) {
        let written = self.written.load(Ordering::Relaxed);
        (self.inner, hex::encode(self.hasher.finalize()), written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

type CompressedSink = HashingWriter<BufWriter<File>>;
type TarSink = HashingWriter<Compressor<CompressedSink>>;

/// Streams tar entries through an optional compressor into `path`, hashing
/// both sides as bytes pass.
pub struct DataTarWriter {
    path: PathBuf,
    compression: Option<OciCompression>,
    builder: tar::Builder<TarSink>,
    compressed_written: Arc<AtomicU64>,
    tar_written: Arc<AtomicU64>,
    settled_compressed: u64,
    settled_tar: u64,
    entry_count: usize,
}

impl DataTarWriter {
    pub fn create(path: &Path, compression: Option<OciCompression>) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        let compressed = HashingWriter::new(BufWriter::with_capacity(FILE_BUFFER_SIZE, file));
        let compressed_written = compressed.counter();
        let compressor = Compressor::new(compressed, compression)
            .with_context(|| format!("Failed to start compressor for {}", path.display()))?;
        let tar_sink = HashingWriter::new(compressor);
        let tar_written = tar_sink.counter();

        let mut builder = tar::Builder::new(tar_sink);
        builder.follow_symlinks(false);

        Ok(Self {
            path: path.to_path_buf(),
            compression,
            builder,
            compressed_written,
            tar_written,
            settled_compressed: 0,
            settled_tar: 0,
            entry_count: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn compression(&self) -> Option<OciCompression> {
        self.compression
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    /// Bytes that have reached the output file so far. Lags the tar stream by
    /// whatever the compressor is still buffering.
    pub fn compressed_size(&self) -> u64 {
        self.compressed_written.load(Ordering::Relaxed)
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.tar_written.load(Ordering::Relaxed)
    }

    /// Compressed bytes so far plus every tar byte fed in since the
    /// compressor last produced output, counted at full size.
    pub fn estimated_size(&self) -> u64 {
        self.compressed_size() + self.uncompressed_size().saturating_sub(self.settled_tar)
    }

    pub fn append_entry(&mut self, entry: &TarSourceEntry, readers: &mut SourceReaders) -> Result<()> {
        append_entry(&mut self.builder, entry, readers)?;
        self.entry_count += 1;

        let compressed = self.compressed_size();
        if compressed != self.settled_compressed {
            self.settled_compressed = compressed;
            self.settled_tar = self.uncompressed_size();
        }
        Ok(())
    }

    pub fn finish(self) -> Result<CompressedStreamInfo> {
        let path = self.path;
        let tar_sink = self
            .builder
            .into_inner()
            .with_context(|| format!("Failed to finish tar stream {}", path.display()))?;
        let (compressor, uncompressed_sha256, uncompressed_size) = tar_sink.into_parts();
        let compressed = compressor
            .finish()
            .with_context(|| format!("Failed to finish compressor for {}", path.display()))?;
        let (mut file, compressed_sha256, compressed_size) = compressed.into_parts();
        file.flush()
            .with_context(|| format!("Failed to flush {}", path.display()))?;

        log::debug!(
            "Wrote {} ({} tar bytes, {} stored bytes)",
            path.display(),
            uncompressed_size,
            compressed_size
        );

        Ok(CompressedStreamInfo {
            compressed_size,
            compressed_sha256,
            uncompressed_size,
            uncompressed_sha256,
        })
    }
}
