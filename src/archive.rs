use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Instant;
use zstd::stream::read::Decoder as ZstdDecoder;
use zstd::stream::write::Encoder as ZstdEncoder;

use crate::progress::format_bytes;

const COMPRESSION_LEVEL: i32 = 3;
const BUFFER_SIZE: usize = 1024 * 1024;

/// Archives the contents of `source_dir` into a zstd-compressed tar at
/// `archive_path`. Returns the compressed size.
pub async fn create_tar_archive(source_dir: &Path, archive_path: &Path) -> Result<u64> {
    let start_time = Instant::now();
    let source_dir = source_dir.to_path_buf();
    let archive_path = archive_path.to_path_buf();
    let archive_path_owned = archive_path.clone();

    let compressed_size = tokio::task::spawn_blocking(move || write_archive(&source_dir, &archive_path_owned))
        .await
        .context("Archive creation task failed")??;

    log::debug!(
        "Created {} ({}) in {:.1}s",
        archive_path.display(),
        format_bytes(compressed_size),
        start_time.elapsed().as_secs_f64()
    );
    Ok(compressed_size)
}

fn write_archive(source_dir: &Path, archive_path: &Path) -> Result<u64> {
    let output_file =
        File::create(archive_path).with_context(|| format!("Failed to create {}", archive_path.display()))?;
    let writer = BufWriter::with_capacity(BUFFER_SIZE, output_file);
    let encoder = ZstdEncoder::new(writer, COMPRESSION_LEVEL)?;

    let mut tar_builder = tar::Builder::new(encoder);
    tar_builder.mode(tar::HeaderMode::Deterministic);
    tar_builder.follow_symlinks(false);

    for path in sorted_files(source_dir)? {
        let name = path
            .strip_prefix(source_dir)
            .with_context(|| format!("{} is outside {}", path.display(), source_dir.display()))?;
        tar_builder
            .append_path_with_name(&path, name)
            .with_context(|| format!("Failed to add {} to archive", name.display()))?;
    }

    let encoder = tar_builder.into_inner()?;
    encoder.finish()?.into_inner().map_err(|err| err.into_error())?;

    Ok(fs::metadata(archive_path)?.len())
}

/// Regular files under `dir`, depth first, in name order.
fn sorted_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    let mut files = Vec::new();
    for entry in entries {
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            files.extend(sorted_files(&path)?);
        } else {
            files.push(path);
        }
    }
    Ok(files)
}

/// Unpacks a zstd-compressed tar created by [`create_tar_archive`].
pub async fn extract_tar_archive(archive_path: &Path, target_path: &Path) -> Result<()> {
    let archive_path = archive_path.to_path_buf();
    let target_path = target_path.to_path_buf();

    tokio::fs::create_dir_all(&target_path)
        .await
        .with_context(|| format!("Failed to create target directory {}", target_path.display()))?;

    tokio::task::spawn_blocking(move || {
        let file = File::open(&archive_path).with_context(|| format!("Failed to open {}", archive_path.display()))?;
        let decoder = ZstdDecoder::new(BufReader::with_capacity(BUFFER_SIZE, file))?;
        let mut archive = tar::Archive::new(decoder);
        archive.set_unpack_xattrs(false);
        archive
            .unpack(&target_path)
            .with_context(|| format!("Failed to extract {}", archive_path.display()))
    })
    .await
    .context("Archive extraction task failed")?
}
