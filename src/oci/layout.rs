use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::builder::BuiltRepository;
use super::data::DataRef;
use super::digest::{digest_hex_component, is_valid_sha256_digest};
use super::error::OciError;
use super::image::{OciImageIndex, OciImageLayer, OciImageManifest, OciIndexChild, OciIndexEntry};
use super::media::{
    Descriptor, ImageConfig, IndexDocument, ManifestDocument, MediaKind, MediaTypeRegistry, OCI_IMAGE_INDEX,
};

pub const OCI_LAYOUT_FILE: &str = "oci-layout";
pub const INDEX_FILE: &str = "index.json";
const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

pub fn blob_path(layout_dir: &Path, digest: &str) -> Result<PathBuf> {
    if !is_valid_sha256_digest(digest) {
        return Err(OciError::InvalidDigest {
            digest: digest.to_string(),
        }
        .into());
    }
    let hex = digest_hex_component(digest).ok_or_else(|| anyhow!("Invalid digest '{digest}'"))?;
    Ok(layout_dir.join("blobs").join("sha256").join(hex))
}

/// Loads the image graph rooted at `index.json`. Layer data stays on disk
/// and is referenced by path.
pub fn read_layout(layout_dir: &Path, registry: &MediaTypeRegistry) -> Result<OciImageIndex> {
    let index_path = layout_dir.join(INDEX_FILE);
    if !index_path.is_file() {
        return Err(anyhow!("Missing OCI index at {}", index_path.display()));
    }
    let bytes =
        std::fs::read(&index_path).with_context(|| format!("Failed to read {}", index_path.display()))?;
    let document: IndexDocument = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse {}", index_path.display()))?;

    let media_type = document
        .media_type
        .clone()
        .unwrap_or_else(|| OCI_IMAGE_INDEX.to_string());
    index_from_document(layout_dir, registry, media_type, document)
}

fn index_from_document(
    layout_dir: &Path,
    registry: &MediaTypeRegistry,
    media_type: String,
    document: IndexDocument,
) -> Result<OciImageIndex> {
    let mut manifests = Vec::with_capacity(document.manifests.len());
    for descriptor in document.manifests {
        let child = match registry.kind(&descriptor.media_type)? {
            MediaKind::Index => {
                let nested: IndexDocument = read_blob_json(layout_dir, &descriptor)?;
                OciIndexChild::Index(Box::new(index_from_document(
                    layout_dir,
                    registry,
                    descriptor.media_type.clone(),
                    nested,
                )?))
            }
            MediaKind::Manifest => {
                OciIndexChild::Manifest(Box::new(read_manifest(layout_dir, registry, &descriptor)?))
            }
            other => {
                return Err(OciError::UnexpectedMediaType {
                    digest: descriptor.digest.clone(),
                    expected: "an index or manifest",
                    media_type: format!("{} ({})", descriptor.media_type, other.describe()),
                }
                .into())
            }
        };
        manifests.push(OciIndexEntry {
            child,
            platform: descriptor.platform,
            annotations: descriptor.annotations,
        });
    }

    Ok(OciImageIndex {
        media_type,
        manifests,
        annotations: document.annotations,
    })
}

fn read_manifest(
    layout_dir: &Path,
    registry: &MediaTypeRegistry,
    descriptor: &Descriptor,
) -> Result<OciImageManifest> {
    let document: ManifestDocument = read_blob_json(layout_dir, descriptor)?;

    if registry.kind(&document.config.media_type)? != MediaKind::Config {
        return Err(OciError::UnexpectedMediaType {
            digest: document.config.digest.clone(),
            expected: MediaKind::Config.describe(),
            media_type: document.config.media_type.clone(),
        }
        .into());
    }
    let config: ImageConfig = read_blob_json(layout_dir, &document.config)?;

    let mut layers = Vec::with_capacity(document.layers.len());
    for layer in document.layers {
        if !matches!(registry.kind(&layer.media_type)?, MediaKind::Layer(_)) {
            return Err(OciError::UnexpectedMediaType {
                digest: layer.digest.clone(),
                expected: "a layer",
                media_type: layer.media_type.clone(),
            }
            .into());
        }
        let path = blob_path(layout_dir, &layer.digest)?;
        if !path.is_file() {
            return Err(anyhow!("Missing layer blob {}", path.display()));
        }
        layers.push(OciImageLayer {
            media_type: layer.media_type,
            data: DataRef::File(path),
            info: None,
            annotations: layer.annotations,
        });
    }

    Ok(OciImageManifest {
        media_type: document
            .media_type
            .unwrap_or_else(|| descriptor.media_type.clone()),
        config_media_type: document.config.media_type,
        config,
        layers,
        annotations: document.annotations,
    })
}

fn read_blob_json<T: serde::de::DeserializeOwned>(layout_dir: &Path, descriptor: &Descriptor) -> Result<T> {
    let path = blob_path(layout_dir, &descriptor.digest)?;
    let bytes = std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Writes `repo` as an OCI image layout. `index.json` carries the root index
/// document; every blob, the root included, lands under `blobs/sha256`.
pub fn write_layout(repo: &BuiltRepository, layout_dir: &Path) -> Result<()> {
    let blobs_dir = layout_dir.join("blobs").join("sha256");
    std::fs::create_dir_all(&blobs_dir)
        .with_context(|| format!("Failed to create {}", blobs_dir.display()))?;

    std::fs::write(layout_dir.join(OCI_LAYOUT_FILE), OCI_LAYOUT_CONTENT)
        .with_context(|| format!("Failed to write {}", layout_dir.join(OCI_LAYOUT_FILE).display()))?;

    for (digest, blob) in &repo.blobs {
        let target = blob_path(layout_dir, digest)?;
        match blob.data.data() {
            DataRef::File(source) => {
                std::fs::copy(source, &target).with_context(|| {
                    format!("Failed to copy {} to {}", source.display(), target.display())
                })?;
            }
            data => {
                let mut reader = data.open()?;
                let file = File::create(&target)
                    .with_context(|| format!("Failed to create {}", target.display()))?;
                let mut writer = BufWriter::new(file);
                std::io::copy(&mut reader, &mut writer)
                    .with_context(|| format!("Failed to write {}", target.display()))?;
                writer.flush()?;
            }
        }
    }

    let root = repo
        .blob(&repo.root.digest)
        .ok_or_else(|| OciError::UnresolvedDescriptor {
            digest: repo.root.digest.clone(),
        })?;
    let mut index_bytes = Vec::new();
    std::io::copy(&mut root.data.data().open()?, &mut index_bytes)?;
    std::fs::write(layout_dir.join(INDEX_FILE), index_bytes)
        .with_context(|| format!("Failed to write {}", layout_dir.join(INDEX_FILE).display()))?;

    log::info!(
        "Wrote OCI layout to {} ({} blobs)",
        layout_dir.display(),
        repo.blobs.len()
    );
    Ok(())
}
