use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use super::builder::RepositoryBuilder;
use super::compression::{decompress_file, OciCompression};
use super::data::DataRef;
use super::digest::prefixed;
use super::image::{OciImageIndex, OciImageLayer, OciImageManifest, OciIndexEntry, OciNode};
use super::layout::{read_layout, write_layout};
use super::media::{layer_media_type, MediaKind, MediaTypeRegistry};
use super::packer::LayerPacker;
use super::tar_index::{OpaqueWhiteoutPolicy, TarEntryIndex};
use super::unpacker::LayerUnpacker;
use crate::progress::Timing;

#[derive(Debug, Clone)]
pub struct RepackOptions {
    pub layers: usize,
    pub compression: Option<OciCompression>,
    pub opaque_whiteouts: OpaqueWhiteoutPolicy,
    /// Scratch space for decompressed and repacked layers. A temporary
    /// directory is used when unset.
    pub work_dir: Option<PathBuf>,
}

impl Default for RepackOptions {
    fn default() -> Self {
        Self {
            layers: 1,
            compression: Some(OciCompression::Gzip),
            opaque_whiteouts: OpaqueWhiteoutPolicy::default(),
            work_dir: None,
        }
    }
}

/// Rewrites the single-manifest image at `src_dir` with its layers flattened
/// and split into `options.layers` balanced layers, writing the result as a
/// new OCI layout at `dst_dir`.
pub fn repack_layout(
    src_dir: &Path,
    dst_dir: &Path,
    registry: &MediaTypeRegistry,
    options: &RepackOptions,
) -> Result<OciImageIndex> {
    anyhow::ensure!(options.layers > 0, "Layer count must be greater than zero");
    let _timing = Timing::start(format!("Repack of {}", src_dir.display()));

    let temp_dir;
    let work_dir = match &options.work_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
            dir.clone()
        }
        None => {
            temp_dir = tempfile::tempdir().context("Failed to create repack work dir")?;
            temp_dir.path().to_path_buf()
        }
    };

    let source_index = read_layout(src_dir, registry)?;
    let (source_entry, source_manifest) = source_index.single_manifest()?;

    let mut layer_tars = Vec::with_capacity(source_manifest.layers.len());
    for (position, layer) in source_manifest.layers.iter().enumerate() {
        layer_tars.push(uncompressed_layer(layer, registry, &work_dir, position)?);
    }

    let index = TarEntryIndex::from_sources(&layer_tars, options.opaque_whiteouts)?;
    let flat = work_dir.join("flat.tar");
    LayerUnpacker::new(&index, &flat).unpack()?;

    let extension = OciCompression::file_extension(options.compression);
    let outputs = (0..options.layers)
        .map(|i| work_dir.join(format!("packed-{i}.{extension}")))
        .collect();
    let packed = LayerPacker::new(&flat, outputs, options.compression).write()?;

    let media_type = layer_media_type(options.compression);
    let mut layers = Vec::new();
    let mut diff_ids = Vec::new();
    for output in packed.outputs {
        if output.entry_count == 0 {
            log::debug!("Dropping empty output {}", output.path.display());
            continue;
        }
        diff_ids.push(prefixed(&output.info.uncompressed_sha256));
        layers.push(OciImageLayer {
            media_type: media_type.clone(),
            data: DataRef::File(output.path),
            info: Some(output.info),
            annotations: None,
        });
    }

    let layer_count = layers.len();
    let mut config = source_manifest.config.clone();
    config.rootfs.kind = "layers".to_string();
    config.rootfs.diff_ids = diff_ids;
    config.history = None;

    let mut manifest = OciImageManifest::new(config, layers);
    manifest.annotations = source_manifest.annotations.clone();

    let mut entry = OciIndexEntry::manifest(manifest);
    entry.platform = source_entry.platform.clone();
    entry.annotations = source_entry.annotations.clone();
    let mut new_index = OciImageIndex::new(vec![entry]);
    new_index.annotations = source_index.annotations.clone();

    let mut builder = RepositoryBuilder::new(registry);
    let root = builder.add_data(OciNode::Index(&new_index))?;
    let repo = builder.build(root)?;
    write_layout(&repo, dst_dir)?;

    log::info!(
        "Repacked {} source layers into {} layers",
        layer_tars.len(),
        layer_count
    );
    read_layout(dst_dir, registry)
}

fn uncompressed_layer(
    layer: &OciImageLayer,
    registry: &MediaTypeRegistry,
    work_dir: &Path,
    position: usize,
) -> Result<PathBuf> {
    let DataRef::File(blob) = &layer.data else {
        anyhow::bail!("Layer {position} is not backed by a file");
    };

    let declared = match registry.kind(&layer.media_type)? {
        MediaKind::Layer(compression) => compression,
        _ => None,
    };
    let detected = OciCompression::detect_file(blob)?;
    if declared != detected {
        log::debug!(
            "Layer {} declares {:?} but looks like {:?}; using the stream header",
            position,
            declared,
            detected
        );
    }

    let target = work_dir.join(format!("source-{position}.tar"));
    decompress_file(blob, &target, detected)?;
    Ok(target)
}
