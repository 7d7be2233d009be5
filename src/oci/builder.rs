use anyhow::{Context, Result};
use std::collections::BTreeMap;

use super::data::{DataRef, OciDataRefInfo};
use super::digest::{is_valid_sha256_digest, prefixed};
use super::error::OciError;
use super::image::{OciImageIndex, OciImageLayer, OciImageManifest, OciIndexChild, OciNode};
use super::media::{
    Descriptor, ImageConfig, IndexDocument, ManifestDocument, MediaKind, MediaTypeRegistry, SCHEMA_VERSION,
};

#[derive(Debug)]
pub struct Blob {
    pub media_type: String,
    pub data: OciDataRefInfo,
}

/// Blobs produced by one build, keyed by digest, plus the root descriptor.
#[derive(Debug)]
pub struct BuiltRepository {
    pub root: Descriptor,
    pub blobs: BTreeMap<String, Blob>,
}

impl BuiltRepository {
    pub fn blob(&self, digest: &str) -> Option<&Blob> {
        self.blobs.get(digest)
    }
}

/// Flattens an image graph into a digest-keyed blob table. Adding two blobs
/// with the same digest in one session is an error; build each graph once.
pub struct RepositoryBuilder<'r> {
    registry: &'r MediaTypeRegistry,
    blobs: BTreeMap<String, Blob>,
}

impl<'r> RepositoryBuilder<'r> {
    pub fn new(registry: &'r MediaTypeRegistry) -> Self {
        Self {
            registry,
            blobs: BTreeMap::new(),
        }
    }

    pub fn add_blob(&mut self, media_type: &str, data: OciDataRefInfo) -> Result<Descriptor> {
        let digest = data.digest()?;
        let size = data.size()?;
        if !is_valid_sha256_digest(&digest) {
            return Err(OciError::InvalidDigest { digest }.into());
        }
        if self.blobs.contains_key(&digest) {
            return Err(OciError::DuplicateBlob { digest }.into());
        }

        self.blobs.insert(
            digest.clone(),
            Blob {
                media_type: media_type.to_string(),
                data,
            },
        );
        Ok(Descriptor::new(media_type, digest, size))
    }

    pub fn add_data(&mut self, node: OciNode<'_>) -> Result<Descriptor> {
        match node {
            OciNode::Index(index) => self.add_index(index),
            OciNode::Manifest(manifest) => self.add_manifest(manifest),
            OciNode::Config(media_type, config) => self.add_config(media_type, config),
            OciNode::Layer(layer) => self.add_layer(layer),
        }
    }

    fn expect_kind(&self, media_type: &str, expected: MediaKind, digest_hint: &str) -> Result<MediaKind> {
        let kind = self.registry.kind(media_type)?;
        let matches = match (kind, expected) {
            (MediaKind::Layer(_), MediaKind::Layer(_)) => true,
            (actual, wanted) => actual == wanted,
        };
        if !matches {
            return Err(OciError::UnexpectedMediaType {
                digest: digest_hint.to_string(),
                expected: expected.describe(),
                media_type: media_type.to_string(),
            }
            .into());
        }
        Ok(kind)
    }

    fn add_json<T: serde::Serialize>(&mut self, media_type: &str, value: &T) -> Result<Descriptor> {
        let bytes = serde_json::to_vec(value).context("Failed to serialize OCI document")?;
        self.add_blob(media_type, OciDataRefInfo::new(DataRef::bytes(bytes)))
    }

    pub fn add_layer(&mut self, layer: &OciImageLayer) -> Result<Descriptor> {
        self.expect_kind(&layer.media_type, MediaKind::Layer(None), "layer")?;
        let data = match &layer.info {
            Some(info) => OciDataRefInfo::with_known(
                layer.data.clone(),
                prefixed(&info.compressed_sha256),
                info.compressed_size,
            ),
            None => OciDataRefInfo::new(layer.data.clone()),
        };
        let mut descriptor = self.add_blob(&layer.media_type, data)?;
        descriptor.annotations = layer.annotations.clone();
        Ok(descriptor)
    }

    pub fn add_config(&mut self, media_type: &str, config: &ImageConfig) -> Result<Descriptor> {
        self.expect_kind(media_type, MediaKind::Config, "config")?;
        self.add_json(media_type, config)
    }

    pub fn add_manifest(&mut self, manifest: &OciImageManifest) -> Result<Descriptor> {
        self.expect_kind(&manifest.media_type, MediaKind::Manifest, "manifest")?;
        let config = self.add_config(&manifest.config_media_type, &manifest.config)?;
        let layers = manifest
            .layers
            .iter()
            .map(|layer| self.add_layer(layer))
            .collect::<Result<Vec<_>>>()?;

        let document = ManifestDocument {
            schema_version: SCHEMA_VERSION,
            media_type: Some(manifest.media_type.clone()),
            config,
            layers,
            annotations: manifest.annotations.clone(),
        };
        self.add_json(&manifest.media_type, &document)
    }

    pub fn add_index(&mut self, index: &OciImageIndex) -> Result<Descriptor> {
        self.expect_kind(&index.media_type, MediaKind::Index, "index")?;
        let mut manifests = Vec::with_capacity(index.manifests.len());
        for entry in &index.manifests {
            let mut descriptor = match &entry.child {
                OciIndexChild::Index(nested) => self.add_index(nested)?,
                OciIndexChild::Manifest(manifest) => self.add_manifest(manifest)?,
            };
            descriptor.platform = entry.platform.clone();
            descriptor.annotations = entry.annotations.clone();
            manifests.push(descriptor);
        }

        let document = IndexDocument {
            schema_version: SCHEMA_VERSION,
            media_type: Some(index.media_type.clone()),
            manifests,
            annotations: index.annotations.clone(),
        };
        self.add_json(&index.media_type, &document)
    }

    /// Checks that every descriptor inside every JSON blob resolves to a blob
    /// in this session, then hands out the table.
    pub fn build(self, root: Descriptor) -> Result<BuiltRepository> {
        self.resolve(&root)?;
        for blob in self.blobs.values() {
            match self.registry.kind(&blob.media_type)? {
                MediaKind::Index => {
                    let document: IndexDocument = read_json(blob)?;
                    for descriptor in &document.manifests {
                        self.resolve(descriptor)?;
                    }
                }
                MediaKind::Manifest => {
                    let document: ManifestDocument = read_json(blob)?;
                    self.resolve(&document.config)?;
                    for descriptor in &document.layers {
                        self.resolve(descriptor)?;
                    }
                }
                MediaKind::Config | MediaKind::Layer(_) => {}
            }
        }

        log::debug!("Built repository with {} blobs", self.blobs.len());
        Ok(BuiltRepository {
            root,
            blobs: self.blobs,
        })
    }

    fn resolve(&self, descriptor: &Descriptor) -> Result<()> {
        if self.blobs.contains_key(&descriptor.digest) {
            Ok(())
        } else {
            Err(OciError::UnresolvedDescriptor {
                digest: descriptor.digest.clone(),
            }
            .into())
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(blob: &Blob) -> Result<T> {
    let reader = blob.data.data().open()?;
    serde_json::from_reader(reader).context("Failed to parse OCI document")
}
