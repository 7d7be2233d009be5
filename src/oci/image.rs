use std::collections::BTreeMap;

use super::data::DataRef;
use super::data_tar::CompressedStreamInfo;
use super::media::{ImageConfig, OCI_IMAGE_CONFIG, OCI_IMAGE_INDEX, OCI_IMAGE_MANIFEST};

pub type Annotations = BTreeMap<String, String>;

#[derive(Debug, Clone)]
pub struct OciImageLayer {
    pub media_type: String,
    pub data: DataRef,
    /// Present when the layer was written here and its digests are known.
    pub info: Option<CompressedStreamInfo>,
    pub annotations: Option<Annotations>,
}

#[derive(Debug, Clone)]
pub struct OciImageManifest {
    pub media_type: String,
    pub config_media_type: String,
    pub config: ImageConfig,
    pub layers: Vec<OciImageLayer>,
    pub annotations: Option<Annotations>,
}

impl OciImageManifest {
    pub fn new(config: ImageConfig, layers: Vec<OciImageLayer>) -> Self {
        Self {
            media_type: OCI_IMAGE_MANIFEST.to_string(),
            config_media_type: OCI_IMAGE_CONFIG.to_string(),
            config,
            layers,
            annotations: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum OciIndexChild {
    Index(Box<OciImageIndex>),
    Manifest(Box<OciImageManifest>),
}

#[derive(Debug, Clone)]
pub struct OciIndexEntry {
    pub child: OciIndexChild,
    pub platform: Option<serde_json::Value>,
    pub annotations: Option<Annotations>,
}

impl OciIndexEntry {
    pub fn manifest(manifest: OciImageManifest) -> Self {
        Self {
            child: OciIndexChild::Manifest(Box::new(manifest)),
            platform: None,
            annotations: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OciImageIndex {
    pub media_type: String,
    pub manifests: Vec<OciIndexEntry>,
    pub annotations: Option<Annotations>,
}

impl OciImageIndex {
    pub fn new(manifests: Vec<OciIndexEntry>) -> Self {
        Self {
            media_type: OCI_IMAGE_INDEX.to_string(),
            manifests,
            annotations: None,
        }
    }

    /// Descends through nested indices to the single manifest they wrap,
    /// returning it with the entry that referenced it.
    pub fn single_manifest(&self) -> anyhow::Result<(&OciIndexEntry, &OciImageManifest)> {
        match self.manifests.as_slice() {
            [entry] => match &entry.child {
                OciIndexChild::Manifest(manifest) => Ok((entry, manifest)),
                OciIndexChild::Index(nested) => nested.single_manifest(),
            },
            [] => anyhow::bail!("Image index has no manifests"),
            many => anyhow::bail!(
                "Image index has {} manifests; only single-manifest images are supported",
                many.len()
            ),
        }
    }
}

/// Any node the repository builder can turn into a blob.
#[derive(Debug, Clone, Copy)]
pub enum OciNode<'a> {
    Index(&'a OciImageIndex),
    Manifest(&'a OciImageManifest),
    Config(&'a str, &'a ImageConfig),
    Layer(&'a OciImageLayer),
}
