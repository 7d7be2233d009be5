use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::compression::OciCompression;
use super::error::OciError;

pub const OCI_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_IMAGE_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";

pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

pub const SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Index,
    Manifest,
    Config,
    Layer(Option<OciCompression>),
}

impl MediaKind {
    pub fn describe(&self) -> &'static str {
        match self {
            MediaKind::Index => "an image index",
            MediaKind::Manifest => "an image manifest",
            MediaKind::Config => "an image config",
            MediaKind::Layer(_) => "a layer",
        }
    }
}

/// Media types this crate knows how to interpret. Built once and passed to
/// whatever reads or builds image graphs.
#[derive(Debug, Clone, Default)]
pub struct MediaTypeRegistry {
    kinds: HashMap<String, MediaKind>,
}

impl MediaTypeRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(OCI_IMAGE_INDEX, MediaKind::Index);
        registry.register(OCI_IMAGE_MANIFEST, MediaKind::Manifest);
        registry.register(OCI_IMAGE_CONFIG, MediaKind::Config);
        registry.register(OCI_IMAGE_LAYER, MediaKind::Layer(None));
        for compression in [OciCompression::Gzip, OciCompression::Zstd] {
            registry.register(&layer_media_type(Some(compression)), MediaKind::Layer(Some(compression)));
        }
        registry.register(DOCKER_MANIFEST_LIST, MediaKind::Index);
        registry.register(DOCKER_MANIFEST, MediaKind::Manifest);
        registry.register(DOCKER_CONFIG, MediaKind::Config);
        registry.register(DOCKER_LAYER_GZIP, MediaKind::Layer(Some(OciCompression::Gzip)));
        registry
    }

    pub fn register(&mut self, media_type: &str, kind: MediaKind) -> &mut Self {
        self.kinds.insert(media_type.to_string(), kind);
        self
    }

    pub fn kind(&self, media_type: &str) -> Result<MediaKind, OciError> {
        self.kinds
            .get(media_type)
            .copied()
            .ok_or_else(|| OciError::UnknownMediaType {
                media_type: media_type.to_string(),
            })
    }
}

pub fn layer_media_type(compression: Option<OciCompression>) -> String {
    match compression {
        None => OCI_IMAGE_LAYER.to_string(),
        Some(compression) => format!("{OCI_IMAGE_LAYER}{}", compression.media_type_suffix()),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: impl Into<String>, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest.into(),
            size,
            platform: None,
            annotations: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDocument {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestDocument {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub kind: String,
    pub diff_ids: Vec<String>,
}

/// Image config. Only the fields the repack rewrites are typed; everything
/// else round-trips untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    pub rootfs: RootFs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<serde_json::Value>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_knows_oci_and_docker_types() {
        let registry = MediaTypeRegistry::standard();
        assert_eq!(registry.kind(OCI_IMAGE_INDEX).unwrap(), MediaKind::Index);
        assert_eq!(registry.kind(DOCKER_MANIFEST).unwrap(), MediaKind::Manifest);
        assert_eq!(
            registry
                .kind("application/vnd.oci.image.layer.v1.tar+zstd")
                .unwrap(),
            MediaKind::Layer(Some(OciCompression::Zstd))
        );
        assert_eq!(
            registry.kind(DOCKER_LAYER_GZIP).unwrap(),
            MediaKind::Layer(Some(OciCompression::Gzip))
        );
        assert!(matches!(
            registry.kind("text/plain"),
            Err(OciError::UnknownMediaType { .. })
        ));
    }

    #[test]
    fn registries_are_isolated() {
        let mut custom = MediaTypeRegistry::empty();
        custom.register("application/x-test-layer", MediaKind::Layer(None));
        assert!(custom.kind(OCI_IMAGE_INDEX).is_err());
        assert!(MediaTypeRegistry::standard()
            .kind("application/x-test-layer")
            .is_err());
    }

    #[test]
    fn config_preserves_unknown_fields() {
        let raw = r#"{"architecture":"amd64","os":"linux","config":{"Env":["A=1"]},
            "rootfs":{"type":"layers","diff_ids":["sha256:aa"]},
            "history":[{"created_by":"RUN x"}]}"#;
        let mut config: ImageConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.rootfs.diff_ids, vec!["sha256:aa"]);
        config.history = None;

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["architecture"], "amd64");
        assert_eq!(value["config"]["Env"][0], "A=1");
        assert!(value.get("history").is_none());
    }
}
