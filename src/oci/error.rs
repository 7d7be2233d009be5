use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum OciError {
    #[error("Duplicate entry '{path}' in layer {}", source_tar.display())]
    DuplicateEntry { source_tar: PathBuf, path: String },

    #[error("Opaque whiteout for directory '{dir}' in layer {} is not supported", source_tar.display())]
    OpaqueWhiteoutUnsupported { source_tar: PathBuf, dir: String },

    #[error("Whiteout marker '{path}' reached the output archive")]
    WhiteoutLeaked { path: String },

    #[error("Hardlink '{link}' points at '{target}', which has not been placed")]
    HardlinkTargetMissing { link: String, target: String },

    #[error("Entry '{path}' was already written to output {index}")]
    EntryAlreadyPlaced { path: String, index: usize },

    #[error("Entry '{path}' has unsupported type {kind}")]
    UnsupportedEntry { path: String, kind: String },

    #[error("Path '{path}' conflicts with a non-directory entry at '{parent}'")]
    NotADirectory { path: String, parent: String },

    #[error("Blob {digest} was added twice in one build")]
    DuplicateBlob { digest: String },

    #[error("Descriptor {digest} does not resolve to a blob in this build")]
    UnresolvedDescriptor { digest: String },

    #[error("Unknown media type '{media_type}'")]
    UnknownMediaType { media_type: String },

    #[error("Expected {expected} for {digest}, found media type '{media_type}'")]
    UnexpectedMediaType {
        digest: String,
        expected: &'static str,
        media_type: String,
    },

    #[error("Invalid digest '{digest}'")]
    InvalidDigest { digest: String },
}
