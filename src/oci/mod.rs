//! Layer flattening, rebalancing and content-addressed OCI layout handling.

pub mod builder;
pub mod compression;
pub mod data;
pub mod data_tar;
pub mod digest;
pub mod error;
pub mod image;
pub mod layout;
pub mod media;
pub mod packer;
pub mod repack;
pub mod tar_entry;
pub mod tar_index;
pub mod unpacker;

pub use builder::{BuiltRepository, RepositoryBuilder};
pub use compression::OciCompression;
pub use data::{DataRef, OciDataRefInfo};
pub use data_tar::{CompressedStreamInfo, DataTarWriter};
pub use error::OciError;
pub use image::{OciImageIndex, OciImageLayer, OciImageManifest, OciIndexChild, OciIndexEntry, OciNode};
pub use layout::{read_layout, write_layout};
pub use media::{MediaKind, MediaTypeRegistry};
pub use packer::{LayerPacker, PackResult, PackedOutput};
pub use repack::{repack_layout, RepackOptions};
pub use tar_index::{OpaqueWhiteoutPolicy, TarEntryIndex};
pub use unpacker::LayerUnpacker;
