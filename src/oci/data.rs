use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use super::digest::{prefixed, sha256_reader};
use super::tar_entry::{normalize_path, scan_tar, SourceReaders, TarSourceEntry};

/// Where the bytes of a blob live.
#[derive(Debug, Clone)]
pub enum DataRef {
    Bytes(Arc<[u8]>),
    File(PathBuf),
    TarEntry { tar_path: PathBuf, entry_path: String },
}

impl DataRef {
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        DataRef::Bytes(Arc::from(data.into()))
    }

    pub fn open(&self) -> Result<Box<dyn Read + Send>> {
        match self {
            DataRef::Bytes(bytes) => Ok(Box::new(std::io::Cursor::new(bytes.clone()))),
            DataRef::File(path) => {
                let file =
                    File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
                Ok(Box::new(BufReader::new(file)))
            }
            DataRef::TarEntry { tar_path, .. } => {
                let entry = self.locate_tar_entry()?;
                let readers = SourceReaders::new(vec![tar_path.clone()]);
                Ok(Box::new(readers.into_data(&entry)?))
            }
        }
    }

    pub fn size(&self) -> Result<u64> {
        match self {
            DataRef::Bytes(bytes) => Ok(bytes.len() as u64),
            DataRef::File(path) => Ok(std::fs::metadata(path)
                .with_context(|| format!("Failed to stat {}", path.display()))?
                .len()),
            DataRef::TarEntry { .. } => Ok(self.locate_tar_entry()?.size),
        }
    }

    /// Header of the regular file a `TarEntry` ref points at.
    fn locate_tar_entry(&self) -> Result<TarSourceEntry> {
        let DataRef::TarEntry {
            tar_path,
            entry_path,
        } = self
        else {
            anyhow::bail!("Data is not a tar entry");
        };
        let wanted = normalize_path(entry_path);
        scan_tar(tar_path, 0)?
            .into_iter()
            .find(|entry| entry.path == wanted && entry.kind.is_regular())
            .with_context(|| format!("No file '{}' in {}", entry_path, tar_path.display()))
    }
}

/// A data ref with its digest and size computed at most once.
#[derive(Debug)]
pub struct OciDataRefInfo {
    data: DataRef,
    digest: OnceLock<String>,
    size: OnceLock<u64>,
}

impl OciDataRefInfo {
    pub fn new(data: DataRef) -> Self {
        Self {
            data,
            digest: OnceLock::new(),
            size: OnceLock::new(),
        }
    }

    /// For data whose digest was already computed while it was written.
    pub fn with_known(data: DataRef, digest: String, size: u64) -> Self {
        let info = Self::new(data);
        let _ = info.digest.set(digest);
        let _ = info.size.set(size);
        info
    }

    pub fn data(&self) -> &DataRef {
        &self.data
    }

    pub fn digest(&self) -> Result<String> {
        if let Some(digest) = self.digest.get() {
            return Ok(digest.clone());
        }
        let (hex, size) = sha256_reader(self.data.open()?).context("Failed to hash blob data")?;
        let _ = self.size.set(size);
        Ok(self.digest.get_or_init(|| prefixed(&hex)).clone())
    }

    pub fn size(&self) -> Result<u64> {
        if let Some(size) = self.size.get() {
            return Ok(*size);
        }
        let size = self.data.size()?;
        Ok(*self.size.get_or_init(|| size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::digest::prefixed_sha256_digest;
    use crate::oci::tar_entry::test_support::*;

    #[test]
    fn digest_is_memoized_and_matches_direct_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"original contents").unwrap();

        let info = OciDataRefInfo::new(DataRef::File(path.clone()));
        let first = info.digest().unwrap();
        assert_eq!(first, prefixed_sha256_digest(b"original contents"));

        std::fs::write(&path, b"changed").unwrap();
        assert_eq!(info.digest().unwrap(), first);
        assert_eq!(info.size().unwrap(), b"original contents".len() as u64);
    }

    #[test]
    fn every_variant_reads_the_same_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("blob");
        std::fs::write(&file, b"payload").unwrap();
        let tar = dir.path().join("layer.tar");
        write_tar(&tar, &[Fixture::Dir("d"), Fixture::File("d/blob", b"payload")]);

        let expected = prefixed_sha256_digest(b"payload");
        for data in [
            DataRef::bytes(b"payload".to_vec()),
            DataRef::File(file),
            DataRef::TarEntry {
                tar_path: tar,
                entry_path: "./d/blob".to_string(),
            },
        ] {
            let info = OciDataRefInfo::new(data);
            assert_eq!(info.digest().unwrap(), expected);
            assert_eq!(info.size().unwrap(), 7);
        }
    }

    #[test]
    fn tar_entry_streams_its_data_and_sizes_from_the_header() {
        let dir = tempfile::tempdir().unwrap();
        let tar = dir.path().join("layer.tar");
        let large: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        write_tar(
            &tar,
            &[
                Fixture::File("first", b"before"),
                Fixture::File("big", &large),
                Fixture::File("last", b"after"),
            ],
        );

        let data = DataRef::TarEntry {
            tar_path: tar.clone(),
            entry_path: "big".to_string(),
        };
        assert_eq!(data.size().unwrap(), large.len() as u64);

        let mut read = Vec::new();
        data.open().unwrap().read_to_end(&mut read).unwrap();
        assert_eq!(read, large);

        let missing = DataRef::TarEntry {
            tar_path: tar,
            entry_path: "absent".to_string(),
        };
        assert!(missing.size().is_err());
        assert!(missing.open().is_err());
    }

    #[test]
    fn known_values_skip_hashing() {
        let info = OciDataRefInfo::with_known(
            DataRef::File(PathBuf::from("/nonexistent/blob")),
            "sha256:abc".to_string(),
            3,
        );
        assert_eq!(info.digest().unwrap(), "sha256:abc");
        assert_eq!(info.size().unwrap(), 3);
    }
}
