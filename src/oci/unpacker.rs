use anyhow::Result;
use std::path::{Path, PathBuf};

use super::compression::OciCompression;
use super::data_tar::{CompressedStreamInfo, DataTarWriter};
use super::error::OciError;
use super::tar_entry::SourceReaders;
use super::tar_index::{is_whiteout_path, TarEntryIndex};

/// Writes the resolved view of a [`TarEntryIndex`] as one flat tar.
pub struct LayerUnpacker<'a> {
    index: &'a TarEntryIndex,
    output: PathBuf,
    compression: Option<OciCompression>,
    consumed: bool,
}

impl<'a> LayerUnpacker<'a> {
    pub fn new(index: &'a TarEntryIndex, output: &Path) -> Self {
        Self {
            index,
            output: output.to_path_buf(),
            compression: None,
            consumed: false,
        }
    }

    pub fn with_compression(mut self, compression: Option<OciCompression>) -> Self {
        self.compression = compression;
        self
    }

    pub fn unpack(&mut self) -> Result<CompressedStreamInfo> {
        anyhow::ensure!(
            !self.consumed,
            "Unpacker for {} has already run",
            self.output.display()
        );
        self.consumed = true;

        let mut readers = SourceReaders::new(self.index.sources().to_vec());
        let mut writer = DataTarWriter::create(&self.output, self.compression)?;

        for entry in self.index.resolved() {
            if is_whiteout_path(&entry.path) {
                return Err(OciError::WhiteoutLeaked {
                    path: entry.path.clone(),
                }
                .into());
            }
            writer.append_entry(entry, &mut readers)?;
        }

        let entry_count = writer.entry_count();
        let info = writer.finish()?;
        log::info!(
            "Flattened {} layers into {} ({} entries)",
            self.index.sources().len(),
            self.output.display(),
            entry_count
        );
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::tar_entry::test_support::*;
    use crate::oci::tar_index::OpaqueWhiteoutPolicy;

    fn layers(dir: &Path) -> Vec<PathBuf> {
        let lower = dir.join("lower.tar");
        let upper = dir.join("upper.tar");
        write_tar(
            &lower,
            &[
                Fixture::File("a", b"from lower"),
                Fixture::Dir("dir"),
                Fixture::File("dir/b", b"b contents"),
                Fixture::Symlink("dir/link", "b"),
            ],
        );
        write_tar(
            &upper,
            &[
                Fixture::File(".wh.a", b""),
                Fixture::File("dir/c", b"c contents"),
                Fixture::File("dir/b", b"b replaced"),
            ],
        );
        vec![lower, upper]
    }

    #[test]
    fn flattens_union_of_layers() {
        let dir = tempfile::tempdir().unwrap();
        let sources = layers(dir.path());
        let index = TarEntryIndex::from_sources(&sources, OpaqueWhiteoutPolicy::Reject).unwrap();

        let output = dir.path().join("flat.tar");
        LayerUnpacker::new(&index, &output).unpack().unwrap();

        let entries = read_tar(&output);
        let summary: Vec<_> = entries
            .iter()
            .map(|(name, _, data)| (name.as_str(), String::from_utf8_lossy(data).into_owned()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("dir/", String::new()),
                ("dir/b", "b replaced".to_string()),
                ("dir/c", "c contents".to_string()),
                ("dir/link", String::new()),
            ]
        );
        assert_eq!(entries[3].1, tar::EntryType::Symlink);
    }

    #[test]
    fn repeated_runs_are_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let sources = layers(dir.path());

        let mut outputs = Vec::new();
        for run in 0..2 {
            let index = TarEntryIndex::from_sources(&sources, OpaqueWhiteoutPolicy::Reject).unwrap();
            let output = dir.path().join(format!("flat-{run}.tar"));
            let info = LayerUnpacker::new(&index, &output).unpack().unwrap();
            outputs.push((std::fs::read(&output).unwrap(), info));
        }

        assert_eq!(outputs[0].0, outputs[1].0);
        assert_eq!(outputs[0].1, outputs[1].1);
    }

    #[test]
    fn unpacker_is_single_use() {
        let dir = tempfile::tempdir().unwrap();
        let sources = layers(dir.path());
        let index = TarEntryIndex::from_sources(&sources, OpaqueWhiteoutPolicy::Reject).unwrap();

        let mut unpacker = LayerUnpacker::new(&index, &dir.path().join("flat.tar"));
        unpacker.unpack().unwrap();
        assert!(unpacker.unpack().is_err());
    }
}
