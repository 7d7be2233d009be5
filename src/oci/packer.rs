use anyhow::Result;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::path::{Path, PathBuf};

use super::compression::OciCompression;
use super::data_tar::{CompressedStreamInfo, DataTarWriter};
use super::error::OciError;
use super::tar_entry::{scan_tar, EntryKind, SourceReaders, TarSourceEntry};

#[derive(Debug, Clone, Serialize)]
pub struct PackedOutput {
    pub path: PathBuf,
    pub entry_count: usize,
    #[serde(flatten)]
    pub info: CompressedStreamInfo,
}

#[derive(Debug, Clone)]
pub struct PackResult {
    pub outputs: Vec<PackedOutput>,
    /// Normalized entry path to the index of the output it was written to.
    pub placements: BTreeMap<String, usize>,
}

/// Splits one flat tar into several independently compressed tars of
/// roughly equal stored size.
pub struct LayerPacker {
    input: PathBuf,
    outputs: Vec<PathBuf>,
    compression: Option<OciCompression>,
}

impl LayerPacker {
    pub fn new(input: &Path, outputs: Vec<PathBuf>, compression: Option<OciCompression>) -> Self {
        Self {
            input: input.to_path_buf(),
            outputs,
            compression,
        }
    }

    pub fn write(self) -> Result<PackResult> {
        anyhow::ensure!(!self.outputs.is_empty(), "At least one output is required");

        let entries = scan_tar(&self.input, 0)?;
        let mut readers = SourceReaders::new(vec![self.input.clone()]);

        let mut non_regular = Vec::new();
        let mut regular = Vec::new();
        let mut hardlinks = Vec::new();
        for entry in &entries {
            match entry.kind {
                EntryKind::Regular => regular.push(entry),
                EntryKind::Hardlink => hardlinks.push(entry),
                _ => non_regular.push(entry),
            }
        }

        non_regular.sort_by(|a, b| a.path.cmp(&b.path));
        regular.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.path.cmp(&b.path)));
        hardlinks.sort_by(|a, b| a.path.cmp(&b.path));

        let mut writers = self
            .outputs
            .iter()
            .map(|path| DataTarWriter::create(path, self.compression))
            .collect::<Result<Vec<_>>>()?;
        let mut placements = BTreeMap::new();

        for entry in non_regular {
            place(&mut writers, &mut placements, &mut readers, entry, 0)?;
        }

        let mut heap: BinaryHeap<Reverse<(u64, usize)>> = writers
            .iter()
            .enumerate()
            .map(|(index, writer)| Reverse((writer.estimated_size(), index)))
            .collect();

        for entry in regular {
            let Some(Reverse((_, index))) = heap.pop() else {
                anyhow::bail!("No output available for '{}'", entry.path);
            };
            place(&mut writers, &mut placements, &mut readers, entry, index)?;
            heap.push(Reverse((writers[index].estimated_size(), index)));
        }

        for entry in hardlinks {
            let target = entry
                .link_target
                .clone()
                .unwrap_or_default();
            let index = *placements
                .get(&target)
                .ok_or_else(|| OciError::HardlinkTargetMissing {
                    link: entry.path.clone(),
                    target: target.clone(),
                })?;
            place(&mut writers, &mut placements, &mut readers, entry, index)?;
        }

        let mut outputs = Vec::with_capacity(writers.len());
        for writer in writers {
            let path = writer.path().to_path_buf();
            let entry_count = writer.entry_count();
            let info = writer.finish()?;
            outputs.push(PackedOutput {
                path,
                entry_count,
                info,
            });
        }

        log::info!(
            "Packed {} entries from {} into {} outputs",
            placements.len(),
            self.input.display(),
            outputs.len()
        );

        Ok(PackResult {
            outputs,
            placements,
        })
    }
}

fn place(
    writers: &mut [DataTarWriter],
    placements: &mut BTreeMap<String, usize>,
    readers: &mut SourceReaders,
    entry: &TarSourceEntry,
    index: usize,
) -> Result<()> {
    if let Some(existing) = placements.get(&entry.path) {
        return Err(OciError::EntryAlreadyPlaced {
            path: entry.path.clone(),
            index: *existing,
        }
        .into());
    }
    writers[index].append_entry(entry, readers)?;
    placements.insert(entry.path.clone(), index);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::tar_entry::normalize_path;
    use crate::oci::tar_entry::test_support::*;
    use std::collections::BTreeSet;

    fn outputs(dir: &Path, count: usize, ext: &str) -> Vec<PathBuf> {
        (0..count).map(|i| dir.join(format!("out-{i}.{ext}"))).collect()
    }

    #[test]
    fn every_entry_lands_in_exactly_one_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("flat.tar");
        let big = vec![b'x'; 5000];
        let medium = vec![b'y'; 3000];
        write_tar(
            &input,
            &[
                Fixture::Dir("bin"),
                Fixture::File("bin/big", &big),
                Fixture::File("bin/medium", &medium),
                Fixture::File("bin/small", b"s"),
                Fixture::Symlink("bin/sh", "big"),
                Fixture::Hardlink("bin/big-again", "bin/big"),
                Fixture::Hardlink("bin/small-again", "./bin/small"),
            ],
        );

        let result = LayerPacker::new(&input, outputs(dir.path(), 3, "tar.gz"), Some(OciCompression::Gzip))
            .write()
            .unwrap();

        assert_eq!(result.placements.len(), 7);
        assert_eq!(result.placements["bin"], 0);
        assert_eq!(result.placements["bin/sh"], 0);
        assert_eq!(result.placements["bin/big-again"], result.placements["bin/big"]);
        assert_eq!(result.placements["bin/small-again"], result.placements["bin/small"]);

        let mut seen = BTreeSet::new();
        for (index, output) in result.outputs.iter().enumerate() {
            let plain = dir.path().join(format!("plain-{index}.tar"));
            crate::oci::compression::decompress_file(&output.path, &plain, None).unwrap();
            let names = read_tar(&plain);
            assert_eq!(names.len(), output.entry_count);
            for (name, _, _) in names {
                let normalized = normalize_path(&name);
                assert_eq!(result.placements[&normalized], index);
                assert!(seen.insert(normalized));
            }
        }
        assert_eq!(seen.len(), 7);
    }

    #[test]
    fn largest_files_spread_across_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("flat.tar");
        let payloads: Vec<(String, Vec<u8>)> = (0..40)
            .map(|i| (format!("f{i:02}"), vec![b'a'; 512 * (1 + i % 7)]))
            .collect();
        let fixtures: Vec<Fixture<'_>> = payloads
            .iter()
            .map(|(name, data)| Fixture::File(name, data))
            .collect();
        write_tar(&input, &fixtures);

        let result = LayerPacker::new(&input, outputs(dir.path(), 4, "tar"), None)
            .write()
            .unwrap();

        let sizes: Vec<u64> = result.outputs.iter().map(|o| o.info.compressed_size).collect();
        let total: u64 = sizes.iter().sum();
        let average = total / sizes.len() as u64;
        let heaviest = *sizes.iter().max().unwrap();
        assert!(heaviest < total);
        assert!(heaviest <= average * 2, "unbalanced outputs: {sizes:?}");
        assert!(result.outputs.iter().all(|o| o.entry_count > 0));
    }

    fn pseudo_random(seed: u64, len: usize) -> Vec<u8> {
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 56) as u8
            })
            .collect()
    }

    #[test]
    fn compressed_outputs_stay_balanced_with_many_small_files() {
        for compression in [OciCompression::Gzip, OciCompression::Zstd] {
            let dir = tempfile::tempdir().unwrap();
            let input = dir.path().join("flat.tar");
            let payloads: Vec<(String, Vec<u8>)> = (0..400u64)
                .map(|i| (format!("f{i:03}"), pseudo_random(i, 4096 + 1024 * (i % 8) as usize)))
                .collect();
            let fixtures: Vec<Fixture<'_>> = payloads
                .iter()
                .map(|(name, data)| Fixture::File(name, data))
                .collect();
            write_tar(&input, &fixtures);

            let result = LayerPacker::new(&input, outputs(dir.path(), 4, "tar.z"), Some(compression))
                .write()
                .unwrap();

            let sizes: Vec<u64> = result.outputs.iter().map(|o| o.info.compressed_size).collect();
            let total: u64 = sizes.iter().sum();
            let average = total / sizes.len() as u64;
            let heaviest = *sizes.iter().max().unwrap();
            let lightest = *sizes.iter().min().unwrap();
            assert!(
                heaviest <= average * 3 / 2 && lightest >= average / 2,
                "unbalanced {compression:?} outputs: {sizes:?}"
            );
        }
    }

    #[test]
    fn hardlink_to_missing_target_fails() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("flat.tar");
        write_tar(&input, &[Fixture::Hardlink("orphan", "nowhere")]);

        let err = LayerPacker::new(&input, outputs(dir.path(), 2, "tar"), None)
            .write()
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OciError>(),
            Some(OciError::HardlinkTargetMissing { target, .. }) if target == "nowhere"
        ));
    }

    #[test]
    fn duplicate_entry_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("flat.tar");
        write_tar(&input, &[Fixture::File("same", b"1"), Fixture::File("same", b"2")]);

        let err = LayerPacker::new(&input, outputs(dir.path(), 1, "tar"), None)
            .write()
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OciError>(),
            Some(OciError::EntryAlreadyPlaced { .. })
        ));
    }
}
