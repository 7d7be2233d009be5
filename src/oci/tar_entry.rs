use anyhow::{Context, Result};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::error::OciError;

pub const WHITEOUT_PREFIX: &str = ".wh.";
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    Regular,
    Symlink,
    Hardlink,
    Char,
    Block,
    Fifo,
}

impl EntryKind {
    fn from_entry_type(entry_type: tar::EntryType) -> Option<Self> {
        Some(match entry_type {
            tar::EntryType::Regular | tar::EntryType::Continuous => EntryKind::Regular,
            tar::EntryType::Directory => EntryKind::Directory,
            tar::EntryType::Symlink => EntryKind::Symlink,
            tar::EntryType::Link => EntryKind::Hardlink,
            tar::EntryType::Char => EntryKind::Char,
            tar::EntryType::Block => EntryKind::Block,
            tar::EntryType::Fifo => EntryKind::Fifo,
            _ => return None,
        })
    }

    pub fn is_regular(&self) -> bool {
        matches!(self, EntryKind::Regular)
    }
}

/// One member of a source tar. The header is the raw header as read; path,
/// size and link target are the resolved values (long-name and pax records
/// already applied).
#[derive(Debug, Clone)]
pub struct TarSourceEntry {
    pub source: usize,
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub data_offset: u64,
    pub link_target: Option<String>,
    pub header: tar::Header,
}

impl TarSourceEntry {
    pub fn basename(&self) -> &str {
        basename(&self.path)
    }

    /// Path as written to an output archive; directories keep a trailing slash.
    pub fn archive_path(&self) -> String {
        match self.kind {
            EntryKind::Directory => format!("{}/", self.path),
            _ => self.path.clone(),
        }
    }
}

pub fn normalize_path(raw: &str) -> String {
    let mut path = raw;
    loop {
        if let Some(rest) = path.strip_prefix("./") {
            path = rest;
        } else if let Some(rest) = path.strip_prefix('/') {
            path = rest;
        } else {
            break;
        }
    }
    let path = path.trim_end_matches('/');
    if path == "." {
        String::new()
    } else {
        path.to_string()
    }
}

pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub fn parent(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

/// Reads every member header of an uncompressed tar without loading data.
/// The archive root (`./`) and pax global headers are skipped.
pub fn scan_tar(path: &Path, source: usize) -> Result<Vec<TarSourceEntry>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut archive = tar::Archive::new(BufReader::new(file));
    let mut entries = Vec::new();

    for entry in archive
        .entries()
        .with_context(|| format!("Failed to read tar {}", path.display()))?
    {
        let entry = entry.with_context(|| format!("Failed to read entry in {}", path.display()))?;
        let raw_path = entry.path()?.to_string_lossy().into_owned();
        let entry_type = entry.header().entry_type();

        if entry_type == tar::EntryType::XGlobalHeader {
            log::debug!("Skipping pax global header in {}", path.display());
            continue;
        }

        let normalized = normalize_path(&raw_path);
        if normalized.is_empty() {
            continue;
        }

        let kind = EntryKind::from_entry_type(entry_type).ok_or_else(|| OciError::UnsupportedEntry {
            path: normalized.clone(),
            kind: format!("{entry_type:?}"),
        })?;

        // Hardlink targets name archive members, so they follow entry paths.
        let link_target = entry.link_name()?.map(|target| {
            let target = target.to_string_lossy();
            match kind {
                EntryKind::Hardlink => normalize_path(&target),
                _ => target.into_owned(),
            }
        });

        entries.push(TarSourceEntry {
            source,
            path: normalized,
            kind,
            size: entry.size(),
            data_offset: entry.raw_file_position(),
            link_target,
            header: entry.header().clone(),
        });
    }

    Ok(entries)
}

/// Lazily opened handles onto the source tars, read by entry offset.
pub struct SourceReaders {
    paths: Vec<PathBuf>,
    files: Vec<Option<File>>,
}

impl SourceReaders {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        let files = paths.iter().map(|_| None).collect();
        Self { paths, files }
    }

    /// Owned reader over `entry`'s data, consuming the handles.
    pub fn into_data(mut self, entry: &TarSourceEntry) -> Result<io::Take<BufReader<File>>> {
        self.data(entry)?;
        let file = self
            .files
            .get_mut(entry.source)
            .and_then(Option::take)
            .with_context(|| format!("Source for '{}' is not open", entry.path))?;
        Ok(BufReader::new(file).take(entry.size))
    }

    pub fn data(&mut self, entry: &TarSourceEntry) -> Result<io::Take<&mut File>> {
        let path = self
            .paths
            .get(entry.source)
            .with_context(|| format!("Unknown source {} for '{}'", entry.source, entry.path))?;

        let slot = &mut self.files[entry.source];
        if slot.is_none() {
            *slot = Some(File::open(path).with_context(|| format!("Failed to open {}", path.display()))?);
        }
        let file = slot
            .as_mut()
            .with_context(|| format!("Source {} is not open", path.display()))?;

        file.seek(SeekFrom::Start(entry.data_offset))
            .with_context(|| format!("Failed to seek to '{}' in {}", entry.path, path.display()))?;
        Ok(file.take(entry.size))
    }
}

/// Appends `entry` to `builder`, streaming regular file data from its source.
pub fn append_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    entry: &TarSourceEntry,
    readers: &mut SourceReaders,
) -> Result<()> {
    let mut header = entry.header.clone();
    let archive_path = entry.archive_path();

    match entry.kind {
        EntryKind::Regular => {
            header.set_size(entry.size);
            let data = readers.data(entry)?;
            builder
                .append_data(&mut header, &archive_path, data)
                .with_context(|| format!("Failed to write '{}'", entry.path))?;
        }
        EntryKind::Symlink | EntryKind::Hardlink => {
            let target = entry
                .link_target
                .as_deref()
                .with_context(|| format!("Link '{}' has no target", entry.path))?;
            header.set_size(0);
            builder
                .append_link(&mut header, &archive_path, target)
                .with_context(|| format!("Failed to write link '{}'", entry.path))?;
        }
        EntryKind::Directory | EntryKind::Char | EntryKind::Block | EntryKind::Fifo => {
            header.set_size(0);
            builder
                .append_data(&mut header, &archive_path, io::empty())
                .with_context(|| format!("Failed to write '{}'", entry.path))?;
        }
    }

    Ok(())
}
