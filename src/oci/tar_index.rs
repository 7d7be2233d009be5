use anyhow::Result;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use super::error::OciError;
use super::tar_entry::{basename, parent, scan_tar, EntryKind, TarSourceEntry, OPAQUE_WHITEOUT, WHITEOUT_PREFIX};

/// How `.wh..wh..opq` markers are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpaqueWhiteoutPolicy {
    /// Fail the whole index build.
    #[default]
    Reject,
    /// Hide everything lower layers placed under the marked directory.
    Apply,
}

#[derive(Debug)]
enum Node {
    Dir {
        entry: Option<usize>,
        children: BTreeMap<String, Node>,
    },
    Leaf(usize),
}

impl Node {
    fn implicit_dir() -> Self {
        Node::Dir {
            entry: None,
            children: BTreeMap::new(),
        }
    }
}

/// Union view over an ordered stack of layer tars, bottom layer first.
#[derive(Debug)]
pub struct TarEntryIndex {
    policy: OpaqueWhiteoutPolicy,
    sources: Vec<PathBuf>,
    entries: Vec<TarSourceEntry>,
    root: BTreeMap<String, Node>,
}

impl Default for TarEntryIndex {
    fn default() -> Self {
        Self::new(OpaqueWhiteoutPolicy::default())
    }
}

impl TarEntryIndex {
    pub fn new(policy: OpaqueWhiteoutPolicy) -> Self {
        Self {
            policy,
            sources: Vec::new(),
            entries: Vec::new(),
            root: BTreeMap::new(),
        }
    }

    pub fn from_sources<P: AsRef<Path>>(sources: &[P], policy: OpaqueWhiteoutPolicy) -> Result<Self> {
        let mut index = Self::new(policy);
        for source in sources {
            index.add_source(source.as_ref())?;
        }
        Ok(index)
    }

    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    /// Layers `path` on top of everything added so far.
    pub fn add_source(&mut self, path: &Path) -> Result<()> {
        let source = self.sources.len();
        let scanned = scan_tar(path, source)?;

        let mut seen = HashSet::with_capacity(scanned.len());
        let mut opaque_dirs = Vec::new();
        let mut whiteouts = Vec::new();
        let mut real = Vec::new();

        for entry in scanned {
            if !seen.insert(entry.path.clone()) {
                return Err(OciError::DuplicateEntry {
                    source_tar: path.to_path_buf(),
                    path: entry.path,
                }
                .into());
            }

            let name = entry.basename();
            if name == OPAQUE_WHITEOUT {
                let dir = parent(&entry.path).to_string();
                if self.policy == OpaqueWhiteoutPolicy::Reject {
                    return Err(OciError::OpaqueWhiteoutUnsupported {
                        source_tar: path.to_path_buf(),
                        dir,
                    }
                    .into());
                }
                opaque_dirs.push(dir);
            } else if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
                let dir = parent(&entry.path);
                let target = if dir.is_empty() {
                    hidden.to_string()
                } else {
                    format!("{dir}/{hidden}")
                };
                whiteouts.push(target);
            } else {
                real.push(entry);
            }
        }

        for dir in &opaque_dirs {
            self.clear_children(dir);
        }

        self.sources.push(path.to_path_buf());
        for entry in real {
            let slot = self.entries.len();
            let entry_path = entry.path.clone();
            self.entries.push(entry);
            self.insert(&entry_path, slot, source)?;
        }

        whiteouts.sort();
        for target in whiteouts.iter().rev() {
            if !self.remove(target) {
                log::debug!(
                    "Whiteout for '{}' in {} matched nothing",
                    target,
                    path.display()
                );
            }
        }

        log::debug!(
            "Indexed {} ({} whiteouts, {} opaque dirs)",
            path.display(),
            whiteouts.len(),
            opaque_dirs.len()
        );
        Ok(())
    }

    fn insert(&mut self, path: &str, slot: usize, source: usize) -> Result<()> {
        let is_dir = self.entries[slot].kind == EntryKind::Directory;
        let mut components: Vec<&str> = path.split('/').collect();
        let Some(last) = components.pop() else {
            return Ok(());
        };

        let entries = &self.entries;
        let mut level = &mut self.root;
        let mut walked = String::new();
        for component in components {
            if !walked.is_empty() {
                walked.push('/');
            }
            walked.push_str(component);

            let node = level
                .entry(component.to_string())
                .or_insert_with(Node::implicit_dir);
            if let Node::Leaf(existing) = node {
                if entries[*existing].source == source {
                    return Err(OciError::NotADirectory {
                        path: path.to_string(),
                        parent: walked,
                    }
                    .into());
                }
                *node = Node::implicit_dir();
            }
            level = match node {
                Node::Dir { children, .. } => children,
                Node::Leaf(_) => {
                    return Err(OciError::NotADirectory {
                        path: path.to_string(),
                        parent: walked,
                    }
                    .into())
                }
            };
        }

        if is_dir {
            if let Some(Node::Dir { entry, .. }) = level.get_mut(last) {
                *entry = Some(slot);
                return Ok(());
            }
        }

        let node = if is_dir {
            Node::Dir {
                entry: Some(slot),
                children: BTreeMap::new(),
            }
        } else {
            Node::Leaf(slot)
        };
        level.insert(last.to_string(), node);
        Ok(())
    }

    fn remove(&mut self, path: &str) -> bool {
        let mut components: Vec<&str> = path.split('/').collect();
        let Some(last) = components.pop() else {
            return false;
        };
        match self.children_of_mut(&components) {
            Some(children) => children.remove(last).is_some(),
            None => false,
        }
    }

    fn clear_children(&mut self, dir: &str) {
        let components: Vec<&str> = if dir.is_empty() {
            Vec::new()
        } else {
            dir.split('/').collect()
        };
        if let Some(children) = self.children_of_mut(&components) {
            children.clear();
        }
    }

    fn children_of_mut(&mut self, components: &[&str]) -> Option<&mut BTreeMap<String, Node>> {
        let mut level = &mut self.root;
        for component in components {
            level = match level.get_mut(*component)? {
                Node::Dir { children, .. } => children,
                Node::Leaf(_) => return None,
            };
        }
        Some(level)
    }

    pub fn get(&self, path: &str) -> Option<&TarSourceEntry> {
        let mut components: Vec<&str> = path.split('/').collect();
        let last = components.pop()?;
        let mut level = &self.root;
        for component in components {
            level = match level.get(component)? {
                Node::Dir { children, .. } => children,
                Node::Leaf(_) => return None,
            };
        }
        match level.get(last)? {
            Node::Dir { entry, .. } => entry.map(|slot| &self.entries[slot]),
            Node::Leaf(slot) => Some(&self.entries[*slot]),
        }
    }

    /// Surviving entries, depth first with each directory before its children
    /// and siblings in byte order of their names.
    pub fn resolved(&self) -> Vec<&TarSourceEntry> {
        let mut out = Vec::new();
        self.walk(&self.root, &mut out);
        out
    }

    fn walk<'a>(&'a self, level: &'a BTreeMap<String, Node>, out: &mut Vec<&'a TarSourceEntry>) {
        for node in level.values() {
            match node {
                Node::Dir { entry, children } => {
                    if let Some(slot) = entry {
                        out.push(&self.entries[*slot]);
                    }
                    self.walk(children, out);
                }
                Node::Leaf(slot) => out.push(&self.entries[*slot]),
            }
        }
    }
}

pub fn is_whiteout_path(path: &str) -> bool {
    basename(path).starts_with(WHITEOUT_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::tar_entry::test_support::*;

    fn paths(index: &TarEntryIndex) -> Vec<String> {
        index.resolved().iter().map(|entry| entry.path.clone()).collect()
    }

    #[test]
    fn later_layers_override_and_whiteout() {
        let dir = tempfile::tempdir().unwrap();
        let lower = dir.path().join("lower.tar");
        let upper = dir.path().join("upper.tar");
        write_tar(
            &lower,
            &[
                Fixture::File("a", b"a"),
                Fixture::Dir("dir"),
                Fixture::File("dir/b", b"old b"),
                Fixture::Dir("gone"),
                Fixture::File("gone/x", b"x"),
            ],
        );
        write_tar(
            &upper,
            &[
                Fixture::File(".wh.a", b""),
                Fixture::File("dir/b", b"new b"),
                Fixture::File("dir/c", b"c"),
                Fixture::File(".wh.gone", b""),
            ],
        );

        let index = TarEntryIndex::from_sources(&[&lower, &upper], OpaqueWhiteoutPolicy::Reject).unwrap();
        assert_eq!(paths(&index), vec!["dir", "dir/b", "dir/c"]);
        assert_eq!(index.get("dir/b").unwrap().source, 1);
        assert_eq!(index.get("dir").unwrap().source, 0);
        assert!(index.get("a").is_none());
        assert!(index.get("gone/x").is_none());
    }

    #[test]
    fn duplicate_path_in_one_layer_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let layer = dir.path().join("layer.tar");
        write_tar(&layer, &[Fixture::File("a", b"1"), Fixture::File("a", b"2")]);

        let err = TarEntryIndex::from_sources(&[&layer], OpaqueWhiteoutPolicy::Reject).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OciError>(),
            Some(OciError::DuplicateEntry { path, .. }) if path == "a"
        ));
    }

    #[test]
    fn opaque_marker_rejected_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let layer = dir.path().join("layer.tar");
        write_tar(&layer, &[Fixture::Dir("d"), Fixture::File("d/.wh..wh..opq", b"")]);

        let err = TarEntryIndex::from_sources(&[&layer], OpaqueWhiteoutPolicy::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OciError>(),
            Some(OciError::OpaqueWhiteoutUnsupported { dir, .. }) if dir == "d"
        ));
    }

    #[test]
    fn opaque_marker_hides_lower_children_when_applied() {
        let dir = tempfile::tempdir().unwrap();
        let lower = dir.path().join("lower.tar");
        let upper = dir.path().join("upper.tar");
        write_tar(
            &lower,
            &[Fixture::Dir("d"), Fixture::File("d/old", b"o"), Fixture::File("keep", b"k")],
        );
        write_tar(
            &upper,
            &[
                Fixture::Dir("d"),
                Fixture::File("d/.wh..wh..opq", b""),
                Fixture::File("d/new", b"n"),
            ],
        );

        let index = TarEntryIndex::from_sources(&[&lower, &upper], OpaqueWhiteoutPolicy::Apply).unwrap();
        assert_eq!(paths(&index), vec!["d", "d/new", "keep"]);
    }

    #[test]
    fn file_replacing_directory_drops_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let lower = dir.path().join("lower.tar");
        let upper = dir.path().join("upper.tar");
        write_tar(&lower, &[Fixture::Dir("p"), Fixture::File("p/q", b"q")]);
        write_tar(&upper, &[Fixture::Symlink("p", "elsewhere")]);

        let index = TarEntryIndex::from_sources(&[&lower, &upper], OpaqueWhiteoutPolicy::Reject).unwrap();
        assert_eq!(paths(&index), vec!["p"]);
        assert_eq!(index.get("p").unwrap().kind, EntryKind::Symlink);
    }

    #[test]
    fn whiteout_of_missing_path_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let layer = dir.path().join("layer.tar");
        write_tar(&layer, &[Fixture::File("x", b"x"), Fixture::File(".wh.nothing", b"")]);

        let index = TarEntryIndex::from_sources(&[&layer], OpaqueWhiteoutPolicy::Reject).unwrap();
        assert_eq!(paths(&index), vec!["x"]);
        assert!(is_whiteout_path("a/.wh.b"));
        assert!(!is_whiteout_path("a/b.wh.c"));
    }
}
