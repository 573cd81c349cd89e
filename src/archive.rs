//! Archive-backed filesystems: the provider that builds them and the
//! read-only tree they expose once attached.

use crate::error::ArchiveError;
use crate::util::{NodeAttr, NodeKind};
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use zip::ZipArchive;

const DIR_PERM: u16 = 0o555;
const FILE_PERM: u16 = 0o444;
// Upper bound on buffer preallocation from sizes recorded in the archive.
const MAX_PREALLOC: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub name: String,
    pub attr: NodeAttr,
}

/// A browsable, read-only file tree. Paths are archive-relative without a
/// leading slash; the empty path is the archive root.
pub trait ArchiveFs: Send + Sync + fmt::Debug {
    fn stat(&self, path: &str) -> Result<NodeAttr, ArchiveError>;
    fn list(&self, path: &str) -> Result<Vec<ArchiveEntry>, ArchiveError>;
    fn read(&self, path: &str, offset: u64, size: u32) -> Result<Bytes, ArchiveError>;
}

pub type ArchiveHandle = Arc<dyn ArchiveFs>;

pub trait ArchiveProvider: Send + Sync {
    fn build(&self, source: &Path) -> Result<ArchiveHandle, ArchiveError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ZipProvider;

impl ArchiveProvider for ZipProvider {
    fn build(&self, source: &Path) -> Result<ArchiveHandle, ArchiveError> {
        Ok(Arc::new(ZipArchiveFs::open(source)?))
    }
}

#[derive(Debug)]
struct ZipNode {
    attr: NodeAttr,
    index: Option<usize>,
    children: BTreeSet<String>,
    data: OnceLock<Bytes>,
}

impl ZipNode {
    fn dir() -> Self {
        Self {
            attr: NodeAttr {
                kind: NodeKind::Directory,
                size: 0,
                perm: DIR_PERM,
            },
            index: None,
            children: BTreeSet::new(),
            data: OnceLock::new(),
        }
    }

    fn file(index: usize, size: u64, perm: u16) -> Self {
        Self {
            attr: NodeAttr {
                kind: NodeKind::File,
                size,
                perm,
            },
            index: Some(index),
            children: BTreeSet::new(),
            data: OnceLock::new(),
        }
    }
}

pub struct ZipArchiveFs {
    source: PathBuf,
    archive: Mutex<ZipArchive<File>>,
    nodes: HashMap<String, ZipNode>,
}

impl fmt::Debug for ZipArchiveFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZipArchiveFs")
            .field("source", &self.source)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

/// Splits an entry name into clean segments. Names that try to climb out of
/// the archive root are dropped.
fn normalize_entry_name(raw: &str) -> Option<String> {
    let mut parts = Vec::new();
    for seg in raw.split('/') {
        match seg {
            "" | "." => continue,
            ".." => return None,
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => ("", path),
    }
}

impl ZipArchiveFs {
    pub fn open(source: &Path) -> Result<Self, ArchiveError> {
        let file = File::open(source)?;
        let mut archive = ZipArchive::new(file)?;

        let mut nodes = HashMap::new();
        nodes.insert(String::new(), ZipNode::dir());

        for index in 0..archive.len() {
            let entry = archive.by_index(index)?;
            let Some(name) = normalize_entry_name(entry.name()) else {
                continue;
            };
            let node = if entry.is_dir() {
                ZipNode::dir()
            } else {
                let perm = entry
                    .unix_mode()
                    .map(|mode| (mode & 0o444) as u16)
                    .filter(|perm| *perm != 0)
                    .unwrap_or(FILE_PERM);
                ZipNode::file(index, entry.size(), perm)
            };
            Self::insert_node(&mut nodes, name, node);
        }

        Ok(Self {
            source: source.to_path_buf(),
            archive: Mutex::new(archive),
            nodes,
        })
    }

    fn insert_node(nodes: &mut HashMap<String, ZipNode>, path: String, mut node: ZipNode) {
        let mut child = path.clone();
        loop {
            let (parent, base) = split_parent(&child);
            let (parent, base) = (parent.to_owned(), base.to_owned());
            let parent_node = nodes.entry(parent.clone()).or_insert_with(ZipNode::dir);
            let fresh = parent_node.children.insert(base);
            if !fresh || parent.is_empty() {
                break;
            }
            child = parent;
        }

        // An explicit directory entry must not clobber one synthesized from
        // an earlier file path.
        if node.attr.kind == NodeKind::Directory
            && nodes
                .get(&path)
                .is_some_and(|existing| existing.attr.kind == NodeKind::Directory)
        {
            return;
        }
        let children = nodes
            .remove(&path)
            .map(|old| old.children)
            .unwrap_or_default();
        if node.attr.kind == NodeKind::Directory {
            node.children = children;
        }
        nodes.insert(path, node);
    }

    fn node(&self, path: &str) -> Result<&ZipNode, ArchiveError> {
        let key = normalize_entry_name(path).unwrap_or_default();
        self.nodes.get(&key).ok_or(ArchiveError::NotFound)
    }

    fn contents(&self, node: &ZipNode) -> Result<Bytes, ArchiveError> {
        if let Some(data) = node.data.get() {
            return Ok(data.clone());
        }
        let index = node.index.ok_or(ArchiveError::IsDir)?;

        let mut archive = self.archive.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entry = archive.by_index(index)?;
        let mut buf = Vec::with_capacity((node.attr.size as usize).min(MAX_PREALLOC));
        entry.read_to_end(&mut buf)?;
        drop(entry);
        drop(archive);

        let _ = node.data.set(Bytes::from(buf));
        node.data.get().cloned().ok_or(ArchiveError::NotFound)
    }
}

impl ArchiveFs for ZipArchiveFs {
    fn stat(&self, path: &str) -> Result<NodeAttr, ArchiveError> {
        self.node(path).map(|node| node.attr)
    }

    fn list(&self, path: &str) -> Result<Vec<ArchiveEntry>, ArchiveError> {
        let key = normalize_entry_name(path).unwrap_or_default();
        let node = self.nodes.get(&key).ok_or(ArchiveError::NotFound)?;
        if node.attr.kind != NodeKind::Directory {
            return Err(ArchiveError::NotDir);
        }

        let mut entries = Vec::with_capacity(node.children.len());
        for name in &node.children {
            let child_key = if key.is_empty() {
                name.clone()
            } else {
                format!("{key}/{name}")
            };
            if let Some(child) = self.nodes.get(&child_key) {
                entries.push(ArchiveEntry {
                    name: name.clone(),
                    attr: child.attr,
                });
            }
        }
        Ok(entries)
    }

    fn read(&self, path: &str, offset: u64, size: u32) -> Result<Bytes, ArchiveError> {
        let node = self.node(path)?;
        if node.attr.kind == NodeKind::Directory {
            return Err(ArchiveError::IsDir);
        }
        let data = self.contents(node)?;
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(size as usize).min(data.len());
        Ok(data.slice(start..end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::CompressionMethod;
    use zip::write::SimpleFileOptions;

    fn write_zip(dir: &Path, entries: &[(&str, Option<&[u8]>)]) -> PathBuf {
        let path = dir.join("fixture.zip");
        let file = File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        for (name, data) in entries {
            match data {
                Some(data) => {
                    writer.start_file(*name, options).unwrap();
                    writer.write_all(data).unwrap();
                }
                None => writer.add_directory(*name, options).unwrap(),
            }
        }
        writer.finish().unwrap();
        path
    }

    #[test]
    fn builds_tree_with_implicit_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_zip(
            dir.path(),
            &[
                ("readme.txt", Some(b"hello")),
                ("photos/2024/beach.jpg", Some(b"jpeg")),
            ],
        );

        let fs = ZipProvider.build(&path).unwrap();
        let root: Vec<_> = fs.list("").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(root, vec!["photos".to_owned(), "readme.txt".to_owned()]);

        let nested = fs.stat("photos/2024").unwrap();
        assert_eq!(nested.kind, NodeKind::Directory);
        assert_eq!(nested.perm, DIR_PERM);

        let file = fs.stat("photos/2024/beach.jpg").unwrap();
        assert_eq!(file.kind, NodeKind::File);
        assert_eq!(file.size, 4);
    }

    #[test]
    fn explicit_directory_keeps_children() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_zip(
            dir.path(),
            &[("docs/a.txt", Some(b"a")), ("docs/", None)],
        );

        let fs = ZipArchiveFs::open(&path).unwrap();
        let names: Vec<_> = fs.list("docs").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["a.txt".to_owned()]);
    }

    #[test]
    fn reads_respect_offset_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_zip(dir.path(), &[("data.bin", Some(b"0123456789"))]);
        let fs = ZipArchiveFs::open(&path).unwrap();

        assert_eq!(&fs.read("data.bin", 0, 4).unwrap()[..], b"0123");
        assert_eq!(&fs.read("data.bin", 8, 100).unwrap()[..], b"89");
        assert!(fs.read("data.bin", 50, 4).unwrap().is_empty());
    }

    #[test]
    fn entries_larger_than_preallocation_read_whole() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..MAX_PREALLOC * 3 + 17).map(|i| (i % 251) as u8).collect();
        let path = write_zip(dir.path(), &[("big.bin", Some(data.as_slice()))]);
        let fs = ZipArchiveFs::open(&path).unwrap();

        assert_eq!(fs.stat("big.bin").unwrap().size, data.len() as u64);
        let tail = fs.read("big.bin", (data.len() - 17) as u64, 64).unwrap();
        assert_eq!(&tail[..], &data[data.len() - 17..]);
        let whole = fs.read("big.bin", 0, data.len() as u32).unwrap();
        assert_eq!(&whole[..], &data[..]);
    }

    #[test]
    fn lookup_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_zip(dir.path(), &[("sub/file", Some(b"x"))]);
        let fs = ZipArchiveFs::open(&path).unwrap();

        assert!(matches!(fs.stat("missing"), Err(ArchiveError::NotFound)));
        assert!(matches!(fs.read("sub", 0, 1), Err(ArchiveError::IsDir)));
        assert!(matches!(fs.list("sub/file"), Err(ArchiveError::NotDir)));
    }

    #[test]
    fn entries_escaping_root_are_skipped() {
        assert_eq!(normalize_entry_name("../etc/passwd"), None);
        assert_eq!(normalize_entry_name("./a//b/"), Some("a/b".to_owned()));
        assert_eq!(normalize_entry_name("/"), None);
    }

    #[test]
    fn missing_or_garbage_source_fails_to_build() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ZipProvider.build(&dir.path().join("missing.zip")),
            Err(ArchiveError::Io(_))
        ));

        let junk = dir.path().join("junk.zip");
        std::fs::write(&junk, b"definitely not a zip").unwrap();
        assert!(matches!(ZipProvider.build(&junk), Err(ArchiveError::Zip(_))));
    }
}
