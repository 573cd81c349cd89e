use crate::config::Config;
use fuse3::FileType;
use fuse3::path::reply::FileAttr;
use nix::fcntl::OFlag;
use std::ffi::{OsStr, OsString};

pub const BLOCK_SIZE: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAttr {
    pub kind: NodeKind,
    pub size: u64,
    pub perm: u16,
}

impl NodeAttr {
    pub fn dir(perm: u16) -> Self {
        Self {
            kind: NodeKind::Directory,
            size: 0,
            perm,
        }
    }

    pub fn file(perm: u16, size: u64) -> Self {
        Self {
            kind: NodeKind::File,
            size,
            perm,
        }
    }
}

pub fn file_type_from_kind(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::Directory => FileType::Directory,
        NodeKind::File => FileType::RegularFile,
    }
}

pub fn file_attr_from_node(attr: NodeAttr, config: &Config) -> FileAttr {
    let kind = file_type_from_kind(attr.kind);
    let nlink = match attr.kind {
        NodeKind::Directory => 2,
        NodeKind::File => 1,
    };

    FileAttr {
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: config.started_at,
        mtime: config.started_at,
        ctime: config.started_at,
        kind,
        perm: attr.perm,
        nlink,
        uid: config.uid,
        gid: config.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        #[cfg(target_os = "macos")]
        crtime: config.started_at,
        #[cfg(target_os = "macos")]
        flags: 0,
    }
}

pub fn oflag_from_bits(flags: u32) -> OFlag {
    OFlag::from_bits_truncate(flags as i32)
}

/// True for any open flag that could modify the file.
pub fn is_write_intent(flags: u32) -> bool {
    let any_write =
        OFlag::O_WRONLY | OFlag::O_RDWR | OFlag::O_APPEND | OFlag::O_CREAT | OFlag::O_TRUNC;
    oflag_from_bits(flags).intersects(any_write)
}

/// Strips the leading slash the kernel hands us. Non UTF-8 names can never
/// match a registry entry.
pub fn relative_path(path: &OsStr) -> Result<&str, fuse3::Errno> {
    let path = path.to_str().ok_or_else(fuse3::Errno::new_not_exist)?;
    Ok(path.trim_start_matches('/'))
}

/// Splits a relative path into its parent directory and final component.
pub fn split_dir_base(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => ("", path),
    }
}

/// Splits `name/rest` into the top-level name and the remainder.
pub fn split_top(path: &str) -> (&str, &str) {
    match path.find('/') {
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => (path, ""),
    }
}

pub fn make_child_path(parent: &OsStr, name: &OsStr) -> OsString {
    if parent == OsStr::new("/") {
        let mut composed = OsString::from("/");
        composed.push(name);
        composed
    } else {
        let mut composed = OsString::from(parent);
        composed.push(OsStr::new("/"));
        composed.push(name);
        composed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_intent_flags() {
        assert!(!is_write_intent(libc::O_RDONLY as u32));
        assert!(is_write_intent(libc::O_WRONLY as u32));
        assert!(is_write_intent(libc::O_RDWR as u32));
        assert!(is_write_intent((libc::O_RDONLY | libc::O_TRUNC) as u32));
        assert!(is_write_intent((libc::O_RDONLY | libc::O_APPEND) as u32));
    }

    #[test]
    fn path_splitting() {
        assert_eq!(split_dir_base("config/photos"), ("config", "photos"));
        assert_eq!(split_dir_base("photos"), ("", "photos"));
        assert_eq!(split_dir_base("a/b/c"), ("a/b", "c"));

        assert_eq!(split_top("photos/2024/beach.jpg"), ("photos", "2024/beach.jpg"));
        assert_eq!(split_top("photos"), ("photos", ""));
    }

    #[test]
    fn child_paths() {
        assert_eq!(
            make_child_path(OsStr::new("/"), OsStr::new("config")),
            OsString::from("/config")
        );
        assert_eq!(
            make_child_path(OsStr::new("/config"), OsStr::new("photos")),
            OsString::from("/config/photos")
        );
        assert_eq!(relative_path(OsStr::new("/config/photos")).unwrap(), "config/photos");
        assert_eq!(relative_path(OsStr::new("/")).unwrap(), "");
    }

    #[test]
    fn synthesized_attrs_use_owner() {
        let config = Config::for_owner(1000, 100);
        let attr = file_attr_from_node(NodeAttr::file(0o600, 17), &config);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.perm, 0o600);
        assert_eq!(attr.size, 17);
        assert_eq!((attr.uid, attr.gid), (1000, 100));

        let dir = file_attr_from_node(NodeAttr::dir(0o500), &config);
        assert_eq!(dir.kind, FileType::Directory);
        assert_eq!(dir.nlink, 2);
    }
}
