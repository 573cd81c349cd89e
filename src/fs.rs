use crate::archive::ArchiveHandle;
use crate::config::Config;
use crate::handle_table::{DirEntryInfo, DirSnapshot, Handle, HandleTable};
use crate::registry::{CONFIG_DIR, MountRegistry};
use crate::util::{
    BLOCK_SIZE, NodeAttr, NodeKind, file_attr_from_node, file_type_from_kind, is_write_intent,
    make_child_path, relative_path, split_top,
};
use fuse3::FileType;
use fuse3::SetAttr;
use fuse3::path::prelude::*;
use fuse3::path::reply::DirectoryEntryPlus;
use std::ffi::{OsStr, OsString};
use std::sync::Arc;
use tracing::{debug, info};

/// Bypass the page cache so reads are not clipped to the advertised size.
const FOPEN_DIRECT_IO: u32 = 1;
const NAME_MAX: u32 = 255;

enum Route<'p> {
    /// Served from the registry tables.
    Namespace(&'p str),
    /// Below `/<name>`, served by the attached archive.
    Archive(ArchiveHandle, &'p str),
}

pub struct MultiZipFs {
    config: Arc<Config>,
    registry: Arc<MountRegistry>,
    handles: HandleTable,
}

impl MultiZipFs {
    pub fn new(config: Config, registry: Arc<MountRegistry>) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            handles: HandleTable::new(),
        }
    }

    fn route<'p>(&self, rel: &'p str) -> Result<Route<'p>, fuse3::Errno> {
        let (top, rest) = split_top(rel);
        if rest.is_empty() || top == CONFIG_DIR {
            return Ok(Route::Namespace(rel));
        }
        // Unlinked and pending names hide whatever is still attached.
        let fs = self
            .registry
            .mounted_fs(top)
            .ok_or_else(fuse3::Errno::new_not_exist)?;
        Ok(Route::Archive(fs, rest))
    }

    fn stat_path(&self, path: &OsStr) -> Result<NodeAttr, fuse3::Errno> {
        let rel = relative_path(path)?;
        match self.route(rel)? {
            Route::Namespace(rel) => Ok(self.registry.attributes(rel)?),
            Route::Archive(fs, rest) => Ok(fs.stat(rest)?),
        }
    }

    fn file_attr(&self, attr: NodeAttr) -> FileAttr {
        file_attr_from_node(attr, &self.config)
    }

    fn build_attr_reply(&self, path: &OsStr) -> Result<ReplyAttr, fuse3::Errno> {
        let attr = self.stat_path(path)?;
        Ok(ReplyAttr {
            ttl: self.config.attr_ttl,
            attr: self.file_attr(attr),
        })
    }

    fn handle_attr(&self, handle: &Handle) -> Result<NodeAttr, fuse3::Errno> {
        match handle {
            Handle::Control(_) => Ok(NodeAttr::file(0o600, 0)),
            Handle::Record(data) => Ok(NodeAttr::file(0o600, data.len() as u64)),
            Handle::ArchiveFile { fs, path } => Ok(fs.stat(path)?),
            Handle::Dir(snapshot) => Ok(snapshot.attr),
        }
    }

    fn snapshot_dir(&self, path: &OsStr) -> Result<DirSnapshot, fuse3::Errno> {
        let rel = relative_path(path)?;
        let (attr, entries) = match self.route(rel)? {
            Route::Archive(fs, rest) => {
                let attr = fs.stat(rest)?;
                let entries = fs.list(rest)?.into_iter().map(DirEntryInfo::from).collect();
                (attr, entries)
            }
            Route::Namespace(rel) => {
                let attr = self.registry.attributes(rel)?;
                if attr.kind != NodeKind::Directory {
                    return Err(fuse3::Errno::from(libc::ENOTDIR));
                }
                let entries = if rel.is_empty() || rel == CONFIG_DIR {
                    self.registry
                        .list(rel)?
                        .into_iter()
                        .map(DirEntryInfo::from)
                        .collect()
                } else {
                    // `/<name>` itself: empty until the archive is mounted.
                    match self.registry.mounted_fs(rel) {
                        Some(fs) => fs.list("")?.into_iter().map(DirEntryInfo::from).collect(),
                        None => Vec::new(),
                    }
                };
                (attr, entries)
            }
        };
        Ok(DirSnapshot { attr, entries })
    }

    fn open_file(&self, path: &OsStr, flags: u32) -> Result<ReplyOpen, fuse3::Errno> {
        let rel = relative_path(path)?;
        match self.route(rel)? {
            Route::Namespace(rel) => {
                let record = self.registry.open(rel, flags)?;
                Ok(ReplyOpen {
                    fh: self.handles.insert_record(record),
                    flags: FOPEN_DIRECT_IO,
                })
            }
            Route::Archive(fs, rest) => {
                if is_write_intent(flags) {
                    return Err(fuse3::Errno::from(libc::EROFS));
                }
                if fs.stat(rest)?.kind == NodeKind::Directory {
                    return Err(fuse3::Errno::from(libc::EISDIR));
                }
                Ok(ReplyOpen {
                    fh: self.handles.insert_archive_file(fs, rest.to_owned()),
                    flags: 0,
                })
            }
        }
    }

    fn dir_entries(snapshot: &DirSnapshot) -> Vec<(FileType, OsString, NodeAttr)> {
        let mut entries = Vec::with_capacity(snapshot.entries.len() + 2);
        entries.push((FileType::Directory, OsString::from("."), snapshot.attr));
        entries.push((FileType::Directory, OsString::from(".."), snapshot.attr));
        for entry in &snapshot.entries {
            entries.push((
                file_type_from_kind(entry.attr.kind),
                OsString::from(&entry.name),
                entry.attr,
            ));
        }
        entries
    }
}

impl PathFilesystem for MultiZipFs {
    async fn init(&self, _req: Request) -> Result<ReplyInit, fuse3::Errno> {
        info!("filesystem initialized");
        Ok(ReplyInit {
            max_write: self.config.max_write,
        })
    }

    async fn destroy(&self, _req: Request) {
        info!("filesystem destroyed");
    }

    async fn lookup(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
    ) -> Result<ReplyEntry, fuse3::Errno> {
        let path = make_child_path(parent, name);
        let attr = self.stat_path(&path)?;
        Ok(ReplyEntry {
            ttl: self.config.attr_ttl,
            attr: self.file_attr(attr),
        })
    }

    async fn getattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: Option<u64>,
        _flags: u32,
    ) -> Result<ReplyAttr, fuse3::Errno> {
        if let Some(path) = path {
            return self.build_attr_reply(path);
        }

        let handle = fh
            .and_then(|id| self.handles.get_file(id))
            .ok_or_else(fuse3::Errno::new_not_exist)?;
        let attr = self.handle_attr(&handle)?;
        Ok(ReplyAttr {
            ttl: self.config.attr_ttl,
            attr: self.file_attr(attr),
        })
    }

    async fn setattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> Result<ReplyAttr, fuse3::Errno> {
        let path = path.ok_or_else(fuse3::Errno::new_not_exist)?;
        let attr = self.stat_path(path)?;

        // Truncating a fresh control file is a no-op; everything else is
        // fixed by the namespace layout.
        let only_truncate = set_attr.mode.is_none()
            && set_attr.uid.is_none()
            && set_attr.gid.is_none()
            && set_attr.size == Some(0);
        if attr.kind != NodeKind::File || !only_truncate {
            return Err(fuse3::Errno::from(libc::EPERM));
        }
        Ok(ReplyAttr {
            ttl: self.config.attr_ttl,
            attr: self.file_attr(attr),
        })
    }

    async fn unlink(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
    ) -> Result<(), fuse3::Errno> {
        let path = make_child_path(parent, name);
        let rel = relative_path(&path)?;
        self.registry.unlink(rel)?;
        Ok(())
    }

    async fn open(
        &self,
        _req: Request,
        path: &OsStr,
        flags: u32,
    ) -> Result<ReplyOpen, fuse3::Errno> {
        self.open_file(path, flags)
    }

    async fn read(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<ReplyData, fuse3::Errno> {
        let handle = self
            .handles
            .get_file(fh)
            .ok_or_else(|| fuse3::Errno::from(libc::EBADF))?;

        let data = match handle {
            Handle::Record(data) => {
                let start = (offset as usize).min(data.len());
                let end = start.saturating_add(size as usize).min(data.len());
                data.slice(start..end)
            }
            Handle::ArchiveFile { fs, path } => fs.read(&path, offset, size)?,
            Handle::Control(_) | Handle::Dir(_) => return Err(fuse3::Errno::from(libc::EBADF)),
        };
        Ok(data.into())
    }

    async fn write(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        _offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> Result<ReplyWrite, fuse3::Errno> {
        let Some(Handle::Control(request)) = self.handles.get_file(fh) else {
            return Err(fuse3::Errno::from(libc::EBADF));
        };

        // Building an archive reads the whole central directory.
        let payload = data.to_vec();
        let written = tokio::task::spawn_blocking(move || request.write(&payload))
            .await
            .map_err(|_| fuse3::Errno::from(libc::EIO))??;
        Ok(ReplyWrite { written })
    }

    async fn release(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> Result<(), fuse3::Errno> {
        if let Some(Handle::Control(request)) = self.handles.remove(fh)
            && request.is_armed()
        {
            debug!(name = request.basename(), "control file closed without a write");
        }
        Ok(())
    }

    async fn flush(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        _lock_owner: u64,
    ) -> Result<(), fuse3::Errno> {
        self.handles
            .get_file(fh)
            .map(|_| ())
            .ok_or_else(|| fuse3::Errno::from(libc::EBADF))
    }

    async fn access(&self, _req: Request, path: &OsStr, _mask: u32) -> Result<(), fuse3::Errno> {
        self.stat_path(path).map(|_| ())
    }

    async fn create(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> Result<ReplyCreated, fuse3::Errno> {
        let path = make_child_path(parent, name);
        let rel = relative_path(&path)?;
        let request = self.registry.create(rel, flags, mode)?;
        let fh = self.handles.insert_control(request);
        let attr = self.file_attr(NodeAttr::file(0o600, 0));
        Ok(ReplyCreated {
            ttl: self.config.attr_ttl,
            attr,
            generation: 0,
            fh,
            flags: FOPEN_DIRECT_IO,
        })
    }

    async fn opendir(
        &self,
        _req: Request,
        path: &OsStr,
        flags: u32,
    ) -> Result<ReplyOpen, fuse3::Errno> {
        let snapshot = self.snapshot_dir(path)?;
        let handle = self.handles.insert_dir(snapshot);
        Ok(ReplyOpen { fh: handle, flags })
    }

    type DirEntryStream<'a>
        = futures_util::stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntry>>>
    where
        Self: 'a;
    type DirEntryPlusStream<'a>
        = futures_util::stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntryPlus>>>
    where
        Self: 'a;

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        _path: &'a OsStr,
        fh: u64,
        offset: i64,
    ) -> Result<ReplyDirectory<Self::DirEntryStream<'a>>, fuse3::Errno> {
        let snapshot = self
            .handles
            .get_dir(fh)
            .ok_or_else(|| fuse3::Errno::from(libc::EBADF))?;

        let entries: Vec<fuse3::Result<DirectoryEntry>> = Self::dir_entries(&snapshot)
            .into_iter()
            .enumerate()
            .map(|(idx, (kind, name, _))| {
                Ok(DirectoryEntry {
                    kind,
                    name,
                    offset: idx as i64 + 1,
                })
            })
            .skip(offset.max(0) as usize)
            .collect();
        Ok(ReplyDirectory {
            entries: futures_util::stream::iter(entries),
        })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        _parent: &'a OsStr,
        fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> Result<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>, fuse3::Errno> {
        let snapshot = self
            .handles
            .get_dir(fh)
            .ok_or_else(|| fuse3::Errno::from(libc::EBADF))?;

        let ttl = self.config.attr_ttl;
        let entries: Vec<fuse3::Result<DirectoryEntryPlus>> = Self::dir_entries(&snapshot)
            .into_iter()
            .enumerate()
            .map(|(idx, (kind, name, attr))| {
                Ok(DirectoryEntryPlus {
                    kind,
                    name,
                    offset: idx as i64 + 1,
                    attr: self.file_attr(attr),
                    entry_ttl: ttl,
                    attr_ttl: ttl,
                })
            })
            .skip(offset as usize)
            .collect();
        Ok(ReplyDirectoryPlus {
            entries: futures_util::stream::iter(entries),
        })
    }

    async fn releasedir(
        &self,
        _req: Request,
        _path: &OsStr,
        fh: u64,
        _flags: u32,
    ) -> Result<(), fuse3::Errno> {
        self.handles.remove(fh);
        Ok(())
    }

    async fn statfs(&self, _req: Request, _path: &OsStr) -> Result<ReplyStatFs, fuse3::Errno> {
        Ok(ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: 0,
            bsize: BLOCK_SIZE,
            namelen: NAME_MAX,
            frsize: BLOCK_SIZE,
        })
    }
}
