use crate::archive::{ArchiveHandle, ArchiveProvider};
use crate::connector::HostConnector;
use crate::error::{MountError, MountResult};
use crate::request::MountRequest;
use crate::util::{NodeAttr, is_write_intent, split_dir_base};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

pub const CONFIG_DIR: &str = "config";

const ROOT_PERM: u16 = 0o500;
const CONFIG_DIR_PERM: u16 = 0o700;
const CONTROL_FILE_PERM: u16 = 0o600;
const MOUNT_DIR_PERM: u16 = 0o700;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceEntry {
    pub name: String,
    pub attr: NodeAttr,
}

#[derive(Debug, Default)]
struct Tables {
    mounted: HashMap<String, ArchiveHandle>,
    sources: HashMap<String, String>,
    /// Value is the generation of the create call that reserved the name.
    pending: HashMap<String, u64>,
}

impl Tables {
    fn contains(&self, name: &str) -> bool {
        self.mounted.contains_key(name) || self.pending.contains_key(name)
    }
}

pub struct MountRegistry {
    tables: RwLock<Tables>,
    provider: Arc<dyn ArchiveProvider>,
    connector: OnceLock<Arc<dyn HostConnector>>,
    next_generation: AtomicU64,
}

impl MountRegistry {
    pub fn new(provider: Arc<dyn ArchiveProvider>) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            provider,
            connector: OnceLock::new(),
            next_generation: AtomicU64::new(1),
        }
    }

    fn read_tables(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_tables(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn bind(&self, connector: Arc<dyn HostConnector>) {
        if self.connector.set(connector).is_err() {
            warn!("host connector already bound, keeping the first one");
        }
    }

    pub(crate) fn provider(&self) -> &dyn ArchiveProvider {
        self.provider.as_ref()
    }

    pub(crate) fn connector(&self) -> Option<&dyn HostConnector> {
        self.connector.get().map(|c| c.as_ref())
    }

    pub fn list(&self, dir: &str) -> MountResult<Vec<NamespaceEntry>> {
        let child_attr = match dir {
            "" => NodeAttr::dir(MOUNT_DIR_PERM),
            CONFIG_DIR => NodeAttr::file(CONTROL_FILE_PERM, 0),
            _ => return Err(MountError::NotFound),
        };

        let tables = self.read_tables();
        let mut entries = Vec::with_capacity(tables.mounted.len() + tables.pending.len() + 1);
        let names = tables.mounted.keys().chain(tables.pending.keys());
        for name in names {
            let mut attr = child_attr;
            if dir == CONFIG_DIR {
                attr.size = tables.sources.get(name).map_or(0, |s| s.len() as u64);
            }
            entries.push(NamespaceEntry {
                name: name.clone(),
                attr,
            });
        }
        if dir.is_empty() {
            entries.push(NamespaceEntry {
                name: CONFIG_DIR.to_owned(),
                attr: NodeAttr::dir(CONFIG_DIR_PERM),
            });
        }
        Ok(entries)
    }

    pub fn attributes(&self, path: &str) -> MountResult<NodeAttr> {
        match path {
            "" => return Ok(NodeAttr::dir(ROOT_PERM)),
            CONFIG_DIR => return Ok(NodeAttr::dir(CONFIG_DIR_PERM)),
            _ => {}
        }

        let (dir, base) = split_dir_base(path);
        let tables = self.read_tables();
        if !tables.contains(base) {
            return Err(MountError::NotFound);
        }
        match dir {
            "" => Ok(NodeAttr::dir(MOUNT_DIR_PERM)),
            CONFIG_DIR => {
                let size = tables.sources.get(base).map_or(0, |s| s.len() as u64);
                Ok(NodeAttr::file(CONTROL_FILE_PERM, size))
            }
            _ => Err(MountError::NotFound),
        }
    }

    pub fn open(&self, path: &str, flags: u32) -> MountResult<Bytes> {
        if is_write_intent(flags) {
            return Err(MountError::PermissionDenied);
        }

        let (dir, base) = split_dir_base(path);
        if dir != CONFIG_DIR {
            return Err(MountError::NotFound);
        }
        let tables = self.read_tables();
        let source = tables.sources.get(base).ok_or(MountError::NotFound)?;
        Ok(Bytes::from(source.clone()))
    }

    /// An existing reservation for the name is replaced.
    pub fn create(
        self: &Arc<Self>,
        path: &str,
        _flags: u32,
        _mode: u32,
    ) -> MountResult<MountRequest> {
        let (dir, base) = split_dir_base(path);
        if dir != CONFIG_DIR || base.is_empty() {
            return Err(MountError::PermissionDenied);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut tables = self.write_tables();
        if let Some(prev) = tables.pending.insert(base.to_owned(), generation) {
            debug!(name = base, prev, generation, "replacing pending reservation");
        }
        drop(tables);

        debug!(name = base, generation, "control file created");
        Ok(MountRequest::new(base.to_owned(), generation, Arc::clone(self)))
    }

    /// The archive serving `/<name>`, if the name is currently mounted.
    pub fn mounted_fs(&self, name: &str) -> Option<ArchiveHandle> {
        self.read_tables().mounted.get(name).cloned()
    }

    // There is no detach: the archive stays attached to the connector.
    pub fn unlink(&self, path: &str) -> MountResult<()> {
        let (dir, base) = split_dir_base(path);
        if dir != CONFIG_DIR {
            return Err(MountError::PermissionDenied);
        }

        let mut tables = self.write_tables();
        if tables.mounted.remove(base).is_none() {
            return Err(MountError::NotFound);
        }
        tables.sources.remove(base);
        debug!(name = base, "mount bookkeeping removed");
        Ok(())
    }

    pub(crate) fn abandon(&self, name: &str, generation: u64) {
        let mut tables = self.write_tables();
        if tables.pending.get(name) == Some(&generation) {
            tables.pending.remove(name);
        }
    }

    /// The last commit for a name wins.
    pub(crate) fn commit(&self, name: &str, generation: u64, fs: ArchiveHandle, source: String) {
        let mut tables = self.write_tables();
        if tables.pending.get(name) == Some(&generation) {
            tables.pending.remove(name);
        }
        if tables.mounted.insert(name.to_owned(), fs).is_some() {
            debug!(name, "replacing previous mount");
        }
        info!(name, source = %source, "archive mounted");
        tables.sources.insert(name.to_owned(), source);
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self, name: &str) -> bool {
        self.read_tables().pending.contains_key(name)
    }

    #[cfg(test)]
    pub(crate) fn mounted_source(&self, name: &str) -> Option<String> {
        let tables = self.read_tables();
        tables.mounted.get(name)?;
        tables.sources.get(name).cloned()
    }
}
