use crate::archive::{ArchiveEntry, ArchiveHandle};
use crate::registry::NamespaceEntry;
use crate::request::MountRequest;
use crate::util::NodeAttr;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub name: String,
    pub attr: NodeAttr,
}

impl From<NamespaceEntry> for DirEntryInfo {
    fn from(value: NamespaceEntry) -> Self {
        Self {
            name: value.name,
            attr: value.attr,
        }
    }
}

impl From<ArchiveEntry> for DirEntryInfo {
    fn from(value: ArchiveEntry) -> Self {
        Self {
            name: value.name,
            attr: value.attr,
        }
    }
}

/// Directory contents captured at opendir time.
#[derive(Debug)]
pub struct DirSnapshot {
    pub attr: NodeAttr,
    pub entries: Vec<DirEntryInfo>,
}

#[derive(Debug, Clone)]
pub enum Handle {
    /// Armed (or spent) control file from `create`.
    Control(Arc<MountRequest>),
    /// Read-only record of a mount's source path.
    Record(Bytes),
    ArchiveFile { fs: ArchiveHandle, path: String },
    Dir(Arc<DirSnapshot>),
}

#[derive(Debug, Default)]
pub struct HandleTable {
    next_id: AtomicU64,
    entries: RwLock<HashMap<u64, Handle>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_control(&self, request: MountRequest) -> u64 {
        self.insert(Handle::Control(Arc::new(request)))
    }

    pub fn insert_record(&self, data: Bytes) -> u64 {
        self.insert(Handle::Record(data))
    }

    pub fn insert_archive_file(&self, fs: ArchiveHandle, path: String) -> u64 {
        self.insert(Handle::ArchiveFile { fs, path })
    }

    pub fn insert_dir(&self, snapshot: DirSnapshot) -> u64 {
        self.insert(Handle::Dir(Arc::new(snapshot)))
    }

    pub fn get_file(&self, id: u64) -> Option<Handle> {
        self.get(id, true)
    }

    pub fn get_dir(&self, id: u64) -> Option<Arc<DirSnapshot>> {
        match self.get(id, false)? {
            Handle::Dir(snapshot) => Some(snapshot),
            _ => None,
        }
    }

    pub fn remove(&self, id: u64) -> Option<Handle> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    fn insert(&self, handle: Handle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, handle);
        id
    }

    fn get(&self, id: u64, want_file: bool) -> Option<Handle> {
        let guard = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let handle = guard.get(&id)?;
        match (want_file, handle) {
            (false, Handle::Dir(_)) => Some(handle.clone()),
            (true, Handle::Dir(_)) | (false, _) => None,
            (true, _) => Some(handle.clone()),
        }
    }
}
