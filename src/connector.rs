use crate::archive::ArchiveHandle;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Attaches a constructed archive filesystem somewhere in the namespace.
pub trait HostConnector: Send + Sync {
    fn attach(&self, mount_path: &str, fs: ArchiveHandle) -> Result<(), fuse3::Errno>;
}

/// Holds the archives attached under the mount root. Attachments are never
/// removed while the process lives.
#[derive(Debug, Default)]
pub struct MountRouter {
    attached: RwLock<HashMap<String, ArchiveHandle>>,
}

impl MountRouter {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn is_attached(&self, name: &str) -> bool {
        let guard = self.attached.read().unwrap_or_else(PoisonError::into_inner);
        guard.contains_key(name)
    }
}

impl HostConnector for MountRouter {
    fn attach(&self, mount_path: &str, fs: ArchiveHandle) -> Result<(), fuse3::Errno> {
        let name = mount_path
            .strip_prefix('/')
            .filter(|name| !name.is_empty() && !name.contains('/'))
            .ok_or_else(|| fuse3::Errno::from(libc::EINVAL))?;

        let mut guard = self.attached.write().unwrap_or_else(PoisonError::into_inner);
        if guard.contains_key(name) {
            return Err(fuse3::Errno::from(libc::EBUSY));
        }
        debug!(mount_path, "attached archive filesystem");
        guard.insert(name.to_owned(), fs);
        Ok(())
    }
}
