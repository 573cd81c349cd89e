use crate::error::{MountError, MountResult};
use crate::registry::MountRegistry;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

/// The writable handle returned by creating `config/<name>`. It accepts a
/// single write carrying the archive path; after that it is spent.
pub struct MountRequest {
    basename: String,
    generation: u64,
    registry: Mutex<Option<Arc<MountRegistry>>>,
}

impl fmt::Debug for MountRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountRequest")
            .field("basename", &self.basename)
            .field("generation", &self.generation)
            .field("armed", &self.is_armed())
            .finish()
    }
}

impl MountRequest {
    pub(crate) fn new(basename: String, generation: u64, registry: Arc<MountRegistry>) -> Self {
        Self {
            basename,
            generation,
            registry: Mutex::new(Some(registry)),
        }
    }

    pub fn basename(&self) -> &str {
        &self.basename
    }

    pub fn is_armed(&self) -> bool {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Builds the archive named by `payload`, attaches it at `/<basename>`
    /// and records the mount. Blocks for as long as the build and attach
    /// take; the registry lock is only held for the final bookkeeping.
    pub fn write(&self, payload: &[u8]) -> MountResult<u32> {
        let registry = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(MountError::PermissionDenied)?;

        let source = String::from_utf8_lossy(payload).trim().to_owned();

        let fs = match registry.provider().build(Path::new(&source)) {
            Ok(fs) => fs,
            Err(err) => {
                warn!(
                    name = %self.basename,
                    source = %source,
                    error = %err,
                    "archive build failed"
                );
                registry.abandon(&self.basename, self.generation);
                return Err(MountError::ConstructionFailed(err));
            }
        };

        // An attach failure leaves the reservation in place.
        let mount_path = format!("/{}", self.basename);
        let connector = registry
            .connector()
            .ok_or_else(|| MountError::AttachFailed(fuse3::Errno::from(libc::ENOTCONN)))?;
        if let Err(errno) = connector.attach(&mount_path, fs.clone()) {
            warn!(name = %self.basename, mount_path = %mount_path, ?errno, "attach rejected");
            return Err(MountError::AttachFailed(errno));
        }

        registry.commit(&self.basename, self.generation, fs, source);
        info!(name = %self.basename, generation = self.generation, "mount request consumed");
        Ok(u32::try_from(payload.len()).unwrap_or(u32::MAX))
    }
}
