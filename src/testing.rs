//! Stand-in archive providers and host connectors for unit tests.

use crate::archive::{ArchiveEntry, ArchiveFs, ArchiveHandle, ArchiveProvider};
use crate::connector::HostConnector;
use crate::error::ArchiveError;
use crate::registry::NamespaceEntry;
use crate::util::NodeAttr;
use bytes::Bytes;
use std::collections::HashSet;
use std::path::Path;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};

#[derive(Debug)]
pub struct EmptyFs;

impl ArchiveFs for EmptyFs {
    fn stat(&self, path: &str) -> Result<NodeAttr, ArchiveError> {
        if path.is_empty() {
            Ok(NodeAttr::dir(0o555))
        } else {
            Err(ArchiveError::NotFound)
        }
    }

    fn list(&self, _path: &str) -> Result<Vec<ArchiveEntry>, ArchiveError> {
        Ok(Vec::new())
    }

    fn read(&self, _path: &str, _offset: u64, _size: u32) -> Result<Bytes, ArchiveError> {
        Err(ArchiveError::IsDir)
    }
}

/// Builds an empty archive for each known source path and fails otherwise.
#[derive(Debug, Default)]
pub struct FakeProvider {
    valid: HashSet<String>,
}

impl FakeProvider {
    pub fn accepting(valid: &[&str]) -> Self {
        Self {
            valid: valid.iter().map(|s| (*s).to_owned()).collect(),
        }
    }
}

impl ArchiveProvider for FakeProvider {
    fn build(&self, source: &Path) -> Result<ArchiveHandle, ArchiveError> {
        let source = source.to_str().ok_or(ArchiveError::NotFound)?;
        if self.valid.contains(source) {
            Ok(Arc::new(EmptyFs))
        } else {
            Err(ArchiveError::NotFound)
        }
    }
}

/// Announces each build on `entered` and blocks until `release` yields.
pub struct GatedProvider {
    pub entered: Mutex<Sender<()>>,
    pub release: Mutex<Receiver<()>>,
}

impl ArchiveProvider for GatedProvider {
    fn build(&self, _source: &Path) -> Result<ArchiveHandle, ArchiveError> {
        let _ = self.entered.lock().unwrap().send(());
        self.release
            .lock()
            .unwrap()
            .recv()
            .map_err(|_| ArchiveError::NotFound)?;
        Ok(Arc::new(EmptyFs))
    }
}

/// Accepts every attach and remembers the mount paths, or rejects all of
/// them with a fixed errno.
#[derive(Debug, Default)]
pub struct RecordingConnector {
    reject: Option<i32>,
    attached: Mutex<Vec<String>>,
}

impl RecordingConnector {
    pub fn rejecting(errno: i32) -> Self {
        Self {
            reject: Some(errno),
            attached: Mutex::new(Vec::new()),
        }
    }

    pub fn attached(&self) -> Vec<String> {
        self.attached.lock().unwrap().clone()
    }
}

impl HostConnector for RecordingConnector {
    fn attach(&self, mount_path: &str, _fs: ArchiveHandle) -> Result<(), fuse3::Errno> {
        if let Some(errno) = self.reject {
            return Err(fuse3::Errno::from(errno));
        }
        self.attached.lock().unwrap().push(mount_path.to_owned());
        Ok(())
    }
}

pub fn names(entries: &[NamespaceEntry]) -> Vec<String> {
    let mut names: Vec<_> = entries.iter().map(|e| e.name.clone()).collect();
    names.sort();
    names
}
