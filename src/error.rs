use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive i/o: {0}")]
    Io(#[from] io::Error),
    #[error("zip: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("no such archive entry")]
    NotFound,
    #[error("entry is a directory")]
    IsDir,
    #[error("entry is not a directory")]
    NotDir,
}

#[derive(Debug, Error)]
pub enum MountError {
    #[error("operation not permitted")]
    PermissionDenied,
    #[error("no such mount")]
    NotFound,
    #[error("could not build archive filesystem: {0}")]
    ConstructionFailed(#[source] ArchiveError),
    #[error("host connector rejected the mount: {0:?}")]
    AttachFailed(fuse3::Errno),
}

pub type MountResult<T> = Result<T, MountError>;

pub fn archive_err_to_errno(err: &ArchiveError) -> i32 {
    match err {
        ArchiveError::Io(ioe) => ioe.raw_os_error().unwrap_or(libc::EIO),
        ArchiveError::Zip(_) => libc::EIO,
        ArchiveError::NotFound => libc::ENOENT,
        ArchiveError::IsDir => libc::EISDIR,
        ArchiveError::NotDir => libc::ENOTDIR,
    }
}

impl From<ArchiveError> for fuse3::Errno {
    fn from(value: ArchiveError) -> Self {
        fuse3::Errno::from(archive_err_to_errno(&value))
    }
}

impl From<MountError> for fuse3::Errno {
    fn from(value: MountError) -> Self {
        match value {
            MountError::PermissionDenied => fuse3::Errno::from(libc::EPERM),
            MountError::NotFound => fuse3::Errno::new_not_exist(),
            MountError::ConstructionFailed(_) => fuse3::Errno::from(libc::EIO),
            MountError::AttachFailed(errno) => errno,
        }
    }
}
