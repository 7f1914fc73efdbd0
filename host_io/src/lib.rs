use std::io;

use bitflags::bitflags;
use thiserror::Error;

pub mod file;

pub use file::{delete_file, file_exists, HostFile};

/// Error codes of the host I/O layer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysError {
    #[error("access denied")]
    AccessDenied,
    #[error("file not found")]
    FileNotFound,
    #[error("file exists")]
    FileExists,
    #[error("I/O error")]
    Io,
    #[error("file is locked")]
    Locked,
    #[error("read-only file system")]
    Rofs,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("unknown system error")]
    Unknown,
}

pub type SysResult<T> = Result<T, SysError>;

impl From<io::Error> for SysError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => SysError::FileNotFound,
            io::ErrorKind::PermissionDenied => SysError::AccessDenied,
            io::ErrorKind::AlreadyExists => SysError::FileExists,
            io::ErrorKind::InvalidInput => SysError::InvalidParameter,
            io::ErrorKind::WouldBlock => SysError::Locked,
            _ => match e.raw_os_error() {
                Some(libc::EROFS) => SysError::Rofs,
                Some(libc::EIO) => SysError::Io,
                Some(libc::EPERM) | Some(libc::EACCES) => SysError::AccessDenied,
                _ => SysError::Unknown,
            },
        }
    }
}

bitflags! {
    /// Open flags for [`HostFile::open`] and [`HostFile::create`].
    /// Neither WRITEONLY nor READWRITE set means read-only access.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const WRITEONLY       = 0x00001;
        const READWRITE       = 0x00002;
        /// Take an exclusive lock on the file.
        const DENYALL         = 0x00010;
        /// Take a shared lock on the file.
        const DENYWRITE       = 0x00020;
        const WRITE_THROUGH   = 0x04000;
        const TRUNC_IF_EXISTS = 0x10000;
        const CREATE_IF_NEW   = 0x20000;
    }
}

impl OpenFlags {
    pub fn writable(self) -> bool {
        self.intersects(OpenFlags::WRITEONLY | OpenFlags::READWRITE)
    }
}

/// Credentials applied to storage-file creation and checked on open.
/// With `enforce` off the process identity is used as-is.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Cred {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub enforce: bool,
}
