use host_io::SysError;
use thiserror::Error;

/// Error taxonomy of the core.  Wrapping layers keep the innermost kind
/// unless they genuinely transform it.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    #[error("file not found")]
    FileNotFound,
    #[error("not enough memory")]
    NotEnoughMemory,
    #[error("file exists")]
    FileExists,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("invalid name")]
    InvalidName,
    #[error("bad checksum")]
    BadChecksum,
    #[error("bad info sector")]
    BadInfoSector,
    #[error("not a directory")]
    NotDirectory,
    #[error("bad directory contents")]
    BadDirectory,
    #[error("bad file type")]
    BadType,
    #[error("bad extended attributes")]
    BadEas,
    #[error("cache overflow")]
    CacheOverflow,
    #[error("volume is read-only")]
    ReadOnly,
    #[error("info sector file corrupt")]
    IsfCorrupt,
    #[error("file ID exists")]
    IdExists,
    #[error("bad superblock")]
    BadSuperblock,
    #[error("unknown cipher")]
    UnknownCipher,
    #[error("cipher failure")]
    MiscCipher,
    #[error("bad superblock version")]
    BadVersion,
    #[error("not a symlink")]
    NotSymlink,
    #[error("bad symlink")]
    BadSymlink,
    #[error("name too long")]
    NameTooLong,
    #[error("system error: {0}")]
    Sys(SysError),
}

impl From<SysError> for CoreError {
    fn from(e: SysError) -> Self {
        match e {
            SysError::InvalidParameter => CoreError::InvalidParameter,
            other => CoreError::Sys(other),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
