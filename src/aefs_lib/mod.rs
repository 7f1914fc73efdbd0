//! Encrypted filesystem core logics
pub mod basefile;
pub mod cipher;
pub mod codec;
pub mod directory;
pub mod ea;
pub mod err;
pub mod infosector;
pub mod storage;
pub mod superblock;
pub mod symlink;
pub mod utils;

pub use basefile::*;
pub use codec::{CryptoFlags, SectorData, CHECKSUM_SIZE, PAYLOAD_SIZE, RANDOM_SIZE, SECTOR_SIZE};
pub use directory::*;
pub use ea::*;
pub use err::{CoreError, CoreResult};
pub use infosector::*;
pub use storage::*;
pub use superblock::*;
pub use symlink::*;

/// ID of a base file; doubles as the sector number of the file's info
/// record inside the info sector file.  0 means "none".
pub type CryptedFileId = u32;
pub type SectorNumber = u32;
/// Byte position/length inside a base file.
pub type CryptedFilePos = u32;
/// Seconds since 00:00:00 1-Jan-1970 UTC.  0 means unknown.
pub type CoreTime = u32;

/// ID of the info sector file.
pub const INFOSECTORFILE_ID: CryptedFileId = 0xffff_ffff;

/// Sector number of the info sector for a file ID within the ISF.
pub fn info_sector_number(id: CryptedFileId) -> SectorNumber {
    id
}
