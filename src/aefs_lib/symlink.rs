//! Symlink support.
//!
//! The link target lives in a critical EA named `SYMLINK`.  Old volumes
//! stored the target as the raw file contents instead; reading falls
//! back to that representation when the EA is absent.

use crate::aefs_lib::basefile::{query_file_info, read_file};
use crate::aefs_lib::ea::{query_eas, set_eas, CryptedEA, CEF_CRITICAL};
use crate::aefs_lib::err::{CoreError, CoreResult};
use crate::aefs_lib::storage::CryptedVolume;
use crate::aefs_lib::utils::names_eq_ci;
use crate::aefs_lib::CryptedFileId;

pub const SYMLINK_EA_NAME: &[u8] = b"SYMLINK";

/// Upper bound on a link target, either representation.
pub const MAX_SYMLINK_SIZE: usize = 4096;

/// Store the link target, replacing any previous one.
pub fn write_symlink(vol: &mut CryptedVolume, id: CryptedFileId, target: &[u8]) -> CoreResult<()> {
    let info = query_file_info(vol, id)?;
    if !info.is_symlink() {
        return Err(CoreError::NotSymlink);
    }
    if target.len() >= MAX_SYMLINK_SIZE {
        return Err(CoreError::NameTooLong);
    }

    let mut eas = query_eas(vol, id)?;
    eas.retain(|ea| !names_eq_ci(&ea.name, SYMLINK_EA_NAME));
    eas.insert(
        0,
        CryptedEA {
            name: SYMLINK_EA_NAME.to_vec(),
            value: target.to_vec(),
            flags: CEF_CRITICAL,
        },
    );

    set_eas(vol, id, &eas)
}

/// Read the link target.
pub fn read_symlink(vol: &mut CryptedVolume, id: CryptedFileId) -> CoreResult<Vec<u8>> {
    let info = query_file_info(vol, id)?;
    if !info.is_symlink() {
        return Err(CoreError::NotSymlink);
    }

    let eas = query_eas(vol, id)?;
    if let Some(ea) = eas.iter().find(|ea| names_eq_ci(&ea.name, SYMLINK_EA_NAME)) {
        if ea.value.len() >= MAX_SYMLINK_SIZE {
            return Err(CoreError::NameTooLong);
        }
        return Ok(ea.value.clone());
    }

    // old-style symlinks store the target in the file contents
    if info.file_size == 0 {
        return Err(CoreError::BadSymlink);
    }
    if info.file_size as usize >= MAX_SYMLINK_SIZE {
        return Err(CoreError::NameTooLong);
    }

    let mut target = vec![0u8; info.file_size as usize];
    read_file(vol, id, 0, &mut target)?;
    Ok(target)
}
