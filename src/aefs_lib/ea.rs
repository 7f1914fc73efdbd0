//! Extended attribute access and modification.
//!
//! On disk an EA list is a sequence of records: a flag byte, the
//! zero-terminated name, the value size (4 bytes) and the value bytes,
//! the whole list terminated by a zero byte.  A zero-length list denotes
//! no EAs.  Small lists live in the tail of the owner's info sector;
//! larger ones in a dedicated EA file.

use crate::aefs_lib::basefile::{
    create_base_file, destroy_base_file, query_file_info, read_file, set_file_info, set_file_size,
    write_file, CryptedFileInfo, CFF_EXTEAS, CFF_IFEA, INTERNAL_EA_OFFSET, MAX_INTERNAL_EAS,
};
use crate::aefs_lib::err::{CoreError, CoreResult};
use crate::aefs_lib::storage::{CryptedVolume, FetchFlags};
use crate::aefs_lib::utils::names_eq_ci;
use crate::aefs_lib::{info_sector_number, CryptedFileId, CryptedFilePos, INFOSECTORFILE_ID};

/// Set on every non-terminator flag byte; on-disk only.
pub const CEF_NOT_EOL: u8 = 1;
/// The EA is critical: programs that do not understand it should refuse
/// to handle the file.
pub const CEF_CRITICAL: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptedEA {
    /// Names are compared case-insensitively.
    pub name: Vec<u8>,
    pub value: Vec<u8>,
    pub flags: u8,
}

/// Decode an on-disk EA stream.
pub fn decode_eas(mut data: &[u8]) -> CoreResult<Vec<CryptedEA>> {
    let mut eas = Vec::new();

    while !data.is_empty() && data[0] != 0 {
        let flags = data[0] & !CEF_NOT_EOL;
        data = &data[1..];

        let name_end = data
            .iter()
            .position(|&c| c == 0)
            .ok_or(CoreError::BadEas)?;
        let rest = &data[name_end..];
        if rest.len() < 5 {
            return Err(CoreError::BadEas);
        }
        let name = data[..name_end].to_vec();

        let cb_value = u32::from_le_bytes(rest[1..5].try_into().unwrap()) as usize;
        let rest = &rest[5..];
        if rest.len() < cb_value {
            return Err(CoreError::BadEas);
        }
        let value = rest[..cb_value].to_vec();

        eas.push(CryptedEA { name, value, flags });
        data = &rest[cb_value..];
    }

    if data.len() != 1 {
        return Err(CoreError::BadEas);
    }

    Ok(eas)
}

/// Encode an EA list; an empty list encodes to zero bytes.
pub fn encode_eas(eas: &[CryptedEA]) -> Vec<u8> {
    if eas.is_empty() {
        return Vec::new();
    }

    let size: usize = 1 + eas.iter().map(|ea| 6 + ea.name.len() + ea.value.len()).sum::<usize>();
    let mut data = Vec::with_capacity(size);

    for ea in eas {
        data.push(ea.flags | CEF_NOT_EOL);
        data.extend_from_slice(&ea.name);
        data.push(0);
        data.extend_from_slice(&(ea.value.len() as u32).to_le_bytes());
        data.extend_from_slice(&ea.value);
    }
    data.push(0);

    data
}

/// Regular files, directories and symlinks can carry EAs.
fn get_info_and_verify(vol: &mut CryptedVolume, id: CryptedFileId) -> CoreResult<CryptedFileInfo> {
    let info = query_file_info(vol, id)?;
    if !info.is_regular() && !info.is_dir() && !info.is_symlink() {
        return Err(CoreError::BadType);
    }
    Ok(info)
}

fn read_external_eas(
    vol: &mut CryptedVolume,
    id_ea_file: CryptedFileId,
    info2: &CryptedFileInfo,
    cb_eas: usize,
) -> CoreResult<Vec<u8>> {
    if !info2.is_ea_file() {
        return Err(CoreError::BadType);
    }
    let mut data = vec![0u8; cb_eas];
    read_file(vol, id_ea_file, 0, &mut data)?;
    Ok(data)
}

fn read_internal_eas(
    vol: &mut CryptedVolume,
    id: CryptedFileId,
    cb_eas: usize,
) -> CoreResult<Vec<u8>> {
    let mut data = vec![0u8; cb_eas];
    vol.query_sector_data(
        INFOSECTORFILE_ID,
        info_sector_number(id),
        INTERNAL_EA_OFFSET,
        &mut data,
        FetchFlags::empty(),
    )?;
    Ok(data)
}

/// Read and decode a file's EA list.
pub fn query_eas(vol: &mut CryptedVolume, id: CryptedFileId) -> CoreResult<Vec<CryptedEA>> {
    let info = get_info_and_verify(vol, id)?;

    if info.cb_eas == 0 {
        return Ok(Vec::new());
    }

    // Guard against a corrupted cb_eas field before trusting it.
    let data = if info.flags & CFF_EXTEAS != 0 {
        let info2 = query_file_info(vol, info.id_ea_file)?;
        if info.cb_eas != info2.file_size {
            return Err(CoreError::BadEas);
        }
        read_external_eas(vol, info.id_ea_file, &info2, info.cb_eas as usize)?
    } else {
        if info.cb_eas as usize > MAX_INTERNAL_EAS {
            return Err(CoreError::BadEas);
        }
        read_internal_eas(vol, id, info.cb_eas as usize)?
    };

    decode_eas(&data)
}

fn write_external_eas(
    vol: &mut CryptedVolume,
    id_ea_file: CryptedFileId,
    data: &[u8],
) -> CoreResult<()> {
    let info = query_file_info(vol, id_ea_file)?;
    if !info.is_ea_file() {
        return Err(CoreError::BadType);
    }
    write_file(vol, id_ea_file, 0, data)?;
    set_file_size(vol, id_ea_file, data.len() as CryptedFilePos)
}

fn write_internal_eas(vol: &mut CryptedVolume, id: CryptedFileId, data: &[u8]) -> CoreResult<()> {
    debug_assert!(data.len() <= MAX_INTERNAL_EAS);
    vol.set_sector_data(
        INFOSECTORFILE_ID,
        info_sector_number(id),
        INTERNAL_EA_OFFSET,
        data,
        FetchFlags::empty(),
    )
}

fn store_eas(vol: &mut CryptedVolume, id: CryptedFileId, data: &[u8]) -> CoreResult<()> {
    let mut info = get_info_and_verify(vol, id)?;

    if data.len() > MAX_INTERNAL_EAS {
        // store externally, creating the EA file on first use
        if info.flags & CFF_EXTEAS == 0 {
            let info2 = CryptedFileInfo {
                flags: CFF_IFEA,
                c_refs: 1,
                file_size: data.len() as CryptedFilePos,
                id_parent: id,
                // uid and gid are always 0 for EA files
                ..Default::default()
            };
            info.id_ea_file = create_base_file(vol, &info2)?;
            info.flags |= CFF_EXTEAS;
        }
        write_external_eas(vol, info.id_ea_file, data)?;
    } else {
        // store internally, deleting a previously attached EA file
        if info.flags & CFF_EXTEAS != 0 {
            destroy_base_file(vol, info.id_ea_file)?;
            info.flags &= !CFF_EXTEAS;
            info.id_ea_file = 0;
        }
        write_internal_eas(vol, id, data)?;
    }

    info.cb_eas = data.len() as CryptedFilePos;
    set_file_info(vol, id, &info)
}

/// Encode and store a file's complete EA list.
pub fn set_eas(vol: &mut CryptedVolume, id: CryptedFileId, eas: &[CryptedEA]) -> CoreResult<()> {
    let data = encode_eas(eas);
    store_eas(vol, id, &data)
}

/// Merge additions into an EA list: same-named entries are replaced, a
/// zero-length value deletes the entry.
pub fn merge_eas(eas: &mut Vec<CryptedEA>, additions: &[CryptedEA]) {
    for addition in additions {
        eas.retain(|ea| !names_eq_ci(&ea.name, &addition.name));
        if !addition.value.is_empty() {
            eas.insert(0, addition.clone());
        }
    }
}

/// Apply merge semantics directly to a file's stored EAs.
pub fn add_eas(vol: &mut CryptedVolume, id: CryptedFileId, additions: &[CryptedEA]) -> CoreResult<()> {
    let mut eas = query_eas(vol, id)?;
    merge_eas(&mut eas, additions);
    set_eas(vol, id, &eas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aefs_lib::basefile::{CFF_IFDIR, CFF_IFREG};
    use crate::aefs_lib::directory::delete_file_and_eas;
    use crate::aefs_lib::infosector::init_isf;
    use crate::aefs_lib::testing::{small_parms, test_volume};
    use crate::aefs_lib::INFOSECTORFILE_ID;

    fn fs_volume() -> (tempfile::TempDir, CryptedVolume) {
        let (dir, mut vol) = test_volume(small_parms());
        vol.create_file(INFOSECTORFILE_ID, 1).unwrap();
        init_isf(&mut vol).unwrap();
        (dir, vol)
    }

    fn new_file(vol: &mut CryptedVolume, type_flags: u32) -> CryptedFileId {
        let info = CryptedFileInfo {
            flags: type_flags | 0o600,
            c_refs: 1,
            ..Default::default()
        };
        create_base_file(vol, &info).unwrap()
    }

    fn ea(name: &str, value: &[u8]) -> CryptedEA {
        CryptedEA {
            name: name.as_bytes().to_vec(),
            value: value.to_vec(),
            flags: 0,
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let list = vec![
            CryptedEA {
                name: b"COMMENT".to_vec(),
                value: b"some value".to_vec(),
                flags: CEF_CRITICAL,
            },
            ea("empty", b""),
            ea("blob", &[0u8, 1, 2, 255]),
        ];
        assert_eq!(decode_eas(&encode_eas(&list)).unwrap(), list);
        assert!(encode_eas(&[]).is_empty());
    }

    #[test]
    fn decode_rejects_malformed_streams() {
        // name without terminator
        assert_eq!(decode_eas(&[1, b'x', b'y']), Err(CoreError::BadEas));
        // value bytes missing
        let mut data = vec![1];
        data.extend_from_slice(b"n\0");
        data.extend_from_slice(&9u32.to_le_bytes());
        data.push(b'v');
        assert_eq!(decode_eas(&data), Err(CoreError::BadEas));
    }

    #[test]
    fn small_eas_stay_internal() {
        let (_dir, mut vol) = fs_volume();
        let id = new_file(&mut vol, CFF_IFREG);

        set_eas(&mut vol, id, &[ea("X", &[7; 50])]).unwrap();

        let info = query_file_info(&mut vol, id).unwrap();
        assert_eq!(info.flags & CFF_EXTEAS, 0);
        assert_eq!(info.id_ea_file, 0);
        assert!(info.cb_eas as usize <= MAX_INTERNAL_EAS);

        assert_eq!(query_eas(&mut vol, id).unwrap(), vec![ea("X", &[7; 50])]);
    }

    #[test]
    fn growing_eas_move_to_an_ea_file() {
        let (_dir, mut vol) = fs_volume();
        let id = new_file(&mut vol, CFF_IFREG);

        set_eas(&mut vol, id, &[ea("X", &[7; 50])]).unwrap();
        set_eas(&mut vol, id, &[ea("X", &[8; 500])]).unwrap();

        let info = query_file_info(&mut vol, id).unwrap();
        assert_ne!(info.flags & CFF_EXTEAS, 0);
        assert_ne!(info.id_ea_file, 0);

        let info2 = query_file_info(&mut vol, info.id_ea_file).unwrap();
        assert!(info2.is_ea_file());
        assert_eq!(info2.id_parent, id);
        assert_eq!(info2.file_size, info.cb_eas);
        assert_eq!(info2.file_size as usize, encode_eas(&[ea("X", &[8; 500])]).len());

        assert_eq!(query_eas(&mut vol, id).unwrap(), vec![ea("X", &[8; 500])]);
    }

    #[test]
    fn shrinking_eas_destroys_the_ea_file() {
        let (_dir, mut vol) = fs_volume();
        let id = new_file(&mut vol, CFF_IFREG);

        set_eas(&mut vol, id, &[ea("X", &[8; 500])]).unwrap();
        let id_ea_file = query_file_info(&mut vol, id).unwrap().id_ea_file;

        set_eas(&mut vol, id, &[ea("X", &[7; 10])]).unwrap();

        let info = query_file_info(&mut vol, id).unwrap();
        assert_eq!(info.flags & CFF_EXTEAS, 0);
        assert_eq!(info.id_ea_file, 0);
        assert_eq!(
            query_file_info(&mut vol, id_ea_file),
            Err(CoreError::BadInfoSector)
        );
    }

    #[test]
    fn merge_replaces_and_deletes() {
        let mut eas = vec![ea("a", b"1"), ea("b", b"2")];
        merge_eas(&mut eas, &[ea("A", b"replaced"), ea("c", b"3"), ea("b", b"")]);

        assert_eq!(eas.len(), 2);
        assert!(eas.contains(&ea("A", b"replaced")));
        assert!(eas.contains(&ea("c", b"3")));
    }

    #[test]
    fn add_eas_applies_merge_to_storage() {
        let (_dir, mut vol) = fs_volume();
        let id = new_file(&mut vol, CFF_IFDIR);

        set_eas(&mut vol, id, &[ea("keep", b"k"), ea("drop", b"d")]).unwrap();
        add_eas(&mut vol, id, &[ea("DROP", b""), ea("new", b"n")]).unwrap();

        let eas = query_eas(&mut vol, id).unwrap();
        assert_eq!(eas.len(), 2);
        assert!(eas.contains(&ea("keep", b"k")));
        assert!(eas.contains(&ea("new", b"n")));
    }

    #[test]
    fn only_ea_capable_types_accepted() {
        let (_dir, mut vol) = fs_volume();
        let id = new_file(&mut vol, CFF_IFEA);
        assert_eq!(query_eas(&mut vol, id), Err(CoreError::BadType));
        assert_eq!(set_eas(&mut vol, id, &[]), Err(CoreError::BadType));
    }

    #[test]
    fn deleting_the_owner_removes_the_ea_file() {
        let (_dir, mut vol) = fs_volume();
        let id = new_file(&mut vol, CFF_IFREG);
        set_eas(&mut vol, id, &[ea("X", &[9; 500])]).unwrap();
        let id_ea_file = query_file_info(&mut vol, id).unwrap().id_ea_file;

        delete_file_and_eas(&mut vol, id).unwrap();
        assert_eq!(query_file_info(&mut vol, id), Err(CoreError::BadInfoSector));
        assert_eq!(
            query_file_info(&mut vol, id_ea_file),
            Err(CoreError::BadInfoSector)
        );
    }
}
