//! Directory access and modification.
//!
//! On disk a directory is a sequence of records: a flag byte, the file
//! ID (4 bytes), the name length (4 bytes) and the name bytes, the whole
//! list terminated by a zero byte.  A zero-length directory file denotes
//! an empty directory.  Entries are kept sorted case-insensitively.

use std::cmp::Ordering;

use crate::aefs_lib::basefile::{
    destroy_base_file, query_file_info, read_file, set_file_info, set_file_size, write_file,
    CFF_EXTEAS,
};
use crate::aefs_lib::err::{CoreError, CoreResult};
use crate::aefs_lib::storage::CryptedVolume;
use crate::aefs_lib::utils::{compare_names_ci, names_eq_ci};
use crate::aefs_lib::{CryptedFileId, CryptedFilePos};

/// Set on every non-terminator flag byte; on-disk only.
pub const CDF_NOT_EOL: u8 = 1;
pub const CDF_HIDDEN: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptedDirEntry {
    pub name: Vec<u8>,
    pub id: CryptedFileId,
    pub flags: u8,
}

fn is_path_separator(c: u8) -> bool {
    c == b'/' || c == b'\\'
}

/// Decode the on-disk byte stream into an ordered entry list.
pub fn decode_dir(mut data: &[u8]) -> CoreResult<Vec<CryptedDirEntry>> {
    let mut entries = Vec::new();

    while !data.is_empty() && data[0] != 0 {
        let flags = data[0] & !CDF_NOT_EOL;
        data = &data[1..];

        if data.len() < 8 {
            return Err(CoreError::BadDirectory);
        }
        let id = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let cb_name = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
        data = &data[8..];

        if data.len() < cb_name {
            return Err(CoreError::BadDirectory);
        }
        let name = data[..cb_name].to_vec();
        data = &data[cb_name..];

        entries.push(CryptedDirEntry { name, id, flags });
    }

    if data.len() != 1 {
        return Err(CoreError::BadDirectory);
    }

    Ok(entries)
}

/// Encode an entry list into the on-disk byte stream.
pub fn encode_dir(entries: &[CryptedDirEntry]) -> Vec<u8> {
    let size: usize = 1 + entries.iter().map(|e| 9 + e.name.len()).sum::<usize>();
    let mut data = Vec::with_capacity(size);

    for entry in entries {
        data.push(entry.flags | CDF_NOT_EOL);
        data.extend_from_slice(&entry.id.to_le_bytes());
        data.extend_from_slice(&(entry.name.len() as u32).to_le_bytes());
        data.extend_from_slice(&entry.name);
    }
    data.push(0);

    data
}

/// Read and decode a directory file.
pub fn query_dir_entries(
    vol: &mut CryptedVolume,
    id: CryptedFileId,
) -> CoreResult<Vec<CryptedDirEntry>> {
    let info = query_file_info(vol, id)?;

    if !info.is_dir() {
        return Err(CoreError::NotDirectory);
    }
    if info.file_size == 0 {
        return Ok(Vec::new());
    }

    let mut buffer = vec![0u8; info.file_size as usize];
    let read = read_file(vol, id, 0, &mut buffer)?;
    decode_dir(&buffer[..read])
}

/// Encode and write a directory file, truncating it to the exact size.
pub fn set_dir_entries(
    vol: &mut CryptedVolume,
    id: CryptedFileId,
    entries: &[CryptedDirEntry],
) -> CoreResult<()> {
    if entries.is_empty() {
        return set_file_size(vol, id, 0);
    }

    let data = encode_dir(entries);
    let written = write_file(vol, id, 0, &data)?;
    debug_assert_eq!(written, data.len());

    set_file_size(vol, id, data.len() as CryptedFilePos)
}

/// Resolve a path relative to a starting directory.  Components are
/// separated by `/` or `\` and matched case-insensitively; an empty path
/// names the starting directory itself.  Returns the terminal ID plus a
/// copy of its directory entry (a synthetic one for the start).
pub fn query_id_from_path(
    vol: &mut CryptedVolume,
    id_start_dir: CryptedFileId,
    path: &str,
) -> CoreResult<(CryptedFileId, CryptedDirEntry)> {
    let mut id = id_start_dir;
    let mut found = CryptedDirEntry {
        name: Vec::new(),
        id,
        flags: 0,
    };

    let mut path = path.as_bytes();
    loop {
        while !path.is_empty() && is_path_separator(path[0]) {
            path = &path[1..];
        }
        if path.is_empty() {
            break;
        }

        let end = path
            .iter()
            .position(|&c| is_path_separator(c))
            .unwrap_or(path.len());
        let component = &path[..end];

        let entries = query_dir_entries(vol, id)?;
        let entry = entries
            .iter()
            .find(|e| names_eq_ci(&e.name, component))
            .ok_or(CoreError::FileNotFound)?;

        id = entry.id;
        found = entry.clone();

        path = &path[end..];
    }

    Ok((id, found))
}

/// Insert into a sorted entry list; a case-insensitive name collision is
/// an error.
fn add_to_list(
    entries: &mut Vec<CryptedDirEntry>,
    name: &[u8],
    id: CryptedFileId,
    flags: u8,
) -> CoreResult<()> {
    let mut insert_at = entries.len();
    for (i, entry) in entries.iter().enumerate() {
        match compare_names_ci(&entry.name, name) {
            Ordering::Equal => return Err(CoreError::FileExists),
            Ordering::Greater => {
                insert_at = i;
                break;
            }
            Ordering::Less => (),
        }
    }
    entries.insert(
        insert_at,
        CryptedDirEntry {
            name: name.to_vec(),
            id,
            flags,
        },
    );
    Ok(())
}

fn remove_from_list(entries: &mut Vec<CryptedDirEntry>, name: &[u8]) -> Option<CryptedDirEntry> {
    let at = entries.iter().position(|e| names_eq_ci(&e.name, name))?;
    Some(entries.remove(at))
}

fn valid_name(name: &[u8]) -> bool {
    !name.is_empty() && !name.iter().any(|&c| c == 0 || is_path_separator(c))
}

/// Add an entry to a directory, keeping the case-insensitive sort order.
pub fn add_dir_entry(
    vol: &mut CryptedVolume,
    id_dir: CryptedFileId,
    name: &[u8],
    id_file: CryptedFileId,
    flags: u8,
) -> CoreResult<()> {
    if !valid_name(name) {
        return Err(CoreError::InvalidName);
    }

    let mut entries = query_dir_entries(vol, id_dir)?;
    add_to_list(&mut entries, name, id_file, flags)?;
    set_dir_entries(vol, id_dir, &entries)
}

/// Remove an entry from a directory without reinserting it anywhere.
/// Returns the ID the entry referenced.
pub fn remove_dir_entry(
    vol: &mut CryptedVolume,
    id_dir: CryptedFileId,
    name: &[u8],
) -> CoreResult<CryptedFileId> {
    let mut entries = query_dir_entries(vol, id_dir)?;
    let entry = remove_from_list(&mut entries, name).ok_or(CoreError::FileNotFound)?;
    set_dir_entries(vol, id_dir, &entries)?;
    Ok(entry.id)
}

/// Move (or rename) a directory entry.  A moved directory gets its
/// parent pointer updated.
pub fn move_dir_entry(
    vol: &mut CryptedVolume,
    src_name: &[u8],
    id_src_dir: CryptedFileId,
    dst_name: &[u8],
    id_dst_dir: CryptedFileId,
) -> CoreResult<()> {
    if id_dst_dir == 0 {
        return Err(CoreError::InvalidParameter);
    }

    let mut src_entries = query_dir_entries(vol, id_src_dir)?;
    let entry = remove_from_list(&mut src_entries, src_name).ok_or(CoreError::FileNotFound)?;

    if id_src_dir == id_dst_dir {
        // simple rename
        add_to_list(&mut src_entries, dst_name, entry.id, entry.flags)?;
    } else {
        add_dir_entry(vol, id_dst_dir, dst_name, entry.id, entry.flags)?;
    }

    set_dir_entries(vol, id_src_dir, &src_entries)?;

    if id_src_dir != id_dst_dir {
        let mut info = query_file_info(vol, entry.id)?;
        if info.is_dir() {
            info.id_parent = id_dst_dir;
            set_file_info(vol, entry.id, &info)?;
        }
    }

    Ok(())
}

/// Destroy a base file along with its external EA file, if any.
pub fn delete_file_and_eas(vol: &mut CryptedVolume, id: CryptedFileId) -> CoreResult<()> {
    let info = query_file_info(vol, id)?;

    let mut final_result = Ok(());
    if !info.is_ea_file() && info.flags & CFF_EXTEAS != 0 {
        final_result = destroy_base_file(vol, info.id_ea_file);
    }

    destroy_base_file(vol, id)?;
    final_result
}
