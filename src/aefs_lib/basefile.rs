//! Byte-granular I/O over base files.
//!
//! A base file is one storage file plus one info sector in the ISF.  The
//! info sector carries the metadata below, 48 reserved bytes and up to
//! [`MAX_INTERNAL_EAS`] bytes of internally stored extended attributes,
//! exactly filling the sector payload.

use crate::aefs_lib::codec::PAYLOAD_SIZE;
use crate::aefs_lib::err::{CoreError, CoreResult};
use crate::aefs_lib::infosector::{alloc_id, free_id, INFOSECTOR_MAGIC_INUSE};
use crate::aefs_lib::storage::{CryptedVolume, FetchFlags};
use crate::aefs_lib::{
    info_sector_number, CoreTime, CryptedFileId, CryptedFilePos, SectorNumber, INFOSECTORFILE_ID,
};

/*
 * Flags for encrypted files (CryptedFileInfo.flags).  These are equal
 * to the Unix mode bits, plus a few of our own in the upper range.
 */

/// File has external EAs.
pub const CFF_EXTEAS: u32 = 0o4000000;
/// File has been modified (OS/2 archive bit).
pub const CFF_OS2A: u32 = 0o2000000;
/// System file (OS/2).
pub const CFF_OS2S: u32 = 0o1000000;

pub const CFF_IFMT: u32 = 0o370000;
pub const CFF_IFEA: u32 = 0o200000;
pub const CFF_IFSOCK: u32 = 0o140000;
pub const CFF_IFLNK: u32 = 0o120000;
pub const CFF_IFREG: u32 = 0o100000;
pub const CFF_IFBLK: u32 = 0o060000;
pub const CFF_IFDIR: u32 = 0o040000;
pub const CFF_IFCHR: u32 = 0o020000;
pub const CFF_IFIFO: u32 = 0o010000;

pub const CFF_ISUID: u32 = 0o4000;
pub const CFF_ISGID: u32 = 0o2000;
pub const CFF_ISVTX: u32 = 0o1000;

pub const FILEINFO_SIZE: usize = 72;
pub const FILEINFO_RESERVED: usize = 48;
/// Maximum size of internally stored EAs.
pub const MAX_INTERNAL_EAS: usize = 384;
/// Offset of the internal-EA region within the info sector payload.
pub const INTERNAL_EA_OFFSET: usize = FILEINFO_SIZE + FILEINFO_RESERVED;

const _: () = assert!(INTERNAL_EA_OFFSET + MAX_INTERNAL_EAS == PAYLOAD_SIZE);

/// Metadata of one base file.  `cs_set`, `cb_eas` and `id_ea_file` are
/// ignored by [`create_base_file`] in the structure passed in.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CryptedFileInfo {
    pub flags: u32,
    pub uid: u32,
    pub gid: u32,
    /// Reference count.
    pub c_refs: u32,
    pub file_size: CryptedFilePos,
    /// Number of initialized sectors.
    pub cs_set: SectorNumber,
    pub time_creation: CoreTime,
    pub time_access: CoreTime,
    pub time_write: CoreTime,
    /// Directories and EA files only.
    pub id_parent: CryptedFileId,
    pub cb_eas: CryptedFilePos,
    pub id_ea_file: CryptedFileId,
}

impl CryptedFileInfo {
    pub fn is_dir(&self) -> bool {
        self.flags & CFF_IFMT == CFF_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        self.flags & CFF_IFMT == CFF_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.flags & CFF_IFMT == CFF_IFLNK
    }

    pub fn is_ea_file(&self) -> bool {
        self.flags & CFF_IFMT == CFF_IFEA
    }
}

fn decode_file_info(id: CryptedFileId, bytes: &[u8; FILEINFO_SIZE]) -> CoreResult<CryptedFileInfo> {
    let field = |i: usize| u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());

    if field(0) != INFOSECTOR_MAGIC_INUSE || field(1) != id {
        return Err(CoreError::BadInfoSector);
    }

    Ok(CryptedFileInfo {
        flags: field(2),
        uid: field(3),
        gid: field(4),
        c_refs: field(5),
        file_size: field(6),
        cs_set: field(10),
        time_creation: field(12),
        time_access: field(13),
        time_write: field(14),
        id_parent: field(15),
        cb_eas: field(16),
        id_ea_file: field(17),
    })
}

fn encode_file_info(id: CryptedFileId, info: &CryptedFileInfo) -> [u8; FILEINFO_SIZE] {
    let mut bytes = [0; FILEINFO_SIZE];
    let mut field = |i: usize, v: u32| bytes[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());

    field(0, INFOSECTOR_MAGIC_INUSE);
    field(1, id);
    field(2, info.flags);
    field(3, info.uid);
    field(4, info.gid);
    field(5, info.c_refs);
    field(6, info.file_size);
    field(10, info.cs_set);
    field(12, info.time_creation);
    field(13, info.time_access);
    field(14, info.time_write);
    field(15, info.id_parent);
    field(16, info.cb_eas);
    field(17, info.id_ea_file);

    bytes
}

/// Number of payload sectors needed for a file of `cb_file_size` bytes.
pub fn file_size_to_allocation(cb_file_size: CryptedFilePos) -> SectorNumber {
    if cb_file_size == 0 {
        0
    } else {
        (cb_file_size - 1) / PAYLOAD_SIZE as CryptedFilePos + 1
    }
}

/// Create a new base file.  Either the file is completely created and
/// initialized, or every step is rolled back.
pub fn create_base_file(vol: &mut CryptedVolume, info: &CryptedFileInfo) -> CoreResult<CryptedFileId> {
    let c_sectors = file_size_to_allocation(info.file_size);

    let id = alloc_id(vol)?;

    if let Err(e) = vol.create_file(id, c_sectors) {
        let _ = free_id(vol, id);
        return Err(e);
    }

    let mut info = *info;
    info.cs_set = 0;
    info.cb_eas = 0;
    info.id_ea_file = 0;

    if let Err(e) = set_file_info(vol, id, &info) {
        let _ = destroy_base_file(vol, id);
        return Err(e);
    }

    Ok(id)
}

pub fn destroy_base_file(vol: &mut CryptedVolume, id: CryptedFileId) -> CoreResult<()> {
    if id == 0 {
        return Err(CoreError::InvalidParameter);
    }
    vol.destroy_file(id)?;
    free_id(vol, id)
}

pub fn query_file_info(vol: &mut CryptedVolume, id: CryptedFileId) -> CoreResult<CryptedFileInfo> {
    if id == 0 {
        return Err(CoreError::InvalidParameter);
    }
    let mut bytes = [0; FILEINFO_SIZE];
    vol.query_sector_data(
        INFOSECTORFILE_ID,
        info_sector_number(id),
        0,
        &mut bytes,
        FetchFlags::empty(),
    )?;
    decode_file_info(id, &bytes)
}

pub fn set_file_info(
    vol: &mut CryptedVolume,
    id: CryptedFileId,
    info: &CryptedFileInfo,
) -> CoreResult<()> {
    if id == 0 {
        return Err(CoreError::InvalidParameter);
    }
    vol.set_sector_data(
        INFOSECTORFILE_ID,
        info_sector_number(id),
        0,
        &encode_file_info(id, info),
        FetchFlags::empty(),
    )
}

/// Read bytes from a file.  Reads beyond end-of-file are clamped; the
/// region past the initialized sectors reads as zeros.  Returns the
/// number of bytes stored into `buffer`.
pub fn read_file(
    vol: &mut CryptedVolume,
    id: CryptedFileId,
    fp_start: CryptedFilePos,
    buffer: &mut [u8],
) -> CoreResult<usize> {
    if id == 0 {
        return Err(CoreError::InvalidParameter);
    }

    let info = query_file_info(vol, id)?;

    if fp_start >= info.file_size {
        return Ok(0);
    }
    let mut cb_length = buffer.len().min((info.file_size - fp_start) as usize);

    let mut s_current = fp_start / PAYLOAD_SIZE as CryptedFilePos;
    let mut offset = (fp_start % PAYLOAD_SIZE as CryptedFilePos) as usize;
    let granularity = vol.parms().cs_io_granularity;

    let mut pos = 0;
    while cb_length > 0 && s_current < info.cs_set {
        // fetch at most cs_io_granularity sectors at a time
        let mut cs_extent = ((offset + cb_length - 1) / PAYLOAD_SIZE + 1) as SectorNumber;
        if s_current + cs_extent > info.cs_set {
            cs_extent = info.cs_set - s_current;
        }
        if cs_extent as usize > granularity {
            cs_extent = granularity as SectorNumber;
        }
        vol.fetch_sectors(id, s_current, cs_extent, FetchFlags::empty())?;

        for _ in 0..cs_extent {
            let read = (PAYLOAD_SIZE - offset).min(cb_length);
            vol.query_sector_data(
                id,
                s_current,
                offset,
                &mut buffer[pos..pos + read],
                FetchFlags::empty(),
            )?;
            pos += read;
            cb_length -= read;
            s_current += 1;
            offset = 0;
        }
    }

    // the uninitialized region is logically zero
    if cb_length > 0 {
        buffer[pos..pos + cb_length].fill(0);
        pos += cb_length;
    }

    Ok(pos)
}

/// Materialize zero-filled sectors up to `cs_init`, advancing `cs_set`.
fn zero_sectors(
    vol: &mut CryptedVolume,
    id: CryptedFileId,
    info: &mut CryptedFileInfo,
    cs_init: SectorNumber,
) -> CoreResult<()> {
    let granularity = vol.parms().cs_io_granularity;
    while info.cs_set < cs_init {
        let mut cs_extent = cs_init - info.cs_set;
        if cs_extent as usize > granularity {
            cs_extent = granularity as SectorNumber;
        }
        vol.fetch_sectors(id, info.cs_set, cs_extent, FetchFlags::NO_READ)?;
        info.cs_set += cs_extent;
    }
    Ok(())
}

/// Write bytes to a file, growing it as needed.  Returns the number of
/// bytes written.  Any advance of the initialized-sector count is
/// committed to the info sector even when a later step fails, so
/// re-reads stay consistent with the data already on disk.
pub fn write_file(
    vol: &mut CryptedVolume,
    id: CryptedFileId,
    fp_start: CryptedFilePos,
    data: &[u8],
) -> CoreResult<usize> {
    if id == 0 {
        return Err(CoreError::InvalidParameter);
    }

    let mut info = query_file_info(vol, id)?;

    if data.is_empty() {
        return Ok(0);
    }

    // writes extending beyond end-of-file grow the allocation first
    if fp_start + data.len() as CryptedFilePos > info.file_size {
        set_file_size(vol, id, fp_start + data.len() as CryptedFilePos)?;
        info = query_file_info(vol, id)?;
    }

    let mut s_current = fp_start / PAYLOAD_SIZE as CryptedFilePos;
    let mut offset = (fp_start % PAYLOAD_SIZE as CryptedFilePos) as usize;
    let granularity = vol.parms().cs_io_granularity;
    let mut changed = false;
    let mut written = 0;
    let mut cb_length = data.len();

    // initialize skipped sectors below the start sector
    if s_current > info.cs_set {
        zero_sectors(vol, id, &mut info, s_current)?;
        changed = true;
    }

    while cb_length > 0 {
        // make room for at most cs_io_granularity sectors, reading from
        // disk only those that are partially overwritten
        let mut flags = FetchFlags::NO_READ;
        let mut cs_extent = ((offset + cb_length - 1) / PAYLOAD_SIZE + 1) as SectorNumber;
        if s_current < info.cs_set && (offset != 0 || cb_length < PAYLOAD_SIZE) {
            if offset + cb_length > PAYLOAD_SIZE
                && offset + cb_length < 2 * PAYLOAD_SIZE
                && s_current + 1 < info.cs_set
            {
                cs_extent = 2;
            } else {
                cs_extent = 1;
            }
            flags = FetchFlags::empty();
        } else if cs_extent > 1
            && (offset + cb_length) % PAYLOAD_SIZE != 0
            && s_current + cs_extent - 1 < info.cs_set
        {
            // the batch ends in a partial overwrite of an initialized
            // sector, which must not be materialized zero-filled; leave
            // it for the next round, where it is fetched from disk
            cs_extent -= 1;
        }
        if cs_extent as usize > granularity {
            cs_extent = granularity as SectorNumber;
        }

        if let Err(e) = vol.fetch_sectors(id, s_current, cs_extent, flags) {
            if changed {
                // commit the sectors that were successfully written
                let _ = set_file_info(vol, id, &info);
            }
            return Err(e);
        }

        for _ in 0..cs_extent {
            let write = (PAYLOAD_SIZE - offset).min(cb_length);
            vol.set_sector_data(id, s_current, offset, &data[written..written + write], flags)?;
            written += write;
            cb_length -= write;
            s_current += 1;
            offset = 0;
        }

        if s_current > info.cs_set {
            info.cs_set = s_current;
            changed = true;
        }
    }

    if changed {
        set_file_info(vol, id, &info)?;
    }

    Ok(written)
}

/// Set the size of the file, growing or shrinking the allocation.  On a
/// shrink the tail of the last initialized sector is zeroed so that a
/// later grow cannot expose stale data.
pub fn set_file_size(
    vol: &mut CryptedVolume,
    id: CryptedFileId,
    cb_file_size: CryptedFilePos,
) -> CoreResult<()> {
    if id == 0 {
        return Err(CoreError::InvalidParameter);
    }

    let mut info = query_file_info(vol, id)?;
    let cb_old_size = info.file_size;

    if info.file_size == cb_file_size {
        return Ok(());
    }

    info.file_size = cb_file_size;

    let c_sectors = file_size_to_allocation(cb_file_size);
    if info.cs_set > c_sectors {
        info.cs_set = c_sectors;
    }

    vol.suggest_file_allocation(id, c_sectors)?;
    set_file_info(vol, id, &info)?;

    if info.file_size < cb_old_size
        && (info.file_size as usize) < info.cs_set as usize * PAYLOAD_SIZE
    {
        let offset = info.file_size as usize % PAYLOAD_SIZE;
        let zero = [0u8; PAYLOAD_SIZE];
        vol.set_sector_data(
            id,
            info.cs_set - 1,
            offset,
            &zero[..PAYLOAD_SIZE - offset],
            FetchFlags::empty(),
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aefs_lib::infosector::init_isf;
    use crate::aefs_lib::testing::{small_parms, test_key, test_volume};
    use crate::aefs_lib::utils::now;
    use crate::aefs_lib::CryptedVolumeParms;
    use crate::aefs_lib::SECTOR_SIZE;

    fn fs_volume() -> (tempfile::TempDir, CryptedVolume) {
        let (dir, mut vol) = test_volume(small_parms());
        vol.create_file(INFOSECTORFILE_ID, 1).unwrap();
        init_isf(&mut vol).unwrap();
        (dir, vol)
    }

    fn new_regular_file(vol: &mut CryptedVolume) -> CryptedFileId {
        let info = CryptedFileInfo {
            flags: CFF_IFREG | 0o600,
            c_refs: 1,
            time_creation: now(),
            time_access: now(),
            time_write: now(),
            ..Default::default()
        };
        create_base_file(vol, &info).unwrap()
    }

    #[test]
    fn file_info_roundtrip() {
        let (_dir, mut vol) = fs_volume();
        let id = new_regular_file(&mut vol);

        let mut info = query_file_info(&mut vol, id).unwrap();
        assert!(info.is_regular());
        assert_eq!(info.cs_set, 0);

        info.uid = 1000;
        info.gid = 100;
        info.time_write = 1234567890;
        set_file_info(&mut vol, id, &info).unwrap();
        assert_eq!(query_file_info(&mut vol, id).unwrap(), info);
    }

    #[test]
    fn large_write_survives_remount() {
        let (dir, mut vol) = fs_volume();
        let id = new_regular_file(&mut vol);

        let data = vec![0xAA; 100_000];
        assert_eq!(write_file(&mut vol, id, 0, &data).unwrap(), 100_000);
        vol.flush_volume().unwrap();
        vol.drop_volume().unwrap();

        let mut vol =
            CryptedVolume::access_volume(dir.path(), test_key("rijndael"), small_parms()).unwrap();
        let mut buf = vec![0u8; 100_000];
        assert_eq!(read_file(&mut vol, id, 0, &mut buf).unwrap(), 100_000);
        assert_eq!(buf, data);
    }

    #[test]
    fn prefix_overwrite_keeps_tail() {
        let (_dir, mut vol) = fs_volume();
        let id = new_regular_file(&mut vol);

        write_file(&mut vol, id, 0, &vec![0xAA; 100_000]).unwrap();
        write_file(&mut vol, id, 0, &vec![0xBB; 1000]).unwrap();

        let mut buf = vec![0u8; 100_000];
        assert_eq!(read_file(&mut vol, id, 0, &mut buf).unwrap(), 100_000);
        assert!(buf[..1000].iter().all(|&b| b == 0xBB));
        assert!(buf[1000..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn resized_file_reads_zeros_without_initialization() {
        let (_dir, mut vol) = fs_volume();
        let id = new_regular_file(&mut vol);

        set_file_size(&mut vol, id, 10_000).unwrap();

        let mut buf = vec![0xFFu8; 10_000];
        assert_eq!(read_file(&mut vol, id, 0, &mut buf).unwrap(), 10_000);
        assert!(buf.iter().all(|&b| b == 0));

        let info = query_file_info(&mut vol, id).unwrap();
        assert_eq!(info.file_size, 10_000);
        assert!(info.cs_set <= 20);
    }

    #[test]
    fn sparse_write_zero_fills_the_gap() {
        let (_dir, mut vol) = fs_volume();
        let id = new_regular_file(&mut vol);

        // skip far past the initialized region
        write_file(&mut vol, id, 5000, b"end").unwrap();

        let mut buf = vec![0xFFu8; 5003];
        read_file(&mut vol, id, 0, &mut buf).unwrap();
        assert!(buf[..5000].iter().all(|&b| b == 0));
        assert_eq!(&buf[5000..], b"end");
    }

    #[test]
    fn shrink_zeroes_stale_tail() {
        let (_dir, mut vol) = fs_volume();
        let id = new_regular_file(&mut vol);

        write_file(&mut vol, id, 0, &vec![0xEE; 1000]).unwrap();
        set_file_size(&mut vol, id, 100).unwrap();
        set_file_size(&mut vol, id, 1000).unwrap();

        let mut buf = vec![0xFFu8; 1000];
        assert_eq!(read_file(&mut vol, id, 0, &mut buf).unwrap(), 1000);
        assert!(buf[..100].iter().all(|&b| b == 0xEE));
        assert!(buf[100..].iter().all(|&b| b == 0), "stale bytes re-exposed");
    }

    #[test]
    fn reads_clamp_at_end_of_file() {
        let (_dir, mut vol) = fs_volume();
        let id = new_regular_file(&mut vol);

        write_file(&mut vol, id, 0, b"0123456789").unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(read_file(&mut vol, id, 4, &mut buf).unwrap(), 6);
        assert_eq!(&buf[..6], b"456789");
        assert_eq!(read_file(&mut vol, id, 10, &mut buf).unwrap(), 0);
        assert_eq!(read_file(&mut vol, id, 11, &mut buf).unwrap(), 0);
    }

    #[test]
    fn cs_set_respects_invariants() {
        let (dir, mut vol) = fs_volume();
        let id = new_regular_file(&mut vol);

        write_file(&mut vol, id, 0, &vec![1; 3000]).unwrap();
        let info = query_file_info(&mut vol, id).unwrap();
        assert!(info.cs_set <= (info.file_size as usize / PAYLOAD_SIZE + 1) as u32);

        vol.flush_volume().unwrap();
        let host = std::fs::metadata(dir.path().join(format!("{:08x}.enc", id))).unwrap();
        assert!(info.cs_set as u64 * SECTOR_SIZE as u64 <= host.len());
    }

    #[test]
    fn destroy_returns_id_to_free_list() {
        let (dir, mut vol) = fs_volume();
        let id = new_regular_file(&mut vol);
        write_file(&mut vol, id, 0, b"gone soon").unwrap();

        destroy_base_file(&mut vol, id).unwrap();
        assert!(!dir.path().join(format!("{:08x}.enc", id)).exists());
        assert_eq!(query_file_info(&mut vol, id), Err(CoreError::BadInfoSector));

        // the freed ID is handed out again
        assert_eq!(new_regular_file(&mut vol), id);
    }

    #[test]
    fn create_rolls_back_on_collision() {
        let (_dir, mut vol) = fs_volume();
        let id = new_regular_file(&mut vol);

        // occupy the next ID's storage file so create_file must fail
        let next = id + 1;
        vol.create_file(next, 0).unwrap();
        let info = CryptedFileInfo {
            flags: CFF_IFREG | 0o600,
            c_refs: 1,
            ..Default::default()
        };
        assert_eq!(create_base_file(&mut vol, &info), Err(CoreError::IdExists));

        // the ID went back to the free list
        vol.destroy_file(next).unwrap();
        assert_eq!(create_base_file(&mut vol, &info).unwrap(), next);
    }

    #[test]
    fn bare_volume_parms_accept_defaults() {
        let parms = CryptedVolumeParms::default();
        assert!(parms.max_open_storage_files <= parms.max_crypted_files);
        assert!(parms.cs_io_granularity <= parms.cs_max_cached);
    }
}
