//! Maintains the info sector file (ISF).
//!
//! The ISF is an ordinary storage file accessed under a reserved file
//! ID.  Sector 0 is the free-list sentinel; every other sector either
//! holds the info record of a live file or a link of the free list.

use crate::aefs_lib::err::{CoreError, CoreResult};
use crate::aefs_lib::storage::{CryptedVolume, FetchFlags};
use crate::aefs_lib::{info_sector_number, CryptedFileId, SectorNumber, INFOSECTORFILE_ID};

/// Magic values for allocated and free info sectors.
pub const INFOSECTOR_MAGIC_INUSE: u32 = 0xba38_ed1e;
pub const INFOSECTOR_MAGIC_FREE: u32 = 0x17dc_3b07;

pub const FREE_LINK_SIZE: usize = 12;

/// On-disk link of the ISF free list.  `cs_size` is only meaningful in
/// the sentinel (sector 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeLink {
    pub magic: u32,
    pub id_next_free: CryptedFileId,
    pub cs_size: SectorNumber,
}

impl FreeLink {
    pub fn decode(bytes: &[u8; FREE_LINK_SIZE]) -> FreeLink {
        FreeLink {
            magic: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            id_next_free: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            cs_size: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
        }
    }

    pub fn encode(&self) -> [u8; FREE_LINK_SIZE] {
        let mut bytes = [0; FREE_LINK_SIZE];
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.id_next_free.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.cs_size.to_le_bytes());
        bytes
    }
}

fn read_link(vol: &mut CryptedVolume, sector: SectorNumber) -> CoreResult<FreeLink> {
    let mut bytes = [0; FREE_LINK_SIZE];
    vol.query_sector_data(INFOSECTORFILE_ID, sector, 0, &mut bytes, FetchFlags::empty())?;
    Ok(FreeLink::decode(&bytes))
}

fn write_link(
    vol: &mut CryptedVolume,
    sector: SectorNumber,
    link: &FreeLink,
    flags: FetchFlags,
) -> CoreResult<()> {
    vol.set_sector_data(INFOSECTORFILE_ID, sector, 0, &link.encode(), flags)
}

/// Write the initial sentinel into sector 0 of a freshly created ISF.
pub fn init_isf(vol: &mut CryptedVolume) -> CoreResult<()> {
    let sentinel = FreeLink {
        magic: INFOSECTOR_MAGIC_FREE,
        id_next_free: 0,
        cs_size: 1,
    };
    write_link(vol, 0, &sentinel, FetchFlags::NO_READ)
}

/// Allocate a file ID, growing the ISF when the free list is empty.
/// The caller must overwrite the returned sector with a valid in-use
/// record; not even the magic value is cleared here.
pub fn alloc_id(vol: &mut CryptedVolume) -> CoreResult<CryptedFileId> {
    let mut sentinel = read_link(vol, 0)?;
    if sentinel.magic != INFOSECTOR_MAGIC_FREE {
        return Err(CoreError::IsfCorrupt);
    }
    let mut id_free = sentinel.id_next_free;
    let mut cs_size = sentinel.cs_size;
    if id_free >= cs_size {
        return Err(CoreError::IsfCorrupt);
    }

    let id_new_head;
    if id_free != 0 {
        // the new head is the successor of the current head
        let link = read_link(vol, id_free)?;
        if link.magic != INFOSECTOR_MAGIC_FREE {
            return Err(CoreError::IsfCorrupt);
        }
        id_new_head = link.id_next_free;
        if id_new_head >= cs_size {
            return Err(CoreError::IsfCorrupt);
        }
    } else {
        // free list is empty; grow the ISF
        let cs_grow = vol.parms().cs_isf_grow.max(1);
        vol.suggest_file_allocation(INFOSECTORFILE_ID, cs_size + cs_grow)?;

        // thread the {2..cs_grow}th new sectors into the free list
        for id_clear in cs_size + 1..cs_size + cs_grow {
            let link = FreeLink {
                magic: INFOSECTOR_MAGIC_FREE,
                id_next_free: if id_clear == cs_size + cs_grow - 1 {
                    0
                } else {
                    id_clear + 1
                },
                cs_size: 0,
            };
            write_link(vol, id_clear, &link, FetchFlags::NO_READ)?;
        }

        id_new_head = if cs_grow > 1 { cs_size + 1 } else { 0 };

        // the first new sector is the allocated one; force it into the cache
        id_free = cs_size;
        vol.fetch_sectors(INFOSECTORFILE_ID, id_free, 1, FetchFlags::NO_READ)?;

        cs_size += cs_grow;
    }

    sentinel.id_next_free = id_new_head;
    sentinel.cs_size = cs_size;
    write_link(vol, 0, &sentinel, FetchFlags::empty())?;

    Ok(id_free)
}

/// Return a file ID to the free list (head insertion).
pub fn free_id(vol: &mut CryptedVolume, id: CryptedFileId) -> CoreResult<()> {
    let mut sentinel = read_link(vol, 0)?;
    if sentinel.magic != INFOSECTOR_MAGIC_FREE {
        return Err(CoreError::IsfCorrupt);
    }
    if sentinel.id_next_free >= sentinel.cs_size || id >= sentinel.cs_size {
        return Err(CoreError::IsfCorrupt);
    }

    let link = FreeLink {
        magic: INFOSECTOR_MAGIC_FREE,
        id_next_free: sentinel.id_next_free,
        cs_size: 0,
    };
    write_link(vol, info_sector_number(id), &link, FetchFlags::empty())?;

    sentinel.id_next_free = id;
    write_link(vol, 0, &sentinel, FetchFlags::empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aefs_lib::testing::{small_parms, test_volume};

    fn isf_volume() -> (tempfile::TempDir, CryptedVolume) {
        let (dir, mut vol) = test_volume(small_parms());
        vol.create_file(INFOSECTORFILE_ID, 1).unwrap();
        init_isf(&mut vol).unwrap();
        (dir, vol)
    }

    #[test]
    fn alloc_grows_and_threads_free_list() {
        // cs_isf_grow is 4 in the test parms
        let (_dir, mut vol) = isf_volume();
        assert_eq!(alloc_id(&mut vol).unwrap(), 1);

        let sentinel = read_link(&mut vol, 0).unwrap();
        assert_eq!(sentinel.cs_size, 5);
        assert_eq!(sentinel.id_next_free, 2);

        assert_eq!(alloc_id(&mut vol).unwrap(), 2);
        assert_eq!(alloc_id(&mut vol).unwrap(), 3);
        assert_eq!(alloc_id(&mut vol).unwrap(), 4);

        // list exhausted; next alloc grows again
        assert_eq!(alloc_id(&mut vol).unwrap(), 5);
        assert_eq!(read_link(&mut vol, 0).unwrap().cs_size, 9);
    }

    #[test]
    fn freed_id_is_reused_first() {
        let (_dir, mut vol) = isf_volume();
        let a = alloc_id(&mut vol).unwrap();
        let b = alloc_id(&mut vol).unwrap();
        assert_ne!(a, b);

        free_id(&mut vol, a).unwrap();
        assert_eq!(alloc_id(&mut vol).unwrap(), a);
    }

    #[test]
    fn free_chain_is_consistent() {
        let (_dir, mut vol) = isf_volume();
        let a = alloc_id(&mut vol).unwrap();
        let _b = alloc_id(&mut vol).unwrap();
        free_id(&mut vol, a).unwrap();

        let sentinel = read_link(&mut vol, 0).unwrap();
        let mut seen = 0;
        let mut next = sentinel.id_next_free;
        while next != 0 {
            assert!(next < sentinel.cs_size);
            let link = read_link(&mut vol, next).unwrap();
            assert_eq!(link.magic, INFOSECTOR_MAGIC_FREE);
            next = link.id_next_free;
            seen += 1;
            assert!(seen < sentinel.cs_size, "free list cycle");
        }
        // 5 sectors total: sentinel + 1 live (b) + 3 free (a, 3, 4)
        assert_eq!(seen, 3);
    }

    #[test]
    fn corrupt_sentinel_is_rejected() {
        let (_dir, mut vol) = isf_volume();
        let bogus = FreeLink {
            magic: 0xdeadbeef,
            id_next_free: 0,
            cs_size: 1,
        };
        write_link(&mut vol, 0, &bogus, FetchFlags::empty()).unwrap();
        assert_eq!(alloc_id(&mut vol), Err(CoreError::IsfCorrupt));

        let out_of_range = FreeLink {
            magic: INFOSECTOR_MAGIC_FREE,
            id_next_free: 7,
            cs_size: 1,
        };
        write_link(&mut vol, 0, &out_of_range, FetchFlags::empty()).unwrap();
        assert_eq!(alloc_id(&mut vol), Err(CoreError::IsfCorrupt));
    }
}
