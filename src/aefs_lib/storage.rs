//! Storage and cache management.
//!
//! A [`CryptedVolume`] owns, per file ID, at most one in-memory file
//! record and at most one open host file, plus a bounded cache of
//! decrypted sectors.  Files and sectors live in slab arenas and are
//! linked into MRU lists through slot indices; lookups go through hash
//! maps keyed by file ID and (file ID, sector number).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use host_io::{delete_file, file_exists, Cred, HostFile, OpenFlags, SysError};
use log::{debug, warn};

use crate::aefs_lib::cipher::Key;
use crate::aefs_lib::codec::{
    decrypt_sector_data, encrypt_sector_data, CryptoFlags, SectorData, PAYLOAD_SIZE, SECTOR_SIZE,
};
use crate::aefs_lib::err::{CoreError, CoreResult};
use crate::aefs_lib::{CryptedFileId, SectorNumber};

bitflags! {
    /// Flags for [`CryptedVolume::fetch_sectors`] and the sector data
    /// accessors.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FetchFlags: u32 {
        /// Do not read the sectors from disk; materialize zero-filled
        /// dirty sectors instead.
        const NO_READ = 0x01;
        /// Keep sectors with a bad checksum in the cache.  `BadChecksum`
        /// is still returned.
        const ADD_BAD = 0x02;
    }
}

/// Invoked on every 0<->1 transition of the volume's dirty sector count.
pub type DirtyCallback = Box<dyn FnMut(bool)>;

pub struct CryptedVolumeParms {
    pub crypto_flags: CryptoFlags,
    pub open_flags: OpenFlags,
    pub cred: Cred,
    pub read_only: bool,
    /// > 0
    pub max_crypted_files: usize,
    /// > 0, <= max_crypted_files
    pub max_open_storage_files: usize,
    /// > 0
    pub cs_max_cached: usize,
    /// > 0, <= cs_max_cached
    pub cs_io_granularity: usize,
    /// > 0
    pub cs_isf_grow: SectorNumber,
    pub dirty_callback: Option<DirtyCallback>,
}

impl Default for CryptedVolumeParms {
    fn default() -> Self {
        CryptedVolumeParms {
            crypto_flags: CryptoFlags::empty(),
            open_flags: OpenFlags::READWRITE | OpenFlags::DENYWRITE,
            cred: Cred::default(),
            read_only: false,
            max_crypted_files: 512,
            max_open_storage_files: 8,
            cs_max_cached: 1024,
            cs_io_granularity: 512,
            cs_isf_grow: 64,
            dirty_callback: None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CryptedVolumeStats {
    pub c_crypted_files: usize,
    pub c_open_storage_files: usize,
    pub cs_in_cache: usize,
    pub cs_dirty: usize,
}

struct CryptedFile {
    id: CryptedFileId,
    storage: Option<HostFile>,
    cs_dirty: usize,
    /// Head of this file's chain of cached sectors.
    first_sector: Option<usize>,
    prev_mru: Option<usize>,
    next_mru: Option<usize>,
    prev_open: Option<usize>,
    next_open: Option<usize>,
}

struct CryptedSector {
    file: usize,
    number: SectorNumber,
    dirty: bool,
    data: SectorData,
    prev_in_file: Option<usize>,
    next_in_file: Option<usize>,
    prev_mru: Option<usize>,
    next_mru: Option<usize>,
}

pub struct CryptedVolume {
    base_path: PathBuf,
    key: Key,
    parms: CryptedVolumeParms,

    files: Vec<Option<CryptedFile>>,
    free_file_slots: Vec<usize>,
    file_index: HashMap<CryptedFileId, usize>,
    c_crypted_files: usize,
    file_mru_head: Option<usize>,
    file_mru_tail: Option<usize>,

    c_open_storage_files: usize,
    open_head: Option<usize>,
    open_tail: Option<usize>,

    sectors: Vec<Option<CryptedSector>>,
    free_sector_slots: Vec<usize>,
    sector_index: HashMap<(CryptedFileId, SectorNumber), usize>,
    cs_in_cache: usize,
    sector_mru_head: Option<usize>,
    sector_mru_tail: Option<usize>,
    cs_dirty: usize,
}

impl CryptedVolume {
    pub fn access_volume(
        base_path: &Path,
        key: Key,
        mut parms: CryptedVolumeParms,
    ) -> CoreResult<CryptedVolume> {
        if parms.max_open_storage_files < 1
            || parms.cs_max_cached < 1
            || parms.cs_io_granularity < 1
        {
            return Err(CoreError::InvalidParameter);
        }
        if SECTOR_SIZE % key.block_len() != 0 {
            return Err(CoreError::InvalidParameter);
        }
        if parms.read_only {
            parms
                .open_flags
                .remove(OpenFlags::READWRITE | OpenFlags::WRITEONLY);
        }
        Ok(CryptedVolume {
            base_path: base_path.to_path_buf(),
            key,
            parms,
            files: Vec::new(),
            free_file_slots: Vec::new(),
            file_index: HashMap::new(),
            c_crypted_files: 0,
            file_mru_head: None,
            file_mru_tail: None,
            c_open_storage_files: 0,
            open_head: None,
            open_tail: None,
            sectors: Vec::new(),
            free_sector_slots: Vec::new(),
            sector_index: HashMap::new(),
            cs_in_cache: 0,
            sector_mru_head: None,
            sector_mru_tail: None,
            cs_dirty: 0,
        })
    }

    /// Flush everything and release the volume.
    pub fn drop_volume(mut self) -> CoreResult<()> {
        while let Some(slot) = self.file_mru_head {
            self.drop_file_slot(slot)?;
        }
        debug_assert_eq!(self.cs_in_cache, 0);
        debug_assert_eq!(self.cs_dirty, 0);
        Ok(())
    }

    pub fn parms(&self) -> &CryptedVolumeParms {
        &self.parms
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub(crate) fn key(&self) -> &Key {
        &self.key
    }

    pub fn stats(&self) -> CryptedVolumeStats {
        CryptedVolumeStats {
            c_crypted_files: self.c_crypted_files,
            c_open_storage_files: self.c_open_storage_files,
            cs_in_cache: self.cs_in_cache,
            cs_dirty: self.cs_dirty,
        }
    }

    /*
     * Arena access.  Slot validity is an internal invariant.
     */

    fn file(&self, slot: usize) -> &CryptedFile {
        self.files[slot].as_ref().unwrap()
    }

    fn file_mut(&mut self, slot: usize) -> &mut CryptedFile {
        self.files[slot].as_mut().unwrap()
    }

    fn sector(&self, slot: usize) -> &CryptedSector {
        self.sectors[slot].as_ref().unwrap()
    }

    fn sector_mut(&mut self, slot: usize) -> &mut CryptedSector {
        self.sectors[slot].as_mut().unwrap()
    }

    /*
     * Files.
     */

    fn add_file_to_mru(&mut self, slot: usize) {
        let old_head = self.file_mru_head;
        {
            let f = self.file_mut(slot);
            f.prev_mru = None;
            f.next_mru = old_head;
        }
        match old_head {
            Some(h) => self.file_mut(h).prev_mru = Some(slot),
            None => self.file_mru_tail = Some(slot),
        }
        self.file_mru_head = Some(slot);
        self.c_crypted_files += 1;
    }

    fn remove_file_from_mru(&mut self, slot: usize) {
        self.c_crypted_files -= 1;
        let (prev, next) = {
            let f = self.file(slot);
            (f.prev_mru, f.next_mru)
        };
        match prev {
            Some(p) => self.file_mut(p).next_mru = next,
            None => self.file_mru_head = next,
        }
        match next {
            Some(n) => self.file_mut(n).prev_mru = prev,
            None => self.file_mru_tail = prev,
        }
    }

    fn add_file_to_open_list(&mut self, slot: usize) {
        let old_head = self.open_head;
        {
            let f = self.file_mut(slot);
            f.prev_open = None;
            f.next_open = old_head;
        }
        match old_head {
            Some(h) => self.file_mut(h).prev_open = Some(slot),
            None => self.open_tail = Some(slot),
        }
        self.open_head = Some(slot);
        self.c_open_storage_files += 1;
    }

    fn remove_file_from_open_list(&mut self, slot: usize) {
        self.c_open_storage_files -= 1;
        let (prev, next) = {
            let f = self.file(slot);
            (f.prev_open, f.next_open)
        };
        match prev {
            Some(p) => self.file_mut(p).next_open = next,
            None => self.open_head = next,
        }
        match next {
            Some(n) => self.file_mut(n).prev_open = prev,
            None => self.open_tail = prev,
        }
    }

    fn storage_path(&self, id: CryptedFileId) -> PathBuf {
        self.base_path.join(format!("{:08x}.enc", id))
    }

    fn storage_file_exists(&self, id: CryptedFileId) -> CoreResult<bool> {
        Ok(file_exists(&self.storage_path(id))?)
    }

    /// Close the file's storage handle, if any.
    fn close_storage_file(&mut self, slot: usize) -> CoreResult<()> {
        if self.file(slot).storage.is_none() {
            return Ok(());
        }
        self.file_mut(slot).storage = None;
        self.remove_file_from_open_list(slot);
        Ok(())
    }

    /// Make sure the file's storage file is open.  Already open means a
    /// promotion to the head of the open-MRU list; otherwise the pool is
    /// shrunk below its cap first and the host file opened or created.
    fn open_storage_file(&mut self, slot: usize, create: bool, initial_size: u64) -> CoreResult<()> {
        if self.file(slot).storage.is_some() {
            self.remove_file_from_open_list(slot);
            self.add_file_to_open_list(slot);
            return Ok(());
        }

        if self.c_open_storage_files >= self.parms.max_open_storage_files {
            self.shrink_open_storage_files(self.parms.max_open_storage_files - 1)?;
        }

        let path = self.storage_path(self.file(slot).id);
        let storage = if create {
            HostFile::create(&path, self.parms.open_flags, initial_size, self.parms.cred)?
        } else {
            HostFile::open(&path, self.parms.open_flags, self.parms.cred)?
        };
        self.file_mut(slot).storage = Some(storage);
        self.add_file_to_open_list(slot);
        Ok(())
    }

    /// Reduce the number of open storage files to `c_files`.
    pub fn shrink_open_storage_files(&mut self, c_files: usize) -> CoreResult<()> {
        while self.c_open_storage_files > c_files {
            let tail = self.open_tail.unwrap();
            self.close_storage_file(tail)?;
        }
        Ok(())
    }

    /// Get (or materialize) the in-memory record for a file ID and
    /// promote it in the MRU list.  Does not touch the storage file.
    fn access_file(&mut self, id: CryptedFileId) -> CoreResult<usize> {
        if id == 0 {
            return Err(CoreError::InvalidParameter);
        }

        if let Some(&slot) = self.file_index.get(&id) {
            self.remove_file_from_mru(slot);
            self.add_file_to_mru(slot);
            return Ok(slot);
        }

        if self.c_crypted_files >= self.parms.max_crypted_files {
            if let Err(e) = self.shrink_crypted_files(self.parms.max_crypted_files - 1) {
                warn!("shrinking file records failed: {}", e);
            }
        }

        let file = CryptedFile {
            id,
            storage: None,
            cs_dirty: 0,
            first_sector: None,
            prev_mru: None,
            next_mru: None,
            prev_open: None,
            next_open: None,
        };
        let slot = match self.free_file_slots.pop() {
            Some(i) => {
                self.files[i] = Some(file);
                i
            }
            None => {
                self.files.push(Some(file));
                self.files.len() - 1
            }
        };
        self.add_file_to_mru(slot);
        self.file_index.insert(id, slot);
        Ok(slot)
    }

    /// Remove the file record from memory: flush its dirty sectors, evict
    /// everything it has cached and close its storage file.
    fn drop_file_slot(&mut self, slot: usize) -> CoreResult<()> {
        let id = self.file(slot).id;
        self.flush_file(id)?;
        self.delete_high_sectors(slot, 0);
        self.close_storage_file(slot)?;
        self.remove_file_from_mru(slot);
        self.file_index.remove(&id);
        self.files[slot] = None;
        self.free_file_slots.push(slot);
        Ok(())
    }

    fn shrink_crypted_files(&mut self, c_files: usize) -> CoreResult<()> {
        while self.c_crypted_files > c_files {
            let tail = self.file_mru_tail.unwrap();
            self.drop_file_slot(tail)?;
        }
        Ok(())
    }

    /// Create a storage file with the given ID and an advisory initial
    /// allocation.  The content of the allocated sectors is undefined.
    pub fn create_file(&mut self, id: CryptedFileId, cs_preallocate: SectorNumber) -> CoreResult<()> {
        if self.parms.read_only {
            return Err(CoreError::ReadOnly);
        }
        if self.storage_file_exists(id)? {
            return Err(CoreError::IdExists);
        }
        let slot = self.access_file(id)?;
        if let Err(e) =
            self.open_storage_file(slot, true, cs_preallocate as u64 * SECTOR_SIZE as u64)
        {
            let _ = self.drop_file_slot(slot);
            return Err(e);
        }
        Ok(())
    }

    /// Drop the file from memory (without flushing its sectors) and
    /// delete the associated storage file.
    pub fn destroy_file(&mut self, id: CryptedFileId) -> CoreResult<()> {
        if self.parms.read_only {
            return Err(CoreError::ReadOnly);
        }
        let slot = self.access_file(id)?;
        let path = self.storage_path(id);
        self.delete_high_sectors(slot, 0);
        self.drop_file_slot(slot)?;
        delete_file(&path, self.parms.cred)?;
        Ok(())
    }

    /// Suggest growing or truncating the storage file to `cs_allocate`
    /// sectors.  Growing is advisory; cached sectors past the new
    /// allocation are discarded without flushing.
    pub fn suggest_file_allocation(
        &mut self,
        id: CryptedFileId,
        cs_allocate: SectorNumber,
    ) -> CoreResult<()> {
        if self.parms.read_only {
            return Err(CoreError::ReadOnly);
        }
        let slot = self.access_file(id)?;
        self.delete_high_sectors(slot, cs_allocate);
        self.open_storage_file(slot, false, 0)?;
        let storage = self.file_mut(slot).storage.as_mut().unwrap();
        storage.set_size(cs_allocate as u64 * SECTOR_SIZE as u64)?;
        Ok(())
    }

    /*
     * Sectors & cache management.
     */

    fn add_sector_to_mru(&mut self, slot: usize) {
        let old_head = self.sector_mru_head;
        {
            let s = self.sector_mut(slot);
            s.prev_mru = None;
            s.next_mru = old_head;
        }
        match old_head {
            Some(h) => self.sector_mut(h).prev_mru = Some(slot),
            None => self.sector_mru_tail = Some(slot),
        }
        self.sector_mru_head = Some(slot);
    }

    fn remove_sector_from_mru(&mut self, slot: usize) {
        let (prev, next) = {
            let s = self.sector(slot);
            (s.prev_mru, s.next_mru)
        };
        match prev {
            Some(p) => self.sector_mut(p).next_mru = next,
            None => self.sector_mru_head = next,
        }
        match next {
            Some(n) => self.sector_mut(n).prev_mru = prev,
            None => self.sector_mru_tail = prev,
        }
    }

    /// Add a sector to the cache.  The dirty flag is initially clear.
    fn add_sector(&mut self, fslot: usize, number: SectorNumber, data: SectorData) -> usize {
        let id = self.file(fslot).id;
        let sector = CryptedSector {
            file: fslot,
            number,
            dirty: false,
            data,
            prev_in_file: None,
            next_in_file: None,
            prev_mru: None,
            next_mru: None,
        };
        let slot = match self.free_sector_slots.pop() {
            Some(i) => {
                self.sectors[i] = Some(sector);
                i
            }
            None => {
                self.sectors.push(Some(sector));
                self.sectors.len() - 1
            }
        };
        self.cs_in_cache += 1;
        self.add_sector_to_mru(slot);

        let head = self.file(fslot).first_sector;
        self.sector_mut(slot).next_in_file = head;
        if let Some(h) = head {
            self.sector_mut(h).prev_in_file = Some(slot);
        }
        self.file_mut(fslot).first_sector = Some(slot);

        self.sector_index.insert((id, number), slot);
        slot
    }

    /// Look up a cached sector and promote it to the head of the MRU
    /// list.
    fn query_cached_sector(&mut self, id: CryptedFileId, number: SectorNumber) -> Option<usize> {
        let slot = *self.sector_index.get(&(id, number))?;
        self.remove_sector_from_mru(slot);
        self.add_sector_to_mru(slot);
        Some(slot)
    }

    fn delete_sector(&mut self, slot: usize) {
        if self.sector(slot).dirty {
            self.clear_dirty_flag(slot);
        }
        self.cs_in_cache -= 1;
        self.remove_sector_from_mru(slot);

        let (fslot, number, prev, next) = {
            let s = self.sector(slot);
            (s.file, s.number, s.prev_in_file, s.next_in_file)
        };
        match prev {
            Some(p) => self.sector_mut(p).next_in_file = next,
            None => self.file_mut(fslot).first_sector = next,
        }
        if let Some(n) = next {
            self.sector_mut(n).prev_in_file = prev;
        }

        let id = self.file(fslot).id;
        self.sector_index.remove(&(id, number));
        self.sectors[slot] = None;
        self.free_sector_slots.push(slot);
    }

    /// Delete all the file's cached sectors with numbers >= `s`, without
    /// flushing dirty ones.
    fn delete_high_sectors(&mut self, fslot: usize, s: SectorNumber) {
        let mut doomed = Vec::new();
        let mut p = self.file(fslot).first_sector;
        while let Some(slot) = p {
            let sector = self.sector(slot);
            p = sector.next_in_file;
            if sector.number >= s {
                doomed.push(slot);
            }
        }
        for slot in doomed {
            self.delete_sector(slot);
        }
    }

    fn dirty_sector(&mut self, slot: usize) {
        if !self.sector(slot).dirty {
            self.sector_mut(slot).dirty = true;
            let fslot = self.sector(slot).file;
            self.file_mut(fslot).cs_dirty += 1;
            self.cs_dirty += 1;
            if self.cs_dirty == 1 {
                if let Some(cb) = self.parms.dirty_callback.as_mut() {
                    cb(true);
                }
            }
        }
    }

    fn clear_dirty_flag(&mut self, slot: usize) {
        if self.sector(slot).dirty {
            self.sector_mut(slot).dirty = false;
            let fslot = self.sector(slot).file;
            self.file_mut(fslot).cs_dirty -= 1;
            self.cs_dirty -= 1;
            if self.cs_dirty == 0 {
                if let Some(cb) = self.parms.dirty_callback.as_mut() {
                    cb(false);
                }
            }
        }
    }

    /// Evict least-recently-used sectors to make room for `cs_req` new
    /// ones, skipping the exclusion region (the sectors being fetched).
    /// Hitting a dirty eviction candidate triggers one full volume flush.
    fn purge_cache(
        &mut self,
        mut cs_req: usize,
        excl_file: usize,
        s_start: SectorNumber,
        cs_extent: SectorNumber,
    ) -> CoreResult<()> {
        let mut p = self.sector_mru_tail;

        while cs_req > 0 {
            let slot = loop {
                match p {
                    Some(slot) => {
                        let sector = self.sector(slot);
                        if sector.file == excl_file
                            && sector.number >= s_start
                            && sector.number < s_start + cs_extent
                        {
                            p = sector.prev_mru;
                        } else {
                            break slot;
                        }
                    }
                    None => return Err(CoreError::CacheOverflow),
                }
            };

            if self.sector(slot).dirty {
                // happens at most once
                self.flush_volume()?;
            }

            let prev = self.sector(slot).prev_mru;
            self.delete_sector(slot);
            p = prev;
            cs_req -= 1;
        }

        Ok(())
    }

    /// Read ciphertext for a run of sectors from the storage file.
    fn read_buffer(&mut self, fslot: usize, s_start: SectorNumber, count: usize) -> CoreResult<Vec<u8>> {
        self.open_storage_file(fslot, false, 0)?;
        let mut buf = vec![0u8; count * SECTOR_SIZE];
        let storage = self.file_mut(fslot).storage.as_mut().unwrap();
        storage.set_pos(s_start as u64 * SECTOR_SIZE as u64)?;
        let read = storage.read(&mut buf)?;
        if read != buf.len() {
            return Err(CoreError::Sys(SysError::Io));
        }
        Ok(buf)
    }

    /// Read one run of adjacent sectors into the cache.
    fn read_sector_extent(
        &mut self,
        fslot: usize,
        s_start: SectorNumber,
        count: usize,
        flags: FetchFlags,
    ) -> CoreResult<()> {
        let mut final_result = Ok(());
        let buf = self.read_buffer(fslot, s_start, count)?;

        for i in 0..count {
            let mut data = SectorData::new();
            let result = decrypt_sector_data(
                &buf[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE],
                &mut data,
                &self.key,
                self.parms.crypto_flags,
            );
            match result {
                Ok(()) => {
                    self.add_sector(fslot, s_start + i as SectorNumber, data);
                }
                Err(e) if flags.contains(FetchFlags::ADD_BAD) => {
                    self.add_sector(fslot, s_start + i as SectorNumber, data);
                    final_result = Err(e);
                }
                Err(e) => return Err(e),
            }
        }

        final_result
    }

    /// Materialize the given missing sectors, reading adjacent ones in a
    /// single operation.
    fn read_sectors(
        &mut self,
        fslot: usize,
        missing: &[SectorNumber],
        flags: FetchFlags,
    ) -> CoreResult<()> {
        let mut final_result = Ok(());
        let mut i = 0;

        while i < missing.len() {
            if flags.contains(FetchFlags::NO_READ) {
                let slot = self.add_sector(fslot, missing[i], SectorData::new());
                self.dirty_sector(slot);
                i += 1;
            } else {
                let mut c = 1;
                while i + c < missing.len() && missing[i + c] == missing[i] + c as SectorNumber {
                    c += 1;
                }
                match self.read_sector_extent(fslot, missing[i], c, flags) {
                    Ok(()) => (),
                    Err(CoreError::BadChecksum) if flags.contains(FetchFlags::ADD_BAD) => {
                        final_result = Err(CoreError::BadChecksum);
                    }
                    Err(e) => return Err(e),
                }
                i += c;
            }
        }

        final_result
    }

    /// Make sure the given sector range is resident in the cache.
    /// `cs_extent` may not exceed the cache size.
    pub fn fetch_sectors(
        &mut self,
        id: CryptedFileId,
        s_start: SectorNumber,
        cs_extent: SectorNumber,
        flags: FetchFlags,
    ) -> CoreResult<()> {
        let fslot = self.access_file(id)?;

        if cs_extent == 0 {
            return Ok(());
        }
        if cs_extent as usize > self.parms.cs_max_cached {
            return Err(CoreError::CacheOverflow);
        }

        let mut missing = Vec::new();
        for i in 0..cs_extent {
            if self.query_cached_sector(id, s_start + i).is_none() {
                missing.push(s_start + i);
            }
        }
        if missing.is_empty() {
            return Ok(());
        }

        if self.cs_in_cache + missing.len() > self.parms.cs_max_cached {
            let cs_req = self.cs_in_cache - (self.parms.cs_max_cached - missing.len());
            self.purge_cache(cs_req, fslot, s_start, cs_extent)?;
        }

        self.read_sectors(fslot, &missing, flags)
    }

    /// Write ciphertext for a run of sectors through the storage pool.
    fn write_buffer(&mut self, fslot: usize, s_start: SectorNumber, buf: &[u8]) -> CoreResult<()> {
        debug_assert!(!self.parms.read_only);
        self.open_storage_file(fslot, false, 0)?;
        let storage = self.file_mut(fslot).storage.as_mut().unwrap();
        storage.set_pos(s_start as u64 * SECTOR_SIZE as u64)?;
        let written = storage.write(buf)?;
        if written != buf.len() {
            return Err(CoreError::Sys(SysError::Io));
        }
        Ok(())
    }

    /// Flush the given sectors; clean ones are skipped.  The slice must
    /// be sorted by (file, sector number) so adjacent dirty sectors go
    /// out in one write.
    fn flush_sector_slots(&mut self, slots: &[usize]) -> CoreResult<()> {
        let mut i = 0;
        while i < slots.len() {
            if !self.sector(slots[i]).dirty {
                i += 1;
                continue;
            }

            let first = self.sector(slots[i]);
            let (run_file, run_start) = (first.file, first.number);
            let mut c = 1;
            while i + c < slots.len() {
                let s = self.sector(slots[i + c]);
                if s.dirty && s.file == run_file && s.number == run_start + c as SectorNumber {
                    c += 1;
                } else {
                    break;
                }
            }

            let mut buf = vec![0u8; c * SECTOR_SIZE];
            for j in 0..c {
                self.sector_mut(slots[i + j]).data.randomize_nonce();
            }
            for j in 0..c {
                let sector = self.sectors[slots[i + j]].as_ref().unwrap();
                encrypt_sector_data(
                    &sector.data,
                    &mut buf[j * SECTOR_SIZE..(j + 1) * SECTOR_SIZE],
                    &self.key,
                    self.parms.crypto_flags,
                );
            }

            self.write_buffer(run_file, run_start, &buf)?;
            for j in 0..c {
                self.clear_dirty_flag(slots[i + j]);
            }
            debug!(
                "flushed {} sector(s) of file {:08x} from {}",
                c,
                self.file(run_file).id,
                run_start
            );

            i += c;
        }
        Ok(())
    }

    fn sort_sector_slots(&self, slots: &mut [usize]) {
        slots.sort_by_key(|&slot| {
            let s = self.sector(slot);
            (self.file(s.file).id, s.number)
        });
    }

    /// Flush the sector if it is cached and dirty; otherwise do nothing.
    pub fn flush_sector(&mut self, id: CryptedFileId, s: SectorNumber) -> CoreResult<()> {
        match self.query_cached_sector(id, s) {
            Some(slot) => self.flush_sector_slots(&[slot]),
            None => Ok(()),
        }
    }

    /// Flush all the file's dirty sectors.
    pub fn flush_file(&mut self, id: CryptedFileId) -> CoreResult<()> {
        let fslot = self.access_file(id)?;
        if self.file(fslot).cs_dirty == 0 {
            return Ok(());
        }

        let mut dirty = Vec::with_capacity(self.file(fslot).cs_dirty);
        let mut p = self.file(fslot).first_sector;
        while let Some(slot) = p {
            let s = self.sector(slot);
            if s.dirty {
                dirty.push(slot);
            }
            p = s.next_in_file;
        }
        self.sort_sector_slots(&mut dirty);
        self.flush_sector_slots(&dirty)?;
        debug_assert_eq!(self.file(fslot).cs_dirty, 0);
        Ok(())
    }

    /// Flush all dirty sectors in the cache to disk.
    pub fn flush_volume(&mut self) -> CoreResult<()> {
        if self.cs_dirty == 0 {
            return Ok(());
        }

        let mut dirty = Vec::with_capacity(self.cs_dirty);
        let mut p = self.sector_mru_head;
        while let Some(slot) = p {
            let s = self.sector(slot);
            if s.dirty {
                dirty.push(slot);
            }
            p = s.next_mru;
        }
        self.sort_sector_slots(&mut dirty);
        self.flush_sector_slots(&dirty)?;
        debug_assert_eq!(self.cs_dirty, 0);
        Ok(())
    }

    /// Copy a byte range out of a file sector's payload.
    pub fn query_sector_data(
        &mut self,
        id: CryptedFileId,
        s: SectorNumber,
        offset: usize,
        buffer: &mut [u8],
        flags: FetchFlags,
    ) -> CoreResult<()> {
        if offset + buffer.len() > PAYLOAD_SIZE {
            return Err(CoreError::InvalidParameter);
        }

        let fetched = self.fetch_sectors(id, s, 1, flags);
        if let Err(e) = fetched {
            if e != CoreError::BadChecksum || !flags.contains(FetchFlags::ADD_BAD) {
                return Err(e);
            }
        }

        let slot = self.query_cached_sector(id, s).unwrap();
        buffer.copy_from_slice(&self.sector(slot).data.payload()[offset..offset + buffer.len()]);
        fetched
    }

    /// Copy a buffer into a byte range of a file sector's payload and
    /// mark the sector dirty.  A zero-length write only dirties the
    /// sector if it is already resident.
    pub fn set_sector_data(
        &mut self,
        id: CryptedFileId,
        s: SectorNumber,
        offset: usize,
        data: &[u8],
        flags: FetchFlags,
    ) -> CoreResult<()> {
        if self.parms.read_only {
            return Err(CoreError::ReadOnly);
        }
        if offset + data.len() > PAYLOAD_SIZE {
            return Err(CoreError::InvalidParameter);
        }

        if data.is_empty() {
            if let Some(slot) = self.query_cached_sector(id, s) {
                self.dirty_sector(slot);
            }
            return Ok(());
        }

        let fetched = self.fetch_sectors(id, s, 1, flags);
        if let Err(e) = fetched {
            if e != CoreError::BadChecksum || !flags.contains(FetchFlags::ADD_BAD) {
                return Err(e);
            }
        }

        let slot = self.query_cached_sector(id, s).unwrap();
        self.sector_mut(slot).data.payload_mut()[offset..offset + data.len()]
            .copy_from_slice(data);
        self.dirty_sector(slot);
        fetched
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::aefs_lib::testing::{small_parms, test_key, test_volume};

    #[test]
    fn sector_data_roundtrip_within_session() {
        let (_dir, mut vol) = test_volume(small_parms());
        vol.create_file(1, 0).unwrap();
        vol.set_sector_data(1, 0, 10, b"payload bytes", FetchFlags::NO_READ)
            .unwrap();
        let mut buf = [0u8; 13];
        vol.query_sector_data(1, 0, 10, &mut buf, FetchFlags::empty())
            .unwrap();
        assert_eq!(&buf, b"payload bytes");
    }

    #[test]
    fn flushed_data_survives_reopen() {
        let (dir, mut vol) = test_volume(small_parms());
        vol.create_file(1, 2).unwrap();
        vol.set_sector_data(1, 0, 0, &[0xAA; 100], FetchFlags::NO_READ)
            .unwrap();
        vol.set_sector_data(1, 1, 0, &[0xBB; 100], FetchFlags::NO_READ)
            .unwrap();
        vol.drop_volume().unwrap();

        let mut vol =
            CryptedVolume::access_volume(dir.path(), test_key("rijndael"), small_parms()).unwrap();
        let mut buf = [0u8; 100];
        vol.query_sector_data(1, 1, 0, &mut buf, FetchFlags::empty())
            .unwrap();
        assert_eq!(buf, [0xBB; 100]);
    }

    #[test]
    fn wrong_key_reads_fail_checksum() {
        let (dir, mut vol) = test_volume(small_parms());
        vol.create_file(1, 1).unwrap();
        vol.set_sector_data(1, 0, 0, &[1, 2, 3], FetchFlags::NO_READ)
            .unwrap();
        vol.drop_volume().unwrap();

        let mut vol =
            CryptedVolume::access_volume(dir.path(), test_key("twofish"), small_parms()).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(
            vol.query_sector_data(1, 0, 0, &mut buf, FetchFlags::empty()),
            Err(CoreError::BadChecksum)
        );
        // with ADD_BAD the (garbage) sector is materialized anyway
        assert_eq!(
            vol.query_sector_data(1, 0, 0, &mut buf, FetchFlags::ADD_BAD),
            Err(CoreError::BadChecksum)
        );
        assert_eq!(vol.stats().cs_in_cache, 1);
    }

    #[test]
    fn cache_stays_bounded() {
        let (_dir, mut vol) = test_volume(small_parms());
        vol.create_file(1, 0).unwrap();
        for s in 0..20 {
            vol.set_sector_data(1, s, 0, &[s as u8], FetchFlags::NO_READ)
                .unwrap();
        }
        assert!(vol.stats().cs_in_cache <= 8);

        // evicted sectors must still read back correctly from disk
        let mut buf = [0u8; 1];
        for s in 0..20 {
            vol.query_sector_data(1, s, 0, &mut buf, FetchFlags::empty())
                .unwrap();
            assert_eq!(buf[0], s as u8);
        }
    }

    #[test]
    fn open_pool_stays_bounded() {
        let (_dir, mut vol) = test_volume(small_parms());
        for id in 1..=3 {
            vol.create_file(id, 0).unwrap();
            vol.set_sector_data(id, 0, 0, &[id as u8], FetchFlags::NO_READ)
                .unwrap();
            vol.flush_volume().unwrap();
        }
        assert!(vol.stats().c_open_storage_files <= 2);

        vol.shrink_open_storage_files(0).unwrap();
        assert_eq!(vol.stats().c_open_storage_files, 0);
    }

    #[test]
    fn dirty_callback_fires_on_transitions() {
        let transitions = Rc::new(RefCell::new(Vec::new()));
        let seen = transitions.clone();
        let mut parms = small_parms();
        parms.dirty_callback = Some(Box::new(move |dirty| seen.borrow_mut().push(dirty)));

        let (_dir, mut vol) = test_volume(parms);
        vol.create_file(1, 0).unwrap();
        vol.set_sector_data(1, 0, 0, &[1], FetchFlags::NO_READ).unwrap();
        vol.set_sector_data(1, 1, 0, &[2], FetchFlags::NO_READ).unwrap();
        assert_eq!(*transitions.borrow(), vec![true]);

        vol.flush_volume().unwrap();
        assert_eq!(*transitions.borrow(), vec![true, false]);
        assert_eq!(vol.stats().cs_dirty, 0);

        vol.set_sector_data(1, 0, 0, &[3], FetchFlags::empty()).unwrap();
        assert_eq!(*transitions.borrow(), vec![true, false, true]);
    }

    #[test]
    fn purge_of_dirty_tail_forces_flush() {
        let (_dir, mut vol) = test_volume(small_parms());
        vol.create_file(1, 0).unwrap();
        // fill the cache with dirty sectors, then fetch past the cap
        for s in 0..12 {
            vol.set_sector_data(1, s, 0, &[s as u8], FetchFlags::NO_READ)
                .unwrap();
        }
        // everything evicted along the way must have been flushed, not lost
        let mut buf = [0u8; 1];
        for s in 0..12 {
            vol.query_sector_data(1, s, 0, &mut buf, FetchFlags::empty())
                .unwrap();
            assert_eq!(buf[0], s as u8);
        }
    }

    #[test]
    fn destroy_file_removes_storage() {
        let (dir, mut vol) = test_volume(small_parms());
        vol.create_file(1, 1).unwrap();
        vol.set_sector_data(1, 0, 0, &[9], FetchFlags::NO_READ).unwrap();
        assert!(dir.path().join("00000001.enc").exists());
        vol.destroy_file(1).unwrap();
        assert!(!dir.path().join("00000001.enc").exists());
        assert_eq!(vol.stats().cs_in_cache, 0);
        assert_eq!(vol.stats().cs_dirty, 0);
    }

    #[test]
    fn create_existing_id_fails() {
        let (_dir, mut vol) = test_volume(small_parms());
        vol.create_file(1, 0).unwrap();
        assert_eq!(vol.create_file(1, 0), Err(CoreError::IdExists));
    }

    #[test]
    fn read_only_volume_rejects_writes() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut parms = small_parms();
        parms.read_only = true;
        let mut vol =
            CryptedVolume::access_volume(dir.path(), test_key("rijndael"), parms).unwrap();
        assert_eq!(
            vol.set_sector_data(1, 0, 0, &[1], FetchFlags::NO_READ),
            Err(CoreError::ReadOnly)
        );
        assert_eq!(vol.create_file(1, 0), Err(CoreError::ReadOnly));
    }

    #[test]
    fn suggest_allocation_truncates() {
        let (dir, mut vol) = test_volume(small_parms());
        vol.create_file(1, 0).unwrap();
        for s in 0..4 {
            vol.set_sector_data(1, s, 0, &[s as u8], FetchFlags::NO_READ)
                .unwrap();
        }
        vol.flush_volume().unwrap();
        vol.suggest_file_allocation(1, 2).unwrap();
        let meta = std::fs::metadata(dir.path().join("00000001.enc")).unwrap();
        assert_eq!(meta.len(), 2 * SECTOR_SIZE as u64);
        assert_eq!(vol.stats().cs_dirty, 0);
    }
}
