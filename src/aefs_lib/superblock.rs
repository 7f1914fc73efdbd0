//! Superblock and key management.
//!
//! A volume directory carries `SUPERBLK.1` (plaintext key-derivation
//! parameters), `SUPERBLK.2` (one encrypted sector of bootstrap
//! metadata) and optionally `KEY` (the data key, encrypted under the
//! pass key derived from the passphrase).

use std::path::{Path, PathBuf};

use bitflags::bitflags;
use host_io::{Cred, HostFile, OpenFlags, SysError};
use log::debug;
use rand::RngCore;
use sha1::{Digest, Sha1};
use zeroize::Zeroizing;

use crate::aefs_lib::basefile::{create_base_file, CryptedFileInfo, CFF_IFDIR};
use crate::aefs_lib::cipher::{find_cipher, Key};
use crate::aefs_lib::codec::{
    decrypt_sector_data, encrypt_sector_data, CryptoFlags, SectorData, SECTOR_SIZE,
};
use crate::aefs_lib::err::{CoreError, CoreResult};
use crate::aefs_lib::infosector::init_isf;
use crate::aefs_lib::storage::{CryptedVolume, CryptedVolumeParms};
use crate::aefs_lib::utils::{now, round_up};
use crate::aefs_lib::{CryptedFileId, INFOSECTORFILE_ID};

pub const SBV_1_0: u32 = 0x0001_0000;
pub const SBV_CURRENT: u32 = SBV_1_0;

/// The volume has (or may have) unflushed changes.
pub const SBF_DIRTY: u32 = 1;

pub const SUPERBLOCK2_MAGIC: u32 = 0x5a18_0a57;

pub const SUPERBLOCK1_NAME: &str = "SUPERBLK.1";
pub const SUPERBLOCK2_NAME: &str = "SUPERBLK.2";
pub const ENCDATAKEY_NAME: &str = "KEY";

pub const MAX_PASSPHRASE_SIZE: usize = 256;

const LABEL_SIZE: usize = 12;
const DESCRIPTION_SIZE: usize = 128;
/// The encrypted superblock payload starts with 32 bytes of random
/// padding, so the interesting fields never sit in the first cipher
/// blocks with predictable content.
const SB2_PAD: usize = 32;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WriteSuperBlockFlags: u32 {
        const NOWRITE_SUPERBLOCK1 = 1;
    }
}

/// Hash a variable-length passphrase into a fixed-length key.
///
/// The key starts zeroed.  For every 20-byte chunk of the phrase, the
/// SHA-1 digest of (current key || chunk) is XORed into the key at a
/// rotating position.  Hashing the current key along with each chunk
/// keeps repetitions in the phrase from cancelling out, and the rotation
/// spends all of the phrase's entropy even when it is longer than the
/// key.
pub fn hash_phrase(phrase: &[u8], cb_key: usize) -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(vec![0u8; cb_key]);
    if cb_key == 0 {
        return key;
    }

    let mut pos = 0;
    for chunk in phrase.chunks(20) {
        let mut hasher = Sha1::new();
        hasher.update(&key[..]);
        hasher.update(chunk);
        let digest = hasher.finalize();
        for b in digest {
            key[pos] ^= b;
            pos = (pos + 1) % cb_key;
        }
    }

    key
}

pub struct SuperBlock {
    base_path: PathBuf,
    volume: CryptedVolume,
    pub encrypted_key: bool,
    pub version: u32,
    pub flags: u32,
    pub id_root: CryptedFileId,
    pub label: String,
    pub description: String,
    pub magic: u32,
    sb2_file: Option<HostFile>,
}

fn read_c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&c| c == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn write_c_string(dst: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(dst.len() - 1);
    dst[..n].copy_from_slice(&bytes[..n]);
    dst[n..].fill(0);
}

/// Decrypt the `KEY` file with the pass key, yielding the data key.
fn read_data_key(base_path: &Path, cred: Cred, pass_key: &Key) -> CoreResult<Key> {
    let cb_enc = round_up(pass_key.key_len(), pass_key.block_len());

    let mut file = HostFile::open(&base_path.join(ENCDATAKEY_NAME), OpenFlags::DENYWRITE, cred)?;
    let mut enc = Zeroizing::new(vec![0u8; cb_enc]);
    if file.read(&mut enc)? != cb_enc {
        return Err(CoreError::Sys(SysError::Io));
    }

    for block in enc.chunks_mut(pass_key.block_len()) {
        pass_key.decrypt_block(block);
    }

    Ok(Key::new(
        pass_key.cipher(),
        pass_key.block_len(),
        &enc[..pass_key.key_len()],
    )?)
}

/// Read a volume's superblocks and construct the volume.
///
/// A failure to read or verify `SUPERBLK.2` is soft: the superblock and
/// volume are still returned, together with the error, so that a checker
/// can work on a partially broken volume.  A wrong passphrase shows up
/// here as a soft `BadChecksum`.
pub fn read_superblock(
    base_path: &Path,
    passphrase: &[u8],
    mut parms: CryptedVolumeParms,
) -> CoreResult<(SuperBlock, Option<CoreError>)> {
    let mut cipher_spec = String::new();
    let mut encrypted_key = false;

    let mut file = HostFile::open(
        &base_path.join(SUPERBLOCK1_NAME),
        OpenFlags::empty(),
        parms.cred,
    )?;
    let mut text = vec![0u8; 1024];
    let n = file.read(&mut text)?;
    drop(file);

    let text = String::from_utf8_lossy(&text[..n]).into_owned();
    for line in text.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        match (name.trim(), value.trim()) {
            ("cipher", value) => cipher_spec = value.to_string(),
            ("use-cbc", "1") => parms.crypto_flags |= CryptoFlags::USE_CBC,
            ("use-cbc", _) => parms.crypto_flags -= CryptoFlags::USE_CBC,
            ("encrypted-key", value) => encrypted_key = value == "1",
            _ => (), // unrecognized lines are ignored
        }
    }

    let (cipher, cb_block, cb_key) = find_cipher(&cipher_spec)?;

    let pass_key_bytes = hash_phrase(passphrase, cb_key);
    let pass_key = Key::new(cipher, cb_block, &pass_key_bytes)?;

    let data_key = if encrypted_key {
        read_data_key(base_path, parms.cred, &pass_key)?
    } else {
        pass_key
    };

    let volume = CryptedVolume::access_volume(base_path, data_key, parms)?;

    let mut sb = SuperBlock {
        base_path: base_path.to_path_buf(),
        volume,
        encrypted_key,
        version: 0,
        flags: 0,
        id_root: 0,
        label: String::new(),
        description: String::new(),
        magic: 0,
        sb2_file: None,
    };

    let soft_error = match sb.read_superblock2() {
        Err(e) => Some(e),
        Ok(()) => {
            if sb.magic != SUPERBLOCK2_MAGIC {
                Some(CoreError::BadSuperblock)
            } else if (sb.version & 0xff0000) > (SBV_CURRENT & 0xff0000) {
                // only a raised major version is fatal
                Some(CoreError::BadVersion)
            } else {
                None
            }
        }
    };

    Ok((sb, soft_error))
}

impl SuperBlock {
    pub fn volume(&self) -> &CryptedVolume {
        &self.volume
    }

    pub fn volume_mut(&mut self) -> &mut CryptedVolume {
        &mut self.volume
    }

    fn open_superblock2(&mut self, create: bool) -> CoreResult<()> {
        if self.sb2_file.is_some() {
            return Ok(());
        }
        let mut flags = if self.volume.parms().read_only {
            OpenFlags::DENYWRITE
        } else {
            OpenFlags::READWRITE | OpenFlags::DENYALL
        };
        if create {
            flags |= OpenFlags::CREATE_IF_NEW;
        }
        self.sb2_file = Some(HostFile::open(
            &self.base_path.join(SUPERBLOCK2_NAME),
            flags,
            self.volume.parms().cred,
        )?);
        Ok(())
    }

    /// Read `SUPERBLK.2` into the in-memory fields.  The fields are
    /// filled even when the checksum fails.
    fn read_superblock2(&mut self) -> CoreResult<()> {
        self.open_superblock2(false)?;

        let file = self.sb2_file.as_mut().unwrap();
        file.set_pos(0)?;
        let mut cipher = [0u8; SECTOR_SIZE];
        let short = file.read(&mut cipher)? != SECTOR_SIZE;

        let mut sector = SectorData::new();
        let result = decrypt_sector_data(
            &cipher,
            &mut sector,
            self.volume.key(),
            self.volume.parms().crypto_flags,
        );

        let payload = sector.payload();
        let field = |at: usize| u32::from_le_bytes(payload[at..at + 4].try_into().unwrap());
        self.magic = field(SB2_PAD);
        self.version = field(SB2_PAD + 4);
        self.flags = field(SB2_PAD + 8);
        self.id_root = field(SB2_PAD + 12);
        self.label = read_c_string(&payload[SB2_PAD + 16..SB2_PAD + 16 + LABEL_SIZE]);
        self.description = read_c_string(
            &payload[SB2_PAD + 16 + LABEL_SIZE..SB2_PAD + 16 + LABEL_SIZE + DESCRIPTION_SIZE],
        );

        if short {
            return Err(CoreError::BadSuperblock);
        }
        result
    }

    /// Rewrite `SUPERBLK.1` (unless suppressed) and `SUPERBLK.2`.
    pub fn write_superblock(&mut self, flags: WriteSuperBlockFlags) -> CoreResult<()> {
        if self.volume.parms().read_only {
            return Err(CoreError::ReadOnly);
        }

        if !flags.contains(WriteSuperBlockFlags::NOWRITE_SUPERBLOCK1) {
            let key = self.volume.key();
            let text = format!(
                "cipher: {}-{}-{}\nuse-cbc: {}\nencrypted-key: {}\n",
                key.cipher().id(),
                key.key_len() * 8,
                key.block_len() * 8,
                self.volume
                    .parms()
                    .crypto_flags
                    .contains(CryptoFlags::USE_CBC) as u32,
                self.encrypted_key as u32,
            );
            let mut file = HostFile::open(
                &self.base_path.join(SUPERBLOCK1_NAME),
                OpenFlags::CREATE_IF_NEW
                    | OpenFlags::TRUNC_IF_EXISTS
                    | OpenFlags::READWRITE
                    | OpenFlags::DENYALL,
                self.volume.parms().cred,
            )?;
            file.write(text.as_bytes())?;
        }

        let mut sector = SectorData::new();
        sector.randomize_nonce();
        {
            let payload = sector.payload_mut();
            // the pad must hold fresh entropy on every write, not zeros
            rand::thread_rng().fill_bytes(&mut payload[..SB2_PAD]);
            payload[SB2_PAD..SB2_PAD + 4].copy_from_slice(&SUPERBLOCK2_MAGIC.to_le_bytes());
            payload[SB2_PAD + 4..SB2_PAD + 8].copy_from_slice(&SBV_CURRENT.to_le_bytes());
            payload[SB2_PAD + 8..SB2_PAD + 12].copy_from_slice(&self.flags.to_le_bytes());
            payload[SB2_PAD + 12..SB2_PAD + 16].copy_from_slice(&self.id_root.to_le_bytes());
            write_c_string(
                &mut payload[SB2_PAD + 16..SB2_PAD + 16 + LABEL_SIZE],
                &self.label,
            );
            write_c_string(
                &mut payload
                    [SB2_PAD + 16 + LABEL_SIZE..SB2_PAD + 16 + LABEL_SIZE + DESCRIPTION_SIZE],
                &self.description,
            );
        }

        let mut cipher = [0u8; SECTOR_SIZE];
        encrypt_sector_data(
            &sector,
            &mut cipher,
            self.volume.key(),
            self.volume.parms().crypto_flags,
        );

        self.open_superblock2(true)?;
        let file = self.sb2_file.as_mut().unwrap();
        file.set_pos(0)?;
        file.write(&cipher)?;

        self.version = SBV_CURRENT;
        self.magic = SUPERBLOCK2_MAGIC;
        debug!("superblocks written, flags {:#x}", self.flags);

        Ok(())
    }

    /// Re-wrap the data key under a new passphrase and write it to the
    /// `KEY` file, padded with random bits up to a block multiple.  The
    /// caller decides whether the volume uses the encrypted-key scheme
    /// (the `encrypted_key` field and `SUPERBLK.1`).
    pub fn write_data_key(&mut self, passphrase: &[u8]) -> CoreResult<()> {
        let key = self.volume.key();
        let (cb_key, cb_block) = (key.key_len(), key.block_len());

        let pass_key_bytes = hash_phrase(passphrase, cb_key);
        let pass_key = Key::new(key.cipher(), cb_block, &pass_key_bytes)?;

        let cb_enc = round_up(cb_key, cb_block);
        let mut enc = Zeroizing::new(vec![0u8; cb_enc]);
        rand::thread_rng().fill_bytes(&mut enc);
        enc[..cb_key].copy_from_slice(key.key_bytes());
        for block in enc.chunks_mut(cb_block) {
            pass_key.encrypt_block(block);
        }

        let mut file = HostFile::open(
            &self.base_path.join(ENCDATAKEY_NAME),
            OpenFlags::WRITEONLY
                | OpenFlags::DENYALL
                | OpenFlags::CREATE_IF_NEW
                | OpenFlags::TRUNC_IF_EXISTS,
            self.volume.parms().cred,
        )?;
        file.write(&enc)?;
        Ok(())
    }

    /// Flush and release the volume and the superblock files.
    pub fn drop_super_block(self) -> CoreResult<()> {
        self.volume.drop_volume()
    }
}

/// Create a fresh volume in `base_path`: the info sector file, the root
/// directory and both superblock files.
pub fn create_volume(
    base_path: &Path,
    passphrase: &[u8],
    cipher_spec: &str,
    use_cbc: bool,
    label: &str,
    description: &str,
    mut parms: CryptedVolumeParms,
) -> CoreResult<SuperBlock> {
    let (cipher, cb_block, cb_key) = find_cipher(cipher_spec)?;
    if use_cbc {
        parms.crypto_flags |= CryptoFlags::USE_CBC;
    } else {
        parms.crypto_flags -= CryptoFlags::USE_CBC;
    }

    let key_bytes = hash_phrase(passphrase, cb_key);
    let key = Key::new(cipher, cb_block, &key_bytes)?;

    let mut volume = CryptedVolume::access_volume(base_path, key, parms)?;

    volume.create_file(INFOSECTORFILE_ID, 1)?;
    init_isf(&mut volume)?;

    let t = now();
    let root_info = CryptedFileInfo {
        flags: CFF_IFDIR | 0o700,
        c_refs: 1,
        time_creation: t,
        time_access: t,
        time_write: t,
        ..Default::default()
    };
    let id_root = create_base_file(&mut volume, &root_info)?;

    let mut sb = SuperBlock {
        base_path: base_path.to_path_buf(),
        volume,
        encrypted_key: false,
        version: SBV_CURRENT,
        flags: 0,
        id_root,
        label: label.to_string(),
        description: description.to_string(),
        magic: SUPERBLOCK2_MAGIC,
        sb2_file: None,
    };
    sb.write_superblock(WriteSuperBlockFlags::empty())?;
    sb.volume.flush_volume()?;

    Ok(sb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aefs_lib::basefile::{read_file, write_file, CFF_IFREG};
    use crate::aefs_lib::directory::{add_dir_entry, query_id_from_path};
    use crate::aefs_lib::testing::formatted_volume;

    #[test]
    fn phrase_hash_has_the_advertised_shape() {
        let key = hash_phrase(b"hello", 16);
        assert_eq!(key.len(), 16);
        assert_ne!(&key[..], &[0u8; 16]);

        // deterministic
        assert_eq!(hash_phrase(b"hello", 16), hash_phrase(b"hello", 16));
        assert_ne!(hash_phrase(b"hello", 16), hash_phrase(b"hellp", 16));

        // repetitions must not cancel out
        assert_ne!(
            hash_phrase(&[b'x'; 20], 20),
            hash_phrase(&[b'x'; 40], 20)
        );
        assert_ne!(&hash_phrase(&[b'x'; 40], 20)[..], &[0u8; 20]);

        // phrases longer than one digest keep contributing
        assert_ne!(
            hash_phrase(&[b'a'; 40], 16),
            hash_phrase(&{
                let mut p = [b'a'; 40];
                p[39] = b'b';
                p
            }, 16)
        );
    }

    #[test]
    fn superblock_roundtrip() {
        let (dir, sb) = formatted_volume("hello");
        let id_root = sb.id_root;
        sb.drop_super_block().unwrap();

        let (sb, soft) =
            read_superblock(dir.path(), b"hello", CryptedVolumeParms::default()).unwrap();
        assert_eq!(soft, None);
        assert_eq!(sb.magic, SUPERBLOCK2_MAGIC);
        assert_eq!(sb.version, SBV_CURRENT);
        assert_eq!(sb.id_root, id_root);
        assert_eq!(sb.label, "TEST");
        assert_eq!(sb.description, "test volume");
        assert!(!sb.encrypted_key);
        assert_eq!(sb.flags & SBF_DIRTY, 0);
        sb.drop_super_block().unwrap();
    }

    #[test]
    fn wrong_passphrase_is_a_soft_checksum_error() {
        let (dir, sb) = formatted_volume("hello");
        sb.drop_super_block().unwrap();

        let (_sb, soft) =
            read_superblock(dir.path(), b"goodbye", CryptedVolumeParms::default()).unwrap();
        assert_eq!(soft, Some(CoreError::BadChecksum));
    }

    #[test]
    fn dirty_flag_roundtrips() {
        let (dir, mut sb) = formatted_volume("hello");
        sb.flags |= SBF_DIRTY;
        sb.write_superblock(WriteSuperBlockFlags::NOWRITE_SUPERBLOCK1)
            .unwrap();
        sb.drop_super_block().unwrap();

        let (mut sb, soft) =
            read_superblock(dir.path(), b"hello", CryptedVolumeParms::default()).unwrap();
        assert_eq!(soft, None);
        assert_ne!(sb.flags & SBF_DIRTY, 0);

        sb.flags &= !SBF_DIRTY;
        sb.write_superblock(WriteSuperBlockFlags::empty()).unwrap();
        sb.drop_super_block().unwrap();

        let (sb, _) =
            read_superblock(dir.path(), b"hello", CryptedVolumeParms::default()).unwrap();
        assert_eq!(sb.flags & SBF_DIRTY, 0);
        sb.drop_super_block().unwrap();
    }

    #[test]
    fn rewrapped_key_switches_the_passphrase() {
        let (dir, mut sb) = formatted_volume("hello");
        sb.write_data_key(b"swordfish").unwrap();
        sb.encrypted_key = true;
        sb.write_superblock(WriteSuperBlockFlags::empty()).unwrap();
        sb.drop_super_block().unwrap();

        // the volume key is now unwrapped from KEY via the new phrase
        let (sb, soft) =
            read_superblock(dir.path(), b"swordfish", CryptedVolumeParms::default()).unwrap();
        assert_eq!(soft, None);
        assert!(sb.encrypted_key);
        sb.drop_super_block().unwrap();

        // the old phrase no longer unlocks anything
        let (_sb, soft) =
            read_superblock(dir.path(), b"hello", CryptedVolumeParms::default()).unwrap();
        assert!(soft.is_some());
    }

    #[test]
    fn missing_superblock2_is_soft() {
        let (dir, sb) = formatted_volume("hello");
        sb.drop_super_block().unwrap();
        std::fs::remove_file(dir.path().join(SUPERBLOCK2_NAME)).unwrap();

        let (sb, soft) =
            read_superblock(dir.path(), b"hello", CryptedVolumeParms::default()).unwrap();
        assert!(matches!(soft, Some(CoreError::Sys(_))));
        // the volume itself is still reachable for a checker
        assert_eq!(sb.magic, 0);
        sb.drop_super_block().unwrap();
    }

    #[test]
    fn whole_volume_scenario() {
        // create a volume, store a file, remount, read it back
        let (dir, mut sb) = formatted_volume("hello");
        let root = sb.id_root;
        {
            let vol = sb.volume_mut();
            let info = CryptedFileInfo {
                flags: CFF_IFREG | 0o600,
                c_refs: 1,
                time_creation: now(),
                ..Default::default()
            };
            let id = create_base_file(vol, &info).unwrap();
            add_dir_entry(vol, root, b"a", id, 0).unwrap();
            assert_eq!(write_file(vol, id, 0, &vec![0xAA; 100_000]).unwrap(), 100_000);
            vol.flush_volume().unwrap();
        }
        sb.drop_super_block().unwrap();

        let (mut sb, soft) =
            read_superblock(dir.path(), b"hello", CryptedVolumeParms::default()).unwrap();
        assert_eq!(soft, None);
        let root = sb.id_root;
        let vol = sb.volume_mut();
        let (id, _entry) = query_id_from_path(vol, root, "a").unwrap();
        let mut buf = vec![0u8; 100_000];
        assert_eq!(read_file(vol, id, 0, &mut buf).unwrap(), 100_000);
        assert!(buf.iter().all(|&b| b == 0xAA));
        sb.drop_super_block().unwrap();
    }
}
