//! Sector encryption and decryption.
//!
//! A sector is 512 bytes: a 4-byte random nonce, a 4-byte keyed checksum
//! over the payload, and the payload itself.  The nonce and checksum act
//! as a per-sector IV, so identical payloads produce distinct ciphertext.

use bitflags::bitflags;
use rand::RngCore;
use zeroize::Zeroize;

use crate::aefs_lib::cipher::{Key, MAX_BLOCK_SIZE};
use crate::aefs_lib::err::{CoreError, CoreResult};

pub const SECTOR_SIZE: usize = 512;
pub const RANDOM_SIZE: usize = 4;
pub const CHECKSUM_SIZE: usize = 4;
pub const NONPAYLOAD_SIZE: usize = RANDOM_SIZE + CHECKSUM_SIZE;
pub const PAYLOAD_SIZE: usize = SECTOR_SIZE - NONPAYLOAD_SIZE;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CryptoFlags: u32 {
        const USE_CBC = 1;
    }
}

/// Plaintext of one sector.  Zeroed on drop.
pub struct SectorData {
    bytes: Box<[u8; SECTOR_SIZE]>,
}

impl SectorData {
    pub fn new() -> SectorData {
        SectorData {
            bytes: Box::new([0; SECTOR_SIZE]),
        }
    }

    pub fn as_bytes(&self) -> &[u8; SECTOR_SIZE] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; SECTOR_SIZE] {
        &mut self.bytes
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[NONPAYLOAD_SIZE..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[NONPAYLOAD_SIZE..]
    }

    pub fn checksum(&self) -> [u8; CHECKSUM_SIZE] {
        let mut sum = [0; CHECKSUM_SIZE];
        sum.copy_from_slice(&self.bytes[RANDOM_SIZE..NONPAYLOAD_SIZE]);
        sum
    }

    /// Refresh the nonce.  Must be called before every encryption.
    pub fn randomize_nonce(&mut self) {
        rand::thread_rng().fill_bytes(&mut self.bytes[..RANDOM_SIZE]);
    }
}

impl Default for SectorData {
    fn default() -> Self {
        SectorData::new()
    }
}

impl Drop for SectorData {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

/// Keyed MAC over the payload: a CBC pass from a zero IV (the trailing
/// partial block zero-padded), truncated to the first 4 bytes of the
/// final chaining value.
fn payload_checksum(payload: &[u8], key: &Key) -> [u8; CHECKSUM_SIZE] {
    let cb_block = key.block_len();
    let mut state = [0u8; MAX_BLOCK_SIZE];
    for chunk in payload.chunks(cb_block) {
        for (s, b) in state.iter_mut().zip(chunk) {
            *s ^= b;
        }
        key.encrypt_block(&mut state[..cb_block]);
    }
    let mut sum = [0; CHECKSUM_SIZE];
    sum.copy_from_slice(&state[..CHECKSUM_SIZE]);
    state.zeroize();
    sum
}

/// Encrypt one sector into `dst`.  The caller must have randomized the
/// nonce; the checksum is computed here.  With `USE_CBC` the sector's
/// blocks are chained (block 0, which starts with the nonce and checksum,
/// is enciphered with a zero IV); otherwise every block is ECB.
pub fn encrypt_sector_data(src: &SectorData, dst: &mut [u8], key: &Key, flags: CryptoFlags) {
    assert_eq!(dst.len(), SECTOR_SIZE);
    let cb_block = key.block_len();
    assert_eq!(SECTOR_SIZE % cb_block, 0);

    let checksum = payload_checksum(src.payload(), key);
    dst.copy_from_slice(src.as_bytes());
    dst[RANDOM_SIZE..NONPAYLOAD_SIZE].copy_from_slice(&checksum);

    if flags.contains(CryptoFlags::USE_CBC) {
        let mut prev = [0u8; MAX_BLOCK_SIZE];
        for block in dst.chunks_mut(cb_block) {
            for (b, p) in block.iter_mut().zip(&prev[..cb_block]) {
                *b ^= p;
            }
            key.encrypt_block(block);
            prev[..cb_block].copy_from_slice(block);
        }
    } else {
        for block in dst.chunks_mut(cb_block) {
            key.encrypt_block(block);
        }
    }
}

/// Decrypt one sector from `src` into `dst` and verify the checksum.
/// On a mismatch `dst` still holds the (garbage) plaintext and
/// `BadChecksum` is returned; callers may choose to keep it anyway.
pub fn decrypt_sector_data(
    src: &[u8],
    dst: &mut SectorData,
    key: &Key,
    flags: CryptoFlags,
) -> CoreResult<()> {
    assert_eq!(src.len(), SECTOR_SIZE);
    let cb_block = key.block_len();
    assert_eq!(SECTOR_SIZE % cb_block, 0);

    let out = dst.as_bytes_mut();
    out.copy_from_slice(src);
    if flags.contains(CryptoFlags::USE_CBC) {
        let mut prev = [0u8; MAX_BLOCK_SIZE];
        for (cipher_block, block) in src.chunks(cb_block).zip(out.chunks_mut(cb_block)) {
            key.decrypt_block(block);
            for (b, p) in block.iter_mut().zip(&prev[..cb_block]) {
                *b ^= p;
            }
            prev[..cb_block].copy_from_slice(cipher_block);
        }
    } else {
        for block in out.chunks_mut(cb_block) {
            key.decrypt_block(block);
        }
    }

    if payload_checksum(dst.payload(), key) != dst.checksum() {
        return Err(CoreError::BadChecksum);
    }
    Ok(())
}
