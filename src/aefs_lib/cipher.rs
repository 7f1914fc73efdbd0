//! Block cipher abstraction and the table of known ciphers.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use lazy_static::lazy_static;
use thiserror::Error;
use twofish::Twofish;
use zeroize::Zeroizing;

use crate::aefs_lib::err::CoreError;

pub const MAX_BLOCK_SIZE: usize = 64;
pub const MAX_KEY_SIZE: usize = 64;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherError {
    #[error("unknown cipher")]
    UnknownCipher,
    #[error("invalid key size")]
    InvalidKeySize,
    #[error("invalid block size")]
    InvalidBlockSize,
}

pub type CipherResult<T> = Result<T, CipherError>;

impl From<CipherError> for CoreError {
    fn from(e: CipherError) -> Self {
        match e {
            CipherError::UnknownCipher => CoreError::UnknownCipher,
            _ => CoreError::MiscCipher,
        }
    }
}

/// One supported (block size, key size) combination, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSize {
    pub block: usize,
    pub key: usize,
}

/// A block cipher known to the volume layer.  The first entry of
/// [`sizes`](BlockCipher::sizes) is the default for volume creation.
pub trait BlockCipher: Sync {
    fn id(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn sizes(&self) -> &'static [CipherSize];
    fn expand_key(&self, cb_block: usize, key: &[u8]) -> CipherResult<Box<dyn ExpandedKey>>;
}

impl std::fmt::Debug for dyn BlockCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCipher").field("id", &self.id()).finish()
    }
}

impl PartialEq for dyn BlockCipher {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

/// An expanded key schedule operating on one block in place.
pub trait ExpandedKey {
    fn encrypt_block(&self, block: &mut [u8]);
    fn decrypt_block(&self, block: &mut [u8]);
}

/// A cipher instance: the expanded schedule plus the raw key bytes
/// (kept for re-wrapping the data key; burned on drop).
pub struct Key {
    cipher: &'static dyn BlockCipher,
    cb_block: usize,
    bytes: Zeroizing<Vec<u8>>,
    expanded: Box<dyn ExpandedKey>,
}

impl Key {
    pub fn new(cipher: &'static dyn BlockCipher, cb_block: usize, key: &[u8]) -> CipherResult<Key> {
        let expanded = cipher.expand_key(cb_block, key)?;
        Ok(Key {
            cipher,
            cb_block,
            bytes: Zeroizing::new(key.to_vec()),
            expanded,
        })
    }

    pub fn cipher(&self) -> &'static dyn BlockCipher {
        self.cipher
    }

    pub fn block_len(&self) -> usize {
        self.cb_block
    }

    pub fn key_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn key_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn encrypt_block(&self, block: &mut [u8]) {
        debug_assert_eq!(block.len(), self.cb_block);
        self.expanded.encrypt_block(block);
    }

    pub fn decrypt_block(&self, block: &mut [u8]) {
        debug_assert_eq!(block.len(), self.cb_block);
        self.expanded.decrypt_block(block);
    }
}

/*
 * Rijndael.  With a 128-bit block this is AES; 128/192/256-bit keys.
 */

struct RijndaelCipher;

enum AesSchedule {
    K128(Aes128),
    K192(Aes192),
    K256(Aes256),
}

impl ExpandedKey for AesSchedule {
    fn encrypt_block(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            AesSchedule::K128(c) => c.encrypt_block(block),
            AesSchedule::K192(c) => c.encrypt_block(block),
            AesSchedule::K256(c) => c.encrypt_block(block),
        }
    }

    fn decrypt_block(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            AesSchedule::K128(c) => c.decrypt_block(block),
            AesSchedule::K192(c) => c.decrypt_block(block),
            AesSchedule::K256(c) => c.decrypt_block(block),
        }
    }
}

const RIJNDAEL_SIZES: [CipherSize; 3] = [
    CipherSize { block: 16, key: 16 },
    CipherSize { block: 16, key: 24 },
    CipherSize { block: 16, key: 32 },
];

impl BlockCipher for RijndaelCipher {
    fn id(&self) -> &'static str {
        "rijndael"
    }

    fn description(&self) -> &'static str {
        "Rijndael (AES) block cipher"
    }

    fn sizes(&self) -> &'static [CipherSize] {
        &RIJNDAEL_SIZES
    }

    fn expand_key(&self, cb_block: usize, key: &[u8]) -> CipherResult<Box<dyn ExpandedKey>> {
        if cb_block != 16 {
            return Err(CipherError::InvalidBlockSize);
        }
        let schedule = match key.len() {
            16 => AesSchedule::K128(
                Aes128::new_from_slice(key).map_err(|_| CipherError::InvalidKeySize)?,
            ),
            24 => AesSchedule::K192(
                Aes192::new_from_slice(key).map_err(|_| CipherError::InvalidKeySize)?,
            ),
            32 => AesSchedule::K256(
                Aes256::new_from_slice(key).map_err(|_| CipherError::InvalidKeySize)?,
            ),
            _ => return Err(CipherError::InvalidKeySize),
        };
        Ok(Box::new(schedule))
    }
}

/*
 * Twofish, 256-bit key.
 */

struct TwofishCipher;

struct TwofishSchedule(Twofish);

impl ExpandedKey for TwofishSchedule {
    fn encrypt_block(&self, block: &mut [u8]) {
        self.0.encrypt_block(GenericArray::from_mut_slice(block));
    }

    fn decrypt_block(&self, block: &mut [u8]) {
        self.0.decrypt_block(GenericArray::from_mut_slice(block));
    }
}

const TWOFISH_SIZES: [CipherSize; 1] = [CipherSize { block: 16, key: 32 }];

impl BlockCipher for TwofishCipher {
    fn id(&self) -> &'static str {
        "twofish"
    }

    fn description(&self) -> &'static str {
        "Twofish block cipher"
    }

    fn sizes(&self) -> &'static [CipherSize] {
        &TWOFISH_SIZES
    }

    fn expand_key(&self, cb_block: usize, key: &[u8]) -> CipherResult<Box<dyn ExpandedKey>> {
        if cb_block != 16 {
            return Err(CipherError::InvalidBlockSize);
        }
        let schedule = Twofish::new_from_slice(key).map_err(|_| CipherError::InvalidKeySize)?;
        Ok(Box::new(TwofishSchedule(schedule)))
    }
}

/*
 * Identity ("no-op") cipher, for debugging and tests.
 */

struct IdentityCipher;

struct IdentitySchedule;

impl ExpandedKey for IdentitySchedule {
    fn encrypt_block(&self, _block: &mut [u8]) {}

    fn decrypt_block(&self, _block: &mut [u8]) {}
}

const IDENTITY_SIZES: [CipherSize; 1] = [CipherSize { block: 8, key: 0 }];

impl BlockCipher for IdentityCipher {
    fn id(&self) -> &'static str {
        "none"
    }

    fn description(&self) -> &'static str {
        "Identity block cipher"
    }

    fn sizes(&self) -> &'static [CipherSize] {
        &IDENTITY_SIZES
    }

    fn expand_key(&self, cb_block: usize, _key: &[u8]) -> CipherResult<Box<dyn ExpandedKey>> {
        if cb_block == 0 || cb_block > MAX_BLOCK_SIZE {
            return Err(CipherError::InvalidBlockSize);
        }
        Ok(Box::new(IdentitySchedule))
    }
}

static RIJNDAEL: RijndaelCipher = RijndaelCipher;
static TWOFISH: TwofishCipher = TwofishCipher;
static IDENTITY: IdentityCipher = IdentityCipher;

lazy_static! {
    /// Table of known ciphers.  The first entry is the default for
    /// volume creation.
    pub static ref CIPHER_TABLE: [&'static dyn BlockCipher; 3] = [&RIJNDAEL, &TWOFISH, &IDENTITY];
}

/// Resolve a cipher spec of the form `<id>[-<keybits>[-<blockbits>]]`,
/// e.g. `rijndael-128-128`.  Omitted sizes default from the cipher's
/// size table.  Returns (cipher, block bytes, key bytes).
pub fn find_cipher(spec: &str) -> CipherResult<(&'static dyn BlockCipher, usize, usize)> {
    let mut parts = spec.split('-');
    let id = parts.next().unwrap_or("");
    let cipher = CIPHER_TABLE
        .iter()
        .find(|c| c.id() == id)
        .copied()
        .ok_or(CipherError::UnknownCipher)?;
    let default = cipher.sizes()[0];
    let cb_key = match parts.next() {
        Some(s) => s.parse::<usize>().map_err(|_| CipherError::InvalidKeySize)? / 8,
        None => default.key,
    };
    let cb_block = match parts.next() {
        Some(s) => s.parse::<usize>().map_err(|_| CipherError::InvalidBlockSize)? / 8,
        None => default.block,
    };
    Ok((cipher, cb_block, cb_key))
}
