//! The card's KDF data object (`F9`): cards configured for key
//! derivation expect S2K-derived bytes instead of the raw PIN in every
//! VERIFY and password change.

use sha2::{Digest, Sha256, Sha512};
use yubikit_core::tlv::{encode_list, Tlv};
use yubikit_core::Error;
use zeroize::Zeroizing;

use crate::types::Pw;
use crate::Result;

const TAG_ALGORITHM: u32 = 0x81;
const TAG_HASH: u32 = 0x82;
const TAG_ITERATION_COUNT: u32 = 0x83;
const TAG_SALT_USER: u32 = 0x84;
const TAG_SALT_RESET: u32 = 0x85;
const TAG_SALT_ADMIN: u32 = 0x86;
const TAG_INITIAL_HASH_USER: u32 = 0x87;
const TAG_INITIAL_HASH_ADMIN: u32 = 0x88;

const ALGORITHM_NONE: u8 = 0x00;
const ALGORITHM_ITER_SALTED: u8 = 0x03;

const DEFAULT_USER_PIN: &[u8] = b"123456";
const DEFAULT_ADMIN_PIN: &[u8] = b"12345678";

/// Hash underlying the S2K derivation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum KdfHash {
    Sha256 = 0x08,
    Sha512 = 0x0A,
}

impl KdfHash {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x08 => Some(Self::Sha256),
            0x0A => Some(Self::Sha512),
            _ => None,
        }
    }
}

/// Parsed KDF configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Kdf {
    /// PINs travel as their raw UTF-8 bytes.
    None,
    /// OpenPGP iterated+salted S2K; the iteration count is the TOTAL
    /// number of bytes fed into the hash, not a repetition count.
    IterSaltedS2k {
        hash: KdfHash,
        iteration_count: u32,
        salt_user: Vec<u8>,
        salt_reset: Option<Vec<u8>>,
        salt_admin: Option<Vec<u8>>,
    },
}

impl Kdf {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let map = Tlv::parse_map(data)?;
        let algorithm = map
            .get(&TAG_ALGORITHM)
            .and_then(|v| v.first())
            .copied()
            .unwrap_or(ALGORITHM_NONE);
        if algorithm == ALGORITHM_NONE {
            return Ok(Kdf::None);
        }
        if algorithm != ALGORITHM_ITER_SALTED {
            return Err(Error::BadResponse("unknown KDF algorithm").into());
        }
        let hash = map
            .get(&TAG_HASH)
            .and_then(|v| v.first())
            .copied()
            .and_then(KdfHash::from_byte)
            .ok_or(Error::BadResponse("KDF without a known hash"))?;
        let count_bytes: [u8; 4] = map
            .get(&TAG_ITERATION_COUNT)
            .and_then(|v| v.as_slice().try_into().ok())
            .ok_or(Error::BadResponse("KDF without iteration count"))?;
        let salt_user = map
            .get(&TAG_SALT_USER)
            .cloned()
            .ok_or(Error::BadResponse("KDF without user salt"))?;
        Ok(Kdf::IterSaltedS2k {
            hash,
            iteration_count: u32::from_be_bytes(count_bytes),
            salt_user,
            salt_reset: map.get(&TAG_SALT_RESET).cloned(),
            salt_admin: map.get(&TAG_SALT_ADMIN).cloned(),
        })
    }

    /// Serialize for PUT DATA, including the initial hashes of the
    /// default PINs the card expects after a KDF change.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Kdf::None => Ok(Tlv::new(TAG_ALGORITHM, [ALGORITHM_NONE])?.to_bytes()),
            Kdf::IterSaltedS2k {
                hash,
                iteration_count,
                salt_user,
                salt_reset,
                salt_admin,
            } => {
                let mut tlvs = vec![
                    Tlv::new(TAG_ALGORITHM, [ALGORITHM_ITER_SALTED])?,
                    Tlv::new(TAG_HASH, [*hash as u8])?,
                    Tlv::new(TAG_ITERATION_COUNT, iteration_count.to_be_bytes())?,
                    Tlv::new(TAG_SALT_USER, salt_user.clone())?,
                ];
                if let Some(salt) = salt_reset {
                    tlvs.push(Tlv::new(TAG_SALT_RESET, salt.clone())?);
                }
                if let Some(salt) = salt_admin {
                    tlvs.push(Tlv::new(TAG_SALT_ADMIN, salt.clone())?);
                }
                let initial_user =
                    derive(*hash, *iteration_count, salt_user, DEFAULT_USER_PIN);
                let admin_salt = salt_admin.as_deref().unwrap_or(salt_user);
                let initial_admin =
                    derive(*hash, *iteration_count, admin_salt, DEFAULT_ADMIN_PIN);
                tlvs.push(Tlv::new(TAG_INITIAL_HASH_USER, initial_user.to_vec())?);
                tlvs.push(Tlv::new(TAG_INITIAL_HASH_ADMIN, initial_admin.to_vec())?);
                Ok(encode_list(tlvs))
            }
        }
    }

    /// Turn a PIN into the bytes VERIFY expects for the given password.
    pub fn process(&self, pw: Pw, pin: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        match self {
            Kdf::None => Ok(Zeroizing::new(pin.to_vec())),
            Kdf::IterSaltedS2k {
                hash,
                iteration_count,
                salt_user,
                salt_reset,
                salt_admin,
            } => {
                // Missing per-PW salts fall back to the user salt.
                let salt = match pw {
                    Pw::User => salt_user,
                    Pw::Reset => salt_reset.as_ref().unwrap_or(salt_user),
                    Pw::Admin => salt_admin.as_ref().unwrap_or(salt_user),
                };
                Ok(derive(*hash, *iteration_count, salt, pin))
            }
        }
    }
}

/// Iterated+salted S2K: hash `(salt || pin)` cycled until exactly
/// `count` bytes have been fed in.
fn derive(hash: KdfHash, count: u32, salt: &[u8], pin: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut combined = Zeroizing::new(salt.to_vec());
    combined.extend_from_slice(pin);
    match hash {
        KdfHash::Sha256 => s2k::<Sha256>(count as usize, &combined),
        KdfHash::Sha512 => s2k::<Sha512>(count as usize, &combined),
    }
}

fn s2k<D: Digest>(count: usize, combined: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut hasher = D::new();
    let mut fed = 0usize;
    while fed + combined.len() <= count {
        hasher.update(combined);
        fed += combined.len();
    }
    hasher.update(&combined[..count - fed]);
    Zeroizing::new(hasher.finalize().to_vec())
}
