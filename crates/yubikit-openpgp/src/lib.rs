//! OpenPGP card support: PW management with KDF-aware verification,
//! on-device signing, decryption and authentication, key slots, and the
//! card's ISO 7816 data objects.

pub mod kdf;
pub mod session;
pub mod types;

pub use kdf::{Kdf, KdfHash};
pub use session::{OpenPgpSession, AID};
pub use types::{AlgorithmAttributes, DataObject, EcKind, KeyRef, Pw, PwStatus};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OpenPgpError {
    #[error(transparent)]
    Core(#[from] yubikit_core::Error),

    /// Wrong PIN; `attempts_remaining` is re-read from the PW status
    /// bytes, zero when the PIN is blocked.
    #[error("invalid PIN, {attempts_remaining} attempts remaining")]
    InvalidPin { attempts_remaining: u8 },
}

pub type Result<T> = core::result::Result<T, OpenPgpError>;
