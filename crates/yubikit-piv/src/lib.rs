//! PIV (FIPS 201) support: PIN management, on-device asymmetric key
//! operations, key generation and import, and data-object access.

pub mod session;
pub mod types;

mod objects;

pub use objects::ObjectId;
pub use session::{PivSession, PrivateKeyValues, PublicKeyValues, SlotMetadata};
pub use types::{KeyType, ManagementKeyType, PinPolicy, Slot, TouchPolicy};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PivError {
    #[error(transparent)]
    Core(#[from] yubikit_core::Error),

    /// Wrong PIN or PUK; `retries` is the number of attempts left,
    /// zero when the reference data is blocked.
    #[error("invalid PIN, {retries} attempts remaining")]
    InvalidPin { retries: u8 },
}

pub type Result<T> = core::result::Result<T, PivError>;
