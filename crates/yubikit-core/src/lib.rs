//! Core smart-card plumbing shared by the YubiKey application sessions:
//! the connection seam, ISO 7816-4 APDU framing with transparent response
//! chaining, BER-TLV and canonical CTAP2 CBOR codecs, and firmware version
//! handling.
//!
//! Nothing in this crate talks to hardware. Callers supply a
//! [`SmartCardConnection`] that delivers one command APDU and returns one
//! raw response; everything above is deterministic byte manipulation.

pub mod apdu;
pub mod cbor;
pub mod connection;
pub mod der;
pub mod tlv;
pub mod version;

mod error;

pub use connection::{CommandState, SmartCardConnection, TransportError};
pub use error::Error;
pub use version::Version;

pub type Result<T> = core::result::Result<T, Error>;
