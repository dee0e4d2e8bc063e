//! FIDO2 support for YubiKeys: the CTAP2 authenticator protocol, PIN/UV
//! auth, and a WebAuthn client composed on top, with a CTAP1 (U2F)
//! fallback for older keys.
//!
//! The entry points are [`ctap2::Ctap2Session`] for raw authenticator
//! access and [`webauthn::client::WebAuthnClient`] for the full
//! `makeCredential` / `getAssertion` flows.

pub mod cose;
pub mod ctap1;
pub mod ctap2;
pub mod extensions;
pub mod origin;
pub mod webauthn;

mod error;

pub use error::{CtapStatus, FidoError};

pub type Result<T> = core::result::Result<T, FidoError>;
