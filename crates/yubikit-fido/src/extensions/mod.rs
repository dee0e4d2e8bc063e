//! WebAuthn extension pipeline.
//!
//! Extensions translate client-side inputs into authenticator extension
//! inputs (plus any extra pinUvAuthToken permissions they need) before a
//! request goes out, and turn the authenticator's outputs into client
//! extension results afterwards. They run in registration order; when two
//! extensions produce the same output key, the later registration wins.

use std::collections::BTreeMap;

use ciborium::value::Value;
use yubikit_core::SmartCardConnection;

use crate::ctap2::client_pin::PinPermissions;
use crate::ctap2::get_assertion::AssertionData;
use crate::ctap2::pin_uv::PinUvAuthProtocol;
use crate::ctap2::{Ctap2Session, InfoData};
use crate::webauthn::attestation::AttestationObject;
use crate::webauthn::client::ClientError;

pub mod cred_blob;
pub mod cred_protect;
pub mod hmac_secret;
pub mod large_blob;
pub mod min_pin_length;

pub use cred_blob::CredBlobExtension;
pub use cred_protect::CredProtectExtension;
pub use hmac_secret::HmacSecretExtension;
pub use large_blob::LargeBlobExtension;
pub use min_pin_length::MinPinLengthExtension;

/// Client-side extension inputs, keyed by WebAuthn extension identifier.
pub type ExtensionInputs = BTreeMap<String, Value>;

/// Authentication material available when outputs are processed.
pub struct AuthParams<'a> {
    pub protocol: &'a dyn PinUvAuthProtocol,
    pub token: Option<&'a [u8]>,
}

/// Output hook run against the attestation object.
pub type CreateFinalize<C> = Box<
    dyn Fn(
        &mut Ctap2Session<C>,
        &AttestationObject,
        &AuthParams<'_>,
    ) -> Result<Option<(String, Value)>, ClientError>,
>;

/// Output hook run against each returned assertion.
pub type GetFinalize<C> = Box<
    dyn Fn(
        &mut Ctap2Session<C>,
        &AssertionData,
        &AuthParams<'_>,
    ) -> Result<Option<(String, Value)>, ClientError>,
>;

/// What one extension contributes to a `makeCredential` call.
pub struct CreateOutcome<C> {
    /// Entry for the request's authenticator extensions map.
    pub auth_input: Option<(String, Value)>,
    /// Extra permissions to request with the pinUvAuthToken.
    pub permissions: PinPermissions,
    pub finalize: Option<CreateFinalize<C>>,
}

impl<C> Default for CreateOutcome<C> {
    fn default() -> Self {
        Self {
            auth_input: None,
            permissions: PinPermissions::empty(),
            finalize: None,
        }
    }
}

/// What one extension contributes to a `getAssertion` call.
pub struct GetOutcome<C> {
    pub auth_input: Option<(String, Value)>,
    pub permissions: PinPermissions,
    pub finalize: Option<GetFinalize<C>>,
}

impl<C> Default for GetOutcome<C> {
    fn default() -> Self {
        Self {
            auth_input: None,
            permissions: PinPermissions::empty(),
            finalize: None,
        }
    }
}

/// One registered extension.
pub trait Extension<C: SmartCardConnection> {
    /// The authenticator-side extension identifier.
    fn name(&self) -> &'static str;

    fn is_supported(&self, info: &InfoData) -> bool {
        info.supports_extension(self.name())
    }

    /// Inspect the caller's inputs and contribute to the outgoing
    /// `makeCredential`. Returning `None` keeps the extension out of the
    /// request entirely.
    fn process_create_input(
        &self,
        _session: &mut Ctap2Session<C>,
        _inputs: &ExtensionInputs,
        _protocol: &dyn PinUvAuthProtocol,
    ) -> Result<Option<CreateOutcome<C>>, ClientError> {
        Ok(None)
    }

    /// Inspect the caller's inputs and contribute to the outgoing
    /// `getAssertion`.
    fn process_get_input(
        &self,
        _session: &mut Ctap2Session<C>,
        _inputs: &ExtensionInputs,
        _protocol: &dyn PinUvAuthProtocol,
    ) -> Result<Option<GetOutcome<C>>, ClientError> {
        Ok(None)
    }
}

/// The built-in extensions, in default registration order.
pub fn default_extensions<C: SmartCardConnection>() -> Vec<Box<dyn Extension<C>>> {
    vec![
        Box::new(HmacSecretExtension),
        Box::new(CredBlobExtension),
        Box::new(CredProtectExtension),
        Box::new(MinPinLengthExtension),
        Box::new(LargeBlobExtension),
    ]
}
