//! The `PublicKeyCredential` handed back to callers.

use std::collections::BTreeMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ciborium::value::Value;

/// This library only drives removable keys, so attachment is a constant.
/// Reporting "platform" for any configuration remains a product decision.
pub const AUTHENTICATOR_ATTACHMENT: &str = "cross-platform";

/// Registration response: the attestation object plus everything needed
/// to use the new credential.
#[derive(Clone, Debug, PartialEq)]
pub struct AuthenticatorAttestationResponse {
    pub client_data_json: Vec<u8>,
    pub transports: Vec<String>,
    pub attestation_object: Vec<u8>,
    pub authenticator_data: Vec<u8>,
    /// DER SubjectPublicKeyInfo of the credential key, when the COSE key
    /// has a standard encoding.
    pub public_key: Option<Vec<u8>>,
    pub public_key_algorithm: i64,
}

/// Authentication response: the signed assertion.
#[derive(Clone, Debug, PartialEq)]
pub struct AuthenticatorAssertionResponse {
    pub client_data_json: Vec<u8>,
    pub authenticator_data: Vec<u8>,
    pub signature: Vec<u8>,
    pub user_handle: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PublicKeyCredential<R> {
    /// base64url of `raw_id`.
    pub id: String,
    pub raw_id: Vec<u8>,
    pub authenticator_attachment: &'static str,
    pub client_extension_results: BTreeMap<String, Value>,
    pub response: R,
}

impl<R> PublicKeyCredential<R> {
    pub fn new(
        raw_id: Vec<u8>,
        response: R,
        client_extension_results: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            id: URL_SAFE_NO_PAD.encode(&raw_id),
            raw_id,
            authenticator_attachment: AUTHENTICATOR_ATTACHMENT,
            client_extension_results,
            response,
        }
    }

    pub fn credential_type(&self) -> &'static str {
        super::CREDENTIAL_TYPE_PUBLIC_KEY
    }
}
