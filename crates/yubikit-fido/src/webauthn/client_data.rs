//! Collected client data: the JSON document both sides sign over.
//!
//! The serialized form is fixed: keys in the order `type`, `challenge`,
//! `origin`, `crossOrigin` and no whitespace. The SHA-256 of exactly
//! these bytes is the `clientDataHash` sent to the authenticator.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Serialize;
use sha2::{Digest, Sha256};

pub const TYPE_CREATE: &str = "webauthn.create";
pub const TYPE_GET: &str = "webauthn.get";

#[derive(Serialize)]
struct ClientDataJson<'a> {
    #[serde(rename = "type")]
    operation: &'a str,
    challenge: &'a str,
    origin: &'a str,
    #[serde(rename = "crossOrigin", skip_serializing_if = "Option::is_none")]
    cross_origin: Option<bool>,
}

/// Where a request comes from, as reported in the collected client data.
#[derive(Clone, Debug)]
pub struct ClientDataProvider {
    pub origin: String,
    pub cross_origin: Option<bool>,
}

impl ClientDataProvider {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            cross_origin: None,
        }
    }

    /// Serialize the client data for one operation.
    pub fn client_data(&self, operation: &str, challenge: &[u8]) -> Vec<u8> {
        let challenge = URL_SAFE_NO_PAD.encode(challenge);
        serde_json::to_vec(&ClientDataJson {
            operation,
            challenge: &challenge,
            origin: &self.origin,
            cross_origin: self.cross_origin,
        })
        .expect("client data always serializes")
    }
}

pub fn client_data_hash(client_data_json: &[u8]) -> [u8; 32] {
    Sha256::digest(client_data_json).into()
}
