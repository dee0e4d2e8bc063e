//! WebAuthn data model: the entity structures and request options that
//! callers hand to the client.

use std::collections::BTreeMap;

use ciborium::value::Value;
use typed_builder::TypedBuilder;
use yubikit_core::cbor::{self, MapBuilder, MapView};
use yubikit_core::Error;

use crate::Result;

pub mod attestation;
pub mod authenticator_data;
pub mod client;
pub mod client_data;
pub mod credential;

pub use attestation::{AttestationConveyancePreference, AttestationObject};
pub use authenticator_data::{AttestedCredentialData, AuthenticatorData, AuthenticatorDataFlags};
pub use client_data::ClientDataProvider;
pub use credential::PublicKeyCredential;

/// The only credential type defined so far.
pub const CREDENTIAL_TYPE_PUBLIC_KEY: &str = "public-key";

/// > This PublicKeyCredentialRpEntity data structure describes a Relying
/// > Party with which the new public key credential will be associated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKeyCredentialRpEntity {
    pub id: Option<String>,
    pub name: String,
}

impl PublicKeyCredentialRpEntity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            name: name.into(),
        }
    }

    pub(crate) fn to_value(&self, rp_id: &str) -> Value {
        let mut map = MapBuilder::new();
        map.push(cbor::text("id"), cbor::text(rp_id));
        map.push(cbor::text("name"), cbor::text(self.name.clone()));
        map.build()
    }
}

/// > ... describes the user account to which the new public key
/// > credential will be associated at the RP.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKeyCredentialUserEntity {
    pub id: Vec<u8>,
    pub name: String,
    pub display_name: String,
}

impl PublicKeyCredentialUserEntity {
    pub fn new(id: impl Into<Vec<u8>>, name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            display_name: display_name.into(),
        }
    }

    pub(crate) fn to_value(&self) -> Value {
        let mut map = MapBuilder::new();
        map.push(cbor::text("id"), cbor::bytes(self.id.clone()));
        map.push(cbor::text("name"), cbor::text(self.name.clone()));
        map.push(
            cbor::text("displayName"),
            cbor::text(self.display_name.clone()),
        );
        map.build()
    }

    /// Assertion responses may carry only the user id.
    pub(crate) fn from_value(value: &Value) -> Result<Self> {
        let map = MapView::from_value(value)?;
        let id = cbor::as_bytes(
            map.get_text("id")
                .ok_or(Error::BadResponse("user entity without id"))?,
        )?
        .to_vec();
        let name = match map.get_text("name") {
            Some(value) => cbor::as_text(value)?.to_string(),
            None => String::new(),
        };
        let display_name = match map.get_text("displayName") {
            Some(value) => cbor::as_text(value)?.to_string(),
            None => String::new(),
        };
        Ok(Self {
            id,
            name,
            display_name,
        })
    }
}

/// > This dictionary identifies a specific public key credential.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKeyCredentialDescriptor {
    pub id: Vec<u8>,
    pub transports: Vec<String>,
}

impl PublicKeyCredentialDescriptor {
    pub fn new(id: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            transports: Vec::new(),
        }
    }

    pub(crate) fn to_value(&self) -> Value {
        let mut map = MapBuilder::new();
        map.push(cbor::text("id"), cbor::bytes(self.id.clone()));
        map.push(cbor::text("type"), cbor::text(CREDENTIAL_TYPE_PUBLIC_KEY));
        if !self.transports.is_empty() {
            map.push(
                cbor::text("transports"),
                cbor::array(self.transports.iter().map(cbor::text).collect()),
            );
        }
        map.build()
    }

    pub(crate) fn from_value(value: &Value) -> Result<Self> {
        let map = MapView::from_value(value)?;
        let id = cbor::as_bytes(
            map.get_text("id")
                .ok_or(Error::BadResponse("credential descriptor without id"))?,
        )?
        .to_vec();
        Ok(Self {
            id,
            transports: Vec::new(),
        })
    }
}

/// One entry of `pubKeyCredParams`, ordered from most to least preferred.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKeyCredentialParameters {
    pub alg: i64,
}

impl PublicKeyCredentialParameters {
    pub fn es256() -> Self {
        Self {
            alg: crate::cose::alg::ES256,
        }
    }

    pub(crate) fn to_value(&self) -> Value {
        let mut map = MapBuilder::new();
        map.push(cbor::text("alg"), cbor::int(self.alg));
        map.push(cbor::text("type"), cbor::text(CREDENTIAL_TYPE_PUBLIC_KEY));
        map.build()
    }

    pub(crate) fn from_value(value: &Value) -> Result<Self> {
        let map = MapView::from_value(value)?;
        let alg = cbor::as_i64(
            map.get_text("alg")
                .ok_or(Error::BadResponse("credential parameters without alg"))?,
        )?;
        Ok(Self { alg })
    }
}

/// > WebAuthn Relying Parties may use this to specify their requirements
/// > regarding authenticator attributes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthenticatorSelectionCriteria {
    pub resident_key: Option<ResidentKeyRequirement>,
    pub user_verification: UserVerificationRequirement,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResidentKeyRequirement {
    Discouraged,
    Preferred,
    Required,
}

impl ResidentKeyRequirement {
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "discouraged" => Some(Self::Discouraged),
            "preferred" => Some(Self::Preferred),
            "required" => Some(Self::Required),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UserVerificationRequirement {
    Discouraged,
    #[default]
    Preferred,
    Required,
}

impl UserVerificationRequirement {
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "discouraged" => Some(Self::Discouraged),
            "preferred" => Some(Self::Preferred),
            "required" => Some(Self::Required),
            _ => None,
        }
    }
}

/// Parameters for `makeCredential`.
#[derive(Clone, Debug, TypedBuilder)]
pub struct PublicKeyCredentialCreationOptions {
    pub rp: PublicKeyCredentialRpEntity,
    pub user: PublicKeyCredentialUserEntity,
    pub challenge: Vec<u8>,
    pub pub_key_cred_params: Vec<PublicKeyCredentialParameters>,
    #[builder(default)]
    pub timeout: Option<u32>,
    #[builder(default)]
    pub exclude_credentials: Vec<PublicKeyCredentialDescriptor>,
    #[builder(default)]
    pub authenticator_selection: Option<AuthenticatorSelectionCriteria>,
    #[builder(default)]
    pub attestation: AttestationConveyancePreference,
    #[builder(default)]
    pub extensions: BTreeMap<String, Value>,
}

/// Parameters for `getAssertion`.
#[derive(Clone, Debug, TypedBuilder)]
pub struct PublicKeyCredentialRequestOptions {
    pub challenge: Vec<u8>,
    #[builder(default)]
    pub timeout: Option<u32>,
    #[builder(default)]
    pub rp_id: Option<String>,
    #[builder(default)]
    pub allow_credentials: Vec<PublicKeyCredentialDescriptor>,
    #[builder(default)]
    pub user_verification: UserVerificationRequirement,
    #[builder(default)]
    pub extensions: BTreeMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_cbor_shape() {
        let descriptor = PublicKeyCredentialDescriptor::new(vec![1, 2, 3]);
        let encoded = cbor::encode(&descriptor.to_value()).unwrap();
        // {"id": h'010203', "type": "public-key"}: "id" sorts before "type"
        assert_eq!(
            hex::encode(encoded),
            "a26269644301020364747970656a7075626c69632d6b6579"
        );
    }

    #[test]
    fn requirement_parsing_is_strict() {
        assert_eq!(
            ResidentKeyRequirement::from_str("required"),
            Some(ResidentKeyRequirement::Required)
        );
        assert_eq!(ResidentKeyRequirement::from_str("Required"), None);
        assert_eq!(UserVerificationRequirement::from_str("bogus"), None);
        assert_eq!(
            UserVerificationRequirement::default(),
            UserVerificationRequirement::Preferred
        );
    }

    #[test]
    fn user_entity_round_trip() {
        let user = PublicKeyCredentialUserEntity::new(vec![9; 8], "ada", "Ada Lovelace");
        let parsed = PublicKeyCredentialUserEntity::from_value(&user.to_value()).unwrap();
        assert_eq!(parsed, user);
    }

    #[test]
    fn options_builder_defaults() {
        let options = PublicKeyCredentialRequestOptions::builder()
            .challenge(vec![0; 32])
            .build();
        assert!(options.rp_id.is_none());
        assert!(options.allow_credentials.is_empty());
        assert_eq!(
            options.user_verification,
            UserVerificationRequirement::Preferred
        );
    }
}
