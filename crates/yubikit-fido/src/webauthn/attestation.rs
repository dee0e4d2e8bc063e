//! Attestation: the authenticator's signed statement binding a freshly
//! created credential to its identity.

use ciborium::value::Value;
use yubikit_core::cbor::{self, MapBuilder, MapView};
use yubikit_core::Error;

use super::authenticator_data::AuthenticatorData;
use crate::Result;

/// > WebAuthn Relying Parties may use AttestationConveyancePreference to
/// > specify their preference regarding attestation conveyance during
/// > credential generation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AttestationConveyancePreference {
    /// > The Relying Party is not interested in authenticator attestation.
    #[default]
    None,
    /// > The Relying Party wants to receive a verifiable attestation
    /// > statement, but allows the client to decide how to obtain it.
    Indirect,
    /// > The Relying Party wants to receive the attestation statement as
    /// > generated by the authenticator.
    Direct,
    /// > The Relying Party wants to receive an attestation statement that
    /// > may include uniquely identifying information.
    Enterprise,
}

impl AttestationConveyancePreference {
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "indirect" => Some(Self::Indirect),
            "direct" => Some(Self::Direct),
            "enterprise" => Some(Self::Enterprise),
            _ => None,
        }
    }
}

const TAG_FMT: i64 = 0x01;
const TAG_AUTH_DATA: i64 = 0x02;
const TAG_ATT_STMT: i64 = 0x03;
const TAG_EP_ATT: i64 = 0x04;
const TAG_LARGE_BLOB_KEY: i64 = 0x05;
const TAG_UNSIGNED_EXTENSION_OUTPUTS: i64 = 0x06;

/// A parsed `authenticatorMakeCredential` response.
///
/// Note that a missing `unsigned_extension_outputs` and an empty one
/// compare unequal; callers that care about the distinction get it.
#[derive(Clone, Debug, PartialEq)]
pub struct AttestationObject {
    pub format: String,
    pub auth_data: AuthenticatorData,
    /// The exact authenticator data bytes as received; signatures cover
    /// these, so they are kept verbatim.
    pub raw_auth_data: Vec<u8>,
    pub att_stmt: Value,
    pub ep_att: Option<bool>,
    pub large_blob_key: Option<Vec<u8>>,
    pub unsigned_extension_outputs: Option<Value>,
}

impl AttestationObject {
    /// Parse the integer-keyed CTAP2 response map.
    pub fn from_response(value: &Value) -> Result<Self> {
        let map = MapView::from_value(value)?;
        let format = cbor::as_text(map.required(TAG_FMT)?)?.to_string();
        let raw_auth_data = cbor::as_bytes(map.required(TAG_AUTH_DATA)?)?.to_vec();
        let auth_data = AuthenticatorData::parse(&raw_auth_data)?;
        let att_stmt = map.required(TAG_ATT_STMT)?.clone();
        let ep_att = map.get_int(TAG_EP_ATT).map(cbor::as_bool).transpose()?;
        let large_blob_key = map
            .get_int(TAG_LARGE_BLOB_KEY)
            .map(|v| Ok::<_, Error>(cbor::as_bytes(v)?.to_vec()))
            .transpose()?;
        let unsigned_extension_outputs = map.get_int(TAG_UNSIGNED_EXTENSION_OUTPUTS).cloned();
        Ok(Self {
            format,
            auth_data,
            raw_auth_data,
            att_stmt,
            ep_att,
            large_blob_key,
            unsigned_extension_outputs,
        })
    }

    /// Build a synthesized attestation object, e.g. on the U2F path.
    pub fn new(format: impl Into<String>, auth_data: AuthenticatorData, att_stmt: Value) -> Result<Self> {
        let raw_auth_data = auth_data.to_bytes()?;
        Ok(Self {
            format: format.into(),
            auth_data,
            raw_auth_data,
            att_stmt,
            ep_att: None,
            large_blob_key: None,
            unsigned_extension_outputs: None,
        })
    }

    /// Serialize to the text-keyed WebAuthn attestation object form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut map = MapBuilder::new();
        map.push(cbor::text("fmt"), cbor::text(self.format.clone()));
        map.push(cbor::text("attStmt"), self.att_stmt.clone());
        map.push(cbor::text("authData"), cbor::bytes(self.raw_auth_data.clone()));
        map.push_opt(cbor::text("epAtt"), self.ep_att.map(Value::Bool));
        map.push_opt(
            cbor::text("largeBlobKey"),
            self.large_blob_key.clone().map(cbor::bytes),
        );
        map.push_opt(
            cbor::text("unsignedExtensionOutputs"),
            self.unsigned_extension_outputs.clone(),
        );
        Ok(cbor::encode(&map.build())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cose::{alg, CoseKey};
    use crate::webauthn::authenticator_data::{
        AttestedCredentialData, AuthenticatorDataFlags,
    };

    fn auth_data() -> AuthenticatorData {
        AuthenticatorData {
            rp_id_hash: [3; 32],
            flags: AuthenticatorDataFlags::USER_PRESENT
                | AuthenticatorDataFlags::ATTESTED_CREDENTIAL_DATA,
            sign_count: 1,
            attested_credential_data: Some(AttestedCredentialData {
                aaguid: [0; 16],
                credential_id: vec![7; 16],
                public_key: CoseKey::ec2_p256(alg::ES256, vec![1; 32], vec![2; 32]),
            }),
            extensions: None,
        }
    }

    fn response_map(with_unsigned: bool) -> Value {
        let mut map = MapBuilder::new();
        map.push(cbor::int(TAG_FMT), cbor::text("packed"));
        map.push(
            cbor::int(TAG_AUTH_DATA),
            cbor::bytes(auth_data().to_bytes().unwrap()),
        );
        let mut stmt = MapBuilder::new();
        stmt.push(cbor::text("alg"), cbor::int(alg::ES256));
        stmt.push(cbor::text("sig"), cbor::bytes(vec![0xD5; 70]));
        map.push(cbor::int(TAG_ATT_STMT), stmt.build());
        if with_unsigned {
            map.push(
                cbor::int(TAG_UNSIGNED_EXTENSION_OUTPUTS),
                Value::Map(Vec::new()),
            );
        }
        map.build()
    }

    #[test]
    fn parses_ctap_response() {
        let object = AttestationObject::from_response(&response_map(false)).unwrap();
        assert_eq!(object.format, "packed");
        assert_eq!(object.auth_data, auth_data());
        assert!(object.ep_att.is_none());
        assert!(object.large_blob_key.is_none());
    }

    #[test]
    fn webauthn_form_key_order() {
        let object = AttestationObject::from_response(&response_map(false)).unwrap();
        let bytes = object.to_bytes().unwrap();
        // "fmt" (3) < "attStmt" (7) < "authData" (8) in canonical order
        assert_eq!(bytes[0], 0xA3);
        assert_eq!(&bytes[1..5], b"\x63fmt");
    }

    #[test]
    fn nil_and_empty_unsigned_outputs_differ() {
        let absent = AttestationObject::from_response(&response_map(false)).unwrap();
        let empty = AttestationObject::from_response(&response_map(true)).unwrap();
        assert_ne!(absent, empty);
        assert_eq!(empty.unsigned_extension_outputs, Some(Value::Map(Vec::new())));
    }
}
