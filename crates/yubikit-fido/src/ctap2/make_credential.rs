//! The `authenticatorMakeCredential` command.

use ciborium::value::Value;
use yubikit_core::cbor::{self, MapBuilder};
use yubikit_core::{CommandState, SmartCardConnection};

use super::{command, Ctap2Session};
use crate::webauthn::attestation::AttestationObject;
use crate::webauthn::{
    PublicKeyCredentialDescriptor, PublicKeyCredentialParameters, PublicKeyCredentialRpEntity,
    PublicKeyCredentialUserEntity,
};
use crate::Result;

const TAG_CLIENT_DATA_HASH: i64 = 0x01;
const TAG_RP: i64 = 0x02;
const TAG_USER: i64 = 0x03;
const TAG_PUB_KEY_CRED_PARAMS: i64 = 0x04;
const TAG_EXCLUDE_LIST: i64 = 0x05;
const TAG_EXTENSIONS: i64 = 0x06;
const TAG_OPTIONS: i64 = 0x07;
const TAG_PIN_UV_AUTH_PARAM: i64 = 0x08;
const TAG_PIN_UV_AUTH_PROTOCOL: i64 = 0x09;
const TAG_ENTERPRISE_ATTESTATION: i64 = 0x0A;

/// Wire parameters for one `authenticatorMakeCredential` call.
#[derive(Debug)]
pub struct MakeCredentialRequest<'a> {
    /// > Hash of the ClientData contextual binding specified by host.
    pub client_data_hash: &'a [u8],
    /// The RP the new credential is scoped to; `rp_id` is the resolved
    /// identifier, which may differ from `rp.id` when the caller left it
    /// unset.
    pub rp: &'a PublicKeyCredentialRpEntity,
    pub rp_id: &'a str,
    pub user: &'a PublicKeyCredentialUserEntity,
    /// > List of supported algorithms for credential generation. The
    /// > array is ordered from most preferred to least preferred.
    pub pub_key_cred_params: &'a [PublicKeyCredentialParameters],
    /// > The authenticator returns an error if the authenticator already
    /// > contains one of the credentials enumerated in this array.
    pub exclude_list: &'a [PublicKeyCredentialDescriptor],
    /// Authenticator extension inputs, keyed by extension identifier.
    pub extensions: Option<Value>,
    /// The `rk`/`up`/`uv` option map, when any option deviates from its
    /// default.
    pub options: Option<Value>,
    pub pin_uv_auth_param: Option<Vec<u8>>,
    pub pin_uv_auth_protocol: Option<u64>,
    pub enterprise_attestation: Option<u64>,
}

impl MakeCredentialRequest<'_> {
    pub(crate) fn to_value(&self) -> Value {
        let mut map = MapBuilder::new();
        map.push(
            cbor::int(TAG_CLIENT_DATA_HASH),
            cbor::bytes(self.client_data_hash),
        );
        map.push(cbor::int(TAG_RP), self.rp.to_value(self.rp_id));
        map.push(cbor::int(TAG_USER), self.user.to_value());
        map.push(
            cbor::int(TAG_PUB_KEY_CRED_PARAMS),
            cbor::array(
                self.pub_key_cred_params
                    .iter()
                    .map(PublicKeyCredentialParameters::to_value)
                    .collect(),
            ),
        );
        if !self.exclude_list.is_empty() {
            map.push(
                cbor::int(TAG_EXCLUDE_LIST),
                cbor::array(
                    self.exclude_list
                        .iter()
                        .map(PublicKeyCredentialDescriptor::to_value)
                        .collect(),
                ),
            );
        }
        map.push_opt(cbor::int(TAG_EXTENSIONS), self.extensions.clone());
        map.push_opt(cbor::int(TAG_OPTIONS), self.options.clone());
        map.push_opt(
            cbor::int(TAG_PIN_UV_AUTH_PARAM),
            self.pin_uv_auth_param.clone().map(cbor::bytes),
        );
        map.push_opt(
            cbor::int(TAG_PIN_UV_AUTH_PROTOCOL),
            self.pin_uv_auth_protocol.map(cbor::uint),
        );
        map.push_opt(
            cbor::int(TAG_ENTERPRISE_ATTESTATION),
            self.enterprise_attestation.map(cbor::uint),
        );
        map.build()
    }
}

impl<C: SmartCardConnection> Ctap2Session<C> {
    /// Create a credential and parse the attestation it comes back with.
    pub fn make_credential(
        &mut self,
        request: &MakeCredentialRequest<'_>,
        state: Option<&CommandState>,
    ) -> Result<AttestationObject> {
        let body = self
            .send_cbor_cancellable(command::MAKE_CREDENTIAL, Some(request.to_value()), state)?
            .ok_or(yubikit_core::Error::BadResponse(
                "makeCredential returned no body",
            ))?;
        AttestationObject::from_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yubikit_core::cbor::MapView;

    #[test]
    fn request_map_layout() {
        let rp = PublicKeyCredentialRpEntity::new("example.com", "Example");
        let user = PublicKeyCredentialUserEntity::new(vec![1; 4], "ada", "Ada");
        let params = [PublicKeyCredentialParameters::es256()];
        let request = MakeCredentialRequest {
            client_data_hash: &[0xCD; 32],
            rp: &rp,
            rp_id: "example.com",
            user: &user,
            pub_key_cred_params: &params,
            exclude_list: &[],
            extensions: None,
            options: None,
            pin_uv_auth_param: Some(vec![0xAF; 32]),
            pin_uv_auth_protocol: Some(2),
            enterprise_attestation: None,
        };
        let value = request.to_value();
        let map = MapView::from_value(&value).unwrap();
        assert!(map.get_int(TAG_CLIENT_DATA_HASH).is_some());
        assert!(map.get_int(TAG_RP).is_some());
        assert!(map.get_int(TAG_USER).is_some());
        assert!(map.get_int(TAG_PUB_KEY_CRED_PARAMS).is_some());
        assert!(map.get_int(TAG_EXCLUDE_LIST).is_none());
        assert!(map.get_int(TAG_OPTIONS).is_none());
        assert_eq!(
            cbor::as_u64(map.get_int(TAG_PIN_UV_AUTH_PROTOCOL).unwrap()).unwrap(),
            2
        );
    }
}
