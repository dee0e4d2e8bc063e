//! The `authenticatorGetAssertion` and `authenticatorGetNextAssertion`
//! commands.

use ciborium::value::Value;
use yubikit_core::cbor::{self, MapBuilder, MapView};
use yubikit_core::{CommandState, Error, SmartCardConnection};

use super::{command, Ctap2Session};
use crate::webauthn::authenticator_data::AuthenticatorData;
use crate::webauthn::{PublicKeyCredentialDescriptor, PublicKeyCredentialUserEntity};
use crate::Result;

const TAG_RP_ID: i64 = 0x01;
const TAG_CLIENT_DATA_HASH: i64 = 0x02;
const TAG_ALLOW_LIST: i64 = 0x03;
const TAG_EXTENSIONS: i64 = 0x04;
const TAG_OPTIONS: i64 = 0x05;
const TAG_PIN_UV_AUTH_PARAM: i64 = 0x06;
const TAG_PIN_UV_AUTH_PROTOCOL: i64 = 0x07;

const RESP_CREDENTIAL: i64 = 0x01;
const RESP_AUTH_DATA: i64 = 0x02;
const RESP_SIGNATURE: i64 = 0x03;
const RESP_USER: i64 = 0x04;
const RESP_NUMBER_OF_CREDENTIALS: i64 = 0x05;
const RESP_USER_SELECTED: i64 = 0x06;
const RESP_LARGE_BLOB_KEY: i64 = 0x07;

/// Wire parameters for one `authenticatorGetAssertion` call.
#[derive(Debug)]
pub struct GetAssertionRequest<'a> {
    /// > relying party identifier
    pub rp_id: &'a str,
    /// > Hash of the serialized client data collected by the host.
    pub client_data_hash: &'a [u8],
    /// > If this parameter is present the authenticator MUST only
    /// > generate an assertion using one of the denoted credentials. A
    /// > platform MUST NOT send an empty allowList.
    pub allow_list: &'a [PublicKeyCredentialDescriptor],
    pub extensions: Option<Value>,
    pub options: Option<Value>,
    pub pin_uv_auth_param: Option<Vec<u8>>,
    pub pin_uv_auth_protocol: Option<u64>,
}

impl GetAssertionRequest<'_> {
    pub(crate) fn to_value(&self) -> Value {
        let mut map = MapBuilder::new();
        map.push(cbor::int(TAG_RP_ID), cbor::text(self.rp_id));
        map.push(
            cbor::int(TAG_CLIENT_DATA_HASH),
            cbor::bytes(self.client_data_hash),
        );
        if !self.allow_list.is_empty() {
            map.push(
                cbor::int(TAG_ALLOW_LIST),
                cbor::array(
                    self.allow_list
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
        map.build()
    }
}

/// One assertion as returned by the authenticator.
#[derive(Clone, Debug, PartialEq)]
pub struct AssertionData {
    pub credential: Option<PublicKeyCredentialDescriptor>,
    pub raw_auth_data: Vec<u8>,
    pub auth_data: AuthenticatorData,
    pub signature: Vec<u8>,
    pub user: Option<PublicKeyCredentialUserEntity>,
    pub number_of_credentials: Option<u64>,
    pub user_selected: Option<bool>,
    pub large_blob_key: Option<Vec<u8>>,
}

impl AssertionData {
    pub(crate) fn parse(value: &Value) -> Result<Self> {
        let map = MapView::from_value(value)?;
        let credential = map
            .get_int(RESP_CREDENTIAL)
            .map(PublicKeyCredentialDescriptor::from_value)
            .transpose()?;
        let raw_auth_data = cbor::as_bytes(map.required(RESP_AUTH_DATA)?)?.to_vec();
        let auth_data = AuthenticatorData::parse(&raw_auth_data)?;
        let signature = cbor::as_bytes(map.required(RESP_SIGNATURE)?)?.to_vec();
        let user = map
            .get_int(RESP_USER)
            .map(PublicKeyCredentialUserEntity::from_value)
            .transpose()?;
        let number_of_credentials = map
            .get_int(RESP_NUMBER_OF_CREDENTIALS)
            .map(cbor::as_u64)
            .transpose()?;
        let user_selected = map
            .get_int(RESP_USER_SELECTED)
            .map(cbor::as_bool)
            .transpose()?;
        let large_blob_key = map
            .get_int(RESP_LARGE_BLOB_KEY)
            .map(|v| Ok::<_, Error>(cbor::as_bytes(v)?.to_vec()))
            .transpose()?;
        Ok(Self {
            credential,
            raw_auth_data,
            auth_data,
            signature,
            user,
            number_of_credentials,
            user_selected,
            large_blob_key,
        })
    }

    /// The credential id, from the descriptor when present.
    pub fn credential_id(&self) -> Option<&[u8]> {
        self.credential.as_ref().map(|c| c.id.as_slice())
    }
}

impl<C: SmartCardConnection> Ctap2Session<C> {
    /// Request an assertion. When the authenticator reports multiple
    /// matching discoverable credentials, the remaining assertions are
    /// drained immediately with `getNextAssertion`, as the protocol
    /// requires, and all of them are returned in order.
    pub fn get_assertion(
        &mut self,
        request: &GetAssertionRequest<'_>,
        state: Option<&CommandState>,
    ) -> Result<Vec<AssertionData>> {
        let body = self
            .send_cbor_cancellable(command::GET_ASSERTION, Some(request.to_value()), state)?
            .ok_or(Error::BadResponse("getAssertion returned no body"))?;
        let first = AssertionData::parse(&body)?;
        let total = first.number_of_credentials.unwrap_or(1).max(1);
        let mut assertions = vec![first];
        for _ in 1..total {
            let body = self
                .send_cbor(command::GET_NEXT_ASSERTION, None)?
                .ok_or(Error::BadResponse("getNextAssertion returned no body"))?;
            assertions.push(AssertionData::parse(&body)?);
        }
        Ok(assertions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctap2::testing::{ctap_request, default_info, ok_body, MockAuthenticator};
    use crate::webauthn::authenticator_data::AuthenticatorDataFlags;

    fn assertion_body(user_id: u8, total: Option<u64>) -> Value {
        let auth_data = AuthenticatorData {
            rp_id_hash: [6; 32],
            flags: AuthenticatorDataFlags::USER_PRESENT,
            sign_count: 9,
            attested_credential_data: None,
            extensions: None,
        };
        let mut user = MapBuilder::new();
        user.push(cbor::text("id"), cbor::bytes(vec![user_id; 4]));
        let mut map = MapBuilder::new();
        map.push(
            cbor::int(RESP_CREDENTIAL),
            PublicKeyCredentialDescriptor::new(vec![user_id; 8]).to_value(),
        );
        map.push(
            cbor::int(RESP_AUTH_DATA),
            cbor::bytes(auth_data.to_bytes().unwrap()),
        );
        map.push(cbor::int(RESP_SIGNATURE), cbor::bytes(vec![0x51; 16]));
        map.push(cbor::int(RESP_USER), user.build());
        if let Some(total) = total {
            map.push(cbor::int(RESP_NUMBER_OF_CREDENTIALS), cbor::uint(total));
        }
        map.build()
    }

    #[test]
    fn single_assertion() {
        let request = GetAssertionRequest {
            rp_id: "example.com",
            client_data_hash: &[0xCD; 32],
            allow_list: &[],
            extensions: None,
            options: None,
            pin_uv_auth_param: None,
            pin_uv_auth_protocol: None,
        };
        let mock = MockAuthenticator::new(
            default_info(),
            vec![(
                ctap_request(command::GET_ASSERTION, &request.to_value()),
                ok_body(&assertion_body(1, None)),
            )],
        );
        let mut session = Ctap2Session::new(mock).unwrap();
        let assertions = session.get_assertion(&request, None).unwrap();
        assert_eq!(assertions.len(), 1);
        assert_eq!(assertions[0].credential_id(), Some(&[1u8; 8][..]));
        assert_eq!(assertions[0].user.as_ref().unwrap().id, vec![1; 4]);
    }

    #[test]
    fn multiple_assertions_are_drained() {
        let request = GetAssertionRequest {
            rp_id: "example.com",
            client_data_hash: &[0xCD; 32],
            allow_list: &[],
            extensions: None,
            options: None,
            pin_uv_auth_param: None,
            pin_uv_auth_protocol: None,
        };
        let mock = MockAuthenticator::new(
            default_info(),
            vec![
                (
                    ctap_request(command::GET_ASSERTION, &request.to_value()),
                    ok_body(&assertion_body(1, Some(3))),
                ),
                (
                    vec![command::GET_NEXT_ASSERTION],
                    ok_body(&assertion_body(2, None)),
                ),
                (
                    vec![command::GET_NEXT_ASSERTION],
                    ok_body(&assertion_body(3, None)),
                ),
            ],
        );
        let mut session = Ctap2Session::new(mock).unwrap();
        let assertions = session.get_assertion(&request, None).unwrap();
        assert_eq!(assertions.len(), 3);
        let ids: Vec<_> = assertions
            .iter()
            .map(|a| a.user.as_ref().unwrap().id.clone())
            .collect();
        assert_eq!(ids, vec![vec![1; 4], vec![2; 4], vec![3; 4]]);
    }
}
