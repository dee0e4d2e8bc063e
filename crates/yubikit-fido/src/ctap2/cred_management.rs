//! The `authenticatorCredentialManagement` command: inventory and
//! maintenance of discoverable credentials.

use ciborium::value::Value;
use yubikit_core::cbor::{self, MapBuilder, MapView};
use yubikit_core::{Error, SmartCardConnection};

use super::pin_uv::PinUvAuthProtocol;
use super::{command, Ctap2Session};
use crate::cose::CoseKey;
use crate::webauthn::{PublicKeyCredentialDescriptor, PublicKeyCredentialUserEntity};
use crate::{CtapStatus, FidoError, Result};

const SUB_GET_CREDS_METADATA: u8 = 0x01;
const SUB_ENUMERATE_RPS_BEGIN: u8 = 0x02;
const SUB_ENUMERATE_RPS_NEXT: u8 = 0x03;
const SUB_ENUMERATE_CREDS_BEGIN: u8 = 0x04;
const SUB_ENUMERATE_CREDS_NEXT: u8 = 0x05;
const SUB_DELETE_CREDENTIAL: u8 = 0x06;
const SUB_UPDATE_USER_INFORMATION: u8 = 0x07;

const TAG_SUB_COMMAND: i64 = 0x01;
const TAG_SUB_PARAMS: i64 = 0x02;
const TAG_PIN_UV_AUTH_PROTOCOL: i64 = 0x03;
const TAG_PIN_UV_AUTH_PARAM: i64 = 0x04;

const PARAM_RP_ID_HASH: i64 = 0x01;
const PARAM_CREDENTIAL_ID: i64 = 0x02;
const PARAM_USER: i64 = 0x03;

const RESP_EXISTING_COUNT: i64 = 0x01;
const RESP_MAX_REMAINING_COUNT: i64 = 0x02;
const RESP_RP: i64 = 0x03;
const RESP_RP_ID_HASH: i64 = 0x04;
const RESP_TOTAL_RPS: i64 = 0x05;
const RESP_USER: i64 = 0x06;
const RESP_CREDENTIAL_ID: i64 = 0x07;
const RESP_PUBLIC_KEY: i64 = 0x08;
const RESP_TOTAL_CREDENTIALS: i64 = 0x09;
const RESP_CRED_PROTECT: i64 = 0x0A;
const RESP_LARGE_BLOB_KEY: i64 = 0x0B;

/// Discoverable-credential bookkeeping numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CredentialMetadata {
    pub existing_count: u64,
    pub max_possible_remaining_count: u64,
}

/// One relying party with discoverable credentials on the key.
#[derive(Clone, Debug, PartialEq)]
pub struct RpInfo {
    pub rp_id: String,
    pub rp_id_hash: Vec<u8>,
}

/// One discoverable credential.
#[derive(Clone, Debug, PartialEq)]
pub struct CredentialInfo {
    pub user: PublicKeyCredentialUserEntity,
    pub credential_id: PublicKeyCredentialDescriptor,
    pub public_key: CoseKey,
    pub cred_protect: Option<u64>,
    pub large_blob_key: Option<Vec<u8>>,
}

/// Credential management over a CTAP2 session; every subcommand is
/// authenticated with a pinUvAuthToken carrying the `cm` permission.
pub struct CredentialManagement<'a, C> {
    session: &'a mut Ctap2Session<C>,
    protocol: &'a dyn PinUvAuthProtocol,
    token: &'a [u8],
}

impl<'a, C: SmartCardConnection> CredentialManagement<'a, C> {
    pub fn new(
        session: &'a mut Ctap2Session<C>,
        protocol: &'a dyn PinUvAuthProtocol,
        token: &'a [u8],
    ) -> Self {
        Self {
            session,
            protocol,
            token,
        }
    }

    fn send(&mut self, sub_command: u8, params: Option<Value>) -> Result<Option<Value>> {
        let mut message = vec![sub_command];
        if let Some(params) = &params {
            message.extend(cbor::encode(params)?);
        }
        let auth = self.protocol.authenticate(self.token, &message);
        let mut map = MapBuilder::new();
        map.push(cbor::int(TAG_SUB_COMMAND), cbor::uint(sub_command as u64));
        map.push_opt(cbor::int(TAG_SUB_PARAMS), params);
        map.push(
            cbor::int(TAG_PIN_UV_AUTH_PROTOCOL),
            cbor::uint(self.protocol.version()),
        );
        map.push(cbor::int(TAG_PIN_UV_AUTH_PARAM), cbor::bytes(auth));
        self.session
            .send_cbor(command::CREDENTIAL_MANAGEMENT, Some(map.build()))
    }

    pub fn get_metadata(&mut self) -> Result<CredentialMetadata> {
        let body = self
            .send(SUB_GET_CREDS_METADATA, None)?
            .ok_or(Error::BadResponse("getCredsMetadata returned no body"))?;
        let map = MapView::from_value(&body)?;
        Ok(CredentialMetadata {
            existing_count: cbor::as_u64(map.required(RESP_EXISTING_COUNT)?)?,
            max_possible_remaining_count: cbor::as_u64(map.required(RESP_MAX_REMAINING_COUNT)?)?,
        })
    }

    /// Enumerate all RPs with discoverable credentials.
    pub fn enumerate_rps(&mut self) -> Result<Vec<RpInfo>> {
        let first = match self.send(SUB_ENUMERATE_RPS_BEGIN, None) {
            Err(FidoError::Ctap(CtapStatus::NoCredentials)) => return Ok(Vec::new()),
            other => other?,
        }
        .ok_or(Error::BadResponse("enumerateRPs returned no body"))?;
        let total = {
            let map = MapView::from_value(&first)?;
            cbor::as_u64(map.required(RESP_TOTAL_RPS)?)?
        };
        let mut rps = vec![parse_rp(&first)?];
        for _ in 1..total {
            let body = self
                .send(SUB_ENUMERATE_RPS_NEXT, None)?
                .ok_or(Error::BadResponse("enumerateRPs returned no body"))?;
            rps.push(parse_rp(&body)?);
        }
        Ok(rps)
    }

    /// Enumerate the credentials scoped to one RP-ID hash.
    pub fn enumerate_credentials(&mut self, rp_id_hash: &[u8]) -> Result<Vec<CredentialInfo>> {
        let mut params = MapBuilder::new();
        params.push(cbor::int(PARAM_RP_ID_HASH), cbor::bytes(rp_id_hash));
        let first = match self.send(SUB_ENUMERATE_CREDS_BEGIN, Some(params.build())) {
            Err(FidoError::Ctap(CtapStatus::NoCredentials)) => return Ok(Vec::new()),
            other => other?,
        }
        .ok_or(Error::BadResponse("enumerateCredentials returned no body"))?;
        let total = {
            let map = MapView::from_value(&first)?;
            cbor::as_u64(map.required(RESP_TOTAL_CREDENTIALS)?)?
        };
        let mut credentials = vec![parse_credential(&first)?];
        for _ in 1..total {
            let body = self
                .send(SUB_ENUMERATE_CREDS_NEXT, None)?
                .ok_or(Error::BadResponse("enumerateCredentials returned no body"))?;
            credentials.push(parse_credential(&body)?);
        }
        Ok(credentials)
    }

    pub fn delete_credential(
        &mut self,
        credential: &PublicKeyCredentialDescriptor,
    ) -> Result<()> {
        let mut params = MapBuilder::new();
        params.push(cbor::int(PARAM_CREDENTIAL_ID), credential.to_value());
        self.send(SUB_DELETE_CREDENTIAL, Some(params.build()))?;
        Ok(())
    }

    /// Replace the stored user entity for an existing credential.
    pub fn update_user_information(
        &mut self,
        credential: &PublicKeyCredentialDescriptor,
        user: &PublicKeyCredentialUserEntity,
    ) -> Result<()> {
        let mut params = MapBuilder::new();
        params.push(cbor::int(PARAM_CREDENTIAL_ID), credential.to_value());
        params.push(cbor::int(PARAM_USER), user.to_value());
        self.send(SUB_UPDATE_USER_INFORMATION, Some(params.build()))?;
        Ok(())
    }
}

fn parse_rp(body: &Value) -> Result<RpInfo> {
    let map = MapView::from_value(body)?;
    let rp = MapView::from_value(map.required(RESP_RP)?)?;
    let rp_id = rp
        .get_text("id")
        .map(cbor::as_text)
        .transpose()?
        .unwrap_or_default()
        .to_string();
    Ok(RpInfo {
        rp_id,
        rp_id_hash: cbor::as_bytes(map.required(RESP_RP_ID_HASH)?)?.to_vec(),
    })
}

fn parse_credential(body: &Value) -> Result<CredentialInfo> {
    let map = MapView::from_value(body)?;
    Ok(CredentialInfo {
        user: PublicKeyCredentialUserEntity::from_value(map.required(RESP_USER)?)?,
        credential_id: PublicKeyCredentialDescriptor::from_value(map.required(RESP_CREDENTIAL_ID)?)?,
        public_key: CoseKey::from_value(map.required(RESP_PUBLIC_KEY)?)?,
        cred_protect: map.get_int(RESP_CRED_PROTECT).map(cbor::as_u64).transpose()?,
        large_blob_key: map
            .get_int(RESP_LARGE_BLOB_KEY)
            .map(|v| Ok::<_, Error>(cbor::as_bytes(v)?.to_vec()))
            .transpose()?,
    })
}
