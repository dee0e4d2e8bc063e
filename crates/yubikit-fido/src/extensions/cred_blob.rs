//! The `credBlob` extension: a small opaque blob stored with the
//! credential and returned in the signed authenticator data.

use ciborium::value::Value;
use yubikit_core::cbor;
use yubikit_core::SmartCardConnection;

use super::{CreateOutcome, Extension, ExtensionInputs, GetOutcome};
use crate::ctap2::pin_uv::PinUvAuthProtocol;
use crate::ctap2::Ctap2Session;
use crate::webauthn::client::ClientError;

const CREATE_INPUT: &str = "credBlob";
const GET_INPUT: &str = "getCredBlob";

pub struct CredBlobExtension;

impl<C: SmartCardConnection> Extension<C> for CredBlobExtension {
    fn name(&self) -> &'static str {
        "credBlob"
    }

    fn process_create_input(
        &self,
        session: &mut Ctap2Session<C>,
        inputs: &ExtensionInputs,
        _protocol: &dyn PinUvAuthProtocol,
    ) -> Result<Option<CreateOutcome<C>>, ClientError> {
        let Some(blob) = inputs.get(CREATE_INPUT) else {
            return Ok(None);
        };
        let blob = blob
            .as_bytes()
            .ok_or(ClientError::BadRequest("credBlob must be a byte string"))?;
        if !Extension::<C>::is_supported(self, session.info()) {
            return Ok(None);
        }
        let max = session.info().max_cred_blob_length.unwrap_or(32);
        if blob.len() as u64 > max {
            return Err(ClientError::BadRequest("credBlob too large for this key"));
        }
        Ok(Some(CreateOutcome {
            auth_input: Some(("credBlob".to_string(), cbor::bytes(blob.clone()))),
            ..Default::default()
        }))
    }

    fn process_get_input(
        &self,
        session: &mut Ctap2Session<C>,
        inputs: &ExtensionInputs,
        _protocol: &dyn PinUvAuthProtocol,
    ) -> Result<Option<GetOutcome<C>>, ClientError> {
        let requested = inputs
            .get(GET_INPUT)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !requested || !Extension::<C>::is_supported(self, session.info()) {
            return Ok(None);
        }
        Ok(Some(GetOutcome {
            auth_input: Some(("credBlob".to_string(), Value::Bool(true))),
            ..Default::default()
        }))
    }
}
