//! The `hmac-secret` extension: per-credential symmetric secrets derived
//! on the authenticator from salts the platform sends encrypted.

use ciborium::value::Value;
use yubikit_core::cbor::{self, MapBuilder, MapView};
use yubikit_core::SmartCardConnection;

use super::{CreateOutcome, Extension, ExtensionInputs, GetOutcome};
use crate::ctap2::client_pin::ClientPin;
use crate::ctap2::pin_uv::PinUvAuthProtocol;
use crate::ctap2::Ctap2Session;
use crate::webauthn::client::ClientError;

const CREATE_INPUT: &str = "hmacCreateSecret";
const GET_INPUT: &str = "hmacGetSecret";
const SALT_LEN: usize = 32;

const TAG_KEY_AGREEMENT: i64 = 0x01;
const TAG_SALT_ENC: i64 = 0x02;
const TAG_SALT_AUTH: i64 = 0x03;
const TAG_PIN_UV_AUTH_PROTOCOL: i64 = 0x04;

pub struct HmacSecretExtension;

fn salt_from(map: &MapView<'_>, key: &str) -> Result<Option<Vec<u8>>, ClientError> {
    let Some(value) = map.get_text(key) else {
        return Ok(None);
    };
    let salt = value
        .as_bytes()
        .ok_or(ClientError::BadRequest("hmacGetSecret salt must be bytes"))?;
    if salt.len() != SALT_LEN {
        return Err(ClientError::BadRequest("hmacGetSecret salt must be 32 bytes"));
    }
    Ok(Some(salt.clone()))
}

impl<C: SmartCardConnection> Extension<C> for HmacSecretExtension {
    fn name(&self) -> &'static str {
        "hmac-secret"
    }

    fn process_create_input(
        &self,
        session: &mut Ctap2Session<C>,
        inputs: &ExtensionInputs,
        _protocol: &dyn PinUvAuthProtocol,
    ) -> Result<Option<CreateOutcome<C>>, ClientError> {
        let requested = inputs
            .get(CREATE_INPUT)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !requested || !Extension::<C>::is_supported(self, session.info()) {
            return Ok(None);
        }
        Ok(Some(CreateOutcome {
            auth_input: Some(("hmac-secret".to_string(), Value::Bool(true))),
            finalize: Some(Box::new(|_, attestation, _| {
                let enabled = attestation
                    .auth_data
                    .extensions
                    .as_ref()
                    .and_then(|ext| MapView::from_value(ext).ok())
                    .and_then(|map| map.get_text("hmac-secret"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                Ok(Some((CREATE_INPUT.to_string(), Value::Bool(enabled))))
            })),
            ..Default::default()
        }))
    }

    fn process_get_input(
        &self,
        session: &mut Ctap2Session<C>,
        inputs: &ExtensionInputs,
        protocol: &dyn PinUvAuthProtocol,
    ) -> Result<Option<GetOutcome<C>>, ClientError> {
        let Some(request) = inputs.get(GET_INPUT) else {
            return Ok(None);
        };
        if !Extension::<C>::is_supported(self, session.info()) {
            return Ok(None);
        }
        let request = MapView::from_value(request)
            .map_err(|_| ClientError::BadRequest("hmacGetSecret must be a map"))?;
        let Some(salt1) = salt_from(&request, "salt1")? else {
            return Err(ClientError::BadRequest("hmacGetSecret requires salt1"));
        };
        let salt2 = salt_from(&request, "salt2")?;

        // Fresh key agreement per operation; the shared secret lives on in
        // the finalize hook to decrypt the outputs.
        let (platform_key, shared_secret) = ClientPin::new(session, protocol)
            .get_shared_secret()
            .map_err(ClientError::from)?;
        let mut salts = salt1;
        if let Some(salt2) = &salt2 {
            salts.extend_from_slice(salt2);
        }
        let salt_enc = protocol
            .encrypt(&shared_secret, &salts)
            .map_err(ClientError::from)?;
        let salt_auth = protocol.authenticate(&shared_secret, &salt_enc);

        let mut auth_input = MapBuilder::new();
        auth_input.push(cbor::int(TAG_KEY_AGREEMENT), platform_key.to_value());
        auth_input.push(cbor::int(TAG_SALT_ENC), cbor::bytes(salt_enc));
        auth_input.push(cbor::int(TAG_SALT_AUTH), cbor::bytes(salt_auth));
        if protocol.version() != 1 {
            auth_input.push(
                cbor::int(TAG_PIN_UV_AUTH_PROTOCOL),
                cbor::uint(protocol.version()),
            );
        }

        let two_salts = salt2.is_some();
        Ok(Some(GetOutcome {
            auth_input: Some(("hmac-secret".to_string(), auth_input.build())),
            finalize: Some(Box::new(move |_, assertion, auth| {
                let Some(output_enc) = assertion
                    .auth_data
                    .extensions
                    .as_ref()
                    .and_then(|ext| MapView::from_value(ext).ok())
                    .and_then(|map| map.get_text("hmac-secret"))
                    .and_then(|v| v.as_bytes())
                else {
                    return Ok(None);
                };
                let outputs = auth
                    .protocol
                    .decrypt(&shared_secret, output_enc)
                    .map_err(ClientError::from)?;
                if outputs.len() != if two_salts { 2 * SALT_LEN } else { SALT_LEN } {
                    return Err(ClientError::BadRequest("bad hmac-secret output length"));
                }
                let mut result = MapBuilder::new();
                result.push(
                    cbor::text("output1"),
                    cbor::bytes(outputs[..SALT_LEN].to_vec()),
                );
                if two_salts {
                    result.push(
                        cbor::text("output2"),
                        cbor::bytes(outputs[SALT_LEN..].to_vec()),
                    );
                }
                Ok(Some((GET_INPUT.to_string(), result.build())))
            })),
            ..Default::default()
        }))
    }
}
