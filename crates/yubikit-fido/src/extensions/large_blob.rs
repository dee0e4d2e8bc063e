//! The `largeBlob` extension: per-credential entries in the shared
//! large-blob store, keyed by the `largeBlobKey` the authenticator
//! returns with the credential.

use ciborium::value::Value;
use yubikit_core::cbor::{self, MapBuilder, MapView};
use yubikit_core::SmartCardConnection;

use super::{CreateOutcome, Extension, ExtensionInputs, GetOutcome};
use crate::ctap2::client_pin::PinPermissions;
use crate::ctap2::large_blobs::LargeBlobs;
use crate::ctap2::pin_uv::PinUvAuthProtocol;
use crate::ctap2::Ctap2Session;
use crate::webauthn::client::ClientError;

const INPUT: &str = "largeBlob";
const AUTH_INPUT: &str = "largeBlobKey";

pub struct LargeBlobExtension;

impl<C: SmartCardConnection> Extension<C> for LargeBlobExtension {
    fn name(&self) -> &'static str {
        "largeBlobKey"
    }

    fn is_supported(&self, info: &crate::ctap2::InfoData) -> bool {
        info.option_enabled("largeBlobs")
    }

    fn process_create_input(
        &self,
        session: &mut Ctap2Session<C>,
        inputs: &ExtensionInputs,
        _protocol: &dyn PinUvAuthProtocol,
    ) -> Result<Option<CreateOutcome<C>>, ClientError> {
        let Some(request) = inputs.get(INPUT) else {
            return Ok(None);
        };
        let request = MapView::from_value(request)
            .map_err(|_| ClientError::BadRequest("largeBlob must be a map"))?;
        if request.get_text("read").is_some() || request.get_text("write").is_some() {
            return Err(ClientError::BadRequest(
                "largeBlob read/write are assertion inputs",
            ));
        }
        let support = request
            .get_text("support")
            .map(cbor::as_text)
            .transpose()
            .map_err(|_| ClientError::BadRequest("largeBlob support must be a string"))?;
        let supported = Extension::<C>::is_supported(self, session.info());
        match support {
            Some("required") if !supported => {
                return Err(ClientError::ConfigurationUnsupported(
                    "large blobs not supported",
                ))
            }
            Some("required") | Some("preferred") => {}
            Some(_) => return Err(ClientError::BadRequest("unknown largeBlob support value")),
            None => return Ok(None),
        }
        if !supported {
            return Ok(None);
        }
        Ok(Some(CreateOutcome {
            auth_input: Some((AUTH_INPUT.to_string(), Value::Bool(true))),
            finalize: Some(Box::new(|_, attestation, _| {
                let mut result = MapBuilder::new();
                result.push(
                    cbor::text("supported"),
                    Value::Bool(attestation.large_blob_key.is_some()),
                );
                Ok(Some((INPUT.to_string(), result.build())))
            })),
            ..Default::default()
        }))
    }

    fn process_get_input(
        &self,
        session: &mut Ctap2Session<C>,
        inputs: &ExtensionInputs,
        _protocol: &dyn PinUvAuthProtocol,
    ) -> Result<Option<GetOutcome<C>>, ClientError> {
        let Some(request) = inputs.get(INPUT) else {
            return Ok(None);
        };
        if !Extension::<C>::is_supported(self, session.info()) {
            return Ok(None);
        }
        let request = MapView::from_value(request)
            .map_err(|_| ClientError::BadRequest("largeBlob must be a map"))?;
        let read = request
            .get_text("read")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let write = request
            .get_text("write")
            .map(|v| {
                v.as_bytes()
                    .cloned()
                    .ok_or(ClientError::BadRequest("largeBlob write must be bytes"))
            })
            .transpose()?;
        if read && write.is_some() {
            return Err(ClientError::BadRequest(
                "largeBlob read and write are exclusive",
            ));
        }
        if !read && write.is_none() {
            return Ok(None);
        }

        let permissions = if write.is_some() {
            PinPermissions::LARGE_BLOB_WRITE
        } else {
            PinPermissions::empty()
        };
        let finalize: super::GetFinalize<C> = Box::new(move |session, assertion, auth| {
            let mut result = MapBuilder::new();
            match (&write, assertion.large_blob_key.as_deref()) {
                (None, Some(key)) => {
                    let mut store = LargeBlobs::new(session, auth.protocol, auth.token);
                    if let Some(blob) = store.get_blob(key).map_err(ClientError::from)? {
                        result.push(cbor::text("blob"), cbor::bytes(blob));
                    }
                }
                (Some(data), Some(key)) => {
                    let mut store = LargeBlobs::new(session, auth.protocol, auth.token);
                    let written = store.put_blob(key, data).is_ok();
                    result.push(cbor::text("written"), Value::Bool(written));
                }
                (Some(_), None) => {
                    result.push(cbor::text("written"), Value::Bool(false));
                }
                (None, None) => {}
            }
            if result.is_empty() {
                Ok(None)
            } else {
                Ok(Some((INPUT.to_string(), result.build())))
            }
        });
        Ok(Some(GetOutcome {
            auth_input: Some((AUTH_INPUT.to_string(), Value::Bool(true))),
            permissions,
            finalize: Some(finalize),
        }))
    }
}
