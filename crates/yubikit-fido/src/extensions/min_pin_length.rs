//! The `minPinLength` extension: lets enrolled RPs learn the configured
//! minimum PIN length from the signed authenticator data.

use ciborium::value::Value;
use yubikit_core::SmartCardConnection;

use super::{CreateOutcome, Extension, ExtensionInputs};
use crate::ctap2::pin_uv::PinUvAuthProtocol;
use crate::ctap2::Ctap2Session;
use crate::webauthn::client::ClientError;

pub struct MinPinLengthExtension;

impl<C: SmartCardConnection> Extension<C> for MinPinLengthExtension {
    fn name(&self) -> &'static str {
        "minPinLength"
    }

    fn process_create_input(
        &self,
        session: &mut Ctap2Session<C>,
        inputs: &ExtensionInputs,
        _protocol: &dyn PinUvAuthProtocol,
    ) -> Result<Option<CreateOutcome<C>>, ClientError> {
        let requested = inputs
            .get("minPinLength")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !requested || !Extension::<C>::is_supported(self, session.info()) {
            return Ok(None);
        }
        Ok(Some(CreateOutcome {
            auth_input: Some(("minPinLength".to_string(), Value::Bool(true))),
            ..Default::default()
        }))
    }
}
