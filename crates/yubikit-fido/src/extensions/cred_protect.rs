//! The `credProtect` extension: per-credential protection policy.

use yubikit_core::cbor;
use yubikit_core::SmartCardConnection;

use super::{CreateOutcome, Extension, ExtensionInputs};
use crate::ctap2::pin_uv::PinUvAuthProtocol;
use crate::ctap2::Ctap2Session;
use crate::webauthn::client::ClientError;

const POLICY_INPUT: &str = "credentialProtectionPolicy";
const ENFORCE_INPUT: &str = "enforceCredentialProtectionPolicy";

const LEVEL_OPTIONAL: u64 = 0x01;
const LEVEL_OPTIONAL_WITH_LIST: u64 = 0x02;
const LEVEL_REQUIRED: u64 = 0x03;

fn policy_level(policy: &str) -> Option<u64> {
    match policy {
        "userVerificationOptional" => Some(LEVEL_OPTIONAL),
        "userVerificationOptionalWithCredentialIDList" => Some(LEVEL_OPTIONAL_WITH_LIST),
        "userVerificationRequired" => Some(LEVEL_REQUIRED),
        _ => None,
    }
}

pub struct CredProtectExtension;

impl<C: SmartCardConnection> Extension<C> for CredProtectExtension {
    fn name(&self) -> &'static str {
        "credProtect"
    }

    fn process_create_input(
        &self,
        session: &mut Ctap2Session<C>,
        inputs: &ExtensionInputs,
        _protocol: &dyn PinUvAuthProtocol,
    ) -> Result<Option<CreateOutcome<C>>, ClientError> {
        let Some(policy) = inputs.get(POLICY_INPUT) else {
            return Ok(None);
        };
        let policy = policy
            .as_text()
            .and_then(policy_level)
            .ok_or(ClientError::BadRequest("unknown credProtect policy"))?;
        let enforce = inputs
            .get(ENFORCE_INPUT)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !Extension::<C>::is_supported(self, session.info()) {
            if enforce && policy > LEVEL_OPTIONAL {
                return Err(ClientError::ConfigurationUnsupported(
                    "credProtect not supported",
                ));
            }
            return Ok(None);
        }
        Ok(Some(CreateOutcome {
            auth_input: Some(("credProtect".to_string(), cbor::uint(policy))),
            ..Default::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_names_map_to_levels() {
        assert_eq!(policy_level("userVerificationOptional"), Some(1));
        assert_eq!(
            policy_level("userVerificationOptionalWithCredentialIDList"),
            Some(2)
        );
        assert_eq!(policy_level("userVerificationRequired"), Some(3));
        assert_eq!(policy_level("UserVerificationRequired"), None);
    }
}
