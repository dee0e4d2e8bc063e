//! The cached `authenticatorGetInfo` response.

use std::collections::BTreeMap;

use ciborium::value::Value;
use yubikit_core::cbor::{self, MapView};
use yubikit_core::Error;

use crate::webauthn::PublicKeyCredentialParameters;
use crate::Result;

/// Everything the authenticator reports about itself. Fetched once per
/// session and read-only afterwards; every higher layer queries this
/// instead of making additional round-trips.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InfoData {
    pub versions: Vec<String>,
    pub extensions: Vec<String>,
    pub aaguid: [u8; 16],
    pub options: BTreeMap<String, bool>,
    pub max_msg_size: Option<u64>,
    pub pin_uv_auth_protocols: Vec<u64>,
    pub max_credential_count_in_list: Option<u64>,
    pub max_credential_id_length: Option<u64>,
    pub transports: Vec<String>,
    pub algorithms: Vec<PublicKeyCredentialParameters>,
    pub max_serialized_large_blob_array: Option<u64>,
    pub force_pin_change: bool,
    pub min_pin_length: u64,
    pub firmware_version: Option<u64>,
    pub max_cred_blob_length: Option<u64>,
    pub max_rp_ids_for_set_min_pin_length: Option<u64>,
    pub preferred_platform_uv_attempts: Option<u64>,
    pub uv_modality: Option<u64>,
    pub certifications: BTreeMap<String, u64>,
    pub remaining_discoverable_credentials: Option<u64>,
    pub vendor_prototype_config_commands: Vec<u64>,
}

impl InfoData {
    pub fn parse(value: &Value) -> Result<Self> {
        let map = MapView::from_value(value)?;
        let mut info = InfoData {
            versions: string_list(map.required(0x01)?)?,
            aaguid: aaguid(map.required(0x03)?)?,
            min_pin_length: 4,
            ..Default::default()
        };
        if let Some(value) = map.get_int(0x02) {
            info.extensions = string_list(value)?;
        }
        if let Some(value) = map.get_int(0x04) {
            for (key, enabled) in MapView::from_value(value)?.entries() {
                info.options
                    .insert(cbor::as_text(key)?.to_string(), cbor::as_bool(enabled)?);
            }
        }
        if let Some(value) = map.get_int(0x05) {
            info.max_msg_size = Some(cbor::as_u64(value)?);
        }
        if let Some(value) = map.get_int(0x06) {
            info.pin_uv_auth_protocols = uint_list(value)?;
        }
        if let Some(value) = map.get_int(0x07) {
            info.max_credential_count_in_list = Some(cbor::as_u64(value)?);
        }
        if let Some(value) = map.get_int(0x08) {
            info.max_credential_id_length = Some(cbor::as_u64(value)?);
        }
        if let Some(value) = map.get_int(0x09) {
            info.transports = string_list(value)?;
        }
        if let Some(value) = map.get_int(0x0A) {
            info.algorithms = cbor::as_array(value)?
                .iter()
                .map(PublicKeyCredentialParameters::from_value)
                .collect::<Result<_>>()?;
        }
        if let Some(value) = map.get_int(0x0B) {
            info.max_serialized_large_blob_array = Some(cbor::as_u64(value)?);
        }
        if let Some(value) = map.get_int(0x0C) {
            info.force_pin_change = cbor::as_bool(value)?;
        }
        if let Some(value) = map.get_int(0x0D) {
            info.min_pin_length = cbor::as_u64(value)?;
        }
        if let Some(value) = map.get_int(0x0E) {
            info.firmware_version = Some(cbor::as_u64(value)?);
        }
        if let Some(value) = map.get_int(0x0F) {
            info.max_cred_blob_length = Some(cbor::as_u64(value)?);
        }
        if let Some(value) = map.get_int(0x10) {
            info.max_rp_ids_for_set_min_pin_length = Some(cbor::as_u64(value)?);
        }
        if let Some(value) = map.get_int(0x11) {
            info.preferred_platform_uv_attempts = Some(cbor::as_u64(value)?);
        }
        if let Some(value) = map.get_int(0x12) {
            info.uv_modality = Some(cbor::as_u64(value)?);
        }
        if let Some(value) = map.get_int(0x13) {
            for (key, level) in MapView::from_value(value)?.entries() {
                info.certifications
                    .insert(cbor::as_text(key)?.to_string(), cbor::as_u64(level)?);
            }
        }
        if let Some(value) = map.get_int(0x14) {
            info.remaining_discoverable_credentials = Some(cbor::as_u64(value)?);
        }
        if let Some(value) = map.get_int(0x15) {
            info.vendor_prototype_config_commands = uint_list(value)?;
        }
        Ok(info)
    }

    /// The option is present and set to true.
    pub fn option_enabled(&self, name: &str) -> bool {
        self.options.get(name) == Some(&true)
    }

    /// The option is present at all, enabled or not.
    pub fn option_supported(&self, name: &str) -> bool {
        self.options.contains_key(name)
    }

    pub fn supports_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|e| e == name)
    }

    pub fn supports_version(&self, version: &str) -> bool {
        self.versions.iter().any(|v| v == version)
    }

    /// A client PIN has been configured on the authenticator.
    pub fn pin_configured(&self) -> bool {
        self.option_enabled("clientPin")
    }

    /// Built-in user verification is configured (biometrics enrolled or
    /// on-device PIN entry available).
    pub fn uv_configured(&self) -> bool {
        self.option_enabled("uv") || self.option_enabled("bioEnroll")
    }

    /// The authenticator hands out pinUvAuthTokens with permissions.
    pub fn supports_permissions(&self) -> bool {
        self.option_enabled("pinUvAuthToken")
    }

    /// Whether some form of user verification protects credentials.
    pub fn uv_protected(&self) -> bool {
        self.pin_configured() || self.uv_configured()
    }
}

fn string_list(value: &Value) -> Result<Vec<String>> {
    cbor::as_array(value)?
        .iter()
        .map(|v| Ok(cbor::as_text(v)?.to_string()))
        .collect()
}

fn uint_list(value: &Value) -> Result<Vec<u64>> {
    cbor::as_array(value)?
        .iter()
        .map(|v| Ok(cbor::as_u64(v)?))
        .collect()
}

fn aaguid(value: &Value) -> Result<[u8; 16]> {
    cbor::as_bytes(value)?
        .try_into()
        .map_err(|_| Error::BadResponse("AAGUID must be 16 bytes").into())
}
