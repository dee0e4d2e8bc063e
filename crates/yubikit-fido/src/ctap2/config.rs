//! The `authenticatorConfig` command.

use ciborium::value::Value;
use yubikit_core::cbor::{self, MapBuilder};
use yubikit_core::SmartCardConnection;

use super::pin_uv::PinUvAuthProtocol;
use super::{command, Ctap2Session};
use crate::Result;

const SUB_ENABLE_ENTERPRISE_ATTESTATION: u8 = 0x01;
const SUB_TOGGLE_ALWAYS_UV: u8 = 0x02;
const SUB_SET_MIN_PIN_LENGTH: u8 = 0x03;

const TAG_SUB_COMMAND: i64 = 0x01;
const TAG_SUB_PARAMS: i64 = 0x02;
const TAG_PIN_UV_AUTH_PROTOCOL: i64 = 0x03;
const TAG_PIN_UV_AUTH_PARAM: i64 = 0x04;

const PARAM_NEW_MIN_PIN_LENGTH: i64 = 0x01;
const PARAM_MIN_PIN_LENGTH_RP_IDS: i64 = 0x02;
const PARAM_FORCE_CHANGE_PIN: i64 = 0x03;

/// Authenticator configuration; every subcommand is authenticated with a
/// pinUvAuthToken carrying the `acfg` permission.
pub struct Config<'a, C> {
    session: &'a mut Ctap2Session<C>,
    protocol: &'a dyn PinUvAuthProtocol,
    token: &'a [u8],
}

impl<'a, C: SmartCardConnection> Config<'a, C> {
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

    fn send(&mut self, sub_command: u8, params: Option<Value>) -> Result<()> {
        // 32 x 0xFF || 0x0D || subCommand || subCommandParams
        let mut message = vec![0xFF; 32];
        message.push(0x0D);
        message.push(sub_command);
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
        self.session.send_cbor(command::CONFIG, Some(map.build()))?;
        Ok(())
    }

    /// Allow enterprise attestation until the next reset or toggle.
    pub fn enable_enterprise_attestation(&mut self) -> Result<()> {
        self.send(SUB_ENABLE_ENTERPRISE_ATTESTATION, None)
    }

    /// Flip the always-require-UV switch.
    pub fn toggle_always_uv(&mut self) -> Result<()> {
        self.send(SUB_TOGGLE_ALWAYS_UV, None)
    }

    /// Raise the minimum PIN length, optionally naming RPs allowed to
    /// read it via the `minPinLength` extension, optionally forcing a
    /// PIN change first.
    pub fn set_min_pin_length(
        &mut self,
        new_min_pin_length: Option<u64>,
        min_pin_length_rp_ids: &[&str],
        force_change_pin: Option<bool>,
    ) -> Result<()> {
        let mut params = MapBuilder::new();
        params.push_opt(
            cbor::int(PARAM_NEW_MIN_PIN_LENGTH),
            new_min_pin_length.map(cbor::uint),
        );
        if !min_pin_length_rp_ids.is_empty() {
            params.push(
                cbor::int(PARAM_MIN_PIN_LENGTH_RP_IDS),
                cbor::array(min_pin_length_rp_ids.iter().copied().map(cbor::text).collect()),
            );
        }
        params.push_opt(
            cbor::int(PARAM_FORCE_CHANGE_PIN),
            force_change_pin.map(Value::Bool),
        );
        let params = if params.is_empty() {
            None
        } else {
            Some(params.build())
        };
        self.send(SUB_SET_MIN_PIN_LENGTH, params)
    }
}
