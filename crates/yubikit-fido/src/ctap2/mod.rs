//! CTAP2 authenticator protocol over a smart-card connection.
//!
//! Requests are a command byte followed by a canonical CBOR map; responses
//! are a status byte followed by an optional CBOR body. Everything rides
//! on NFCCTAP_MSG APDUs; chunking and keep-alives are the connection
//! layer's problem.

use ciborium::value::Value;
use tracing::debug;
use yubikit_core::apdu::{Apdu, ApduProcessor, SW_INS_NOT_SUPPORTED};
use yubikit_core::{cbor, CommandState, Error, SmartCardConnection};

use crate::{CtapStatus, FidoError, Result};

pub mod bio_enrollment;
pub mod client_pin;
pub mod config;
pub mod cred_management;
pub mod get_assertion;
pub mod info;
pub mod large_blobs;
pub mod make_credential;
pub mod pin_uv;

pub use info::InfoData;

/// FIDO applet AID.
pub const AID: [u8; 8] = [0xA0, 0x00, 0x00, 0x06, 0x47, 0x2F, 0x00, 0x01];

const INS_CTAP_MSG: u8 = 0x10;

/// CTAP2 command opcodes.
pub mod command {
    pub const MAKE_CREDENTIAL: u8 = 0x01;
    pub const GET_ASSERTION: u8 = 0x02;
    pub const GET_INFO: u8 = 0x04;
    pub const CLIENT_PIN: u8 = 0x06;
    pub const RESET: u8 = 0x07;
    pub const GET_NEXT_ASSERTION: u8 = 0x08;
    pub const BIO_ENROLLMENT: u8 = 0x09;
    pub const CREDENTIAL_MANAGEMENT: u8 = 0x0A;
    pub const SELECTION: u8 = 0x0B;
    pub const LARGE_BLOBS: u8 = 0x0C;
    pub const CONFIG: u8 = 0x0D;
}

/// A CTAP2 session. Selects the FIDO applet, fetches the authenticator
/// info once, and keeps it cached read-only for the session's lifetime.
#[derive(Debug)]
pub struct Ctap2Session<C> {
    processor: ApduProcessor<C>,
    info: InfoData,
}

impl<C: SmartCardConnection> Ctap2Session<C> {
    pub fn new(connection: C) -> Result<Self> {
        let mut processor = ApduProcessor::new(connection);
        processor.select(&AID)?;
        Self::from_processor(processor)
    }

    /// Build a session over an already-selected FIDO applet.
    pub(crate) fn from_processor(mut processor: ApduProcessor<C>) -> Result<Self> {
        if processor.supports_extended_length() {
            processor.force_extended();
        }
        let info = Self::fetch_info(&mut processor)?;
        Ok(Self::from_parts(processor, info))
    }

    /// Assemble a session from a processor and an already-fetched info.
    pub(crate) fn from_parts(processor: ApduProcessor<C>, info: InfoData) -> Self {
        debug!(versions = ?info.versions, "CTAP2 session established");
        Self { processor, info }
    }

    pub(crate) fn fetch_info(processor: &mut ApduProcessor<C>) -> Result<InfoData> {
        let body = match Self::transceive(processor, command::GET_INFO, None) {
            Err(FidoError::Core(Error::Apdu {
                sw: SW_INS_NOT_SUPPORTED,
            })) => return Err(FidoError::Ctap2NotSupported),
            other => other?,
        };
        let value = body.ok_or(Error::BadResponse("getInfo returned no body"))?;
        InfoData::parse(&value)
    }

    /// The cached `authenticatorGetInfo` response.
    pub fn info(&self) -> &InfoData {
        &self.info
    }

    /// Send one CTAP2 command and return the CBOR body, if any.
    pub fn send_cbor(&mut self, command: u8, payload: Option<Value>) -> Result<Option<Value>> {
        Self::transceive(&mut self.processor, command, payload.as_ref())
    }

    /// Like [`Ctap2Session::send_cbor`], aborting with OPERATION_DENIED at
    /// the APDU boundary when the caller cancelled.
    pub fn send_cbor_cancellable(
        &mut self,
        command: u8,
        payload: Option<Value>,
        state: Option<&CommandState>,
    ) -> Result<Option<Value>> {
        if state.is_some_and(CommandState::is_cancelled) {
            return Err(FidoError::Ctap(CtapStatus::OperationDenied));
        }
        self.send_cbor(command, payload)
    }

    fn transceive(
        processor: &mut ApduProcessor<C>,
        command: u8,
        payload: Option<&Value>,
    ) -> Result<Option<Value>> {
        let mut request = vec![command];
        if let Some(payload) = payload {
            request.extend(cbor::encode(payload)?);
        }
        let ne = if processor.supports_extended_length() {
            65536
        } else {
            256
        };
        let apdu = Apdu::new(0x80, INS_CTAP_MSG, 0x00, 0x00)
            .with_data(request)
            .with_ne(ne);
        let response = processor.send_and_receive(&apdu)?;
        let (&status, body) = response
            .split_first()
            .ok_or(Error::BadResponse("empty CTAP response"))?;
        if status != 0 {
            return Err(FidoError::Ctap(CtapStatus::from_byte(status)));
        }
        if body.is_empty() {
            Ok(None)
        } else {
            Ok(Some(cbor::decode(body)?))
        }
    }

    /// Factory-reset the authenticator. Requires a fresh power cycle and
    /// user presence; the authenticator enforces both.
    pub fn reset(&mut self, state: Option<&CommandState>) -> Result<()> {
        self.send_cbor_cancellable(command::RESET, None, state)?;
        Ok(())
    }

    /// Ask the user to prove presence so the platform can tell which of
    /// several connected authenticators to use.
    pub fn selection(&mut self, state: Option<&CommandState>) -> Result<()> {
        self.send_cbor_cancellable(command::SELECTION, None, state)?;
        Ok(())
    }

    pub fn into_connection(self) -> C {
        self.processor.into_connection()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn caches_info_at_init() {
        let mock = MockAuthenticator::new(default_info(), vec![]);
        let session = Ctap2Session::new(mock).unwrap();
        assert_eq!(session.info().aaguid, [0xA5; 16]);
        assert!(session.info().option_enabled("clientPin"));
        assert_eq!(session.info().pin_uv_auth_protocols, vec![2, 1]);
    }

    #[test]
    fn ctap_error_status_is_mapped() {
        let mock = MockAuthenticator::new(
            default_info(),
            vec![(vec![command::RESET], vec![0x27])],
        );
        let mut session = Ctap2Session::new(mock).unwrap();
        match session.reset(None) {
            Err(FidoError::Ctap(CtapStatus::OperationDenied)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn cancelled_state_short_circuits() {
        let mock = MockAuthenticator::new(default_info(), vec![]);
        let mut session = Ctap2Session::new(mock).unwrap();
        let state = CommandState::new();
        state.cancel();
        match session.selection(Some(&state)) {
            Err(FidoError::Ctap(CtapStatus::OperationDenied)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn u2f_only_key_is_detected() {
        #[derive(Debug)]
        struct U2fOnly;
        impl SmartCardConnection for U2fOnly {
            fn send_and_receive(
                &mut self,
                apdu: &[u8],
            ) -> std::result::Result<Vec<u8>, yubikit_core::TransportError> {
                if apdu[1] == 0xA4 {
                    Ok(b"U2F_V2\x90\x00".to_vec())
                } else {
                    Ok(vec![0x6D, 0x00])
                }
            }
        }
        match Ctap2Session::new(U2fOnly) {
            Err(FidoError::Ctap2NotSupported) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
