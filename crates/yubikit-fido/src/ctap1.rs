//! CTAP1 / U2F raw message protocol, used as a fallback for keys that
//! predate CTAP2.

use std::thread;
use std::time::Duration;

use tracing::debug;
use yubikit_core::apdu::{Apdu, ApduProcessor, SW_CONDITIONS_NOT_SATISFIED};
use yubikit_core::{CommandState, Error, SmartCardConnection};

use crate::{CtapStatus, FidoError, Result};

const INS_REGISTER: u8 = 0x01;
const INS_AUTHENTICATE: u8 = 0x02;
const INS_VERSION: u8 = 0x03;

/// P1 control bytes for U2F_AUTHENTICATE.
pub const CTRL_CHECK_ONLY: u8 = 0x07;
pub const CTRL_ENFORCE_UP_AND_SIGN: u8 = 0x03;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Parsed U2F registration response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistrationData {
    /// Uncompressed P-256 point, 65 bytes.
    pub public_key_point: Vec<u8>,
    pub key_handle: Vec<u8>,
    /// The attestation certificate, DER.
    pub certificate: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Parsed U2F authentication response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureData {
    pub user_presence: u8,
    pub counter: u32,
    pub signature: Vec<u8>,
}

/// A CTAP1-only session over the FIDO applet.
#[derive(Debug)]
pub struct Ctap1Session<C> {
    processor: ApduProcessor<C>,
}

impl<C: SmartCardConnection> Ctap1Session<C> {
    pub fn new(connection: C) -> Result<Self> {
        let mut processor = ApduProcessor::new(connection);
        processor.select(&crate::ctap2::AID)?;
        Ok(Self::from_processor(processor))
    }

    pub(crate) fn from_processor(processor: ApduProcessor<C>) -> Self {
        Self { processor }
    }

    /// `U2F_VERSION`; always "U2F_V2" for conforming keys.
    pub fn version(&mut self) -> Result<String> {
        let body = self
            .processor
            .send_and_receive(&Apdu::new(0x00, INS_VERSION, 0x00, 0x00).with_ne(256))?;
        String::from_utf8(body).map_err(|_| Error::BadResponse("non-UTF8 version string").into())
    }

    /// `U2F_REGISTER`. Retries while the key reports that user presence
    /// is required, until touched or cancelled.
    pub fn register(
        &mut self,
        challenge_param: &[u8; 32],
        app_param: &[u8; 32],
        state: Option<&CommandState>,
    ) -> Result<RegistrationData> {
        let mut data = challenge_param.to_vec();
        data.extend_from_slice(app_param);
        let apdu = Apdu::new(0x00, INS_REGISTER, 0x00, 0x00)
            .with_data(data)
            .with_ne(256);
        let body = self.poll(&apdu, state)?;
        parse_registration(&body)
    }

    /// `U2F_AUTHENTICATE`. With [`CTRL_CHECK_ONLY`] the key never signs;
    /// `SW=6985` then means the key handle is recognized.
    pub fn authenticate(
        &mut self,
        challenge_param: &[u8; 32],
        app_param: &[u8; 32],
        key_handle: &[u8],
        control: u8,
        state: Option<&CommandState>,
    ) -> Result<SignatureData> {
        if key_handle.len() > u8::MAX as usize {
            return Err(Error::InvalidArgument("key handle too long").into());
        }
        let mut data = challenge_param.to_vec();
        data.extend_from_slice(app_param);
        data.push(key_handle.len() as u8);
        data.extend_from_slice(key_handle);
        let apdu = Apdu::new(0x00, INS_AUTHENTICATE, control, 0x00)
            .with_data(data)
            .with_ne(256);
        let body = if control == CTRL_CHECK_ONLY {
            self.processor.send_and_receive(&apdu)?
        } else {
            self.poll(&apdu, state)?
        };
        parse_signature(&body)
    }

    /// Re-issue the command while the key wants a touch.
    fn poll(&mut self, apdu: &Apdu, state: Option<&CommandState>) -> Result<Vec<u8>> {
        loop {
            if state.is_some_and(CommandState::is_cancelled) {
                return Err(FidoError::Ctap(CtapStatus::OperationDenied));
            }
            match self.processor.send_and_receive(apdu) {
                Err(Error::Apdu {
                    sw: SW_CONDITIONS_NOT_SATISFIED,
                }) => {
                    debug!("user presence required, retrying");
                    thread::sleep(POLL_INTERVAL);
                }
                other => return other.map_err(Into::into),
            }
        }
    }

    pub fn into_processor(self) -> ApduProcessor<C> {
        self.processor
    }
}

fn parse_registration(body: &[u8]) -> Result<RegistrationData> {
    // 0x05 || publicKey(65) || L || keyHandle(L) || certificate || signature
    if body.len() < 67 || body[0] != 0x05 {
        return Err(Error::BadResponse("malformed U2F registration").into());
    }
    let public_key_point = body[1..66].to_vec();
    let kh_len = body[66] as usize;
    let rest = &body[67..];
    if rest.len() < kh_len {
        return Err(Error::BadResponse("truncated U2F key handle").into());
    }
    let (key_handle, rest) = rest.split_at(kh_len);
    let cert_len = der_certificate_len(rest)?;
    let (certificate, signature) = rest.split_at(cert_len);
    if signature.is_empty() {
        return Err(Error::BadResponse("missing U2F signature").into());
    }
    Ok(RegistrationData {
        public_key_point,
        key_handle: key_handle.to_vec(),
        certificate: certificate.to_vec(),
        signature: signature.to_vec(),
    })
}

/// Total length of the DER certificate at the front of `data`.
fn der_certificate_len(data: &[u8]) -> Result<usize> {
    if data.len() < 4 || data[0] != 0x30 {
        return Err(Error::BadResponse("malformed attestation certificate").into());
    }
    let (header, length) = match data[1] {
        len @ 0..=0x7F => (2, len as usize),
        0x81 => (3, data[2] as usize),
        0x82 => (4, u16::from_be_bytes([data[2], data[3]]) as usize),
        _ => return Err(Error::BadResponse("malformed attestation certificate").into()),
    };
    let total = header + length;
    if data.len() < total {
        return Err(Error::BadResponse("truncated attestation certificate").into());
    }
    Ok(total)
}

fn parse_signature(body: &[u8]) -> Result<SignatureData> {
    if body.len() < 6 {
        return Err(Error::BadResponse("malformed U2F signature data").into());
    }
    Ok(SignatureData {
        user_presence: body[0],
        counter: u32::from_be_bytes(body[1..5].try_into().expect("length checked")),
        signature: body[5..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_cert() -> Vec<u8> {
        let mut cert = vec![0x30, 0x81, 0x90];
        cert.extend_from_slice(&[0xCE; 0x90]);
        cert
    }

    #[test]
    fn registration_parses() {
        let mut body = vec![0x05];
        body.extend_from_slice(&[0x04; 65]);
        body.push(8);
        body.extend_from_slice(&[0x22; 8]);
        body.extend(fake_cert());
        body.extend_from_slice(&[0x51; 72]);
        let parsed = parse_registration(&body).unwrap();
        assert_eq!(parsed.public_key_point.len(), 65);
        assert_eq!(parsed.key_handle, vec![0x22; 8]);
        assert_eq!(parsed.certificate, fake_cert());
        assert_eq!(parsed.signature, vec![0x51; 72]);
    }

    #[test]
    fn signature_data_parses() {
        let mut body = vec![0x01];
        body.extend_from_slice(&7u32.to_be_bytes());
        body.extend_from_slice(&[0x51; 70]);
        let parsed = parse_signature(&body).unwrap();
        assert_eq!(parsed.user_presence, 1);
        assert_eq!(parsed.counter, 7);
        assert_eq!(parsed.signature.len(), 70);
    }

    #[test]
    fn truncated_registration_is_rejected() {
        assert!(parse_registration(&[0x05, 0x04]).is_err());
        let mut body = vec![0x05];
        body.extend_from_slice(&[0x04; 65]);
        body.push(16);
        body.extend_from_slice(&[0x22; 4]);
        assert!(parse_registration(&body).is_err());
    }
}
