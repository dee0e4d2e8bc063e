//! The OpenPGP card application session.

use std::collections::BTreeMap;

use tracing::debug;
use yubikit_core::apdu::{Apdu, ApduProcessor, SW_AUTH_METHOD_BLOCKED, SW_MEMORY_FAILURE, SW_REFERENCE_DATA_NOT_FOUND, SW_SECURITY_STATUS_NOT_SATISFIED};
use yubikit_core::tlv::{encode_list, Tlv};
use yubikit_core::{Error, SmartCardConnection, Version};
use zeroize::Zeroizing;

use crate::kdf::Kdf;
use crate::types::{AlgorithmAttributes, DataObject, KeyRef, Pw, PwStatus};
use crate::{OpenPgpError, Result};

/// OpenPGP applet AID (RID + application).
pub const AID: [u8; 6] = [0xD2, 0x76, 0x00, 0x01, 0x24, 0x01];

const INS_VERIFY: u8 = 0x20;
const INS_CHANGE_REFERENCE: u8 = 0x24;
const INS_RESET_RETRY: u8 = 0x2C;
const INS_PSO: u8 = 0x2A;
const INS_ACTIVATE: u8 = 0x44;
const INS_GENERATE_ASYMMETRIC: u8 = 0x47;
const INS_GET_CHALLENGE: u8 = 0x84;
const INS_INTERNAL_AUTHENTICATE: u8 = 0x88;
const INS_GET_DATA: u8 = 0xCA;
const INS_PUT_DATA: u8 = 0xDA;
const INS_PUT_DATA_ODD: u8 = 0xDB;
const INS_TERMINATE: u8 = 0xE6;
const INS_SET_PIN_RETRIES: u8 = 0xF2;

const SW_TERMINATION_STATE: u16 = 0x6285;

const P2_VERIFY_SIGN: u8 = 0x81;
const P2_VERIFY_OTHER: u8 = 0x82;
const P2_VERIFY_ADMIN: u8 = 0x83;

const RESET_BLOCK_ATTEMPTS: u8 = 16;

/// A public key as returned from generation or readout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublicKey {
    Rsa { modulus: Vec<u8>, exponent: Vec<u8> },
    /// Uncompressed point for ECDSA/ECDH, raw key for EdDSA/X25519.
    Ec { point: Vec<u8> },
}

/// Private key material for import; zeroized on drop.
pub enum PrivateKeyImport {
    Rsa {
        exponent: Vec<u8>,
        p: Zeroizing<Vec<u8>>,
        q: Zeroizing<Vec<u8>>,
    },
    Ec {
        secret: Zeroizing<Vec<u8>>,
    },
}

/// The `6E` composite data object.
#[derive(Clone, Debug)]
pub struct ApplicationRelatedData {
    pub aid: Vec<u8>,
    pub historical_bytes: Vec<u8>,
    /// The `73` discretionary data objects, keyed by tag.
    pub discretionary: BTreeMap<u32, Vec<u8>>,
}

impl ApplicationRelatedData {
    fn parse(encoded: &[u8]) -> Result<Self> {
        let outer = Tlv::unpack(DataObject::APPLICATION_RELATED_DATA, encoded)?;
        let map = Tlv::parse_map(&outer)?;
        let aid = map
            .get(&DataObject::AID)
            .cloned()
            .ok_or(Error::BadResponse("application data without AID"))?;
        let discretionary = match map.get(&DataObject::DISCRETIONARY) {
            Some(data) => Tlv::parse_map(data)?,
            None => BTreeMap::new(),
        };
        Ok(Self {
            aid,
            historical_bytes: map
                .get(&DataObject::HISTORICAL_BYTES)
                .cloned()
                .unwrap_or_default(),
            discretionary,
        })
    }

    /// Application version, BCD-coded in AID bytes 6 and 7.
    pub fn version(&self) -> Result<Version> {
        let (major, minor) = match self.aid.as_slice() {
            [_, _, _, _, _, _, major, minor, ..] => (*major, *minor),
            _ => return Err(Error::BadResponse("AID shorter than version field").into()),
        };
        let bcd = |b: u8| (b >> 4) * 10 + (b & 0x0F);
        Ok(Version::new(bcd(major), bcd(minor), 0))
    }

    pub fn pw_status(&self) -> Result<PwStatus> {
        let data = self
            .discretionary
            .get(&DataObject::PW_STATUS)
            .ok_or(Error::BadResponse("missing PW status bytes"))?;
        PwStatus::parse(data)
    }

    pub fn algorithm_attributes(&self, key_ref: KeyRef) -> Result<AlgorithmAttributes> {
        let data = self
            .discretionary
            .get(&key_ref.attributes_object())
            .ok_or(Error::BadResponse("missing algorithm attributes"))?;
        AlgorithmAttributes::parse(data)
    }
}

/// A session with the OpenPGP card application.
///
/// When the applet reports the termination state on SELECT, the session
/// recovers by issuing ACTIVATE and selecting again.
#[derive(Debug)]
pub struct OpenPgpSession<C> {
    processor: ApduProcessor<C>,
    version: Version,
    kdf: Kdf,
}

impl<C: SmartCardConnection> OpenPgpSession<C> {
    pub fn new(connection: C) -> Result<Self> {
        let mut processor = ApduProcessor::new(connection);
        match processor.select(&AID) {
            Err(Error::Apdu {
                sw: SW_TERMINATION_STATE,
            }) => {
                debug!("applet inactive, activating");
                processor.send_and_receive(&Apdu::new(0x00, INS_ACTIVATE, 0x00, 0x00))?;
                processor.select(&AID)?;
            }
            Err(error) => return Err(error.into()),
            Ok(_) => {}
        }
        if processor.supports_extended_length() {
            processor.force_extended();
        }
        let mut session = Self {
            processor,
            version: Version::default(),
            kdf: Kdf::None,
        };
        let data = session.get_application_related_data()?;
        session.version = data.version()?;
        if session.version.is_at_least(5, 2, 0) {
            session.kdf = session.read_kdf()?;
        }
        debug!(version = %session.version, "OpenPGP session established");
        Ok(session)
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// The KDF configuration read at session start.
    pub fn kdf(&self) -> &Kdf {
        &self.kdf
    }

    fn read_kdf(&mut self) -> Result<Kdf> {
        match self.get_data(DataObject::KDF) {
            Ok(data) => Kdf::parse(&data),
            Err(OpenPgpError::Core(Error::Apdu {
                sw: SW_REFERENCE_DATA_NOT_FOUND,
            })) => Ok(Kdf::None),
            Err(error) => Err(error),
        }
    }

    // Data objects ------------------------------------------------------

    pub fn get_data(&mut self, object: u32) -> Result<Vec<u8>> {
        let apdu = Apdu::new(
            0x00,
            INS_GET_DATA,
            (object >> 8) as u8,
            (object & 0xFF) as u8,
        )
        .with_ne(256);
        self.processor.send_and_receive(&apdu).map_err(Into::into)
    }

    pub fn put_data(&mut self, object: u32, data: impl Into<Vec<u8>>) -> Result<()> {
        let apdu = Apdu::new(
            0x00,
            INS_PUT_DATA,
            (object >> 8) as u8,
            (object & 0xFF) as u8,
        )
        .with_data(data.into());
        self.processor.send_and_receive(&apdu)?;
        Ok(())
    }

    pub fn get_application_related_data(&mut self) -> Result<ApplicationRelatedData> {
        let data = self.get_data(DataObject::APPLICATION_RELATED_DATA)?;
        ApplicationRelatedData::parse(&data)
    }

    pub fn get_pw_status(&mut self) -> Result<PwStatus> {
        let data = self.get_data(DataObject::PW_STATUS)?;
        PwStatus::parse(&data)
    }

    /// The PSO:CDS usage counter from the security support template.
    pub fn get_signature_counter(&mut self) -> Result<u32> {
        let data = self.get_data(DataObject::SECURITY_SUPPORT_TEMPLATE)?;
        let template = Tlv::unpack(DataObject::SECURITY_SUPPORT_TEMPLATE, &data)?;
        let map = Tlv::parse_map(&template)?;
        let counter = map
            .get(&DataObject::SIGNATURE_COUNTER)
            .filter(|v| v.len() == 3)
            .ok_or(Error::BadResponse("missing signature counter"))?;
        Ok(u32::from_be_bytes([0, counter[0], counter[1], counter[2]]))
    }

    /// Algorithms each slot can be configured for (`FA`, v5.2+).
    pub fn get_algorithm_information(&mut self) -> Result<Vec<(KeyRef, AlgorithmAttributes)>> {
        self.version.require("algorithm information", 5, 2, 0)?;
        let data = self.get_data(DataObject::ALGORITHM_INFORMATION)?;
        let inner = Tlv::unpack(DataObject::ALGORITHM_INFORMATION, &data)?;
        let mut out = Vec::new();
        for tlv in Tlv::parse_list(&inner)? {
            let key_ref = match tlv.tag() {
                0xC1 => KeyRef::Sig,
                0xC2 => KeyRef::Dec,
                0xC3 => KeyRef::Aut,
                0xDA => KeyRef::Att,
                _ => continue,
            };
            out.push((key_ref, AlgorithmAttributes::parse(tlv.value())?));
        }
        Ok(out)
    }

    /// The attestation certificate (YubiKey extension).
    pub fn get_attestation_certificate(&mut self) -> Result<Vec<u8>> {
        self.get_data(DataObject::ATTESTATION_CERT)
    }

    /// Random bytes from the card's RNG.
    pub fn get_challenge(&mut self, length: usize) -> Result<Vec<u8>> {
        let apdu = Apdu::new(0x00, INS_GET_CHALLENGE, 0x00, 0x00).with_ne(length);
        self.processor.send_and_receive(&apdu).map_err(Into::into)
    }

    // PIN management ----------------------------------------------------

    /// Verify the user PIN. With `extended` the verification unlocks
    /// decryption and authentication (mode 82); without it only PSO:CDS
    /// (mode 81). Mode-81 verification is consumed per signature unless
    /// the PW status bytes say otherwise.
    pub fn verify_pin(&mut self, pin: &[u8], extended: bool) -> Result<()> {
        let p2 = if extended {
            P2_VERIFY_OTHER
        } else {
            P2_VERIFY_SIGN
        };
        let processed = self.kdf.process(Pw::User, pin)?;
        self.send_verify(Pw::User, p2, &processed)
    }

    /// Verify the admin PIN (PW3).
    pub fn verify_admin(&mut self, pin: &[u8]) -> Result<()> {
        let processed = self.kdf.process(Pw::Admin, pin)?;
        self.send_verify(Pw::Admin, P2_VERIFY_ADMIN, &processed)
    }

    fn send_verify(&mut self, pw: Pw, p2: u8, processed: &[u8]) -> Result<()> {
        let apdu = Apdu::new(0x00, INS_VERIFY, 0x00, p2).with_data(processed.to_vec());
        match self.processor.send_and_receive(&apdu) {
            Ok(_) => Ok(()),
            Err(error) => Err(self.pin_error(pw, error)),
        }
    }

    /// Translate a failed PIN presentation, re-reading the retry counter
    /// from the PW status bytes.
    fn pin_error(&mut self, pw: Pw, error: Error) -> OpenPgpError {
        match error.status_word() {
            Some(sw) if sw & 0xFFF0 == 0x63C0 => OpenPgpError::InvalidPin {
                attempts_remaining: (sw & 0x0F) as u8,
            },
            Some(SW_AUTH_METHOD_BLOCKED) => OpenPgpError::InvalidPin {
                attempts_remaining: 0,
            },
            Some(SW_SECURITY_STATUS_NOT_SATISFIED | SW_MEMORY_FAILURE) => {
                let attempts_remaining = self
                    .get_pw_status()
                    .map(|status| status.attempts(pw))
                    .unwrap_or(0);
                OpenPgpError::InvalidPin { attempts_remaining }
            }
            _ => error.into(),
        }
    }

    /// Change the user PIN.
    pub fn change_pin(&mut self, old_pin: &[u8], new_pin: &[u8]) -> Result<()> {
        self.change_reference(Pw::User, P2_VERIFY_SIGN, old_pin, new_pin)
    }

    /// Change the admin PIN.
    pub fn change_admin(&mut self, old_pin: &[u8], new_pin: &[u8]) -> Result<()> {
        self.change_reference(Pw::Admin, P2_VERIFY_ADMIN, old_pin, new_pin)
    }

    fn change_reference(&mut self, pw: Pw, p2: u8, old: &[u8], new: &[u8]) -> Result<()> {
        let mut data = Zeroizing::new(Vec::new());
        data.extend_from_slice(&self.kdf.process(pw, old)?);
        data.extend_from_slice(&self.kdf.process(pw, new)?);
        let apdu = Apdu::new(0x00, INS_CHANGE_REFERENCE, 0x00, p2).with_data(data.to_vec());
        match self.processor.send_and_receive(&apdu) {
            Ok(_) => Ok(()),
            Err(error) => Err(self.pin_error(pw, error)),
        }
    }

    /// Store a resetting code (admin must be verified).
    pub fn set_reset_code(&mut self, reset_code: &[u8]) -> Result<()> {
        let processed = self.kdf.process(Pw::Reset, reset_code)?;
        self.put_data(0xD3, processed.to_vec())
    }

    /// Unblock the user PIN, either with the resetting code or after
    /// admin verification.
    pub fn reset_pin(&mut self, new_pin: &[u8], reset_code: Option<&[u8]>) -> Result<()> {
        let mut data = Zeroizing::new(Vec::new());
        let p1 = match reset_code {
            Some(code) => {
                data.extend_from_slice(&self.kdf.process(Pw::Reset, code)?);
                0x00
            }
            None => 0x02,
        };
        data.extend_from_slice(&self.kdf.process(Pw::User, new_pin)?);
        let apdu =
            Apdu::new(0x00, INS_RESET_RETRY, p1, P2_VERIFY_SIGN).with_data(data.to_vec());
        match self.processor.send_and_receive(&apdu) {
            Ok(_) => Ok(()),
            Err(error) => Err(self.pin_error(Pw::Reset, error)),
        }
    }

    /// Set the retry counters for all three passwords (admin).
    pub fn set_pin_attempts(&mut self, user: u8, reset: u8, admin: u8) -> Result<()> {
        let apdu =
            Apdu::new(0x00, INS_SET_PIN_RETRIES, 0x00, 0x00).with_data(vec![user, reset, admin]);
        self.processor.send_and_receive(&apdu)?;
        Ok(())
    }

    /// Replace the KDF configuration (admin). Changing it resets all
    /// PINs to their defaults.
    pub fn set_kdf(&mut self, kdf: Kdf) -> Result<()> {
        self.version.require("KDF configuration", 5, 2, 0)?;
        self.put_data(DataObject::KDF, kdf.to_bytes()?)?;
        self.kdf = kdf;
        Ok(())
    }

    // Key operations ----------------------------------------------------

    /// PSO:CDS with the signature key. For RSA the input must already be
    /// in DigestInfo form; ECDSA returns raw `r || s`, which
    /// `yubikit_core::der::ec_signature` converts to the usual DER form.
    pub fn sign(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        let apdu = Apdu::new(0x00, INS_PSO, 0x9E, 0x9A)
            .with_data(message.to_vec())
            .with_ne(256);
        self.processor.send_and_receive(&apdu).map_err(Into::into)
    }

    /// PSO:DEC of an RSA ciphertext; the leading zero padding byte is
    /// added here.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let mut data = vec![0x00];
        data.extend_from_slice(ciphertext);
        let apdu = Apdu::new(0x00, INS_PSO, 0x80, 0x86)
            .with_data(data)
            .with_ne(256);
        self.processor
            .send_and_receive(&apdu)
            .map(Zeroizing::new)
            .map_err(Into::into)
    }

    /// PSO:DEC key agreement: the peer public key goes wrapped in
    /// `A6 { 7F49 { 86 point } }`.
    pub fn key_agreement(&mut self, peer_public_key: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let wrapped = Tlv::new(
            0xA6,
            Tlv::new(
                0x7F49,
                Tlv::new(0x86, peer_public_key.to_vec())?.to_bytes(),
            )?
            .to_bytes(),
        )?;
        let apdu = Apdu::new(0x00, INS_PSO, 0x80, 0x86)
            .with_data(wrapped.to_bytes())
            .with_ne(256);
        self.processor
            .send_and_receive(&apdu)
            .map(Zeroizing::new)
            .map_err(Into::into)
    }

    /// INTERNAL AUTHENTICATE with the authentication key.
    pub fn internal_authenticate(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        let apdu = Apdu::new(0x00, INS_INTERNAL_AUTHENTICATE, 0x00, 0x00)
            .with_data(message.to_vec())
            .with_ne(256);
        self.processor.send_and_receive(&apdu).map_err(Into::into)
    }

    /// Generate a key on-device and return its public half.
    pub fn generate_key(&mut self, key_ref: KeyRef) -> Result<PublicKey> {
        let apdu = Apdu::new(0x00, INS_GENERATE_ASYMMETRIC, 0x80, 0x00)
            .with_data(key_ref.crt())
            .with_ne(256);
        let body = self.processor.send_and_receive(&apdu)?;
        parse_public_key(&body)
    }

    /// Read the public half of an existing key.
    pub fn read_public_key(&mut self, key_ref: KeyRef) -> Result<PublicKey> {
        let apdu = Apdu::new(0x00, INS_GENERATE_ASYMMETRIC, 0x81, 0x00)
            .with_data(key_ref.crt())
            .with_ne(256);
        let body = self.processor.send_and_receive(&apdu)?;
        parse_public_key(&body)
    }

    /// Import a private key via the extended header list (admin).
    pub fn put_key(&mut self, key_ref: KeyRef, key: &PrivateKeyImport) -> Result<()> {
        let (template, material) = match key {
            PrivateKeyImport::Rsa { exponent, p, q } => {
                let mut template = tlv_header(0x91, exponent.len());
                template.extend(tlv_header(0x92, p.len()));
                template.extend(tlv_header(0x93, q.len()));
                let mut material = Zeroizing::new(Vec::new());
                material.extend_from_slice(exponent);
                material.extend_from_slice(p);
                material.extend_from_slice(q);
                (template, material)
            }
            PrivateKeyImport::Ec { secret } => (
                tlv_header(0x92, secret.len()),
                Zeroizing::new(secret.to_vec()),
            ),
        };
        let mut inner = key_ref.crt();
        inner.extend(Tlv::new(0x7F48, template)?.to_bytes());
        inner.extend(Tlv::new(0x5F48, material.to_vec())?.to_bytes());
        let data = Zeroizing::new(Tlv::new(0x4D, inner)?.to_bytes());
        let apdu = Apdu::new(0x00, INS_PUT_DATA_ODD, 0x3F, 0xFF).with_data(data.to_vec());
        self.processor.send_and_receive(&apdu)?;
        Ok(())
    }

    pub fn set_algorithm_attributes(
        &mut self,
        key_ref: KeyRef,
        attributes: &AlgorithmAttributes,
    ) -> Result<()> {
        self.put_data(key_ref.attributes_object(), attributes.to_bytes())
    }

    /// Store a key's fingerprint after import.
    pub fn set_fingerprint(&mut self, key_ref: KeyRef, fingerprint: &[u8; 20]) -> Result<()> {
        self.put_data(key_ref.fingerprint_object(), fingerprint.to_vec())
    }

    /// Store a key's generation timestamp after import.
    pub fn set_generation_time(&mut self, key_ref: KeyRef, timestamp: u32) -> Result<()> {
        self.put_data(
            key_ref.generation_time_object(),
            timestamp.to_be_bytes().to_vec(),
        )
    }

    // Reset -------------------------------------------------------------

    /// Factory-reset the applet by exhausting both retry counters, then
    /// terminating and re-activating it.
    pub fn factory_reset(&mut self) -> Result<()> {
        self.block_pw(Pw::User)?;
        self.block_pw(Pw::Admin)?;
        self.processor
            .send_and_receive(&Apdu::new(0x00, INS_TERMINATE, 0x00, 0x00))?;
        self.processor
            .send_and_receive(&Apdu::new(0x00, INS_ACTIVATE, 0x00, 0x00))?;
        self.kdf = Kdf::None;
        debug!("OpenPGP applet reset");
        Ok(())
    }

    fn block_pw(&mut self, pw: Pw) -> Result<()> {
        // Deliberately long wrong PIN; KDF processing is skipped because
        // the raw bytes just need to be wrong.
        let wrong = [0x3F; 16];
        for _ in 0..RESET_BLOCK_ATTEMPTS {
            let p2 = match pw {
                Pw::Admin => P2_VERIFY_ADMIN,
                _ => P2_VERIFY_SIGN,
            };
            match self.send_verify(pw, p2, &wrong) {
                Err(OpenPgpError::InvalidPin {
                    attempts_remaining: 0,
                }) => return Ok(()),
                Err(OpenPgpError::InvalidPin { .. }) | Ok(()) => continue,
                Err(error) => return Err(error),
            }
        }
        Err(Error::BadResponse("password did not block").into())
    }

    pub fn into_connection(self) -> C {
        self.processor.into_connection()
    }
}

/// Tag and length only, as the `7F48` import template wants them.
fn tlv_header(tag: u8, len: usize) -> Vec<u8> {
    let mut out = vec![tag];
    match len {
        0..=0x7F => out.push(len as u8),
        0x80..=0xFF => out.extend_from_slice(&[0x81, len as u8]),
        _ => {
            out.push(0x82);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
    }
    out
}

fn parse_public_key(body: &[u8]) -> Result<PublicKey> {
    let inner = Tlv::unpack(0x7F49, body)?;
    let map = Tlv::parse_map(&inner)?;
    if let Some(point) = map.get(&0x86) {
        return Ok(PublicKey::Ec {
            point: point.clone(),
        });
    }
    Ok(PublicKey::Rsa {
        modulus: map
            .get(&0x81)
            .cloned()
            .ok_or(Error::BadResponse("public key without modulus"))?,
        exponent: map
            .get(&0x82)
            .cloned()
            .ok_or(Error::BadResponse("public key without exponent"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::KdfHash;

    fn aid_with_version(major: u8, minor: u8) -> Vec<u8> {
        let mut aid = AID.to_vec();
        aid.extend_from_slice(&[major, minor, 0x00, 0x06, 0x01, 0x02, 0x03, 0x04, 0x00, 0x00]);
        aid
    }

    fn application_related_data(major: u8, minor: u8) -> Vec<u8> {
        let discretionary = encode_list([
            Tlv::new(DataObject::PW_STATUS, vec![0x00, 127, 127, 127, 3, 3, 3]).unwrap(),
            Tlv::new(0xC1, vec![0x01, 0x08, 0x00, 0x00, 0x20, 0x00]).unwrap(),
        ]);
        let inner = encode_list([
            Tlv::new(DataObject::AID, aid_with_version(major, minor)).unwrap(),
            Tlv::new(DataObject::HISTORICAL_BYTES, vec![0x00, 0x73]).unwrap(),
            Tlv::new(DataObject::DISCRETIONARY, discretionary).unwrap(),
        ]);
        Tlv::new(DataObject::APPLICATION_RELATED_DATA, inner)
            .unwrap()
            .to_bytes()
    }

    fn kdf_object() -> Vec<u8> {
        Kdf::IterSaltedS2k {
            hash: KdfHash::Sha256,
            iteration_count: 100_000,
            salt_user: vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08],
            salt_reset: None,
            salt_admin: None,
        }
        .to_bytes()
        .unwrap()
    }

    struct MockCard {
        exchanges: Vec<(Vec<u8>, Vec<u8>)>,
    }

    impl MockCard {
        /// A 5.2 card with a KDF configured.
        fn with_kdf(exchanges: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
            let select = Apdu::new(0x00, 0xA4, 0x04, 0x00)
                .with_data(AID.to_vec())
                .with_ne(256)
                .encode(yubikit_core::apdu::ApduFormat::Short)
                .unwrap();
            let mut ard = application_related_data(0x05, 0x02);
            ard.extend_from_slice(&[0x90, 0x00]);
            let mut kdf = kdf_object();
            kdf.extend_from_slice(&[0x90, 0x00]);
            let mut all = vec![
                (select, vec![0x90, 0x00]),
                (vec![0x00, INS_GET_DATA, 0x00, 0x6E, 0x00], ard),
                (vec![0x00, INS_GET_DATA, 0x00, 0xF9, 0x00], kdf),
            ];
            all.extend(exchanges);
            Self { exchanges: all }
        }
    }

    impl SmartCardConnection for MockCard {
        fn send_and_receive(
            &mut self,
            apdu: &[u8],
        ) -> std::result::Result<Vec<u8>, yubikit_core::TransportError> {
            if self.exchanges.is_empty() {
                return Err(yubikit_core::TransportError::new("unexpected command"));
            }
            let (expected, response) = self.exchanges.remove(0);
            assert_eq!(hex::encode(apdu), hex::encode(&expected));
            Ok(response)
        }
    }

    #[test]
    fn session_reads_version_and_kdf() {
        let mock = MockCard::with_kdf(vec![]);
        let session = OpenPgpSession::new(mock).unwrap();
        assert_eq!(session.version(), Version::new(5, 2, 0));
        assert!(matches!(session.kdf(), Kdf::IterSaltedS2k { .. }));
    }

    #[test]
    fn inactive_applet_is_activated() {
        let select = Apdu::new(0x00, 0xA4, 0x04, 0x00)
            .with_data(AID.to_vec())
            .with_ne(256)
            .encode(yubikit_core::apdu::ApduFormat::Short)
            .unwrap();
        let mut ard = application_related_data(0x03, 0x04);
        ard.extend_from_slice(&[0x90, 0x00]);
        let mock = MockCard {
            exchanges: vec![
                (select.clone(), vec![0x62, 0x85]),
                (vec![0x00, INS_ACTIVATE, 0x00, 0x00], vec![0x90, 0x00]),
                (select, vec![0x90, 0x00]),
                (vec![0x00, INS_GET_DATA, 0x00, 0x6E, 0x00], ard),
            ],
        };
        // 3.4 firmware: no KDF object is read.
        let session = OpenPgpSession::new(mock).unwrap();
        assert_eq!(session.version(), Version::new(3, 4, 0));
        assert_eq!(session.kdf(), &Kdf::None);
    }

    #[test]
    fn verify_pin_sends_derived_bytes() {
        let expected_pin = Kdf::parse(&kdf_object())
            .unwrap()
            .process(Pw::User, b"123456")
            .unwrap();
        let mut verify = vec![0x00, INS_VERIFY, 0x00, P2_VERIFY_OTHER, 0x20];
        verify.extend_from_slice(&expected_pin);
        let mock = MockCard::with_kdf(vec![(verify, vec![0x90, 0x00])]);
        let mut session = OpenPgpSession::new(mock).unwrap();
        session.verify_pin(b"123456", true).unwrap();
    }

    #[test]
    fn wrong_pin_rereads_attempts() {
        let expected_pin = Kdf::parse(&kdf_object())
            .unwrap()
            .process(Pw::Admin, b"12345678")
            .unwrap();
        let mut verify = vec![0x00, INS_VERIFY, 0x00, P2_VERIFY_ADMIN, 0x20];
        verify.extend_from_slice(&expected_pin);
        let mut status = vec![0x00, 127, 127, 127, 3, 3, 2];
        status.extend_from_slice(&[0x90, 0x00]);
        let mock = MockCard::with_kdf(vec![
            (verify, vec![0x69, 0x82]),
            (vec![0x00, INS_GET_DATA, 0x00, 0xC4, 0x00], status),
        ]);
        let mut session = OpenPgpSession::new(mock).unwrap();
        match session.verify_admin(b"12345678") {
            Err(OpenPgpError::InvalidPin {
                attempts_remaining: 2,
            }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn sign_uses_pso_cds() {
        let digest_info = vec![0x30, 0x31, 0x30, 0x0D];
        let mut expected = vec![0x00, INS_PSO, 0x9E, 0x9A, digest_info.len() as u8];
        expected.extend_from_slice(&digest_info);
        expected.push(0x00);
        let mock = MockCard::with_kdf(vec![(
            expected,
            vec![0xAB, 0xCD, 0x90, 0x00],
        )]);
        let mut session = OpenPgpSession::new(mock).unwrap();
        assert_eq!(session.sign(&digest_info).unwrap(), vec![0xAB, 0xCD]);
    }

    #[test]
    fn rsa_decrypt_gets_padding_indicator() {
        let ciphertext = vec![0x11; 4];
        let mut expected = vec![0x00, INS_PSO, 0x80, 0x86, 0x05, 0x00];
        expected.extend_from_slice(&ciphertext);
        expected.push(0x00);
        let mock = MockCard::with_kdf(vec![(expected, vec![0x42, 0x90, 0x00])]);
        let mut session = OpenPgpSession::new(mock).unwrap();
        assert_eq!(session.decrypt(&ciphertext).unwrap().as_slice(), &[0x42]);
    }

    #[test]
    fn ecdh_peer_key_is_wrapped() {
        let mut point = vec![0x04];
        point.extend_from_slice(&[0x77; 64]);
        let wrapped = Tlv::new(
            0xA6,
            Tlv::new(0x7F49, Tlv::new(0x86, point.clone()).unwrap().to_bytes())
                .unwrap()
                .to_bytes(),
        )
        .unwrap()
        .to_bytes();
        let mut expected = vec![0x00, INS_PSO, 0x80, 0x86, wrapped.len() as u8];
        expected.extend_from_slice(&wrapped);
        expected.push(0x00);
        let mut response = vec![0x5E; 32];
        response.extend_from_slice(&[0x90, 0x00]);
        let mock = MockCard::with_kdf(vec![(expected, response)]);
        let mut session = OpenPgpSession::new(mock).unwrap();
        let secret = session.key_agreement(&point).unwrap();
        assert_eq!(secret.len(), 32);
    }

    #[test]
    fn signature_counter_parses() {
        let template = Tlv::new(
            DataObject::SECURITY_SUPPORT_TEMPLATE,
            Tlv::new(DataObject::SIGNATURE_COUNTER, vec![0x00, 0x01, 0x2C])
                .unwrap()
                .to_bytes(),
        )
        .unwrap()
        .to_bytes();
        let mut response = template;
        response.extend_from_slice(&[0x90, 0x00]);
        let mock = MockCard::with_kdf(vec![(
            vec![0x00, INS_GET_DATA, 0x00, 0x7A, 0x00],
            response,
        )]);
        let mut session = OpenPgpSession::new(mock).unwrap();
        assert_eq!(session.get_signature_counter().unwrap(), 300);
    }

    #[test]
    fn put_key_builds_extended_header_list() {
        let import = PrivateKeyImport::Ec {
            secret: Zeroizing::new(vec![0x0D; 32]),
        };
        let template = tlv_header(0x92, 32);
        let mut inner = KeyRef::Dec.crt();
        inner.extend(Tlv::new(0x7F48, template).unwrap().to_bytes());
        inner.extend(Tlv::new(0x5F48, vec![0x0D; 32]).unwrap().to_bytes());
        let data = Tlv::new(0x4D, inner).unwrap().to_bytes();
        let mut expected = vec![0x00, INS_PUT_DATA_ODD, 0x3F, 0xFF, data.len() as u8];
        expected.extend_from_slice(&data);
        let mock = MockCard::with_kdf(vec![(expected, vec![0x90, 0x00])]);
        let mut session = OpenPgpSession::new(mock).unwrap();
        session.put_key(KeyRef::Dec, &import).unwrap();
    }
}
