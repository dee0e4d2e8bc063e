//! The authenticator data structure: the compact binary encoding the
//! authenticator signs over.

use std::io::Cursor;

use bitflags::bitflags;
use ciborium::value::Value;
use yubikit_core::{cbor, Error};

use crate::cose::CoseKey;
use crate::Result;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AuthenticatorDataFlags: u8 {
        const USER_PRESENT = 0x01;
        const USER_VERIFIED = 0x04;
        const ATTESTED_CREDENTIAL_DATA = 0x40;
        const EXTENSION_DATA = 0x80;
    }
}

/// `aaguid || credIdLen || credId || cosePublicKey`, present when the AT
/// flag is set.
#[derive(Clone, Debug, PartialEq)]
pub struct AttestedCredentialData {
    pub aaguid: [u8; 16],
    pub credential_id: Vec<u8>,
    pub public_key: CoseKey,
}

/// `rpIdHash || flags || signCount || attestedCredentialData? ||
/// extensions?`.
#[derive(Clone, Debug, PartialEq)]
pub struct AuthenticatorData {
    pub rp_id_hash: [u8; 32],
    pub flags: AuthenticatorDataFlags,
    pub sign_count: u32,
    pub attested_credential_data: Option<AttestedCredentialData>,
    pub extensions: Option<Value>,
}

impl AuthenticatorData {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 37 {
            return Err(Error::BadResponse("authenticator data too short").into());
        }
        let rp_id_hash: [u8; 32] = bytes[..32].try_into().expect("length checked");
        let flags = AuthenticatorDataFlags::from_bits_retain(bytes[32]);
        let sign_count = u32::from_be_bytes(bytes[33..37].try_into().expect("length checked"));

        let mut cursor = Cursor::new(&bytes[37..]);
        let attested_credential_data = if flags
            .contains(AuthenticatorDataFlags::ATTESTED_CREDENTIAL_DATA)
        {
            Some(parse_attested_credential_data(&mut cursor)?)
        } else {
            None
        };
        let extensions = if flags.contains(AuthenticatorDataFlags::EXTENSION_DATA) {
            let value: Value = ciborium::de::from_reader(&mut cursor)
                .map_err(|_| Error::BadResponse("invalid extension CBOR"))?;
            Some(value)
        } else {
            None
        };
        if (cursor.position() as usize) < cursor.get_ref().len() {
            return Err(Error::BadResponse("trailing bytes after authenticator data").into());
        }
        Ok(Self {
            rp_id_hash,
            flags,
            sign_count,
            attested_credential_data,
            extensions,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.attested_credential_data.is_some()
            != self
                .flags
                .contains(AuthenticatorDataFlags::ATTESTED_CREDENTIAL_DATA)
        {
            return Err(Error::InvalidArgument("AT flag does not match contents").into());
        }
        if self.extensions.is_some()
            != self.flags.contains(AuthenticatorDataFlags::EXTENSION_DATA)
        {
            return Err(Error::InvalidArgument("ED flag does not match contents").into());
        }
        let mut out = Vec::with_capacity(37);
        out.extend_from_slice(&self.rp_id_hash);
        out.push(self.flags.bits());
        out.extend_from_slice(&self.sign_count.to_be_bytes());
        if let Some(acd) = &self.attested_credential_data {
            if acd.credential_id.len() > u16::MAX as usize {
                return Err(Error::InvalidArgument("credential id too long").into());
            }
            out.extend_from_slice(&acd.aaguid);
            out.extend_from_slice(&(acd.credential_id.len() as u16).to_be_bytes());
            out.extend_from_slice(&acd.credential_id);
            out.extend(cbor::encode(&acd.public_key.to_value())?);
        }
        if let Some(extensions) = &self.extensions {
            out.extend(cbor::encode(extensions)?);
        }
        Ok(out)
    }

    pub fn user_present(&self) -> bool {
        self.flags.contains(AuthenticatorDataFlags::USER_PRESENT)
    }

    pub fn user_verified(&self) -> bool {
        self.flags.contains(AuthenticatorDataFlags::USER_VERIFIED)
    }
}

fn parse_attested_credential_data(cursor: &mut Cursor<&[u8]>) -> Result<AttestedCredentialData> {
    let data = *cursor.get_ref();
    let offset = cursor.position() as usize;
    let rest = &data[offset..];
    if rest.len() < 18 {
        return Err(Error::BadResponse("attested credential data too short").into());
    }
    let aaguid: [u8; 16] = rest[..16].try_into().expect("length checked");
    let id_len = u16::from_be_bytes(rest[16..18].try_into().expect("length checked")) as usize;
    if rest.len() < 18 + id_len {
        return Err(Error::BadResponse("truncated credential id").into());
    }
    let credential_id = rest[18..18 + id_len].to_vec();
    cursor.set_position((offset + 18 + id_len) as u64);
    let key_value: Value = ciborium::de::from_reader(&mut *cursor)
        .map_err(|_| Error::BadResponse("invalid COSE key CBOR"))?;
    let public_key = CoseKey::from_value(&key_value)?;
    Ok(AttestedCredentialData {
        aaguid,
        credential_id,
        public_key,
    })
}
