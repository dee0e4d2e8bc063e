//! OpenPGP card data objects, PW references, key slots, and algorithm
//! attributes.

use yubikit_core::Error;

use crate::Result;

/// The card's passwords.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Pw {
    /// PW1, the user PIN.
    User = 0x81,
    /// The resetting code, usable only to unblock PW1.
    Reset = 0x82,
    /// PW3, the admin PIN.
    Admin = 0x83,
}

/// Data objects addressed by GET DATA / PUT DATA.
#[non_exhaustive]
pub struct DataObject;

impl DataObject {
    pub const AID: u32 = 0x4F;
    pub const HISTORICAL_BYTES: u32 = 0x5F52;
    pub const EXTENDED_LENGTH_INFO: u32 = 0x7F66;
    pub const GENERAL_FEATURE_MANAGEMENT: u32 = 0x7F74;
    pub const APPLICATION_RELATED_DATA: u32 = 0x6E;
    pub const DISCRETIONARY: u32 = 0x73;
    pub const EXTENDED_CAPABILITIES: u32 = 0xC0;
    pub const PW_STATUS: u32 = 0xC4;
    pub const FINGERPRINTS: u32 = 0xC5;
    pub const CA_FINGERPRINTS: u32 = 0xC6;
    pub const GENERATION_TIMES: u32 = 0xCD;
    pub const SECURITY_SUPPORT_TEMPLATE: u32 = 0x7A;
    pub const SIGNATURE_COUNTER: u32 = 0x93;
    pub const KDF: u32 = 0xF9;
    pub const ALGORITHM_INFORMATION: u32 = 0xFA;
    pub const ATTESTATION_CERT: u32 = 0xFC;
    pub const EXTENDED_HEADER_LIST: u32 = 0x3FFF;
}

/// The card's key slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyRef {
    /// The signature key, used by PSO:CDS.
    Sig,
    /// The decryption key, used by PSO:DEC.
    Dec,
    /// The authentication key, used by INTERNAL AUTHENTICATE.
    Aut,
    /// The attestation key (YubiKey extension).
    Att,
}

impl KeyRef {
    /// Algorithm-attributes data object for this slot.
    pub fn attributes_object(self) -> u32 {
        match self {
            KeyRef::Sig => 0xC1,
            KeyRef::Dec => 0xC2,
            KeyRef::Aut => 0xC3,
            KeyRef::Att => 0xDA,
        }
    }

    /// Fingerprint data object for this slot.
    pub fn fingerprint_object(self) -> u32 {
        match self {
            KeyRef::Sig => 0xC7,
            KeyRef::Dec => 0xC8,
            KeyRef::Aut => 0xC9,
            KeyRef::Att => 0xDB,
        }
    }

    /// Generation-timestamp data object for this slot.
    pub fn generation_time_object(self) -> u32 {
        match self {
            KeyRef::Sig => 0xCE,
            KeyRef::Dec => 0xCF,
            KeyRef::Aut => 0xD0,
            KeyRef::Att => 0xDD,
        }
    }

    /// Control-reference template naming this slot in GENERATE / import.
    pub fn crt(self) -> Vec<u8> {
        match self {
            KeyRef::Sig => vec![0xB6, 0x00],
            KeyRef::Dec => vec![0xB8, 0x00],
            KeyRef::Aut => vec![0xA4, 0x00],
            KeyRef::Att => vec![0xB6, 0x03, 0x84, 0x01, 0x81],
        }
    }
}

/// PW status bytes (data object `C4`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PwStatus {
    /// PW1 stays valid for several signatures when true.
    pub pin_valid_multiple: bool,
    pub max_len_user: u8,
    pub max_len_reset: u8,
    pub max_len_admin: u8,
    pub attempts_user: u8,
    pub attempts_reset: u8,
    pub attempts_admin: u8,
}

impl PwStatus {
    pub fn parse(data: &[u8]) -> Result<Self> {
        match data {
            [valid, l1, l2, l3, a1, a2, a3, ..] => Ok(Self {
                pin_valid_multiple: *valid == 0x01,
                max_len_user: *l1,
                max_len_reset: *l2,
                max_len_admin: *l3,
                attempts_user: *a1,
                attempts_reset: *a2,
                attempts_admin: *a3,
            }),
            _ => Err(Error::BadResponse("PW status shorter than seven bytes").into()),
        }
    }

    pub fn attempts(&self, pw: Pw) -> u8 {
        match pw {
            Pw::User => self.attempts_user,
            Pw::Reset => self.attempts_reset,
            Pw::Admin => self.attempts_admin,
        }
    }
}

/// Flavor of an EC key, from the leading byte of its attributes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EcKind {
    Ecdh = 0x12,
    Ecdsa = 0x13,
    Eddsa = 0x16,
}

/// Algorithm attributes (`C1`..`C3`, `DA`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AlgorithmAttributes {
    Rsa {
        n_bits: u16,
        e_bits: u16,
        import_format: u8,
    },
    Ec {
        kind: EcKind,
        /// Curve OID body (without the DER OID header). Legacy cards
        /// append a trailing zero; it is stripped on parse, and writes
        /// always emit the strict form.
        oid: Vec<u8>,
    },
}

impl AlgorithmAttributes {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (&first, rest) = data
            .split_first()
            .ok_or(Error::BadResponse("empty algorithm attributes"))?;
        match first {
            0x01 => match rest {
                [n_hi, n_lo, e_hi, e_lo, import, ..] => Ok(Self::Rsa {
                    n_bits: u16::from_be_bytes([*n_hi, *n_lo]),
                    e_bits: u16::from_be_bytes([*e_hi, *e_lo]),
                    import_format: *import,
                }),
                _ => Err(Error::BadResponse("truncated RSA attributes").into()),
            },
            0x12 | 0x13 | 0x16 => {
                let kind = match first {
                    0x12 => EcKind::Ecdh,
                    0x13 => EcKind::Ecdsa,
                    _ => EcKind::Eddsa,
                };
                let mut oid = rest.to_vec();
                // Tolerate the legacy trailing-zero OID form on read.
                if oid.last() == Some(&0x00) && oid.len() > 1 {
                    oid.pop();
                }
                Ok(Self::Ec { kind, oid })
            }
            _ => Err(Error::BadResponse("unknown algorithm attributes").into()),
        }
    }

    /// Strict encoding, as written to the card.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Rsa {
                n_bits,
                e_bits,
                import_format,
            } => {
                let mut out = vec![0x01];
                out.extend_from_slice(&n_bits.to_be_bytes());
                out.extend_from_slice(&e_bits.to_be_bytes());
                out.push(*import_format);
                out
            }
            Self::Ec { kind, oid } => {
                let mut out = vec![*kind as u8];
                out.extend_from_slice(oid);
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pw_status_parses() {
        let status = PwStatus::parse(&[0x00, 127, 127, 127, 3, 0, 3]).unwrap();
        assert!(!status.pin_valid_multiple);
        assert_eq!(status.max_len_user, 127);
        assert_eq!(status.attempts(Pw::User), 3);
        assert_eq!(status.attempts(Pw::Reset), 0);
        assert_eq!(status.attempts(Pw::Admin), 3);
        assert!(PwStatus::parse(&[0; 6]).is_err());
    }

    #[test]
    fn rsa_attributes_round_trip() {
        let attributes = AlgorithmAttributes::Rsa {
            n_bits: 2048,
            e_bits: 32,
            import_format: 0,
        };
        let encoded = attributes.to_bytes();
        assert_eq!(encoded, vec![0x01, 0x08, 0x00, 0x00, 0x20, 0x00]);
        assert_eq!(AlgorithmAttributes::parse(&encoded).unwrap(), attributes);
    }

    #[test]
    fn legacy_trailing_zero_oid_is_stripped_on_read() {
        // ECDSA over secp256r1 with the legacy trailing zero.
        let data = [0x13, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x03, 0x01, 0x07, 0x00];
        let parsed = AlgorithmAttributes::parse(&data).unwrap();
        let oid = vec![0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x03, 0x01, 0x07];
        assert_eq!(
            parsed,
            AlgorithmAttributes::Ec {
                kind: EcKind::Ecdsa,
                oid: oid.clone(),
            }
        );
        // Writes stay strict.
        assert_eq!(parsed.to_bytes()[1..], oid);
    }

    #[test]
    fn key_ref_objects() {
        assert_eq!(KeyRef::Sig.attributes_object(), 0xC1);
        assert_eq!(KeyRef::Dec.fingerprint_object(), 0xC8);
        assert_eq!(KeyRef::Aut.generation_time_object(), 0xD0);
        assert_eq!(KeyRef::Att.attributes_object(), 0xDA);
        assert_eq!(KeyRef::Sig.crt(), vec![0xB6, 0x00]);
    }
}
