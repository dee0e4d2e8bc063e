//! COSE public keys as CTAP2 uses them: an integer-keyed CBOR map with
//! `1 kty`, `3 alg`, `-1 crv`, `-2 x / n`, `-3 y / e`.

use ciborium::value::Value;
use yubikit_core::cbor::{self, MapBuilder, MapView};
use yubikit_core::{der, Error};

/// COSE algorithm identifiers this library understands.
pub mod alg {
    pub const ES256: i64 = -7;
    pub const EDDSA: i64 = -8;
    pub const ECDH_ES_HKDF_256: i64 = -25;
    pub const ES384: i64 = -35;
    pub const ES512: i64 = -36;
    pub const PS256: i64 = -37;
    pub const RS256: i64 = -257;
}

/// COSE elliptic curve identifiers.
pub mod curve {
    pub const P256: i64 = 1;
    pub const P384: i64 = 2;
    pub const P521: i64 = 3;
    pub const ED25519: i64 = 6;
}

const KTY_OKP: i64 = 1;
const KTY_EC2: i64 = 2;
const KTY_RSA: i64 = 3;

/// A decoded COSE public key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoseKey {
    Ec2 {
        alg: i64,
        crv: i64,
        x: Vec<u8>,
        y: Vec<u8>,
    },
    Okp {
        alg: i64,
        crv: i64,
        x: Vec<u8>,
    },
    Rsa {
        alg: i64,
        n: Vec<u8>,
        e: Vec<u8>,
    },
}

impl CoseKey {
    pub fn alg(&self) -> i64 {
        match self {
            CoseKey::Ec2 { alg, .. } | CoseKey::Okp { alg, .. } | CoseKey::Rsa { alg, .. } => *alg,
        }
    }

    /// Build an ES256-family EC2 key from raw affine coordinates.
    pub fn ec2_p256(alg: i64, x: impl Into<Vec<u8>>, y: impl Into<Vec<u8>>) -> Self {
        CoseKey::Ec2 {
            alg,
            crv: curve::P256,
            x: x.into(),
            y: y.into(),
        }
    }

    /// Build an ES256 key from a 65-byte uncompressed SEC1 point, as the
    /// U2F registration response carries it.
    pub fn from_uncompressed_point(point: &[u8]) -> Result<Self, Error> {
        match point {
            [0x04, coords @ ..] if coords.len() == 64 => Ok(CoseKey::ec2_p256(
                alg::ES256,
                &coords[..32],
                &coords[32..],
            )),
            _ => Err(Error::BadResponse("malformed uncompressed EC point")),
        }
    }

    pub fn from_value(value: &Value) -> Result<Self, Error> {
        let map = MapView::from_value(value)?;
        let kty = cbor::as_i64(map.required(1)?)?;
        let alg = cbor::as_i64(map.required(3)?)?;
        match kty {
            KTY_EC2 => Ok(CoseKey::Ec2 {
                alg,
                crv: cbor::as_i64(map.required(-1)?)?,
                x: cbor::as_bytes(map.required(-2)?)?.to_vec(),
                y: cbor::as_bytes(map.required(-3)?)?.to_vec(),
            }),
            KTY_OKP => Ok(CoseKey::Okp {
                alg,
                crv: cbor::as_i64(map.required(-1)?)?,
                x: cbor::as_bytes(map.required(-2)?)?.to_vec(),
            }),
            KTY_RSA => Ok(CoseKey::Rsa {
                alg,
                n: cbor::as_bytes(map.required(-2)?)?.to_vec(),
                e: cbor::as_bytes(map.required(-3)?)?.to_vec(),
            }),
            _ => Err(Error::BadResponse("unsupported COSE key type")),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = MapBuilder::new();
        match self {
            CoseKey::Ec2 { alg, crv, x, y } => {
                map.push(cbor::int(1), cbor::int(KTY_EC2));
                map.push(cbor::int(3), cbor::int(*alg));
                map.push(cbor::int(-1), cbor::int(*crv));
                map.push(cbor::int(-2), cbor::bytes(x.clone()));
                map.push(cbor::int(-3), cbor::bytes(y.clone()));
            }
            CoseKey::Okp { alg, crv, x } => {
                map.push(cbor::int(1), cbor::int(KTY_OKP));
                map.push(cbor::int(3), cbor::int(*alg));
                map.push(cbor::int(-1), cbor::int(*crv));
                map.push(cbor::int(-2), cbor::bytes(x.clone()));
            }
            CoseKey::Rsa { alg, n, e } => {
                map.push(cbor::int(1), cbor::int(KTY_RSA));
                map.push(cbor::int(3), cbor::int(*alg));
                map.push(cbor::int(-2), cbor::bytes(n.clone()));
                map.push(cbor::int(-3), cbor::bytes(e.clone()));
            }
        }
        map.build()
    }

    /// Export as a DER SubjectPublicKeyInfo, when the key type has a
    /// standard encoding.
    pub fn to_der(&self) -> Option<Vec<u8>> {
        match self {
            CoseKey::Ec2 { crv, x, y, .. } => {
                let (curve_oid, size): (&[u8], usize) = match *crv {
                    curve::P256 => (&OID_SECP256R1, 32),
                    curve::P384 => (&OID_SECP384R1, 48),
                    curve::P521 => (&OID_SECP521R1, 66),
                    _ => return None,
                };
                if x.len() > size || y.len() > size {
                    return None;
                }
                let mut point = vec![0x04];
                point.extend(std::iter::repeat(0).take(size - x.len()));
                point.extend_from_slice(x);
                point.extend(std::iter::repeat(0).take(size - y.len()));
                point.extend_from_slice(y);
                let algorithm = der::sequence(&[OID_EC_PUBLIC_KEY.to_vec(), curve_oid.to_vec()]);
                Some(der::sequence(&[algorithm, der::bit_string(&point)]))
            }
            CoseKey::Okp { crv, x, .. } => {
                if *crv != curve::ED25519 {
                    return None;
                }
                let algorithm = der::sequence(&[OID_ED25519.to_vec()]);
                Some(der::sequence(&[algorithm, der::bit_string(x)]))
            }
            CoseKey::Rsa { n, e, .. } => {
                let rsa_key = der::sequence(&[der::integer(n), der::integer(e)]);
                let algorithm = der::sequence(&[OID_RSA_ENCRYPTION.to_vec(), vec![0x05, 0x00]]);
                Some(der::sequence(&[algorithm, der::bit_string(&rsa_key)]))
            }
        }
    }
}

// Pre-encoded OBJECT IDENTIFIER values.
const OID_EC_PUBLIC_KEY: [u8; 9] = [0x06, 0x07, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x02, 0x01];
const OID_SECP256R1: [u8; 10] = [0x06, 0x08, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x03, 0x01, 0x07];
const OID_SECP384R1: [u8; 7] = [0x06, 0x05, 0x2B, 0x81, 0x04, 0x00, 0x22];
const OID_SECP521R1: [u8; 7] = [0x06, 0x05, 0x2B, 0x81, 0x04, 0x00, 0x23];
const OID_ED25519: [u8; 5] = [0x06, 0x03, 0x2B, 0x65, 0x70];
const OID_RSA_ENCRYPTION: [u8; 11] = [
    0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x01,
];

#[cfg(test)]
mod tests {
    use super::*;
    use yubikit_core::cbor;

    #[test]
    fn ec2_round_trip() {
        let key = CoseKey::ec2_p256(alg::ES256, vec![0x11; 32], vec![0x22; 32]);
        let value = key.to_value();
        assert_eq!(CoseKey::from_value(&value).unwrap(), key);
    }

    #[test]
    fn canonical_key_order() {
        let key = CoseKey::ec2_p256(alg::ES256, vec![0xAA; 32], vec![0xBB; 32]);
        let encoded = cbor::encode(&key.to_value()).unwrap();
        // 1, 3, -1, -2, -3
        assert_eq!(encoded[0], 0xA5);
        assert_eq!(encoded[1], 0x01);
        assert_eq!(encoded[3], 0x03);
        assert_eq!(encoded[5], 0x20);
    }

    #[test]
    fn uncompressed_point() {
        let mut point = vec![0x04];
        point.extend_from_slice(&[0x0A; 32]);
        point.extend_from_slice(&[0x0B; 32]);
        let key = CoseKey::from_uncompressed_point(&point).unwrap();
        match key {
            CoseKey::Ec2 { crv, x, y, .. } => {
                assert_eq!(crv, curve::P256);
                assert_eq!(x, vec![0x0A; 32]);
                assert_eq!(y, vec![0x0B; 32]);
            }
            _ => panic!("expected EC2 key"),
        }
        assert!(CoseKey::from_uncompressed_point(&point[..64]).is_err());
    }

    #[test]
    fn p256_spki_layout() {
        let key = CoseKey::ec2_p256(alg::ES256, vec![0x01; 32], vec![0x02; 32]);
        let der = key.to_der().unwrap();
        // SEQUENCE { SEQUENCE { id-ecPublicKey, secp256r1 }, BIT STRING }
        assert_eq!(der[0], 0x30);
        assert_eq!(der.len(), 91);
        assert!(der
            .windows(OID_SECP256R1.len())
            .any(|w| w == OID_SECP256R1));
        // uncompressed point marker after the BIT STRING padding byte
        assert_eq!(&der[der.len() - 65..][..1], &[0x04]);
    }

    #[test]
    fn rsa_spki_has_integer_padding() {
        let key = CoseKey::Rsa {
            alg: alg::RS256,
            n: vec![0xFF; 256],
            e: vec![0x01, 0x00, 0x01],
        };
        let der = key.to_der().unwrap();
        assert_eq!(der[0], 0x30);
        // modulus starts with a 0x00 pad because the high bit is set
        assert!(der.windows(5).any(|w| w == [0x02, 0x82, 0x01, 0x01, 0x00]));
    }

    #[test]
    fn okp_requires_ed25519() {
        let key = CoseKey::Okp {
            alg: alg::EDDSA,
            crv: curve::ED25519,
            x: vec![0x07; 32],
        };
        assert!(key.to_der().is_some());
        let bad = CoseKey::Okp {
            alg: alg::EDDSA,
            crv: 99,
            x: vec![0x07; 32],
        };
        assert!(bad.to_der().is_none());
    }
}
