//! PIN/UV auth protocols 1 and 2.
//!
//! Both derive a shared secret from an ECDH exchange with the
//! authenticator and use it to encrypt PIN material and authenticate
//! commands; they differ in key derivation, IV handling, and MAC length.

use cipher::block_padding::NoPadding;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p256::elliptic_curve::generic_array::GenericArray;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{ecdh::EphemeralSecret, EncodedPoint, PublicKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::cose::{alg, CoseKey};
use crate::Result;
use yubikit_core::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

const AES_BLOCK_SIZE: usize = 16;

/// Key material derived from the ECDH exchange. Zeroized on drop.
pub type SharedSecret = Zeroizing<Vec<u8>>;

/// Platform side of a PIN/UV auth protocol.
pub trait PinUvAuthProtocol {
    /// Protocol number as negotiated via `info.pinUvAuthProtocols`.
    fn version(&self) -> u64;

    /// Run the key agreement against the authenticator's public key,
    /// returning the platform key to send and the derived shared secret.
    /// A fresh ephemeral key pair is generated per call.
    fn encapsulate(&self, peer_key: &CoseKey) -> Result<(CoseKey, SharedSecret)>;

    fn encrypt(&self, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>;

    fn authenticate(&self, key: &[u8], message: &[u8]) -> Vec<u8>;
}

/// Pick the first protocol the authenticator lists that this library
/// implements.
pub fn preferred(protocols: &[u64]) -> Option<Box<dyn PinUvAuthProtocol + Send + Sync>> {
    for protocol in protocols {
        match protocol {
            1 => return Some(Box::new(PinUvAuthProtocolV1)),
            2 => return Some(Box::new(PinUvAuthProtocolV2)),
            _ => continue,
        }
    }
    None
}

fn ecdh(peer_key: &CoseKey) -> Result<(CoseKey, Zeroizing<Vec<u8>>)> {
    let (x, y) = match peer_key {
        CoseKey::Ec2 { x, y, .. } if x.len() == 32 && y.len() == 32 => (x, y),
        _ => return Err(Error::BadResponse("key agreement key is not P-256").into()),
    };
    let point = EncodedPoint::from_affine_coordinates(
        GenericArray::from_slice(x),
        GenericArray::from_slice(y),
        false,
    );
    let peer = Option::<PublicKey>::from(PublicKey::from_encoded_point(&point))
        .ok_or(Error::BadResponse("key agreement key not on curve"))?;

    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let platform_point = ephemeral.public_key().to_encoded_point(false);
    let platform_key = CoseKey::Ec2 {
        alg: alg::ECDH_ES_HKDF_256,
        crv: crate::cose::curve::P256,
        x: platform_point
            .x()
            .ok_or(Error::BadResponse("degenerate platform point"))?
            .to_vec(),
        y: platform_point
            .y()
            .ok_or(Error::BadResponse("degenerate platform point"))?
            .to_vec(),
    };
    let z = Zeroizing::new(
        ephemeral
            .diffie_hellman(&peer)
            .raw_secret_bytes()
            .to_vec(),
    );
    Ok((platform_key, z))
}

fn aes_cbc_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    if plaintext.len() % AES_BLOCK_SIZE != 0 {
        return Err(Error::InvalidArgument("plaintext not block-aligned").into());
    }
    let cipher = Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|_| Error::InvalidArgument("bad AES key length"))?;
    Ok(cipher.encrypt_padded_vec_mut::<NoPadding>(plaintext))
}

fn aes_cbc_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() % AES_BLOCK_SIZE != 0 {
        return Err(Error::BadResponse("ciphertext not block-aligned").into());
    }
    let cipher = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|_| Error::InvalidArgument("bad AES key length"))?;
    cipher
        .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
        .map_err(|_| Error::BadResponse("undecryptable ciphertext").into())
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Protocol 1: `sharedSecret = SHA-256(ECDH x-coordinate)`, AES-256-CBC
/// with a zero IV, HMAC-SHA-256 truncated to 16 bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct PinUvAuthProtocolV1;

impl PinUvAuthProtocol for PinUvAuthProtocolV1 {
    fn version(&self) -> u64 {
        1
    }

    fn encapsulate(&self, peer_key: &CoseKey) -> Result<(CoseKey, SharedSecret)> {
        let (platform_key, z) = ecdh(peer_key)?;
        let secret = Zeroizing::new(Sha256::digest(z.as_slice()).to_vec());
        Ok((platform_key, secret))
    }

    fn encrypt(&self, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        aes_cbc_encrypt(key, &[0u8; AES_BLOCK_SIZE], plaintext)
    }

    fn decrypt(&self, key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        aes_cbc_decrypt(key, &[0u8; AES_BLOCK_SIZE], ciphertext)
    }

    fn authenticate(&self, key: &[u8], message: &[u8]) -> Vec<u8> {
        hmac_sha256(key, message)[..16].to_vec()
    }
}

/// Protocol 2: a 64-byte secret holding separate HMAC and AES keys from
/// HKDF-SHA-256, a random IV prefixed to every ciphertext, and the full
/// 32-byte MAC.
#[derive(Clone, Copy, Debug, Default)]
pub struct PinUvAuthProtocolV2;

impl PinUvAuthProtocolV2 {
    fn split_keys(key: &[u8]) -> Result<(&[u8], &[u8])> {
        if key.len() == 64 {
            Ok(key.split_at(32))
        } else if key.len() == 32 {
            // A pinUvAuthToken is a single key, not a derived pair.
            Ok((key, key))
        } else {
            Err(Error::InvalidArgument("bad protocol 2 key length").into())
        }
    }
}

impl PinUvAuthProtocol for PinUvAuthProtocolV2 {
    fn version(&self) -> u64 {
        2
    }

    fn encapsulate(&self, peer_key: &CoseKey) -> Result<(CoseKey, SharedSecret)> {
        let (platform_key, z) = ecdh(peer_key)?;
        let hk = Hkdf::<Sha256>::new(Some(&[0u8; 32]), z.as_slice());
        let mut secret = Zeroizing::new(vec![0u8; 64]);
        hk.expand(b"CTAP2 HMAC key", &mut secret[..32])
            .expect("fixed-length HKDF output");
        hk.expand(b"CTAP2 AES key", &mut secret[32..])
            .expect("fixed-length HKDF output");
        Ok((platform_key, secret))
    }

    fn encrypt(&self, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let (_, aes_key) = Self::split_keys(key)?;
        let mut iv = [0u8; AES_BLOCK_SIZE];
        OsRng.fill_bytes(&mut iv);
        let mut out = iv.to_vec();
        out.extend(aes_cbc_encrypt(aes_key, &iv, plaintext)?);
        Ok(out)
    }

    fn decrypt(&self, key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let (_, aes_key) = Self::split_keys(key)?;
        if ciphertext.len() < AES_BLOCK_SIZE {
            return Err(Error::BadResponse("ciphertext shorter than IV").into());
        }
        let (iv, body) = ciphertext.split_at(AES_BLOCK_SIZE);
        aes_cbc_decrypt(aes_key, iv, body)
    }

    fn authenticate(&self, key: &[u8], message: &[u8]) -> Vec<u8> {
        let hmac_key = match Self::split_keys(key) {
            Ok((hmac_key, _)) => hmac_key,
            Err(_) => key,
        };
        hmac_sha256(hmac_key, message).to_vec()
    }
}
