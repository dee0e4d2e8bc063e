//! The `authenticatorLargeBlobs` command: a shared CBOR array of opaque,
//! per-credential sealed entries.
//!
//! The serialized array always ends with `LEFT(SHA-256(array), 16)`.
//! Entries are maps `{1: ciphertext, 2: origSize, 3: nonce}` where the
//! ciphertext is AES-256-GCM over the zstd-compressed payload, keyed by
//! the credential's `largeBlobKey`.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use ciborium::value::Value;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::debug;
use yubikit_core::cbor::{self, MapBuilder, MapView};
use yubikit_core::{Error, SmartCardConnection};

use super::pin_uv::PinUvAuthProtocol;
use super::{command, Ctap2Session};
use crate::Result;

const TAG_GET: i64 = 0x01;
const TAG_SET: i64 = 0x02;
const TAG_OFFSET: i64 = 0x03;
const TAG_LENGTH: i64 = 0x04;
const TAG_PIN_UV_AUTH_PARAM: i64 = 0x05;
const TAG_PIN_UV_AUTH_PROTOCOL: i64 = 0x06;

const RESP_CONFIG: i64 = 0x01;

const CHECKSUM_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// Large-blob access over a CTAP2 session. Writes require a
/// pinUvAuthToken carrying the `lbw` permission.
pub struct LargeBlobs<'a, C> {
    session: &'a mut Ctap2Session<C>,
    protocol: &'a dyn PinUvAuthProtocol,
    token: Option<&'a [u8]>,
}

impl<'a, C: SmartCardConnection> LargeBlobs<'a, C> {
    pub fn new(
        session: &'a mut Ctap2Session<C>,
        protocol: &'a dyn PinUvAuthProtocol,
        token: Option<&'a [u8]>,
    ) -> Self {
        Self {
            session,
            protocol,
            token,
        }
    }

    fn fragment_size(&self) -> usize {
        // maxMsgSize less the framing overhead.
        self.session.info().max_msg_size.unwrap_or(1024) as usize - 64
    }

    /// Read and verify the serialized large-blob array.
    pub fn read_blob_array(&mut self) -> Result<Vec<Value>> {
        let fragment = self.fragment_size();
        let mut data = Vec::new();
        loop {
            let mut map = MapBuilder::new();
            map.push(cbor::int(TAG_GET), cbor::uint(fragment as u64));
            map.push(cbor::int(TAG_OFFSET), cbor::uint(data.len() as u64));
            let body = self
                .session
                .send_cbor(command::LARGE_BLOBS, Some(map.build()))?
                .ok_or(Error::BadResponse("largeBlobs returned no body"))?;
            let view = MapView::from_value(&body)?;
            let chunk = cbor::as_bytes(view.required(RESP_CONFIG)?)?;
            data.extend_from_slice(chunk);
            if chunk.len() < fragment {
                break;
            }
        }
        if data.len() < CHECKSUM_LEN {
            return Err(Error::BadResponse("large-blob array shorter than checksum").into());
        }
        let (body, checksum) = data.split_at(data.len() - CHECKSUM_LEN);
        if checksum != &Sha256::digest(body)[..CHECKSUM_LEN] {
            return Err(Error::BadResponse("large-blob array checksum mismatch").into());
        }
        let array = cbor::decode(body)?;
        cbor::as_array(&array).map(<[Value]>::to_vec).map_err(Into::into)
    }

    /// Serialize, checksum, and upload the array in fragments.
    pub fn write_blob_array(&mut self, entries: Vec<Value>) -> Result<()> {
        let mut data = cbor::encode(&Value::Array(entries))?;
        let checksum = Sha256::digest(&data);
        data.extend_from_slice(&checksum[..CHECKSUM_LEN]);

        let fragment = self.fragment_size();
        let total = data.len();
        let mut offset = 0usize;
        for chunk in data.chunks(fragment) {
            let mut map = MapBuilder::new();
            map.push(cbor::int(TAG_SET), cbor::bytes(chunk));
            map.push(cbor::int(TAG_OFFSET), cbor::uint(offset as u64));
            if offset == 0 {
                map.push(cbor::int(TAG_LENGTH), cbor::uint(total as u64));
            }
            if let Some(token) = self.token {
                // 32 x 0xFF || 0x0C 00 || uint32le(offset) || SHA-256(chunk)
                let mut message = vec![0xFF; 32];
                message.extend_from_slice(&[0x0C, 0x00]);
                message.extend_from_slice(&(offset as u32).to_le_bytes());
                message.extend_from_slice(&Sha256::digest(chunk));
                let auth = self.protocol.authenticate(token, &message);
                map.push(cbor::int(TAG_PIN_UV_AUTH_PARAM), cbor::bytes(auth));
                map.push(
                    cbor::int(TAG_PIN_UV_AUTH_PROTOCOL),
                    cbor::uint(self.protocol.version()),
                );
            }
            self.session
                .send_cbor(command::LARGE_BLOBS, Some(map.build()))?;
            offset += chunk.len();
        }
        debug!(bytes = total, "large-blob array written");
        Ok(())
    }

    /// Find and unseal the entry belonging to `large_blob_key`, if any.
    pub fn get_blob(&mut self, large_blob_key: &[u8]) -> Result<Option<Vec<u8>>> {
        let entries = self.read_blob_array()?;
        Ok(entries
            .iter()
            .find_map(|entry| unseal(large_blob_key, entry)))
    }

    /// Store `data` for `large_blob_key`, replacing any entry the key can
    /// already open.
    pub fn put_blob(&mut self, large_blob_key: &[u8], data: &[u8]) -> Result<()> {
        let mut entries = self.read_blob_array()?;
        entries.retain(|entry| unseal(large_blob_key, entry).is_none());
        entries.push(seal(large_blob_key, data)?);
        self.write_blob_array(entries)
    }

    /// Remove the entry for `large_blob_key`; returns whether one existed.
    pub fn delete_blob(&mut self, large_blob_key: &[u8]) -> Result<bool> {
        let entries = self.read_blob_array()?;
        let before = entries.len();
        let remaining: Vec<Value> = entries
            .into_iter()
            .filter(|entry| unseal(large_blob_key, entry).is_none())
            .collect();
        let removed = remaining.len() != before;
        if removed {
            self.write_blob_array(remaining)?;
        }
        Ok(removed)
    }
}

fn aad(orig_size: u64) -> Vec<u8> {
    let mut aad = b"blob".to_vec();
    aad.extend_from_slice(&orig_size.to_le_bytes());
    aad
}

/// Compress and encrypt one large-blob entry.
fn seal(key: &[u8], data: &[u8]) -> Result<Value> {
    let compressed = zstd::stream::encode_all(data, 0)
        .map_err(|_| Error::InvalidArgument("uncompressible blob"))?;
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| Error::InvalidArgument("largeBlobKey must be 32 bytes"))?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let orig_size = data.len() as u64;
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &compressed,
                aad: &aad(orig_size),
            },
        )
        .map_err(|_| Error::InvalidArgument("blob encryption failed"))?;
    let mut map = MapBuilder::new();
    map.push(cbor::int(1), cbor::bytes(ciphertext));
    map.push(cbor::int(2), cbor::uint(orig_size));
    map.push(cbor::int(3), cbor::bytes(nonce.to_vec()));
    Ok(map.build())
}

/// Try to open one entry with the given key. Foreign entries simply fail
/// authentication and yield `None`.
fn unseal(key: &[u8], entry: &Value) -> Option<Vec<u8>> {
    let map = MapView::from_value(entry).ok()?;
    let ciphertext = cbor::as_bytes(map.get_int(1)?).ok()?;
    let orig_size = cbor::as_u64(map.get_int(2)?).ok()?;
    let nonce = cbor::as_bytes(map.get_int(3)?).ok()?;
    if nonce.len() != NONCE_LEN {
        return None;
    }
    let cipher = Aes256Gcm::new_from_slice(key).ok()?;
    let compressed = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: &aad(orig_size),
            },
        )
        .ok()?;
    let data = zstd::stream::decode_all(compressed.as_slice()).ok()?;
    (data.len() as u64 == orig_size).then_some(data)
}
