//! Minimal DER writing helpers, enough for SubjectPublicKeyInfo export
//! and ECDSA signature normalization. Parsing stays with [`crate::tlv`].

use crate::{Error, Result};

fn length(len: usize) -> Vec<u8> {
    match len {
        0..=0x7F => vec![len as u8],
        0x80..=0xFF => vec![0x81, len as u8],
        _ => {
            let mut out = vec![0x82];
            out.extend_from_slice(&(len as u16).to_be_bytes());
            out
        }
    }
}

pub fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend(length(content.len()));
    out.extend_from_slice(content);
    out
}

pub fn sequence(parts: &[Vec<u8>]) -> Vec<u8> {
    tlv(0x30, &parts.concat())
}

pub fn bit_string(content: &[u8]) -> Vec<u8> {
    let mut padded = vec![0x00];
    padded.extend_from_slice(content);
    tlv(0x03, &padded)
}

/// An INTEGER from unsigned big-endian bytes: leading zeros stripped, a
/// zero pad added back when the high bit would flip the sign.
pub fn integer(bytes: &[u8]) -> Vec<u8> {
    let start = bytes.iter().take_while(|&&b| b == 0).count();
    let stripped = &bytes[start.min(bytes.len().saturating_sub(1))..];
    if stripped.first().is_some_and(|&b| b & 0x80 != 0) {
        let mut content = vec![0x00];
        content.extend_from_slice(stripped);
        tlv(0x02, &content)
    } else {
        tlv(0x02, stripped)
    }
}

/// Convert a raw `r || s` ECDSA signature (equal-length halves, as smart
/// cards return them) into the DER `SEQUENCE { INTEGER r, INTEGER s }`
/// form most verifiers expect.
pub fn ec_signature(raw: &[u8]) -> Result<Vec<u8>> {
    if raw.is_empty() || raw.len() % 2 != 0 {
        return Err(Error::BadResponse("raw ECDSA signature has odd length"));
    }
    let (r, s) = raw.split_at(raw.len() / 2);
    Ok(sequence(&[integer(r), integer(s)]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_minimal() {
        assert_eq!(integer(&[0x00, 0x00, 0x01]), vec![0x02, 0x01, 0x01]);
        assert_eq!(integer(&[0x7F]), vec![0x02, 0x01, 0x7F]);
        assert_eq!(integer(&[0x80]), vec![0x02, 0x02, 0x00, 0x80]);
        assert_eq!(integer(&[0x00]), vec![0x02, 0x01, 0x00]);
    }

    #[test]
    fn ec_signature_pads_high_halves() {
        let mut raw = vec![0x80; 32];
        raw.extend_from_slice(&[0x01; 32]);
        let der = ec_signature(&raw).unwrap();
        assert_eq!(der[0], 0x30);
        // r is padded to 33 bytes, s stays 32
        assert_eq!(&der[2..7], &[0x02, 0x21, 0x00, 0x80, 0x80]);
        assert!(ec_signature(&raw[..63]).is_err());
    }

    #[test]
    fn long_sequences_use_multi_byte_lengths() {
        let seq = sequence(&[tlv(0x04, &[0xAA; 200])]);
        assert_eq!(&seq[..2], &[0x30, 0x81]);
        let big = sequence(&[tlv(0x04, &[0xAA; 300])]);
        assert_eq!(&big[..2], &[0x30, 0x82]);
    }
}
