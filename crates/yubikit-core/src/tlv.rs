//! BER-TLV as used by ISO 7816 data objects.
//!
//! Tags are kept as the raw big-endian byte sequence packed into a `u32`,
//! so a two-byte tag like `7F49` is the value `0x7F49`. Lengths are
//! definite form only: one byte up to `0x7F`, then `81 xx` and `82 xx xx`;
//! the `83 xx xx xx` form shows up in some card data and is accepted on
//! decode but never produced.

use std::collections::BTreeMap;

use crate::{Error, Result};

/// One tag-length-value node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tlv {
    tag: u32,
    value: Vec<u8>,
}

impl Tlv {
    /// Build a node. The tag must be a well-formed BER tag no longer than
    /// three bytes and the value no longer than `0xFFFF` bytes.
    pub fn new(tag: u32, value: impl Into<Vec<u8>>) -> Result<Self> {
        let value = value.into();
        if tag == 0 || tag > 0xFF_FF_FF {
            return Err(Error::InvalidArgument("TLV tag out of range"));
        }
        if value.len() > 0xFFFF {
            return Err(Error::InvalidArgument("TLV value too long"));
        }
        Ok(Self { tag, value })
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn into_value(self) -> Vec<u8> {
        self.value
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.value.len() + 6);
        let tag_bytes = self.tag.to_be_bytes();
        let skip = tag_bytes.iter().take_while(|&&b| b == 0).count();
        out.extend_from_slice(&tag_bytes[skip..]);
        match self.value.len() {
            len @ 0..=0x7F => out.push(len as u8),
            len @ 0x80..=0xFF => {
                out.push(0x81);
                out.push(len as u8);
            }
            len => {
                out.push(0x82);
                out.extend_from_slice(&(len as u16).to_be_bytes());
            }
        }
        out.extend_from_slice(&self.value);
        out
    }

    /// Parse one node off the front of `data`, returning it and the rest.
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8])> {
        let (&first, mut rest) = data
            .split_first()
            .ok_or(Error::BadResponse("empty TLV data"))?;
        let mut tag = first as u32;
        if first & 0x1F == 0x1F {
            // Long-form tag: read while the continuation bit is set.
            loop {
                let (&next, tail) = rest
                    .split_first()
                    .ok_or(Error::BadResponse("truncated TLV tag"))?;
                rest = tail;
                if tag > 0xFF_FF {
                    return Err(Error::BadResponse("TLV tag longer than three bytes"));
                }
                tag = tag << 8 | next as u32;
                if next & 0x80 == 0 {
                    break;
                }
            }
        }
        let (&first_len, mut rest) = rest
            .split_first()
            .ok_or(Error::BadResponse("truncated TLV length"))?;
        let length = match first_len {
            len @ 0..=0x7F => len as usize,
            0x81..=0x83 => {
                let n = (first_len - 0x80) as usize;
                if rest.len() < n {
                    return Err(Error::BadResponse("truncated TLV length"));
                }
                let (len_bytes, tail) = rest.split_at(n);
                rest = tail;
                len_bytes.iter().fold(0usize, |acc, &b| acc << 8 | b as usize)
            }
            _ => return Err(Error::BadResponse("indefinite TLV length")),
        };
        if rest.len() < length {
            return Err(Error::BadResponse("truncated TLV value"));
        }
        let (value, rest) = rest.split_at(length);
        Ok((
            Self {
                tag,
                value: value.to_vec(),
            },
            rest,
        ))
    }

    /// Parse a sequence of nodes, in order, duplicates kept.
    pub fn parse_list(mut data: &[u8]) -> Result<Vec<Self>> {
        let mut out = Vec::new();
        while !data.is_empty() {
            let (tlv, rest) = Self::parse(data)?;
            out.push(tlv);
            data = rest;
        }
        Ok(out)
    }

    /// Parse a sequence of nodes into a map keyed by tag; on duplicate
    /// tags the last value wins.
    pub fn parse_map(data: &[u8]) -> Result<BTreeMap<u32, Vec<u8>>> {
        Ok(Self::parse_list(data)?
            .into_iter()
            .map(|tlv| (tlv.tag, tlv.value))
            .collect())
    }

    /// Decode a single node that must fill `data` exactly and carry `tag`,
    /// returning its value.
    pub fn unpack(tag: u32, data: &[u8]) -> Result<Vec<u8>> {
        let (tlv, rest) = Self::parse(data)?;
        if !rest.is_empty() {
            return Err(Error::BadResponse("unexpected data after TLV"));
        }
        if tlv.tag != tag {
            return Err(Error::BadResponse("unexpected TLV tag"));
        }
        Ok(tlv.value)
    }
}

/// Encode a sequence of nodes back to back.
pub fn encode_list<I: IntoIterator<Item = Tlv>>(tlvs: I) -> Vec<u8> {
    let mut out = Vec::new();
    for tlv in tlvs {
        out.extend_from_slice(&tlv.to_bytes());
    }
    out
}
