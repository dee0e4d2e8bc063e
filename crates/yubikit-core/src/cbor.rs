//! Canonical CTAP2 CBOR on top of `ciborium`.
//!
//! `ciborium` handles the wire syntax; this module owns the CTAP2
//! deterministic form: definite lengths, shortest integer encodings, and
//! map keys sorted bytewise by their encodings, which puts integer keys
//! before text keys and orders text keys by length before lexicographic
//! byte value. Decoding is tolerant of unknown entries (callers enumerate
//! the tags they understand) but rejects unsorted or duplicate map keys.

use ciborium::value::{Integer, Value};

use crate::{Error, Result};

pub fn uint(v: u64) -> Value {
    Value::Integer(Integer::from(v))
}

pub fn int(v: i64) -> Value {
    Value::Integer(Integer::from(v))
}

pub fn bytes(v: impl Into<Vec<u8>>) -> Value {
    Value::Bytes(v.into())
}

pub fn text(v: impl Into<String>) -> Value {
    Value::Text(v.into())
}

pub fn array(items: Vec<Value>) -> Value {
    Value::Array(items)
}

/// Encode in canonical form. Maps are sorted recursively before writing.
pub fn encode(value: &Value) -> Result<Vec<u8>> {
    let mut value = value.clone();
    canonicalize(&mut value);
    let mut out = Vec::new();
    ciborium::ser::into_writer(&value, &mut out)
        .map_err(|_| Error::InvalidArgument("unencodable CBOR value"))?;
    Ok(out)
}

/// Decode one value and verify its maps are canonically ordered.
pub fn decode(data: &[u8]) -> Result<Value> {
    let value: Value =
        ciborium::de::from_reader(data).map_err(|_| Error::BadResponse("invalid CBOR"))?;
    ensure_canonical(&value)?;
    Ok(value)
}

/// Recursively sort map entries into canonical key order.
pub fn canonicalize(value: &mut Value) {
    match value {
        Value::Array(items) => items.iter_mut().for_each(canonicalize),
        Value::Map(entries) => {
            for (_, v) in entries.iter_mut() {
                canonicalize(v);
            }
            entries.sort_by_cached_key(|(k, _)| encoded_key(k));
        }
        _ => {}
    }
}

fn ensure_canonical(value: &Value) -> Result<()> {
    match value {
        Value::Array(items) => items.iter().try_for_each(ensure_canonical),
        Value::Map(entries) => {
            let keys: Vec<Vec<u8>> = entries.iter().map(|(k, _)| encoded_key(k)).collect();
            if keys.windows(2).any(|pair| pair[0] >= pair[1]) {
                return Err(Error::BadResponse("CBOR map keys not canonically sorted"));
            }
            entries.iter().try_for_each(|(_, v)| ensure_canonical(v))
        }
        _ => Ok(()),
    }
}

/// Bytewise comparison of encoded keys implements the CTAP2 ordering:
/// lower major types first, shorter encodings first, then lexicographic.
fn encoded_key(key: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    // A key a serializer cannot write sorts last and fails at encode time.
    if ciborium::ser::into_writer(key, &mut out).is_err() {
        return vec![0xFF];
    }
    out
}

/// Borrowing view into a CBOR map with tag-indexed access.
#[derive(Clone, Copy, Debug)]
pub struct MapView<'a> {
    entries: &'a [(Value, Value)],
}

impl<'a> MapView<'a> {
    pub fn from_value(value: &'a Value) -> Result<Self> {
        value
            .as_map()
            .map(|entries| Self { entries })
            .ok_or(Error::BadResponse("expected CBOR map"))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&'a Value, &'a Value)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn get_int(&self, key: i64) -> Option<&'a Value> {
        self.entries.iter().find_map(|(k, v)| {
            k.as_integer()
                .is_some_and(|i| i128::from(i) == i128::from(key))
                .then_some(v)
        })
    }

    pub fn get_text(&self, key: &str) -> Option<&'a Value> {
        self.entries
            .iter()
            .find_map(|(k, v)| (k.as_text() == Some(key)).then_some(v))
    }

    pub fn required(&self, key: i64) -> Result<&'a Value> {
        self.get_int(key)
            .ok_or(Error::BadResponse("missing required CBOR map entry"))
    }
}

/// Builder for integer- or text-keyed maps; entries are sorted into
/// canonical order on [`MapBuilder::build`].
#[derive(Debug, Default)]
pub struct MapBuilder {
    entries: Vec<(Value, Value)>,
}

impl MapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: Value, value: Value) -> &mut Self {
        self.entries.push((key, value));
        self
    }

    pub fn push_opt(&mut self, key: Value, value: Option<Value>) -> &mut Self {
        if let Some(value) = value {
            self.entries.push((key, value));
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn build(self) -> Value {
        let mut value = Value::Map(self.entries);
        canonicalize(&mut value);
        value
    }
}

pub fn as_bytes(value: &Value) -> Result<&[u8]> {
    value
        .as_bytes()
        .map(Vec::as_slice)
        .ok_or(Error::BadResponse("expected CBOR byte string"))
}

pub fn as_text(value: &Value) -> Result<&str> {
    value
        .as_text()
        .ok_or(Error::BadResponse("expected CBOR text string"))
}

pub fn as_array(value: &Value) -> Result<&[Value]> {
    value
        .as_array()
        .map(Vec::as_slice)
        .ok_or(Error::BadResponse("expected CBOR array"))
}

pub fn as_bool(value: &Value) -> Result<bool> {
    value
        .as_bool()
        .ok_or(Error::BadResponse("expected CBOR bool"))
}

pub fn as_u64(value: &Value) -> Result<u64> {
    value
        .as_integer()
        .and_then(|i| u64::try_from(i128::from(i)).ok())
        .ok_or(Error::BadResponse("expected CBOR unsigned integer"))
}

pub fn as_i64(value: &Value) -> Result<i64> {
    value
        .as_integer()
        .and_then(|i| i64::try_from(i128::from(i)).ok())
        .ok_or(Error::BadResponse("expected CBOR integer"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_keys_precede_text_keys() {
        let mut builder = MapBuilder::new();
        builder.push(text("zz"), uint(1));
        builder.push(uint(2), uint(2));
        builder.push(int(-1), uint(3));
        builder.push(uint(1), uint(4));
        let encoded = encode(&builder.build()).unwrap();
        // {1: 4, 2: 2, -1: 3, "zz": 1}
        assert_eq!(
            hex::encode(encoded),
            "a4010402022003627a7a01"
        );
    }

    #[test]
    fn text_keys_sort_by_length_then_bytes() {
        let mut builder = MapBuilder::new();
        builder.push(text("ab"), uint(0));
        builder.push(text("b"), uint(1));
        builder.push(text("aa"), uint(2));
        let value = builder.build();
        let keys: Vec<&str> = value
            .as_map()
            .unwrap()
            .iter()
            .map(|(k, _)| k.as_text().unwrap())
            .collect();
        assert_eq!(keys, vec!["b", "aa", "ab"]);
    }

    #[test]
    fn double_encode_is_stable() {
        let mut builder = MapBuilder::new();
        builder.push(text("b"), bytes(vec![1, 2, 3]));
        builder.push(uint(3), array(vec![uint(7), text("x")]));
        builder.push(uint(1), Value::Bool(true));
        let value = builder.build();
        let first = encode(&value).unwrap();
        let second = encode(&decode(&first).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn unsorted_map_is_rejected_on_decode() {
        // {2: 0, 1: 0} out of order
        let data = hex::decode("a202000100").unwrap();
        assert!(decode(&data).is_err());
    }

    #[test]
    fn duplicate_keys_are_rejected_on_decode() {
        let data = hex::decode("a201000100").unwrap();
        assert!(decode(&data).is_err());
    }

    #[test]
    fn map_view_lookups() {
        let mut builder = MapBuilder::new();
        builder.push(uint(1), bytes(vec![0xAA]));
        builder.push(text("up"), Value::Bool(false));
        let value = builder.build();
        let view = MapView::from_value(&value).unwrap();
        assert_eq!(as_bytes(view.required(1).unwrap()).unwrap(), &[0xAA]);
        assert!(!as_bool(view.get_text("up").unwrap()).unwrap());
        assert!(view.get_int(2).is_none());
        assert!(view.required(2).is_err());
    }
}
