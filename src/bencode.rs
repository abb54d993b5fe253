//! # Canonical Bencode Codec
//!
//! Every wire frame and on-disk record in mixroute is a bencoded value.
//! Router contacts are *signed over their canonical encoding*, so the codec
//! here is deliberately strict:
//!
//! - Dictionary keys are emitted in lexical byte order (`BTreeMap` keeps the
//!   invariant for free) and must arrive in that order.
//! - Integers reject leading zeros and `-0`.
//! - Decoding is bounded in depth and size to survive hostile input.
//!
//! Control payloads travelling a path are right-padded with random bytes, so
//! [`decode_prefix`] parses a single value and reports how many bytes it
//! consumed; [`decode`] additionally requires the buffer to be fully
//! consumed.

use std::collections::BTreeMap;

/// Maximum nesting depth accepted while decoding.
/// SECURITY: Bounds stack usage on untrusted input.
const MAX_DEPTH: usize = 8;

/// Maximum buffer we will decode.
/// SECURITY: Anything bigger than a link MTU plus slack is hostile.
pub const MAX_DECODE_SIZE: usize = 64 * 1024;

/// A bencoded value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn str(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Convenience lookup for dict values by string key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key.as_bytes()))
    }

    /// Encode into canonical bencode bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            Value::Bytes(b) => {
                out.extend_from_slice(b.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(b);
            }
            Value::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Value::Dict(map) => {
                out.push(b'd');
                for (key, val) in map {
                    out.extend_from_slice(key.len().to_string().as_bytes());
                    out.push(b':');
                    out.extend_from_slice(key);
                    val.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }
}

/// Builder for dicts with string keys, the common case for wire frames.
#[derive(Default)]
pub struct DictBuilder {
    map: BTreeMap<Vec<u8>, Value>,
}

impl DictBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(mut self, key: &str, value: Value) -> Self {
        self.map.insert(key.as_bytes().to_vec(), value);
        self
    }

    pub fn insert_bytes(self, key: &str, bytes: &[u8]) -> Self {
        self.insert(key, Value::Bytes(bytes.to_vec()))
    }

    pub fn insert_int(self, key: &str, int: i64) -> Self {
        self.insert(key, Value::Int(int))
    }

    pub fn build(self) -> Value {
        Value::Dict(self.map)
    }
}

/// Error type for bencode decoding failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Input ended before the value was complete.
    Truncated,
    /// A byte that cannot start or continue a value at this position.
    UnexpectedByte,
    /// Integer with a leading zero, bare `-`, or `-0`.
    BadInteger,
    /// Byte-string length prefix overflows or exceeds the buffer.
    BadLength,
    /// Dictionary keys out of canonical order or duplicated.
    NonCanonicalDict,
    /// Nesting deeper than [`MAX_DEPTH`].
    TooDeep,
    /// Input larger than [`MAX_DECODE_SIZE`].
    TooLarge,
    /// Trailing bytes after the value (strict [`decode`] only).
    TrailingBytes,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Truncated => write!(f, "truncated bencode value"),
            DecodeError::UnexpectedByte => write!(f, "unexpected byte in bencode value"),
            DecodeError::BadInteger => write!(f, "malformed bencode integer"),
            DecodeError::BadLength => write!(f, "malformed bencode length prefix"),
            DecodeError::NonCanonicalDict => write!(f, "non-canonical bencode dict"),
            DecodeError::TooDeep => write!(f, "bencode nesting too deep"),
            DecodeError::TooLarge => write!(f, "bencode input too large"),
            DecodeError::TrailingBytes => write!(f, "trailing bytes after bencode value"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decode a single value; the buffer must contain exactly one value.
pub fn decode(buf: &[u8]) -> Result<Value, DecodeError> {
    let (value, used) = decode_prefix(buf)?;
    if used != buf.len() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(value)
}

/// Decode a single value from the front of `buf`, returning the value and
/// the number of bytes consumed. Trailing bytes (e.g. random padding on
/// control payloads) are ignored.
pub fn decode_prefix(buf: &[u8]) -> Result<(Value, usize), DecodeError> {
    if buf.len() > MAX_DECODE_SIZE {
        return Err(DecodeError::TooLarge);
    }
    let mut pos = 0usize;
    let value = decode_at(buf, &mut pos, 0)?;
    Ok((value, pos))
}

fn decode_at(buf: &[u8], pos: &mut usize, depth: usize) -> Result<Value, DecodeError> {
    if depth > MAX_DEPTH {
        return Err(DecodeError::TooDeep);
    }
    match buf.get(*pos) {
        None => Err(DecodeError::Truncated),
        Some(b'i') => {
            *pos += 1;
            decode_int(buf, pos)
        }
        Some(b'l') => {
            *pos += 1;
            let mut items = Vec::new();
            loop {
                match buf.get(*pos) {
                    None => return Err(DecodeError::Truncated),
                    Some(b'e') => {
                        *pos += 1;
                        return Ok(Value::List(items));
                    }
                    Some(_) => items.push(decode_at(buf, pos, depth + 1)?),
                }
            }
        }
        Some(b'd') => {
            *pos += 1;
            let mut map = BTreeMap::new();
            let mut last_key: Option<Vec<u8>> = None;
            loop {
                match buf.get(*pos) {
                    None => return Err(DecodeError::Truncated),
                    Some(b'e') => {
                        *pos += 1;
                        return Ok(Value::Dict(map));
                    }
                    Some(_) => {
                        let key = match decode_at(buf, pos, depth + 1)? {
                            Value::Bytes(k) => k,
                            _ => return Err(DecodeError::UnexpectedByte),
                        };
                        if let Some(prev) = &last_key {
                            if key <= *prev {
                                return Err(DecodeError::NonCanonicalDict);
                            }
                        }
                        let val = decode_at(buf, pos, depth + 1)?;
                        last_key = Some(key.clone());
                        map.insert(key, val);
                    }
                }
            }
        }
        Some(b'0'..=b'9') => decode_bytes(buf, pos),
        Some(_) => Err(DecodeError::UnexpectedByte),
    }
}

fn decode_int(buf: &[u8], pos: &mut usize) -> Result<Value, DecodeError> {
    let start = *pos;
    let mut end = start;
    while let Some(&b) = buf.get(end) {
        if b == b'e' {
            let digits = &buf[start..end];
            *pos = end + 1;
            return parse_int(digits).map(Value::Int);
        }
        end += 1;
    }
    Err(DecodeError::Truncated)
}

fn parse_int(digits: &[u8]) -> Result<i64, DecodeError> {
    let (neg, digits) = match digits.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, digits),
    };
    if digits.is_empty() {
        return Err(DecodeError::BadInteger);
    }
    // Canonical form: no leading zeros, no negative zero.
    if digits[0] == b'0' && (digits.len() > 1 || neg) {
        return Err(DecodeError::BadInteger);
    }
    let mut value: i64 = 0;
    for &d in digits {
        if !d.is_ascii_digit() {
            return Err(DecodeError::BadInteger);
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((d - b'0') as i64))
            .ok_or(DecodeError::BadInteger)?;
    }
    Ok(if neg { -value } else { value })
}

fn decode_bytes(buf: &[u8], pos: &mut usize) -> Result<Value, DecodeError> {
    let start = *pos;
    let mut end = start;
    while let Some(&b) = buf.get(end) {
        if b == b':' {
            break;
        }
        if !b.is_ascii_digit() || end - start > 8 {
            return Err(DecodeError::BadLength);
        }
        end += 1;
    }
    if end >= buf.len() {
        return Err(DecodeError::Truncated);
    }
    let len: usize = std::str::from_utf8(&buf[start..end])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(DecodeError::BadLength)?;
    let data_start = end + 1;
    let data_end = data_start.checked_add(len).ok_or(DecodeError::BadLength)?;
    if data_end > buf.len() {
        return Err(DecodeError::Truncated);
    }
    *pos = data_end;
    Ok(Value::Bytes(buf[data_start..data_end].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_roundtrip() {
        for i in [0i64, 1, -1, 42, -1000, i64::MAX, i64::MIN + 1] {
            let enc = Value::Int(i).encode();
            assert_eq!(decode(&enc).unwrap(), Value::Int(i));
        }
    }

    #[test]
    fn bytes_roundtrip() {
        let v = Value::Bytes(b"hello world".to_vec());
        assert_eq!(v.encode(), b"11:hello world");
        assert_eq!(decode(&v.encode()).unwrap(), v);

        let empty = Value::Bytes(vec![]);
        assert_eq!(empty.encode(), b"0:");
        assert_eq!(decode(b"0:").unwrap(), empty);
    }

    #[test]
    fn dict_keys_sorted_canonically() {
        let v = DictBuilder::new()
            .insert_int("z", 1)
            .insert_int("a", 2)
            .insert_bytes("m", b"x")
            .build();
        assert_eq!(v.encode(), b"d1:ai2e1:m1:x1:zi1ee");
    }

    #[test]
    fn encoding_is_deterministic() {
        let build = || {
            DictBuilder::new()
                .insert_bytes("k", &[7u8; 32])
                .insert_int("u", 1234567)
                .insert(
                    "a",
                    Value::List(vec![Value::str("one"), Value::str("two")]),
                )
                .build()
        };
        assert_eq!(build().encode(), build().encode());
    }

    #[test]
    fn rejects_out_of_order_dict() {
        // keys "b" then "a": valid bencode elsewhere, not canonical here
        assert_eq!(
            decode(b"d1:bi1e1:ai2ee"),
            Err(DecodeError::NonCanonicalDict)
        );
        // duplicate key
        assert_eq!(
            decode(b"d1:ai1e1:ai2ee"),
            Err(DecodeError::NonCanonicalDict)
        );
    }

    #[test]
    fn rejects_bad_integers() {
        assert_eq!(decode(b"i01e"), Err(DecodeError::BadInteger));
        assert_eq!(decode(b"i-0e"), Err(DecodeError::BadInteger));
        assert_eq!(decode(b"ie"), Err(DecodeError::BadInteger));
        assert_eq!(decode(b"i--1e"), Err(DecodeError::BadInteger));
        assert_eq!(decode(b"i99999999999999999999e"), Err(DecodeError::BadInteger));
    }

    #[test]
    fn rejects_truncated_input() {
        assert_eq!(decode(b"i42"), Err(DecodeError::Truncated));
        assert_eq!(decode(b"5:abc"), Err(DecodeError::Truncated));
        assert_eq!(decode(b"l1:a"), Err(DecodeError::Truncated));
        assert_eq!(decode(b"d1:a"), Err(DecodeError::Truncated));
    }

    #[test]
    fn rejects_trailing_bytes_in_strict_mode() {
        assert_eq!(decode(b"i1exxx"), Err(DecodeError::TrailingBytes));
    }

    #[test]
    fn prefix_decode_ignores_padding() {
        let mut buf = Value::str("payload").encode();
        let want = buf.len();
        buf.extend_from_slice(&[0xAA; 100]);
        let (value, used) = decode_prefix(&buf).unwrap();
        assert_eq!(value, Value::str("payload"));
        assert_eq!(used, want);
    }

    #[test]
    fn rejects_deep_nesting() {
        let mut buf = Vec::new();
        for _ in 0..64 {
            buf.push(b'l');
        }
        assert_eq!(decode(&buf), Err(DecodeError::TooDeep));
    }

    #[test]
    fn nested_structures_roundtrip() {
        let v = DictBuilder::new()
            .insert(
                "a",
                Value::List(vec![
                    DictBuilder::new().insert_int("p", 443).build(),
                    DictBuilder::new().insert_int("p", 80).build(),
                ]),
            )
            .insert_bytes("k", &[1u8; 32])
            .build();
        assert_eq!(decode(&v.encode()).unwrap(), v);
    }
}
