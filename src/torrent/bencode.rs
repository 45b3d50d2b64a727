//! Bencode codec
//!
//! A small bencode decoder that keeps track of where every value starts and
//! ends in the source buffer. The info-hash must be computed over the exact
//! bytes of the `info` dictionary, so re-encoding a decoded value is not good
//! enough for metainfo files produced by sloppy encoders.

use std::collections::BTreeMap;
use std::ops::Range;

use anyhow::Result;

use crate::error::TorrentError;

/// Nesting limit for lists and dictionaries
const MAX_DEPTH: usize = 64;

/// A decoded bencode value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    /// Build a dictionary from `(key, value)` pairs
    pub fn dict<'a>(entries: impl IntoIterator<Item = (&'a [u8], Value)>) -> Self {
        Value::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_vec(), v))
                .collect(),
        )
    }

    pub fn bytes(data: impl AsRef<[u8]>) -> Self {
        Value::Bytes(data.as_ref().to_vec())
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

    /// Byte string interpreted as UTF-8, lossily
    pub fn as_str(&self) -> Option<String> {
        self.as_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
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

    /// Look up a key when this value is a dictionary
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }

    /// Encode into canonical bencode (dictionary keys sorted)
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
            Value::Dict(entries) => {
                out.push(b'd');
                for (key, value) in entries {
                    out.extend_from_slice(key.len().to_string().as_bytes());
                    out.push(b':');
                    out.extend_from_slice(key);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }
}

/// Decode a complete buffer. Trailing bytes are an error.
pub fn decode(data: &[u8]) -> Result<Value> {
    let (value, consumed) = decode_prefix(data)?;
    if consumed != data.len() {
        return Err(TorrentError::malformed_with_detail(
            "Trailing data after bencode value",
            format!("{} of {} bytes consumed", consumed, data.len()),
        )
        .into());
    }
    Ok(value)
}

/// Decode the first value of a buffer, returning it with the number of bytes
/// it occupied. Used for `ut_metadata` data messages, where raw piece bytes
/// follow the dictionary.
pub fn decode_prefix(data: &[u8]) -> Result<(Value, usize)> {
    let mut decoder = Decoder { data, pos: 0 };
    let value = decoder.value(0)?;
    Ok((value, decoder.pos))
}

/// Decode a top-level dictionary and report the source span of each value.
///
/// Returns the entries in file order alongside the decoded root.
pub fn decode_dict_spans(data: &[u8]) -> Result<(Value, Vec<(Vec<u8>, Range<usize>)>)> {
    let mut decoder = Decoder { data, pos: 0 };
    if decoder.peek()? != b'd' {
        return Err(TorrentError::malformed("Root value must be a dictionary").into());
    }
    decoder.pos += 1;

    let mut spans = Vec::new();
    let mut dict = BTreeMap::new();
    while decoder.peek()? != b'e' {
        let key = decoder.byte_string()?;
        let start = decoder.pos;
        let value = decoder.value(1)?;
        spans.push((key.clone(), start..decoder.pos));
        dict.insert(key, value);
    }
    decoder.pos += 1;

    if decoder.pos != data.len() {
        return Err(TorrentError::malformed_with_detail(
            "Trailing data after root dictionary",
            format!("{} of {} bytes consumed", decoder.pos, data.len()),
        )
        .into());
    }

    Ok((Value::Dict(dict), spans))
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| TorrentError::malformed("Unexpected end of bencode data").into())
    }

    fn value(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(TorrentError::malformed("Bencode nesting too deep").into());
        }

        match self.peek()? {
            b'i' => {
                self.pos += 1;
                let end = self.find(b'e')?;
                let text = std::str::from_utf8(&self.data[self.pos..end])
                    .map_err(|_| TorrentError::malformed("Integer is not ASCII"))?;
                let value: i64 = text.parse().map_err(|_| {
                    TorrentError::malformed_with_detail("Invalid integer", text.to_string())
                })?;
                self.pos = end + 1;
                Ok(Value::Int(value))
            }
            b'l' => {
                self.pos += 1;
                let mut list = Vec::new();
                while self.peek()? != b'e' {
                    list.push(self.value(depth + 1)?);
                }
                self.pos += 1;
                Ok(Value::List(list))
            }
            b'd' => {
                self.pos += 1;
                let mut dict = BTreeMap::new();
                while self.peek()? != b'e' {
                    let key = self.byte_string()?;
                    let value = self.value(depth + 1)?;
                    dict.insert(key, value);
                }
                self.pos += 1;
                Ok(Value::Dict(dict))
            }
            b'0'..=b'9' => Ok(Value::Bytes(self.byte_string()?)),
            other => Err(TorrentError::malformed_with_detail(
                "Unknown bencode type",
                format!("byte 0x{:02x} at offset {}", other, self.pos),
            )
            .into()),
        }
    }

    fn byte_string(&mut self) -> Result<Vec<u8>> {
        if !self.peek()?.is_ascii_digit() {
            return Err(TorrentError::malformed("Dictionary key must be a byte string").into());
        }
        let colon = self.find(b':')?;
        let length: usize = std::str::from_utf8(&self.data[self.pos..colon])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| TorrentError::malformed("Invalid byte string length"))?;
        let start = colon + 1;
        let end = start
            .checked_add(length)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                TorrentError::malformed_with_detail(
                    "Byte string exceeds buffer",
                    format!("length {} at offset {}", length, self.pos),
                )
            })?;
        self.pos = end;
        Ok(self.data[start..end].to_vec())
    }

    fn find(&self, needle: u8) -> Result<usize> {
        self.data[self.pos..]
            .iter()
            .position(|&b| b == needle)
            .map(|p| p + self.pos)
            .ok_or_else(|| TorrentError::malformed("Unterminated bencode value").into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_int() {
        assert_eq!(decode(b"i42e").unwrap(), Value::Int(42));
        assert_eq!(decode(b"i-7e").unwrap(), Value::Int(-7));
    }

    #[test]
    fn test_decode_string() {
        assert_eq!(decode(b"4:test").unwrap().as_bytes(), Some(b"test".as_ref()));
        assert_eq!(decode(b"0:").unwrap(), Value::Bytes(Vec::new()));
    }

    #[test]
    fn test_decode_nested() {
        let value = decode(b"d4:listl1:ai1ee3:numi3ee").unwrap();
        assert_eq!(value.get(b"num").and_then(Value::as_int), Some(3));
        assert_eq!(value.get(b"list").and_then(Value::as_list).map(|l| l.len()), Some(2));
    }

    #[test]
    fn test_decode_rejects_truncated() {
        assert!(decode(b"5:abc").is_err());
        assert!(decode(b"i42").is_err());
        assert!(decode(b"l1:a").is_err());
        assert!(decode(b"").is_err());
    }

    #[test]
    fn test_decode_rejects_trailing_data() {
        assert!(decode(b"i1ei2e").is_err());
    }

    #[test]
    fn test_decode_rejects_non_string_key() {
        assert!(decode(b"di1ei2ee").is_err());
    }

    #[test]
    fn test_decode_prefix_reports_consumed() {
        let (value, used) = decode_prefix(b"d1:ai1eeRAWBYTES").unwrap();
        assert_eq!(value.get(b"a").and_then(Value::as_int), Some(1));
        assert_eq!(used, 8);
    }

    #[test]
    fn test_dict_spans_preserve_source_bytes() {
        // keys deliberately unsorted so re-encoding would differ
        let data = b"d4:infod1:zi1e1:ai2ee8:announce3:urle";
        let (_, spans) = decode_dict_spans(data).unwrap();
        let (_, range) = spans.iter().find(|(k, _)| k == b"info").unwrap();
        assert_eq!(&data[range.clone()], b"d1:zi1e1:ai2ee");
    }

    #[test]
    fn test_encode_sorts_keys() {
        let value = Value::dict([
            (b"b".as_ref(), Value::Int(1)),
            (b"a".as_ref(), Value::bytes("x")),
        ]);
        assert_eq!(value.encode(), b"d1:a1:x1:bi1ee".to_vec());
    }

    #[test]
    fn test_depth_limit() {
        let mut data = vec![b'l'; MAX_DEPTH + 2];
        data.extend(vec![b'e'; MAX_DEPTH + 2]);
        assert!(decode(&data).is_err());
    }
}
