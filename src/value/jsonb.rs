//! JSON binary document decoding.
//!
//! JSON columns arrive as a typed node stream: a type byte followed by a
//! payload whose layout depends on the type. Containers store their
//! children behind per-entry offsets (2 bytes for "small" containers,
//! 4 for "large"); sufficiently small scalars are inlined into the entry
//! itself. The output is a [`serde_json::Value`] tree.

use serde_json::{json, Map};

use crate::error::{Error, Result};
use crate::value::decimal::decode_decimal;
use crate::{codec, ColumnType};

const TYPE_SMALL_OBJECT: u8 = 0x00;
const TYPE_LARGE_OBJECT: u8 = 0x01;
const TYPE_SMALL_ARRAY: u8 = 0x02;
const TYPE_LARGE_ARRAY: u8 = 0x03;
const TYPE_LITERAL: u8 = 0x04;
const TYPE_INT16: u8 = 0x05;
const TYPE_UINT16: u8 = 0x06;
const TYPE_INT32: u8 = 0x07;
const TYPE_UINT32: u8 = 0x08;
const TYPE_INT64: u8 = 0x09;
const TYPE_UINT64: u8 = 0x0A;
const TYPE_DOUBLE: u8 = 0x0B;
const TYPE_STRING: u8 = 0x0C;
const TYPE_OPAQUE: u8 = 0x0F;

const LITERAL_NULL: u8 = 0x00;
const LITERAL_TRUE: u8 = 0x01;
const LITERAL_FALSE: u8 = 0x02;

/// Decode a complete JSON binary document.
pub fn decode_json(data: &[u8]) -> Result<serde_json::Value> {
    let (&node_type, rest) = data
        .split_first()
        .ok_or_else(|| Error::decode("empty json document"))?;
    decode_node(node_type, rest)
}

fn need(data: &[u8], expected: usize) -> Result<()> {
    if data.len() < expected {
        return Err(Error::decode(format!(
            "json document truncated: need {expected} bytes, have {}",
            data.len()
        )));
    }
    Ok(())
}

fn decode_node(node_type: u8, data: &[u8]) -> Result<serde_json::Value> {
    match node_type {
        TYPE_SMALL_OBJECT => decode_container(data, true, true),
        TYPE_LARGE_OBJECT => decode_container(data, false, true),
        TYPE_SMALL_ARRAY => decode_container(data, true, false),
        TYPE_LARGE_ARRAY => decode_container(data, false, false),
        TYPE_LITERAL => decode_literal(data),
        TYPE_INT16 => {
            need(data, 2)?;
            Ok(json!(codec::decode_u16(data) as i16))
        }
        TYPE_UINT16 => {
            need(data, 2)?;
            Ok(json!(codec::decode_u16(data)))
        }
        TYPE_INT32 => {
            need(data, 4)?;
            Ok(json!(codec::decode_u32(data) as i32))
        }
        TYPE_UINT32 => {
            need(data, 4)?;
            Ok(json!(codec::decode_u32(data)))
        }
        TYPE_INT64 => {
            need(data, 8)?;
            Ok(json!(codec::decode_u64(data) as i64))
        }
        TYPE_UINT64 => {
            need(data, 8)?;
            Ok(json!(codec::decode_u64(data)))
        }
        TYPE_DOUBLE => {
            need(data, 8)?;
            let v = codec::decode_f64(data);
            serde_json::Number::from_f64(v)
                .map(serde_json::Value::Number)
                .ok_or_else(|| Error::decode(format!("non-finite json double {v}")))
        }
        TYPE_STRING => {
            let (len, consumed) = decode_variable_length(data)?;
            need(data, consumed + len)?;
            Ok(json!(String::from_utf8_lossy(
                &data[consumed..consumed + len]
            )))
        }
        TYPE_OPAQUE => decode_opaque(data),
        other => Err(Error::decode(format!("invalid json node type {other:#04x}"))),
    }
}

fn offset_size(small: bool) -> usize {
    if small {
        2
    } else {
        4
    }
}

fn read_offset(data: &[u8], small: bool) -> Result<usize> {
    need(data, offset_size(small))?;
    Ok(if small {
        codec::decode_u16(data) as usize
    } else {
        codec::decode_u32(data) as usize
    })
}

fn decode_container(data: &[u8], small: bool, object: bool) -> Result<serde_json::Value> {
    let off = offset_size(small);
    let key_entry_size = 2 + off;
    let value_entry_size = 1 + off;

    need(data, 2 * off)?;
    let count = read_offset(data, small)?;
    let size = read_offset(&data[off..], small)?;
    need(data, size)?;

    let mut header_size = 2 * off + count * value_entry_size;
    if object {
        header_size += count * key_entry_size;
    }
    if header_size > size {
        return Err(Error::decode(format!(
            "json container header {header_size} exceeds size {size}"
        )));
    }

    let mut keys = Vec::with_capacity(if object { count } else { 0 });
    if object {
        for i in 0..count {
            let entry = 2 * off + key_entry_size * i;
            let key_offset = read_offset(&data[entry..], small)?;
            need(data, entry + off + 2)?;
            let key_len = codec::decode_u16(&data[entry + off..]) as usize;
            // Keys live after the last value entry.
            if key_offset < header_size {
                return Err(Error::decode(format!(
                    "json key offset {key_offset} inside header of {header_size} bytes"
                )));
            }
            need(data, key_offset + key_len)?;
            keys.push(String::from_utf8_lossy(&data[key_offset..key_offset + key_len]).into_owned());
        }
    }

    let mut values = Vec::with_capacity(count);
    for i in 0..count {
        let mut entry = 2 * off + value_entry_size * i;
        if object {
            entry += key_entry_size * count;
        }
        need(data, entry + value_entry_size)?;
        let node_type = data[entry];

        if is_inline(node_type, small) {
            values.push(decode_node(node_type, &data[entry + 1..entry + value_entry_size])?);
            continue;
        }

        let value_offset = read_offset(&data[entry + 1..], small)?;
        need(data, value_offset)?;
        values.push(decode_node(node_type, &data[value_offset..])?);
    }

    if object {
        let mut map = Map::with_capacity(count);
        for (key, value) in keys.into_iter().zip(values) {
            map.insert(key, value);
        }
        Ok(serde_json::Value::Object(map))
    } else {
        Ok(serde_json::Value::Array(values))
    }
}

/// Inline values are stored directly in the entry instead of behind an
/// offset: literals and 16-bit ints always, 32-bit ints only when the
/// entry is wide enough (large containers).
fn is_inline(node_type: u8, small: bool) -> bool {
    match node_type {
        TYPE_LITERAL | TYPE_INT16 | TYPE_UINT16 => true,
        TYPE_INT32 | TYPE_UINT32 => !small,
        _ => false,
    }
}

fn decode_literal(data: &[u8]) -> Result<serde_json::Value> {
    need(data, 1)?;
    match data[0] {
        LITERAL_NULL => Ok(serde_json::Value::Null),
        LITERAL_TRUE => Ok(json!(true)),
        LITERAL_FALSE => Ok(json!(false)),
        other => Err(Error::decode(format!("invalid json literal {other:#04x}"))),
    }
}

/// Opaque nodes carry a column type byte and a length-prefixed payload
/// re-encoded with the binlog column layouts.
fn decode_opaque(data: &[u8]) -> Result<serde_json::Value> {
    need(data, 1)?;
    let column_type = data[0];
    let data = &data[1..];
    let (len, consumed) = decode_variable_length(data)?;
    need(data, consumed + len)?;
    let payload = &data[consumed..consumed + len];

    match ColumnType::from(column_type) {
        ColumnType::NewDecimal => {
            need(payload, 2)?;
            let precision = payload[0] as usize;
            let scale = payload[1] as usize;
            let (text, _) = decode_decimal(&payload[2..], precision, scale)?;
            Ok(json!(text))
        }
        ColumnType::Time => {
            need(payload, 8)?;
            Ok(json!(format_opaque_time(codec::decode_u64(payload) as i64)))
        }
        ColumnType::Date
        | ColumnType::Datetime
        | ColumnType::Datetime2
        | ColumnType::Timestamp
        | ColumnType::Timestamp2 => {
            need(payload, 8)?;
            Ok(json!(format_opaque_datetime(
                codec::decode_u64(payload) as i64
            )))
        }
        _ => Ok(json!(String::from_utf8_lossy(payload))),
    }
}

fn format_opaque_time(v: i64) -> String {
    if v == 0 {
        return "00:00:00".to_string();
    }
    let (sign, v) = if v < 0 { ("-", -v) } else { ("", v) };
    let int_part = v >> 24;
    let hour = (int_part >> 12) & 0x3FF;
    let minute = (int_part >> 6) & 0x3F;
    let second = int_part & 0x3F;
    let micros = v & 0xFF_FFFF;
    format!("{sign}{hour:02}:{minute:02}:{second:02}.{micros:06}")
}

fn format_opaque_datetime(v: i64) -> String {
    if v == 0 {
        return "0000-00-00 00:00:00".to_string();
    }
    let v = v.unsigned_abs() as i64;
    let int_part = v >> 24;
    let ymd = int_part >> 17;
    let ym = ymd >> 5;
    let hms = int_part & 0x1FFFF;
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
        ym / 13,
        ym % 13,
        ymd & 0x1F,
        hms >> 12,
        (hms >> 6) & 0x3F,
        hms & 0x3F,
        v & 0xFF_FFFF
    )
}

/// String and opaque lengths use 7-bit groups with a continuation bit,
/// at most five bytes, capped at u32::MAX.
fn decode_variable_length(data: &[u8]) -> Result<(usize, usize)> {
    let mut length = 0u64;
    for (i, &b) in data.iter().take(5).enumerate() {
        length |= ((b & 0x7F) as u64) << (7 * i);
        if b & 0x80 == 0 {
            if length > u32::MAX as u64 {
                return Err(Error::decode(format!(
                    "json variable length {length} exceeds u32 range"
                )));
            }
            return Ok((length as usize, i + 1));
        }
    }
    Err(Error::decode("json variable length unterminated"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalars() {
        assert_eq!(decode_json(&[TYPE_LITERAL, LITERAL_NULL]).unwrap(), json!(null));
        assert_eq!(decode_json(&[TYPE_LITERAL, LITERAL_TRUE]).unwrap(), json!(true));
        assert_eq!(decode_json(&[TYPE_LITERAL, LITERAL_FALSE]).unwrap(), json!(false));
        assert_eq!(decode_json(&[TYPE_INT16, 0xFF, 0xFF]).unwrap(), json!(-1));
        assert_eq!(decode_json(&[TYPE_UINT16, 0xFF, 0xFF]).unwrap(), json!(65535));
        assert_eq!(
            decode_json(&[TYPE_INT32, 0x00, 0x00, 0x00, 0x80]).unwrap(),
            json!(i32::MIN)
        );
        let mut doc = vec![TYPE_INT64];
        doc.extend_from_slice(&(-42i64).to_le_bytes());
        assert_eq!(decode_json(&doc).unwrap(), json!(-42));
        let mut doc = vec![TYPE_DOUBLE];
        doc.extend_from_slice(&3.75f64.to_le_bytes());
        assert_eq!(decode_json(&doc).unwrap(), json!(3.75));
    }

    #[test]
    fn test_string_node() {
        let mut doc = vec![TYPE_STRING, 5];
        doc.extend_from_slice(b"world");
        assert_eq!(decode_json(&doc).unwrap(), json!("world"));
    }

    #[test]
    fn test_long_string_length_encoding() {
        // 200 bytes: length 200 = 0xC8 needs two 7-bit groups.
        let mut doc = vec![TYPE_STRING, 0xC8, 0x01];
        doc.extend_from_slice(&vec![b'a'; 200]);
        assert_eq!(decode_json(&doc).unwrap(), json!("a".repeat(200)));
    }

    #[test]
    fn test_small_object_with_nested_array() {
        // {"hello":"world","foo":[1,2,3.75]}; keys sorted by length then
        // bytes, as the server lays them out.
        let mut doc = vec![
            TYPE_SMALL_OBJECT,
            0x02, 0x00, // count
            0x35, 0x00, // size = 53
            // key entries: offset, length
            0x12, 0x00, 0x03, 0x00, // "foo" at 18
            0x15, 0x00, 0x05, 0x00, // "hello" at 21
            // value entries: type, offset-or-inline
            TYPE_SMALL_ARRAY, 0x1A, 0x00, // array at 26
            TYPE_STRING, 0x2F, 0x00, // string at 47
        ];
        doc.extend_from_slice(b"foohello");
        // array [1, 2, 3.75]: header 13 bytes + one double
        doc.extend_from_slice(&[
            0x03, 0x00, // count
            0x15, 0x00, // size = 21
            TYPE_INT16, 0x01, 0x00,
            TYPE_INT16, 0x02, 0x00,
            TYPE_DOUBLE, 0x0D, 0x00, // double at 13 within the array
        ]);
        doc.extend_from_slice(&3.75f64.to_le_bytes());
        // "world" string node
        doc.push(5);
        doc.extend_from_slice(b"world");

        assert_eq!(
            decode_json(&doc).unwrap(),
            json!({"hello": "world", "foo": [1, 2, 3.75]})
        );
    }

    #[test]
    fn test_empty_array() {
        let doc = [TYPE_SMALL_ARRAY, 0x00, 0x00, 0x04, 0x00];
        assert_eq!(decode_json(&doc).unwrap(), json!([]));
    }

    #[test]
    fn test_opaque_decimal() {
        // DECIMAL(14,4) 1234567890.1234 wrapped in an opaque node.
        let mut doc = vec![TYPE_OPAQUE, 0xF6, 9, 14, 4];
        doc.extend_from_slice(&[0x81, 0x0D, 0xFB, 0x38, 0xD2, 0x04, 0xD2]);
        assert_eq!(decode_json(&doc).unwrap(), json!("1234567890.1234"));
    }

    #[test]
    fn test_opaque_time() {
        let hms = (13i64 << 12) | (42 << 6) | 59;
        let packed = (hms << 24) | 250_000;
        let mut doc = vec![TYPE_OPAQUE, 11, 8];
        doc.extend_from_slice(&packed.to_le_bytes());
        assert_eq!(decode_json(&doc).unwrap(), json!("13:42:59.250000"));
    }

    #[test]
    fn test_malformed_documents() {
        assert!(decode_json(&[]).is_err());
        assert!(decode_json(&[TYPE_LITERAL]).is_err());
        assert!(decode_json(&[TYPE_LITERAL, 0x09]).is_err());
        assert!(decode_json(&[TYPE_INT32, 0x01]).is_err());
        assert!(decode_json(&[0x42, 0x00]).is_err());
        // Container whose declared size exceeds the data.
        assert!(decode_json(&[TYPE_SMALL_ARRAY, 0x01, 0x00, 0x40, 0x00]).is_err());
        // Unterminated variable length.
        assert!(decode_json(&[TYPE_STRING, 0x80, 0x80, 0x80, 0x80, 0x80]).is_err());
    }
}
