//! Decoded column values and the per-type dispatch.
//!
//! Row images arrive as a concatenation of column payloads whose layout is
//! determined by the column type byte and its TableMap meta. [`decode_value`]
//! consumes exactly one column from the cursor and returns a [`Value`].
//!
//! Integer columns always decode unsigned; the binary log does not carry
//! signedness. The schema enrichment layer re-signs them when the DDL says
//! so (see [`crate::schema`]).

pub mod decimal;
pub mod jsonb;
pub mod temporal;

use std::fmt;

use serde::Serialize;

use crate::buffer::Buffer;
use crate::error::{Error, Result};

/// Column type byte as it appears in TableMap events.
///
/// The values are those of the wire protocol; the gap between `Time2` and
/// `Json` is unassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0,
    Tiny = 1,
    Short = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    Null = 6,
    Timestamp = 7,
    Longlong = 8,
    Int24 = 9,
    Date = 10,
    Time = 11,
    Datetime = 12,
    Year = 13,
    NewDate = 14,
    Varchar = 15,
    Bit = 16,
    Timestamp2 = 17,
    Datetime2 = 18,
    Time2 = 19,
    Json = 245,
    NewDecimal = 246,
    Enum = 247,
    Set = 248,
    TinyBlob = 249,
    MediumBlob = 250,
    LongBlob = 251,
    Blob = 252,
    VarString = 253,
    String = 254,
    Geometry = 255,
    Unknown = 20,
}

impl From<u8> for ColumnType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Decimal,
            1 => Self::Tiny,
            2 => Self::Short,
            3 => Self::Long,
            4 => Self::Float,
            5 => Self::Double,
            6 => Self::Null,
            7 => Self::Timestamp,
            8 => Self::Longlong,
            9 => Self::Int24,
            10 => Self::Date,
            11 => Self::Time,
            12 => Self::Datetime,
            13 => Self::Year,
            14 => Self::NewDate,
            15 => Self::Varchar,
            16 => Self::Bit,
            17 => Self::Timestamp2,
            18 => Self::Datetime2,
            19 => Self::Time2,
            245 => Self::Json,
            246 => Self::NewDecimal,
            247 => Self::Enum,
            248 => Self::Set,
            249 => Self::TinyBlob,
            250 => Self::MediumBlob,
            251 => Self::LongBlob,
            252 => Self::Blob,
            253 => Self::VarString,
            254 => Self::String,
            255 => Self::Geometry,
            _ => Self::Unknown,
        }
    }
}

/// A single decoded column value.
///
/// Integer variants are width-tagged so the schema layer can re-sign them
/// without guessing, and so matches over unsupported shapes fail to
/// compile instead of falling through.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Value {
    Null,
    UInt8(u8),
    UInt16(u16),
    UInt24(u32),
    UInt32(u32),
    UInt64(u64),
    Int8(i8),
    Int16(i16),
    Int24(i32),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    /// Textual, precision-preserving decimal.
    Decimal(String),
    Date {
        year: u16,
        month: u8,
        day: u8,
    },
    Time {
        negative: bool,
        hours: u16,
        minutes: u8,
        seconds: u8,
        micros: u32,
    },
    DateTime {
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
        micros: u32,
    },
    Timestamp {
        seconds: u32,
        micros: u32,
    },
    Year(u16),
    Text(String),
    Bytes(Vec<u8>),
    Bit(u64),
    /// Enum ordinal.
    Enum(u64),
    /// Set membership bitmask.
    Set(u64),
    Json(serde_json::Value),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::UInt8(v) => write!(f, "{v}"),
            Value::UInt16(v) => write!(f, "{v}"),
            Value::UInt24(v) | Value::UInt32(v) => write!(f, "{v}"),
            Value::UInt64(v) => write!(f, "{v}"),
            Value::Int8(v) => write!(f, "{v}"),
            Value::Int16(v) => write!(f, "{v}"),
            Value::Int24(v) | Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Decimal(v) => f.write_str(v),
            Value::Date { year, month, day } => {
                write!(f, "{year:04}-{month:02}-{day:02}")
            }
            Value::Time {
                negative,
                hours,
                minutes,
                seconds,
                micros,
            } => {
                if *negative {
                    f.write_str("-")?;
                }
                write!(f, "{hours:02}:{minutes:02}:{seconds:02}")?;
                if *micros != 0 {
                    write!(f, ".{micros:06}")?;
                }
                Ok(())
            }
            Value::DateTime {
                year,
                month,
                day,
                hour,
                minute,
                second,
                micros,
            } => {
                write!(
                    f,
                    "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}"
                )?;
                if *micros != 0 {
                    write!(f, ".{micros:06}")?;
                }
                Ok(())
            }
            Value::Timestamp { seconds, micros } => {
                write!(f, "{seconds}")?;
                if *micros != 0 {
                    write!(f, ".{micros:06}")?;
                }
                Ok(())
            }
            Value::Year(v) => write!(f, "{v:04}"),
            Value::Text(v) => f.write_str(v),
            Value::Bytes(v) => write!(f, "{}", String::from_utf8_lossy(v)),
            Value::Bit(v) | Value::Enum(v) | Value::Set(v) => write!(f, "{v}"),
            Value::Json(v) => write!(f, "{v}"),
        }
    }
}

/// Sign-extend a 24-bit unsigned value.
pub fn sign_u24(v: u32) -> i32 {
    if v & 0x0080_0000 != 0 {
        (v | 0xFF00_0000) as i32
    } else {
        v as i32
    }
}

impl Value {
    /// Reinterpret an unsigned integer as signed at its stored width. The
    /// column type disambiguates the two `u32`-backed widths. Non-integer
    /// values pass through unchanged.
    pub fn into_signed(self, column_type: ColumnType) -> Value {
        match self {
            Value::UInt8(v) => Value::Int8(v as i8),
            Value::UInt16(v) => Value::Int16(v as i16),
            Value::UInt24(v) => Value::Int24(sign_u24(v)),
            Value::UInt32(v) => {
                if column_type == ColumnType::Int24 {
                    Value::Int24(sign_u24(v))
                } else {
                    Value::Int32(v as i32)
                }
            }
            Value::UInt64(v) => Value::Int64(v as i64),
            other => other,
        }
    }

    /// True for the NULL placeholder.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// STRING columns overload their meta word: wide metas smuggle the real
/// type (ENUM/SET stored as CHAR) in the high byte and split the declared
/// length across both bytes.
fn unpack_string_meta(meta: u16) -> (ColumnType, usize) {
    if meta > 0xFF {
        let type_byte = (meta >> 8) as u8;
        let len_byte = meta & 0xFF;
        if type_byte & 0x30 != 0x30 {
            let length = len_byte | (((type_byte as u16 & 0x30) ^ 0x30) << 4);
            (ColumnType::from(type_byte | 0x30), length as usize)
        } else {
            (ColumnType::from(type_byte), len_byte as usize)
        }
    } else {
        (ColumnType::String, meta as usize)
    }
}

/// Decode one column value, advancing the cursor past exactly the bytes
/// the column occupies.
pub fn decode_value(buf: &mut Buffer<'_>, column_type: u8, meta: u16) -> Result<Value> {
    let mut ct = ColumnType::from(column_type);
    let mut char_length = meta as usize;
    if ct == ColumnType::String {
        (ct, char_length) = unpack_string_meta(meta);
    }

    match ct {
        ColumnType::Null => Ok(Value::Null),

        ColumnType::Tiny => Ok(Value::UInt8(buf.read_u8()?)),
        ColumnType::Short => Ok(Value::UInt16(buf.read_u16()?)),
        ColumnType::Int24 => Ok(Value::UInt24(buf.read_u24()?)),
        ColumnType::Long => Ok(Value::UInt32(buf.read_u32()?)),
        ColumnType::Longlong => Ok(Value::UInt64(buf.read_u64()?)),

        ColumnType::Float => Ok(Value::Float(buf.read_f32()?)),
        ColumnType::Double => Ok(Value::Double(buf.read_f64()?)),

        ColumnType::NewDecimal => {
            let precision = (meta >> 8) as usize;
            let scale = (meta & 0xFF) as usize;
            let (text, consumed) = decimal::decode_decimal(buf.cur(), precision, scale)?;
            buf.skip(consumed)?;
            Ok(Value::Decimal(text))
        }

        ColumnType::Year => Ok(Value::Year(temporal::decode_year(buf.read_u8()?))),
        ColumnType::Date => Ok(temporal::decode_date(buf.read_u24()?)),
        ColumnType::Time => Ok(temporal::decode_time(buf.read_u24()?)),
        ColumnType::Time2 => temporal::decode_time2(buf, meta),
        ColumnType::Timestamp => Ok(temporal::decode_timestamp(buf.read_u32()?)),
        ColumnType::Timestamp2 => temporal::decode_timestamp2(buf, meta),
        ColumnType::Datetime => Ok(temporal::decode_datetime(buf.read_u64()?)),
        ColumnType::Datetime2 => temporal::decode_datetime2(buf, meta),

        ColumnType::String => {
            let width = if char_length < 256 { 1 } else { 2 };
            let bytes = buf.read_var_bytes(width)?;
            Ok(Value::Text(String::from_utf8_lossy(bytes).into_owned()))
        }
        ColumnType::Varchar | ColumnType::VarString => {
            let width = if meta < 256 { 1 } else { 2 };
            let bytes = buf.read_var_bytes(width)?;
            Ok(Value::Text(String::from_utf8_lossy(bytes).into_owned()))
        }

        ColumnType::Blob | ColumnType::Geometry => {
            Ok(Value::Bytes(buf.read_var_bytes(meta as usize)?.to_vec()))
        }
        ColumnType::TinyBlob => Ok(Value::Bytes(buf.read_var_bytes(1)?.to_vec())),
        ColumnType::MediumBlob => Ok(Value::Bytes(buf.read_var_bytes(3)?.to_vec())),
        ColumnType::LongBlob => Ok(Value::Bytes(buf.read_var_bytes(4)?.to_vec())),

        ColumnType::Json => {
            let doc = buf.read_var_bytes(meta as usize)?;
            Ok(Value::Json(jsonb::decode_json(doc)?))
        }

        ColumnType::Bit => {
            let nbits = ((meta >> 8) * 8 + (meta & 0xFF)) as usize;
            let len = (nbits + 7) / 8;
            let data = buf.read(len)?;
            Ok(Value::Bit(crate::codec::decode_bit(data, nbits, len)))
        }
        ColumnType::Enum => Ok(Value::Enum(buf.read_var_u64((meta & 0xFF) as usize)?)),
        ColumnType::Set => Ok(Value::Set(buf.read_var_u64((meta & 0xFF) as usize)?)),

        ColumnType::Decimal | ColumnType::NewDate | ColumnType::Unknown => Err(Error::decode(
            format!("unsupported column type {column_type} ({ct:?})"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(data: &[u8], column_type: u8, meta: u16) -> Value {
        let mut buf = Buffer::new(data);
        let v = decode_value(&mut buf, column_type, meta).unwrap();
        assert!(!buf.more(), "decoder left {} bytes", buf.remaining());
        v
    }

    #[test]
    fn test_integers_decode_unsigned() {
        assert_eq!(decode(&[200], 1, 0), Value::UInt8(200));
        assert_eq!(decode(&[0xFF, 0xFF], 2, 0), Value::UInt16(65535));
        assert_eq!(decode(&[0xFF, 0xFF, 0xFF], 9, 0), Value::UInt24(0xFF_FFFF));
        assert_eq!(
            decode(&[0xFF, 0xFF, 0xFF, 0xFF], 3, 0),
            Value::UInt32(u32::MAX)
        );
        assert_eq!(decode(&[0xFF; 8], 8, 0), Value::UInt64(u64::MAX));
    }

    #[test]
    fn test_signed_reconstruction() {
        for v in [-32768i16, -1, 0, 1, 32767] {
            let decoded = decode(&(v as u16).to_le_bytes(), 2, 0);
            assert_eq!(
                decoded.into_signed(ColumnType::Short),
                Value::Int16(v),
                "short {v}"
            );
        }
        assert_eq!(
            decode(&[0xFF], 1, 0).into_signed(ColumnType::Tiny),
            Value::Int8(-1)
        );
        assert_eq!(
            decode(&[0xFF, 0xFF, 0xFF], 9, 0).into_signed(ColumnType::Int24),
            Value::Int24(-1)
        );
        assert_eq!(
            decode(&[0x00, 0x00, 0x80], 9, 0).into_signed(ColumnType::Int24),
            Value::Int24(-8388608)
        );
        assert_eq!(
            decode(&[0xFF, 0xFF, 0xFF, 0xFF], 3, 0).into_signed(ColumnType::Long),
            Value::Int32(-1)
        );
        assert_eq!(
            decode(&[0xFF; 8], 8, 0).into_signed(ColumnType::Longlong),
            Value::Int64(-1)
        );
    }

    #[test]
    fn test_floats() {
        assert_eq!(decode(&1.5f32.to_le_bytes(), 4, 0), Value::Float(1.5));
        assert_eq!(decode(&(-2.25f64).to_le_bytes(), 5, 0), Value::Double(-2.25));
    }

    #[test]
    fn test_decimal_dispatch() {
        // DECIMAL(14,4) fixture from the decimal module.
        let data = [0x81, 0x0D, 0xFB, 0x38, 0xD2, 0x04, 0xD2];
        let meta = (14u16 << 8) | 4;
        assert_eq!(
            decode(&data, 246, meta),
            Value::Decimal("1234567890.1234".into())
        );
    }

    #[test]
    fn test_varchar_prefix_width_follows_meta() {
        let mut short = vec![5u8];
        short.extend_from_slice(b"hello");
        assert_eq!(decode(&short, 15, 100), Value::Text("hello".into()));

        let mut long = vec![5u8, 0u8];
        long.extend_from_slice(b"hello");
        assert_eq!(decode(&long, 15, 300), Value::Text("hello".into()));
    }

    #[test]
    fn test_string_meta_unpacking_enum() {
        // ENUM with 2 distinct values stored as STRING: high byte carries
        // the real type, low byte the packed width.
        let meta = ((ColumnType::Enum as u16) << 8) | 1;
        assert_eq!(decode(&[0x02], 254, meta), Value::Enum(2));
    }

    #[test]
    fn test_string_meta_unpacking_wide_char() {
        // CHAR(255) in a multibyte charset: declared byte length 765
        // splits across the meta bytes (0x30 ^ 0x20 = 0x10 high nibble).
        let type_byte = 0xFEu16 & !0x20; // 0xDE: real type 0xFE, length bits 0x20
        let meta = (type_byte << 8) | 0xFD; // length 0x2FD = 765
        let mut data = vec![0x05, 0x00];
        data.extend_from_slice(b"abcde");
        assert_eq!(decode(&data, 254, meta), Value::Text("abcde".into()));
    }

    #[test]
    fn test_blob_prefix_widths() {
        let mut tiny = vec![3u8];
        tiny.extend_from_slice(b"abc");
        assert_eq!(decode(&tiny, 249, 0), Value::Bytes(b"abc".to_vec()));

        let mut blob = vec![3u8, 0, 0];
        blob.extend_from_slice(b"abc");
        assert_eq!(decode(&blob, 250, 0), Value::Bytes(b"abc".to_vec()));
        assert_eq!(decode(&blob, 252, 3), Value::Bytes(b"abc".to_vec()));

        let mut long = vec![3u8, 0, 0, 0];
        long.extend_from_slice(b"abc");
        assert_eq!(decode(&long, 251, 0), Value::Bytes(b"abc".to_vec()));
    }

    #[test]
    fn test_set_is_byte_width_mask() {
        // SET('a','b','c') with 'a,c' selected: mask 0b101 in one byte.
        assert_eq!(decode(&[0b101], 248, 1), Value::Set(5));
        // Two-byte set.
        assert_eq!(decode(&[0x01, 0x02], 248, 2), Value::Set(0x0201));
    }

    #[test]
    fn test_bit_width_from_both_meta_bytes() {
        // BIT(12): meta high byte 1 (8 bits), low byte 4.
        let meta = (1u16 << 8) | 4;
        assert_eq!(decode(&[0x34, 0x12], 16, meta), Value::Bit(0x1234));
    }

    #[test]
    fn test_json_dispatch() {
        // 2-byte length prefix (meta = 2) followed by an int16 document.
        let data = [0x03, 0x00, 0x05, 0x2A, 0x00];
        assert_eq!(decode(&data, 245, 2), Value::Json(serde_json::json!(42)));
    }

    #[test]
    fn test_unsupported_types_error() {
        let mut buf = Buffer::new(&[0x00]);
        let err = decode_value(&mut buf, 0, 0).unwrap_err();
        assert!(err.to_string().contains("unsupported column type 0"));

        let mut buf = Buffer::new(&[0x00]);
        assert!(decode_value(&mut buf, 14, 0).is_err());
    }

    #[test]
    fn test_null_type_consumes_nothing() {
        let mut buf = Buffer::new(&[0xAB]);
        assert_eq!(decode_value(&mut buf, 6, 0).unwrap(), Value::Null);
        assert_eq!(buf.remaining(), 1);
    }

    #[test]
    fn test_display_forms() {
        assert_eq!(Value::Null.to_string(), "NULL");
        assert_eq!(Value::Year(0).to_string(), "0000");
        assert_eq!(Value::Year(2024).to_string(), "2024");
        assert_eq!(
            Value::Date {
                year: 0,
                month: 0,
                day: 0
            }
            .to_string(),
            "0000-00-00"
        );
        assert_eq!(
            Value::Timestamp {
                seconds: 1700000000,
                micros: 1200
            }
            .to_string(),
            "1700000000.001200"
        );
    }
}
