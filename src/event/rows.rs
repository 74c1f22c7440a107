//! Row events: the INSERT/UPDATE/DELETE payloads of row-based
//! replication, in all three wire versions.

use tracing::trace;

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::event::format::FormatDescription;
use crate::event::table_map::TableDescription;
use crate::event::EventType;
use crate::value::{decode_value, Value};

/// Statement boundary: the last row event of a statement carries it, and
/// the reader may drop its table map cache once seen.
pub const FLAG_END_OF_STATEMENT: u16 = 0x0001;
pub const FLAG_NO_FOREIGN_KEY_CHECKS: u16 = 0x0002;
pub const FLAG_NO_UNIQUE_KEY_CHECKS: u16 = 0x0004;
pub const FLAG_ROW_HAS_COLUMNS: u16 = 0x0008;

/// A decoded rows event.
///
/// `rows` holds one entry per row image, each with one value per table
/// column; columns absent from the image hold `Value::Null` placeholders.
/// Update events interleave before/after images, in that order.
#[derive(Debug, Clone)]
pub struct RowsEvent {
    pub event_type: EventType,
    pub table_id: u64,
    pub flags: u16,
    pub extra_data: Vec<u8>,
    pub column_count: u64,
    pub column_bitmap1: Vec<u8>,
    pub column_bitmap2: Vec<u8>,
    pub rows: Vec<Vec<Value>>,
}

/// Read the table ID off the front of a rows event body without
/// consuming it.
pub fn peek_table_id(data: &[u8], event_type: EventType, fd: &FormatDescription) -> Result<u64> {
    let mut buf = Buffer::new(data);
    if fd.table_id_size(event_type) == 6 {
        buf.read_u48()
    } else {
        Ok(buf.read_u32()? as u64)
    }
}

/// Read the event flags without consuming the body.
pub fn peek_flags(data: &[u8], event_type: EventType, fd: &FormatDescription) -> Result<u16> {
    let mut buf = Buffer::new(data);
    buf.skip(fd.table_id_size(event_type))?;
    buf.read_u16()
}

impl RowsEvent {
    /// Decode a rows event body against its table description.
    pub fn decode(
        data: &[u8],
        event_type: EventType,
        fd: &FormatDescription,
        td: &TableDescription,
    ) -> Result<Self> {
        let mut buf = Buffer::new(data);
        let table_id = if fd.table_id_size(event_type) == 6 {
            buf.read_u48()?
        } else {
            buf.read_u32()? as u64
        };
        let flags = buf.read_u16()?;

        let mut extra_data = Vec::new();
        if event_type.rows_have_extra_data() {
            // The length field counts itself, so the payload is two bytes
            // shorter.
            let extra_len = buf.read_u16()?;
            if extra_len < 2 {
                return Err(Error::protocol(format!(
                    "rows extra data length {extra_len} below its own size"
                )));
            }
            extra_data = buf.read(extra_len as usize - 2)?.to_vec();
        }

        let (column_count, _) = buf.read_lenenc_int()?;
        if column_count != td.column_count {
            return Err(Error::decode(format!(
                "rows event declares {column_count} columns, table map has {}",
                td.column_count
            )));
        }
        let bitmap_len = (column_count as usize + 7) / 8;
        let column_bitmap1 = buf.read(bitmap_len)?.to_vec();
        let column_bitmap2 = if event_type.rows_have_second_bitmap() {
            buf.read(bitmap_len)?.to_vec()
        } else {
            Vec::new()
        };

        let mut rows = Vec::new();
        while buf.more() {
            rows.push(decode_row(&mut buf, td, &column_bitmap1)?);
            if event_type.rows_have_second_bitmap() {
                rows.push(decode_row(&mut buf, td, &column_bitmap2)?);
            }
        }
        trace!(
            table_id,
            rows = rows.len(),
            "decoded {:?} event",
            event_type
        );

        Ok(RowsEvent {
            event_type,
            table_id,
            flags,
            extra_data,
            column_count,
            column_bitmap1,
            column_bitmap2,
            rows,
        })
    }

    /// True when this event closes its statement.
    pub fn is_end_of_statement(&self) -> bool {
        self.flags & FLAG_END_OF_STATEMENT != 0
    }
}

/// Decode a single row image. The null bitmap covers only the columns
/// present in the image, in bitmap order.
fn decode_row(buf: &mut Buffer<'_>, td: &TableDescription, bitmap: &[u8]) -> Result<Vec<Value>> {
    let column_count = td.column_count as usize;
    let present = (0..column_count).filter(|&i| is_bit_set(bitmap, i)).count();
    let null_bitmap = buf.read((present + 7) / 8)?.to_vec();

    let mut row = Vec::with_capacity(column_count);
    let mut null_idx = 0;
    for i in 0..column_count {
        if !is_bit_set(bitmap, i) {
            row.push(Value::Null);
            continue;
        }
        let is_null = is_bit_set(&null_bitmap, null_idx);
        null_idx += 1;
        if is_null {
            row.push(Value::Null);
            continue;
        }
        let (column_type, meta) = td
            .column_types
            .get(i)
            .zip(td.column_meta.get(i))
            .ok_or_else(|| {
                Error::decode(format!("table map misses metadata for column {i}"))
            })?;
        row.push(decode_value(buf, *column_type, *meta)?);
    }
    Ok(row)
}

pub(crate) fn is_bit_set(bitmap: &[u8], i: usize) -> bool {
    bitmap
        .get(i >> 3)
        .map(|b| b & (1 << (i & 7)) != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_lenenc_int;

    fn table(column_types: &[u8], column_meta: &[u16]) -> TableDescription {
        TableDescription {
            column_count: column_types.len() as u64,
            column_types: column_types.to_vec(),
            column_meta: column_meta.to_vec(),
            ..Default::default()
        }
    }

    fn body_header(
        table_id: u64,
        flags: u16,
        event_type: EventType,
        column_count: u64,
        bitmaps: &[&[u8]],
    ) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&table_id.to_le_bytes()[..6]);
        data.extend_from_slice(&flags.to_le_bytes());
        if event_type.rows_have_extra_data() {
            data.extend_from_slice(&2u16.to_le_bytes());
        }
        encode_lenenc_int(&mut data, column_count, false);
        for bitmap in bitmaps {
            data.extend_from_slice(bitmap);
        }
        data
    }

    #[test]
    fn test_write_rows_two_columns() {
        let td = table(&[1, 15], &[0, 10]); // TINYINT, VARCHAR(10)
        let mut data = body_header(1042, 0, EventType::WriteRowsV1, 2, &[&[0b11]]);
        data.push(0b00); // null bitmap
        data.push(200); // tiny
        data.push(3);
        data.extend_from_slice(b"abc");

        let event = RowsEvent::decode(
            &data,
            EventType::WriteRowsV1,
            &FormatDescription::default(),
            &td,
        )
        .unwrap();
        assert_eq!(event.table_id, 1042);
        assert_eq!(event.rows.len(), 1);
        assert_eq!(
            event.rows[0],
            vec![Value::UInt8(200), Value::Text("abc".into())]
        );
    }

    #[test]
    fn test_null_bitmap_positions() {
        let td = table(&[1, 1, 1], &[0, 0, 0]);
        let mut data = body_header(1, 0, EventType::WriteRowsV1, 3, &[&[0b111]]);
        data.push(0b010); // middle column NULL
        data.push(10);
        data.push(30);

        let event = RowsEvent::decode(
            &data,
            EventType::WriteRowsV1,
            &FormatDescription::default(),
            &td,
        )
        .unwrap();
        assert_eq!(
            event.rows[0],
            vec![Value::UInt8(10), Value::Null, Value::UInt8(30)]
        );
    }

    #[test]
    fn test_absent_columns_get_placeholders() {
        let td = table(&[1, 1, 1], &[0, 0, 0]);
        // Middle column absent from the image: only two values on the
        // wire, null bitmap covers the two present columns.
        let mut data = body_header(1, 0, EventType::WriteRowsV1, 3, &[&[0b101]]);
        data.push(0b00);
        data.push(1);
        data.push(3);

        let event = RowsEvent::decode(
            &data,
            EventType::WriteRowsV1,
            &FormatDescription::default(),
            &td,
        )
        .unwrap();
        assert_eq!(
            event.rows[0],
            vec![Value::UInt8(1), Value::Null, Value::UInt8(3)]
        );
    }

    #[test]
    fn test_update_rows_pairing() {
        let td = table(&[1], &[0]);
        let mut data = body_header(1, 0, EventType::UpdateRowsV2, 1, &[&[0b1], &[0b1]]);
        for pair in [(5u8, 6u8), (7, 8)] {
            data.push(0); // before null bitmap
            data.push(pair.0);
            data.push(0); // after null bitmap
            data.push(pair.1);
        }

        let event = RowsEvent::decode(
            &data,
            EventType::UpdateRowsV2,
            &FormatDescription::default(),
            &td,
        )
        .unwrap();
        // 2k rows alternating before/after.
        assert_eq!(event.rows.len(), 4);
        assert_eq!(event.rows[0], vec![Value::UInt8(5)]);
        assert_eq!(event.rows[1], vec![Value::UInt8(6)]);
        assert_eq!(event.rows[2], vec![Value::UInt8(7)]);
        assert_eq!(event.rows[3], vec![Value::UInt8(8)]);
    }

    #[test]
    fn test_v2_extra_data() {
        let td = table(&[1], &[0]);
        let mut data = Vec::new();
        data.extend_from_slice(&9u64.to_le_bytes()[..6]);
        data.extend_from_slice(&FLAG_END_OF_STATEMENT.to_le_bytes());
        data.extend_from_slice(&5u16.to_le_bytes()); // extra: 2 + 3 payload
        data.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
        data.push(1); // column count
        data.push(0b1);
        data.push(0);
        data.push(42);

        let event = RowsEvent::decode(
            &data,
            EventType::WriteRowsV2,
            &FormatDescription::default(),
            &td,
        )
        .unwrap();
        assert_eq!(event.extra_data, vec![0xAA, 0xBB, 0xCC]);
        assert!(event.is_end_of_statement());
        assert_eq!(event.rows[0], vec![Value::UInt8(42)]);
    }

    #[test]
    fn test_peek_helpers() {
        let mut data = body_header(77, FLAG_END_OF_STATEMENT, EventType::WriteRowsV1, 1, &[&[1]]);
        data.push(0);
        data.push(9);
        let fd = FormatDescription::default();
        assert_eq!(peek_table_id(&data, EventType::WriteRowsV1, &fd).unwrap(), 77);
        assert_eq!(
            peek_flags(&data, EventType::WriteRowsV1, &fd).unwrap(),
            FLAG_END_OF_STATEMENT
        );
    }

    #[test]
    fn test_column_count_mismatch() {
        let td = table(&[1, 1], &[0, 0]);
        let mut data = body_header(1, 0, EventType::WriteRowsV1, 1, &[&[0b1]]);
        data.push(0);
        data.push(1);
        assert!(RowsEvent::decode(
            &data,
            EventType::WriteRowsV1,
            &FormatDescription::default(),
            &td,
        )
        .is_err());
    }

    #[test]
    fn test_unsupported_column_aborts_event() {
        let td = table(&[0], &[0]); // old DECIMAL
        let mut data = body_header(1, 0, EventType::WriteRowsV1, 1, &[&[0b1]]);
        data.push(0);
        data.push(0x99);
        let err = RowsEvent::decode(
            &data,
            EventType::WriteRowsV1,
            &FormatDescription::default(),
            &td,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_truncated_row_is_an_error() {
        let td = table(&[3], &[0]); // INT wants 4 bytes
        let mut data = body_header(1, 0, EventType::WriteRowsV1, 1, &[&[0b1]]);
        data.push(0);
        data.push(0x01); // only one of four bytes
        assert!(RowsEvent::decode(
            &data,
            EventType::WriteRowsV1,
            &FormatDescription::default(),
            &td,
        )
        .is_err());
    }
}
