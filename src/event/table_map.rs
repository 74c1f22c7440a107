//! TableMap events describe the column layout of the table a following
//! row event modifies. The reader caches them by table ID.

use serde::Serialize;

use crate::buffer::Buffer;
use crate::error::Result;
use crate::event::format::FormatDescription;
use crate::event::EventType;
use crate::value::ColumnType;

/// Column layout of a table, as declared by a TableMap event.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TableDescription {
    pub flags: u16,
    pub schema_name: String,
    pub table_name: String,
    pub column_count: u64,
    /// Raw column type bytes, one per column.
    pub column_types: Vec<u8>,
    /// Per-column meta word; interpretation depends on the type.
    pub column_meta: Vec<u16>,
    /// Bitmap of nullable columns.
    pub null_bitmask: Vec<u8>,
}

/// A TableMap event: a table description keyed by the table ID that row
/// events reference.
#[derive(Debug, Clone)]
pub struct TableMapEvent {
    pub table_id: u64,
    pub description: TableDescription,
}

impl TableMapEvent {
    /// Decode a TableMap event body.
    pub fn decode(data: &[u8], fd: &FormatDescription) -> Result<Self> {
        let mut buf = Buffer::new(data);
        let table_id = if fd.table_id_size(EventType::TableMap) == 6 {
            buf.read_u48()?
        } else {
            buf.read_u32()? as u64
        };

        let flags = buf.read_u16()?;
        let schema_name = String::from_utf8_lossy(buf.read_lenenc_str()?).into_owned();
        buf.skip(1)?; // trailing NUL
        let table_name = String::from_utf8_lossy(buf.read_lenenc_str()?).into_owned();
        buf.skip(1)?; // trailing NUL

        let (column_count, _) = buf.read_lenenc_int()?;
        let column_types = buf.read(column_count as usize)?.to_vec();
        let meta_raw = buf.read_lenenc_str()?;
        let column_meta = decode_column_meta(meta_raw, &column_types)?;
        let null_bitmask = buf.read((column_count as usize + 7) / 8)?.to_vec();

        Ok(TableMapEvent {
            table_id,
            description: TableDescription {
                flags,
                schema_name,
                table_name,
                column_count,
                column_types,
                column_meta,
                null_bitmask,
            },
        })
    }
}

/// Recover the per-column meta words from the packed meta block. Byte
/// width and order vary with the column type.
fn decode_column_meta(data: &[u8], column_types: &[u8]) -> Result<Vec<u16>> {
    let mut buf = Buffer::new(data);
    let mut meta = Vec::with_capacity(column_types.len());
    for &raw in column_types {
        let word = match ColumnType::from(raw) {
            // Two bytes, high byte first: precision/scale, or the packed
            // real-type + length encoding of CHAR columns.
            ColumnType::String | ColumnType::NewDecimal => {
                let high = buf.read_u8()? as u16;
                let low = buf.read_u8()? as u16;
                high << 8 | low
            }
            ColumnType::Varchar | ColumnType::VarString | ColumnType::Bit => buf.read_u16()?,
            ColumnType::Float
            | ColumnType::Double
            | ColumnType::Blob
            | ColumnType::Geometry
            | ColumnType::Json
            | ColumnType::Time2
            | ColumnType::Datetime2
            | ColumnType::Timestamp2 => buf.read_u8()? as u16,
            _ => 0,
        };
        meta.push(word);
    }
    Ok(meta)
}
