//! Statement-level events: Query (DDL/DML text), Rotate (file change)
//! and Xid (transaction commit marker).

use crate::buffer::Buffer;
use crate::error::Result;
use crate::event::format::FormatDescription;
use crate::event::Position;

/// A logged statement, surfaced for DDL tracking.
#[derive(Debug, Clone)]
pub struct QueryEvent {
    pub slave_proxy_id: u32,
    pub execution_time: u32,
    pub error_code: u16,
    pub status_vars: Vec<u8>,
    pub schema: String,
    pub query: String,
}

impl QueryEvent {
    /// Decode a Query event body.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut buf = Buffer::new(data);
        let slave_proxy_id = buf.read_u32()?;
        let execution_time = buf.read_u32()?;
        let schema_len = buf.read_u8()? as usize;
        let error_code = buf.read_u16()?;
        let status_vars_len = buf.read_u16()? as usize;
        let status_vars = buf.read(status_vars_len)?.to_vec();
        let schema = String::from_utf8_lossy(buf.read(schema_len)?).into_owned();
        buf.skip(1)?; // NUL separator
        let query = String::from_utf8_lossy(buf.read_eof()).into_owned();

        Ok(QueryEvent {
            slave_proxy_id,
            execution_time,
            error_code,
            status_vars,
            schema,
            query,
        })
    }
}

/// Written at the end of a file, pointing at the next one.
#[derive(Debug, Clone)]
pub struct RotateEvent {
    pub next_file: Position,
}

impl RotateEvent {
    /// Decode a Rotate event body. Binlog v1 carried only the file name;
    /// the offset is then the fixed first-event position.
    pub fn decode(data: &[u8], fd: &FormatDescription) -> Result<Self> {
        let mut buf = Buffer::new(data);
        let offset = if fd.version > 1 { buf.read_u64()? } else { 4 };
        let file = String::from_utf8_lossy(buf.read_eof()).into_owned();
        Ok(RotateEvent {
            next_file: Position { file, offset },
        })
    }
}

/// Commit boundary of an XA-capable transaction.
#[derive(Debug, Clone, Copy)]
pub struct XidEvent {
    pub xid: u64,
}

impl XidEvent {
    /// Decode an Xid event body.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut buf = Buffer::new(data);
        Ok(XidEvent {
            xid: buf.read_u64()?,
        })
    }
}
