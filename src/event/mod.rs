//! Binlog event framing: event types, the common header, and the
//! classification helpers used to route row events.

pub mod format;
pub mod query;
pub mod rows;
pub mod table_map;

use serde::Serialize;

use crate::buffer::Buffer;
use crate::error::Result;
use format::FormatDescription;

/// Binlog event type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    Unknown = 0,
    StartV3 = 1,
    Query = 2,
    Stop = 3,
    Rotate = 4,
    Intvar = 5,
    Load = 6,
    Slave = 7,
    CreateFile = 8,
    AppendBlock = 9,
    ExecLoad = 10,
    DeleteFile = 11,
    NewLoad = 12,
    Rand = 13,
    UserVar = 14,
    FormatDescription = 15,
    Xid = 16,
    BeginLoadQuery = 17,
    ExecuteLoadQuery = 18,
    TableMap = 19,
    WriteRowsV0 = 20,
    UpdateRowsV0 = 21,
    DeleteRowsV0 = 22,
    WriteRowsV1 = 23,
    UpdateRowsV1 = 24,
    DeleteRowsV1 = 25,
    Incident = 26,
    Heartbeat = 27,
    Ignorable = 28,
    RowsQuery = 29,
    WriteRowsV2 = 30,
    UpdateRowsV2 = 31,
    DeleteRowsV2 = 32,
    Gtid = 33,
    AnonymousGtid = 34,
    PreviousGtids = 35,
}

impl From<u8> for EventType {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::StartV3,
            2 => Self::Query,
            3 => Self::Stop,
            4 => Self::Rotate,
            5 => Self::Intvar,
            6 => Self::Load,
            7 => Self::Slave,
            8 => Self::CreateFile,
            9 => Self::AppendBlock,
            10 => Self::ExecLoad,
            11 => Self::DeleteFile,
            12 => Self::NewLoad,
            13 => Self::Rand,
            14 => Self::UserVar,
            15 => Self::FormatDescription,
            16 => Self::Xid,
            17 => Self::BeginLoadQuery,
            18 => Self::ExecuteLoadQuery,
            19 => Self::TableMap,
            20 => Self::WriteRowsV0,
            21 => Self::UpdateRowsV0,
            22 => Self::DeleteRowsV0,
            23 => Self::WriteRowsV1,
            24 => Self::UpdateRowsV1,
            25 => Self::DeleteRowsV1,
            26 => Self::Incident,
            27 => Self::Heartbeat,
            28 => Self::Ignorable,
            29 => Self::RowsQuery,
            30 => Self::WriteRowsV2,
            31 => Self::UpdateRowsV2,
            32 => Self::DeleteRowsV2,
            33 => Self::Gtid,
            34 => Self::AnonymousGtid,
            35 => Self::PreviousGtids,
            _ => Self::Unknown,
        }
    }
}

impl Default for EventType {
    fn default() -> Self {
        EventType::Unknown
    }
}

impl EventType {
    /// Row event version: 0, 1 or 2, or `None` for non-row events.
    pub fn rows_version(self) -> Option<u8> {
        match self {
            Self::WriteRowsV0 | Self::UpdateRowsV0 | Self::DeleteRowsV0 => Some(0),
            Self::WriteRowsV1 | Self::UpdateRowsV1 | Self::DeleteRowsV1 => Some(1),
            Self::WriteRowsV2 | Self::UpdateRowsV2 | Self::DeleteRowsV2 => Some(2),
            _ => None,
        }
    }

    pub fn is_row_event(self) -> bool {
        self.rows_version().is_some()
    }

    /// v2 row events carry a variable-length extra-data block.
    pub fn rows_have_extra_data(self) -> bool {
        self.rows_version() == Some(2)
    }

    /// Update events carry separate before/after column bitmaps.
    pub fn rows_have_second_bitmap(self) -> bool {
        matches!(self, Self::UpdateRowsV1 | Self::UpdateRowsV2)
    }

    /// Updates pair rows: each decoded change is (before, after).
    pub fn is_update_event(self) -> bool {
        matches!(
            self,
            Self::UpdateRowsV0 | Self::UpdateRowsV1 | Self::UpdateRowsV2
        )
    }
}

/// Current position in the binary log: file name plus byte offset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Position {
    pub file: String,
    pub offset: u64,
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.offset)
    }
}

/// Common event header. Every event in the stream starts with one; its
/// length is declared by the FormatDescription event (19 by default).
#[derive(Debug, Clone, Default)]
pub struct EventHeader {
    pub timestamp: u32,
    pub event_type: EventType,
    pub server_id: u32,
    /// Total event length including this header.
    pub event_len: u32,
    /// Offset of the next event within the current file; zero when the
    /// server does not report one.
    pub next_offset: u32,
    pub flags: u16,
    pub extra_headers: Vec<u8>,
}

impl EventHeader {
    /// Decode an event header from the front of a packet.
    pub fn decode(data: &[u8], fd: &FormatDescription) -> Result<Self> {
        let mut buf = Buffer::new(data);
        let mut header = EventHeader {
            timestamp: buf.read_u32()?,
            event_type: EventType::from(buf.read_u8()?),
            server_id: buf.read_u32()?,
            event_len: buf.read_u32()?,
            ..Default::default()
        };

        if fd.version == 0 || fd.version >= 3 {
            header.next_offset = buf.read_u32()?;
            header.flags = buf.read_u16()?;
        }
        if fd.version >= 4 {
            header.extra_headers = buf.read(fd.header_len() - 19)?.to_vec();
        }

        Ok(header)
    }
}
