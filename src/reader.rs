//! Binlog reader: drives the replication session and turns the packet
//! stream into events.
//!
//! [`StreamDecoder`] holds the decode state (format description, position,
//! table map cache) and processes one packet at a time; [`BinlogReader`]
//! couples it to a live replication connection. Keeping the two apart
//! means the whole event path can be exercised against byte fixtures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::driver::{Config, ReplicaConn};
use crate::error::{Error, Result};
use crate::event::format::{ChecksumAlgorithm, FormatDescription};
use crate::event::query::{QueryEvent, RotateEvent, XidEvent};
use crate::event::rows::{self, RowsEvent};
use crate::event::table_map::{TableDescription, TableMapEvent};
use crate::event::{EventHeader, EventType, Position};

/// Table map cache entries kept before an end-of-statement event clears
/// the cache.
const TABLE_MAP_HIGH_WATER: usize = 100;

/// One event surfaced to the caller.
///
/// The body is the packet payload with the header and any trailing
/// checksum removed. Row events carry a snapshot of their table
/// description; the heavyweight bodies are decoded lazily on request.
#[derive(Debug, Clone)]
pub struct Event {
    pub format: Arc<FormatDescription>,
    pub header: EventHeader,
    pub body: Vec<u8>,
    /// Present only for row events.
    pub table: Option<Arc<TableDescription>>,
}

impl Event {
    /// Decode the row change batch of a row event.
    pub fn decode_rows(&self) -> Result<RowsEvent> {
        let table = self.table.as_deref().ok_or_else(|| {
            Error::decode(format!(
                "{:?} event has no table description attached",
                self.header.event_type
            ))
        })?;
        RowsEvent::decode(&self.body, self.header.event_type, &self.format, table)
    }

    /// Decode the body of a Query event.
    pub fn decode_query(&self) -> Result<QueryEvent> {
        QueryEvent::decode(&self.body)
    }

    /// Decode the body of an Xid event.
    pub fn decode_xid(&self) -> Result<XidEvent> {
        XidEvent::decode(&self.body)
    }
}

/// Stateful decoder for a binlog packet stream.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    format: Arc<FormatDescription>,
    state: Position,
    safepoint: Position,
    table_map: HashMap<u64, Arc<TableDescription>>,
}

impl StreamDecoder {
    pub fn new(start: Position) -> Self {
        StreamDecoder {
            format: Arc::default(),
            safepoint: start.clone(),
            state: start,
            table_map: HashMap::new(),
        }
    }

    /// Current position in the log.
    pub fn state(&self) -> &Position {
        &self.state
    }

    /// Last position safe to resume from.
    pub fn safepoint(&self) -> &Position {
        &self.safepoint
    }

    /// Cached table description, if any.
    pub fn table(&self, table_id: u64) -> Option<&Arc<TableDescription>> {
        self.table_map.get(&table_id)
    }

    /// Process one event packet (status byte already stripped).
    pub fn process(&mut self, packet: &[u8]) -> Result<Event> {
        let header = EventHeader::decode(packet, &self.format)?;
        trace!(event_type = ?header.event_type, len = header.event_len, "event header");

        if header.next_offset > 0 {
            self.state.offset = header.next_offset as u64;
        }

        let header_len = self.format.header_len();
        if packet.len() < header_len {
            return Err(Error::protocol(format!(
                "event shorter than its header: {} bytes",
                packet.len()
            )));
        }
        let mut body = &packet[header_len..];

        // Checksums are stripped, never verified. The FormatDescription
        // event describes its own checksum and is handled inside its
        // decoder instead.
        if self.format.server_details.checksum_algorithm == ChecksumAlgorithm::Crc32
            && header.event_type != EventType::FormatDescription
        {
            if body.len() < 4 {
                return Err(Error::protocol("event too short for checksum trailer"));
            }
            body = &body[..body.len() - 4];
        }

        let mut event = Event {
            format: Arc::clone(&self.format),
            header,
            body: body.to_vec(),
            table: None,
        };

        match event.header.event_type {
            EventType::FormatDescription => {
                let fd = FormatDescription::decode(&event.body)?;
                info!(
                    server_version = %fd.server_version,
                    binlog_version = fd.version,
                    checksum = ?fd.server_details.checksum_algorithm,
                    "format description received"
                );
                self.format = Arc::new(fd);
                event.format = Arc::clone(&self.format);
                self.safepoint = self.state.clone();
            }
            EventType::Rotate => {
                let rotate = RotateEvent::decode(&event.body, &self.format)?;
                debug!(next = %rotate.next_file, "rotating");
                self.state = rotate.next_file;
                self.safepoint = self.state.clone();
            }
            EventType::TableMap => {
                let table_map = TableMapEvent::decode(&event.body, &self.format)?;
                trace!(
                    table_id = table_map.table_id,
                    table = %table_map.description.table_name,
                    "table map cached"
                );
                self.table_map
                    .insert(table_map.table_id, Arc::new(table_map.description));
            }
            event_type if event_type.is_row_event() => {
                let table_id = rows::peek_table_id(&event.body, event_type, &self.format)?;
                let table = self
                    .table_map
                    .get(&table_id)
                    .cloned()
                    .ok_or(Error::UnknownTableId(table_id))?;
                event.table = Some(table);

                let flags = rows::peek_flags(&event.body, event_type, &self.format)?;
                if flags & rows::FLAG_END_OF_STATEMENT != 0
                    && self.table_map.len() > TABLE_MAP_HIGH_WATER
                {
                    debug!(
                        entries = self.table_map.len(),
                        "clearing table map cache at end of statement"
                    );
                    self.table_map.clear();
                }
            }
            EventType::Xid => {
                self.safepoint = self.state.clone();
            }
            // Query, GTID and the rest are surfaced as-is; the caller
            // decodes what it cares about.
            _ => {}
        }

        Ok(event)
    }
}

/// A connected binlog reader.
///
/// Single-threaded by design: events are pulled one at a time with
/// [`read_event`](Self::read_event) and delivered strictly in log order.
/// The connection is owned exclusively by the reader.
#[derive(Debug)]
pub struct BinlogReader {
    conn: ReplicaConn,
    decoder: StreamDecoder,
    poisoned: Option<String>,
}

impl BinlogReader {
    /// Connect to the server, set up the session and start the dump.
    ///
    /// Runs checksum negotiation, REGISTER_SLAVE and BINLOG_DUMP in
    /// order; failure of any step fails construction.
    pub async fn connect(dsn: &str, config: Config) -> Result<Self> {
        let mut conn = ReplicaConn::connect(dsn, config).await?;
        conn.disable_checksum().await?;
        conn.register_slave().await?;
        let start = conn.start_binlog_dump().await?;
        Ok(BinlogReader {
            conn,
            decoder: StreamDecoder::new(start),
            poisoned: None,
        })
    }

    /// Read the next event, waiting as long as it takes.
    pub async fn read_event(&mut self) -> Result<Event> {
        self.read_event_inner(None).await
    }

    /// Read the next event, giving up after `timeout`. On expiry the
    /// reader state is untouched and the call may be retried.
    pub async fn read_event_timeout(&mut self, timeout: Duration) -> Result<Event> {
        self.read_event_inner(Some(timeout)).await
    }

    async fn read_event_inner(&mut self, timeout: Option<Duration>) -> Result<Event> {
        // A poisoned reader replays its failure without touching the
        // transport.
        if let Some(message) = &self.poisoned {
            return Err(Error::Protocol(message.clone()));
        }

        let packet = self.conn.read_packet(timeout).await?;
        match self.decoder.process(&packet) {
            Ok(event) => Ok(event),
            Err(Error::Protocol(message)) => {
                warn!(%message, "protocol error; reader poisoned");
                self.poisoned = Some(message.clone());
                Err(Error::Protocol(message))
            }
            Err(other) => Err(other),
        }
    }

    /// Current position in the log. Checkpointing it is the embedder's
    /// job; the reader persists nothing.
    pub fn state(&self) -> &Position {
        self.decoder.state()
    }

    /// Last observed position that is safe to resume from (aligned with
    /// a FormatDescription, Rotate or Xid event).
    pub fn safepoint(&self) -> &Position {
        self.decoder.safepoint()
    }

    /// Close the connection.
    pub async fn close(self) -> Result<()> {
        self.conn.close().await
    }
}
