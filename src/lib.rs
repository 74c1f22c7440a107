//! # binlog-cdc: MySQL binlog replication client
//!
//! Subscribes to a MySQL-compatible server as a replication follower,
//! consumes the binary log as a live stream, and surfaces decoded
//! row-level change events (INSERT/UPDATE/DELETE) together with the
//! position needed to resume after a restart.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   packets   ┌───────────────┐   events   ┌──────────────┐
//! │ ReplicaConn  │────────────▶│ StreamDecoder │───────────▶│ BinlogReader │
//! │ REGISTER_    │             │ header/format │            │ position,    │
//! │ SLAVE + DUMP │             │ table map     │            │ safepoint    │
//! └──────────────┘             └───────────────┘            └──────┬───────┘
//!                                                                  │
//!                                                     ┌────────────▼────────────┐
//!                                                     │ EnrichedReader (opt.)   │
//!                                                     │ column names, signeness │
//!                                                     └─────────────────────────┘
//! ```
//!
//! The reader is a single-threaded cooperative consumer: call
//! [`BinlogReader::read_event`] in a loop from one task. Events arrive
//! strictly in log order, with table maps preceding the row events that
//! reference them. Row bodies are decoded lazily via
//! [`Event::decode_rows`].
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use binlog_cdc::{BinlogReader, Config};
//!
//! # async fn example() -> binlog_cdc::Result<()> {
//! let mut reader = BinlogReader::connect(
//!     "repl:secret@localhost:3306",
//!     Config {
//!         server_id: 1007,
//!         file: "binlog.000001".into(),
//!         offset: 4,
//!         ..Default::default()
//!     },
//! )
//! .await?;
//!
//! loop {
//!     let event = reader.read_event().await?;
//!     if event.header.event_type.is_row_event() {
//!         let rows = event.decode_rows()?;
//!         println!("{} rows at {}", rows.rows.len(), reader.state());
//!     }
//! }
//! # }
//! ```
//!
//! Checkpointing is the embedder's job: persist [`BinlogReader::state`]
//! (or the more conservative [`BinlogReader::safepoint`]) and pass it
//! back through [`Config`] on restart.

pub mod buffer;
pub mod codec;
pub mod conn;
pub mod driver;
pub mod error;
pub mod event;
pub mod reader;
pub mod schema;
pub mod value;

pub use driver::{Config, ReplicaConn};
pub use error::{Error, Result};
pub use event::format::{ChecksumAlgorithm, FormatDescription};
pub use event::query::{QueryEvent, RotateEvent, XidEvent};
pub use event::rows::RowsEvent;
pub use event::table_map::TableDescription;
pub use event::{EventHeader, EventType, Position};
pub use reader::{BinlogReader, Event, StreamDecoder};
pub use schema::{EnrichedReader, EnrichedRowsEvent, SchemaManager};
pub use value::{ColumnType, Value};
