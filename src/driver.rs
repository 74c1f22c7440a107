//! Replication session driver.
//!
//! Turns an authenticated connection into a binlog dump session: checksum
//! negotiation, `COM_REGISTER_SLAVE`, `COM_BINLOG_DUMP`, and the packet
//! pump that feeds the event reader afterwards.

use std::time::Duration;

use tracing::{debug, info};

use crate::buffer::CommandBuffer;
use crate::conn::{parse_err_packet, Conn, Dsn};
use crate::error::{Error, Result};
use crate::event::Position;

const COM_BINLOG_DUMP: u8 = 0x12;
const COM_REGISTER_SLAVE: u8 = 0x15;

const RESULT_OK: u8 = 0x00;
const RESULT_EOF: u8 = 0xFE;
const RESULT_ERR: u8 = 0xFF;

/// The first event of every binlog file starts at byte four, after the
/// magic marker.
pub const FIRST_EVENT_OFFSET: u32 = 4;

/// Replication session options.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Unique replica identifier reported to the server. Must differ from
    /// every other replica connected to the same primary.
    pub server_id: u32,
    /// Binlog file to start dumping from.
    pub file: String,
    /// Byte offset within that file; values below four are clamped.
    pub offset: u32,
    /// Hostname reported in REGISTER_SLAVE; the local hostname when empty.
    pub hostname: String,
}

/// A connection registered (or about to register) as a replication
/// follower.
#[derive(Debug)]
pub struct ReplicaConn {
    conn: Conn,
    config: Config,
}

impl ReplicaConn {
    /// Connect and authenticate; replication commands are issued
    /// separately by the reader.
    pub async fn connect(dsn: &str, mut config: Config) -> Result<Self> {
        if config.hostname.is_empty() {
            config.hostname = hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        let dsn = Dsn::parse(dsn)?;
        let conn = Conn::connect(&dsn).await?;
        Ok(ReplicaConn { conn, config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn server_version(&self) -> &str {
        self.conn.server_version()
    }

    /// Make sure the server does not append CRC32 checksums to the events
    /// it sends on this connection.
    pub async fn disable_checksum(&mut self) -> Result<()> {
        let checksum = self.get_var("BINLOG_CHECKSUM").await?;
        debug!(%checksum, "server binlog checksum");
        if checksum != "NONE" {
            self.set_var("@master_binlog_checksum", "NONE").await?;
        }
        Ok(())
    }

    /// Register this connection as a replica.
    pub async fn register_slave(&mut self) -> Result<()> {
        self.conn.reset_sequence();

        let hostname = self.config.hostname.clone();
        // command + server_id + hostname + user + password + port +
        // replication rank + master id; all but the first three are zero.
        let mut buf = CommandBuffer::new(1 + 4 + 1 + hostname.len() + 1 + 1 + 2 + 4 + 4);
        buf.write_u8(COM_REGISTER_SLAVE);
        buf.write_u32(self.config.server_id);
        buf.write_str_prefixed(&hostname);
        buf.skip(1 + 1 + 2 + 4 + 4);

        self.run_cmd(buf).await?;
        info!(
            server_id = self.config.server_id,
            %hostname,
            "registered as replica"
        );
        Ok(())
    }

    /// Ask the server to start streaming the binlog. Returns the position
    /// the dump actually starts from.
    pub async fn start_binlog_dump(&mut self) -> Result<Position> {
        self.conn.reset_sequence();

        let offset = self.config.offset.max(FIRST_EVENT_OFFSET);
        let file = self.config.file.clone();
        let mut buf = CommandBuffer::new(1 + 4 + 2 + 4 + file.len());
        buf.write_u8(COM_BINLOG_DUMP);
        buf.write_u32(offset);
        buf.skip(2); // flags
        buf.write_u32(self.config.server_id);
        buf.write_str_eof(&file);

        self.run_cmd(buf).await?;
        info!(file = %file, offset, "binlog dump started");
        Ok(Position {
            file,
            offset: offset as u64,
        })
    }

    /// Read the next packet of the dump, honoring a deadline when given,
    /// and classify its status byte. OK payloads are returned with the
    /// status byte stripped.
    pub async fn read_packet(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let packet = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.conn.read_packet())
                .await
                .map_err(|_| Error::Timeout)??,
            None => self.conn.read_packet().await?,
        };
        match packet.first() {
            Some(&RESULT_OK) => Ok(packet[1..].to_vec()),
            Some(&RESULT_EOF) => Err(Error::EndOfStream),
            Some(&RESULT_ERR) => Err(parse_err_packet(&packet)),
            other => Err(Error::protocol(format!(
                "unexpected packet header {other:?}"
            ))),
        }
    }

    /// Close the underlying connection.
    pub async fn close(self) -> Result<()> {
        self.conn.close().await
    }

    async fn run_cmd(&mut self, buf: CommandBuffer) -> Result<()> {
        self.conn.write_packet(buf.into_bytes()).await?;
        self.conn.read_result_ok().await
    }

    async fn get_var(&mut self, name: &str) -> Result<String> {
        let rows = self
            .conn
            .query(&format!("SHOW VARIABLES LIKE '{name}'"))
            .await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().nth(1).flatten())
            .unwrap_or_default())
    }

    async fn set_var(&mut self, name: &str, value: &str) -> Result<()> {
        self.conn.exec(&format!("SET {name}='{value}'")).await
    }
}
