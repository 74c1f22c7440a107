//! MySQL client transport.
//!
//! The replication core needs only a handful of primitives from the
//! connection: packet framing, sequence reset, OK/ERR discrimination, and
//! `COM_QUERY` for session setup. This module implements them directly on
//! a `tokio` TCP stream: server handshake, `mysql_native_password`
//! authentication, and a text-protocol result set reader small enough for
//! `SHOW VARIABLES`.
//!
//! Packet reads accumulate into an internal buffer, so a read cancelled
//! by a deadline leaves the stream consistent and can simply be retried.

use bytes::{Buf, BytesMut};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::buffer::Buffer;
use crate::error::{Error, Result};

const PACKET_HEADER_SIZE: usize = 4;
const MAX_PACKET_SIZE: usize = 0xFF_FFFF;

const COM_QUIT: u8 = 0x01;
const COM_QUERY: u8 = 0x03;

mod capability {
    pub const LONG_PASSWORD: u32 = 0x0000_0001;
    pub const PROTOCOL_41: u32 = 0x0000_0200;
    pub const TRANSACTIONS: u32 = 0x0000_2000;
    pub const SECURE_CONNECTION: u32 = 0x0000_8000;
    pub const PLUGIN_AUTH: u32 = 0x0008_0000;
    pub const CONNECT_WITH_DB: u32 = 0x0000_0008;
}

/// Connection parameters parsed from a DSN of the form
/// `user[:password]@host:port[/database]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dsn {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub database: Option<String>,
}

impl Dsn {
    pub fn parse(dsn: &str) -> Result<Self> {
        let (credentials, rest) = dsn
            .rsplit_once('@')
            .ok_or_else(|| Error::protocol(format!("dsn {dsn:?} is missing '@'")))?;
        let (user, password) = match credentials.split_once(':') {
            Some((u, p)) => (u, p),
            None => (credentials, ""),
        };
        let (addr, database) = match rest.split_once('/') {
            Some((a, d)) if !d.is_empty() => (a, Some(d.to_string())),
            Some((a, _)) => (a, None),
            None => (rest, None),
        };
        let (host, port) = match addr.rsplit_once(':') {
            Some((h, p)) => (
                h.to_string(),
                p.parse::<u16>()
                    .map_err(|_| Error::protocol(format!("invalid port in dsn {dsn:?}")))?,
            ),
            None => (addr.to_string(), 3306),
        };
        if user.is_empty() || host.is_empty() {
            return Err(Error::protocol(format!("dsn {dsn:?} is incomplete")));
        }
        Ok(Dsn {
            user: user.to_string(),
            password: password.to_string(),
            host,
            port,
            database,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// An authenticated MySQL connection exposing packet-level primitives.
pub struct Conn {
    stream: TcpStream,
    read_buf: BytesMut,
    sequence_id: u8,
    server_version: String,
    connection_id: u32,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("sequence_id", &self.sequence_id)
            .field("server_version", &self.server_version)
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

impl Conn {
    /// Connect and authenticate.
    pub async fn connect(dsn: &Dsn) -> Result<Self> {
        let stream = TcpStream::connect(dsn.addr()).await?;
        stream.set_nodelay(true)?;
        let mut conn = Conn {
            stream,
            read_buf: BytesMut::with_capacity(16 * 1024),
            sequence_id: 0,
            server_version: String::new(),
            connection_id: 0,
        };

        let packet = conn.read_packet().await?;
        let handshake = Handshake::parse(&packet)?;
        conn.server_version = handshake.server_version.clone();
        conn.connection_id = handshake.connection_id;
        debug!(
            server_version = %handshake.server_version,
            connection_id = handshake.connection_id,
            auth_plugin = %handshake.auth_plugin_name,
            "received server handshake"
        );

        conn.authenticate(dsn, &handshake).await?;
        Ok(conn)
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Reset the packet sequence counter, as required before each command.
    pub fn reset_sequence(&mut self) {
        self.sequence_id = 0;
    }

    /// Read one logical packet payload. Spanning packets (payload of
    /// exactly 2²⁴−1 bytes) are concatenated with their continuations.
    pub async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut payload = self.read_frame().await?;
        if payload.len() == MAX_PACKET_SIZE {
            loop {
                let next = self.read_frame().await?;
                let done = next.len() < MAX_PACKET_SIZE;
                payload.extend_from_slice(&next);
                if done {
                    break;
                }
            }
        }
        Ok(payload)
    }

    async fn read_frame(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some((seq, payload)) = split_frame(&mut self.read_buf) {
                self.sequence_id = seq.wrapping_add(1);
                trace!(seq, len = payload.len(), "read packet");
                return Ok(payload);
            }
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by server",
                )));
            }
        }
    }

    /// Stamp the reserved header bytes of a command packet and send it.
    pub async fn write_packet(&mut self, mut packet: Vec<u8>) -> Result<()> {
        let len = packet.len() - PACKET_HEADER_SIZE;
        if len > MAX_PACKET_SIZE {
            return Err(Error::protocol(format!("packet too large: {len} bytes")));
        }
        packet[0] = len as u8;
        packet[1] = (len >> 8) as u8;
        packet[2] = (len >> 16) as u8;
        packet[3] = self.sequence_id;
        self.stream.write_all(&packet).await?;
        self.stream.flush().await?;
        self.sequence_id = self.sequence_id.wrapping_add(1);
        Ok(())
    }

    /// Read a packet and require it to be OK.
    pub async fn read_result_ok(&mut self) -> Result<()> {
        let packet = self.read_packet().await?;
        match packet.first() {
            Some(0x00) => Ok(()),
            Some(0xFF) => Err(parse_err_packet(&packet)),
            other => Err(Error::protocol(format!(
                "expected OK packet, got header {other:?}"
            ))),
        }
    }

    /// Execute a statement that produces no result set.
    pub async fn exec(&mut self, sql: &str) -> Result<()> {
        trace!(sql, "exec");
        self.send_query(sql).await?;
        self.read_result_ok().await
    }

    /// Execute a query and collect its text-protocol result set. Cells
    /// come back as strings, `None` for SQL NULL.
    pub async fn query(&mut self, sql: &str) -> Result<Vec<Vec<Option<String>>>> {
        trace!(sql, "query");
        self.send_query(sql).await?;

        let packet = self.read_packet().await?;
        match packet.first() {
            Some(0x00) => return Ok(Vec::new()),
            Some(0xFF) => return Err(parse_err_packet(&packet)),
            Some(_) => {}
            None => return Err(Error::protocol("empty query response")),
        }

        let mut buf = Buffer::new(&packet);
        let (column_count, _) = buf.read_lenenc_int()?;

        // Column definitions don't matter for the session queries this
        // connection issues; skip them and the closing EOF.
        for _ in 0..column_count {
            self.read_packet().await?;
        }
        let eof = self.read_packet().await?;
        if !is_eof_packet(&eof) {
            return Err(Error::protocol("expected EOF after column definitions"));
        }

        let mut rows = Vec::new();
        loop {
            let packet = self.read_packet().await?;
            if is_eof_packet(&packet) {
                break;
            }
            if packet.first() == Some(&0xFF) {
                return Err(parse_err_packet(&packet));
            }
            let mut buf = Buffer::new(&packet);
            let mut row = Vec::with_capacity(column_count as usize);
            for _ in 0..column_count {
                if buf.cur().first() == Some(&crate::codec::LENENC_NULL) {
                    buf.skip(1)?;
                    row.push(None);
                } else {
                    row.push(Some(
                        String::from_utf8_lossy(buf.read_lenenc_str()?).into_owned(),
                    ));
                }
            }
            rows.push(row);
        }
        Ok(rows)
    }

    async fn send_query(&mut self, sql: &str) -> Result<()> {
        self.reset_sequence();
        let mut packet = vec![0u8; PACKET_HEADER_SIZE];
        packet.push(COM_QUERY);
        packet.extend_from_slice(sql.as_bytes());
        self.write_packet(packet).await
    }

    /// Send COM_QUIT and drop the connection.
    pub async fn close(mut self) -> Result<()> {
        self.reset_sequence();
        let packet = vec![0, 0, 0, 0, COM_QUIT];
        // The server may close the socket without replying.
        let _ = self.write_packet(packet).await;
        Ok(())
    }

    async fn authenticate(&mut self, dsn: &Dsn, handshake: &Handshake) -> Result<()> {
        let mut flags = capability::LONG_PASSWORD
            | capability::PROTOCOL_41
            | capability::TRANSACTIONS
            | capability::SECURE_CONNECTION
            | capability::PLUGIN_AUTH;
        if dsn.database.is_some() {
            flags |= capability::CONNECT_WITH_DB;
        }

        let auth_response = native_password_scramble(&dsn.password, &handshake.auth_data());

        let mut packet = vec![0u8; PACKET_HEADER_SIZE];
        packet.extend_from_slice(&flags.to_le_bytes());
        packet.extend_from_slice(&(MAX_PACKET_SIZE as u32).to_le_bytes());
        packet.push(45); // utf8mb4
        packet.extend_from_slice(&[0u8; 23]);
        packet.extend_from_slice(dsn.user.as_bytes());
        packet.push(0);
        packet.push(auth_response.len() as u8);
        packet.extend_from_slice(&auth_response);
        if let Some(db) = &dsn.database {
            packet.extend_from_slice(db.as_bytes());
            packet.push(0);
        }
        packet.extend_from_slice(b"mysql_native_password\0");
        self.write_packet(packet).await?;

        let response = self.read_packet().await?;
        match response.first() {
            Some(0x00) => {
                debug!("authenticated");
                Ok(())
            }
            Some(0xFF) => Err(parse_err_packet(&response)),
            Some(0xFE) => self.auth_switch(&response, &dsn.password).await,
            other => Err(Error::protocol(format!(
                "unexpected authentication response header {other:?}"
            ))),
        }
    }

    /// Handle an auth-switch request; only `mysql_native_password` is
    /// supported on this connection.
    async fn auth_switch(&mut self, request: &[u8], password: &str) -> Result<()> {
        let mut buf = Buffer::new(&request[1..]);
        let plugin = String::from_utf8_lossy(buf.read_null_term_str()?).into_owned();
        if plugin != "mysql_native_password" {
            return Err(Error::protocol(format!(
                "server requires unsupported auth plugin {plugin:?}"
            )));
        }
        let salt = crate::codec::null_terminated(buf.read_eof()).to_vec();

        let mut packet = vec![0u8; PACKET_HEADER_SIZE];
        packet.extend_from_slice(&native_password_scramble(password, &salt));
        self.write_packet(packet).await?;

        let response = self.read_packet().await?;
        match response.first() {
            Some(0x00) => Ok(()),
            Some(0xFF) => Err(parse_err_packet(&response)),
            other => Err(Error::protocol(format!(
                "unexpected auth switch response header {other:?}"
            ))),
        }
    }
}

/// Split one complete frame off the front of the accumulation buffer.
fn split_frame(buf: &mut BytesMut) -> Option<(u8, Vec<u8>)> {
    if buf.len() < PACKET_HEADER_SIZE {
        return None;
    }
    let len = buf[0] as usize | (buf[1] as usize) << 8 | (buf[2] as usize) << 16;
    if buf.len() < PACKET_HEADER_SIZE + len {
        return None;
    }
    let seq = buf[3];
    buf.advance(PACKET_HEADER_SIZE);
    let payload = buf.split_to(len).to_vec();
    Some((seq, payload))
}

/// Classic EOF packet: 0xFE header with fewer than nine payload bytes.
fn is_eof_packet(packet: &[u8]) -> bool {
    packet.first() == Some(&0xFE) && packet.len() < 9
}

/// Decode an ERR packet into a protocol error carrying the server code
/// and message.
pub fn parse_err_packet(packet: &[u8]) -> Error {
    if packet.len() < 3 {
        return Error::protocol("truncated ERR packet");
    }
    let code = u16::from_le_bytes([packet[1], packet[2]]);
    // Protocol 4.1 inserts '#' + a five-byte SQL state before the message.
    let message = if packet.len() > 9 && packet[3] == b'#' {
        String::from_utf8_lossy(&packet[9..])
    } else {
        String::from_utf8_lossy(&packet[3..])
    };
    Error::protocol(format!("server error {code}: {message}"))
}

/// `SHA1(password) XOR SHA1(salt || SHA1(SHA1(password)))`
fn native_password_scramble(password: &str, salt: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(stage2);
    let stage3 = hasher.finalize();
    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// Initial handshake packet sent by the server.
#[derive(Debug)]
struct Handshake {
    server_version: String,
    connection_id: u32,
    auth_data_1: Vec<u8>,
    auth_data_2: Vec<u8>,
    auth_plugin_name: String,
    capabilities: u32,
}

impl Handshake {
    fn parse(data: &[u8]) -> Result<Self> {
        let mut buf = Buffer::new(data);
        let protocol_version = buf.read_u8()?;
        if protocol_version == 0xFF {
            return Err(parse_err_packet(data));
        }
        if protocol_version != 10 {
            return Err(Error::protocol(format!(
                "unsupported handshake protocol version {protocol_version}"
            )));
        }
        let server_version = String::from_utf8_lossy(buf.read_null_term_str()?).into_owned();
        let connection_id = buf.read_u32()?;
        let auth_data_1 = buf.read(8)?.to_vec();
        buf.skip(1)?; // filler
        let cap_low = buf.read_u16()? as u32;
        buf.skip(1)?; // character set
        buf.skip(2)?; // status flags
        let cap_high = buf.read_u16()? as u32;
        let capabilities = cap_high << 16 | cap_low;
        let auth_data_len = buf.read_u8()? as usize;
        buf.skip(10)?; // reserved

        // Part two: the longer of 13 bytes or the declared total minus
        // the eight bytes already read, NUL-padded.
        let part2_len = auth_data_len.saturating_sub(8).max(13);
        let auth_data_2 = crate::codec::null_terminated(buf.read(part2_len.min(buf.remaining()))?)
            .to_vec();

        let auth_plugin_name = if capabilities & capability::PLUGIN_AUTH != 0 {
            String::from_utf8_lossy(crate::codec::null_terminated(buf.read_eof())).into_owned()
        } else {
            String::new()
        };

        Ok(Handshake {
            server_version,
            connection_id,
            auth_data_1,
            auth_data_2,
            auth_plugin_name,
            capabilities,
        })
    }

    /// Full twenty-byte scramble salt.
    fn auth_data(&self) -> Vec<u8> {
        let mut data = self.auth_data_1.clone();
        data.extend_from_slice(&self.auth_data_2);
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dsn_parsing() {
        let dsn = Dsn::parse("repl:secret@db.internal:3307/shop").unwrap();
        assert_eq!(dsn.user, "repl");
        assert_eq!(dsn.password, "secret");
        assert_eq!(dsn.host, "db.internal");
        assert_eq!(dsn.port, 3307);
        assert_eq!(dsn.database.as_deref(), Some("shop"));
        assert_eq!(dsn.addr(), "db.internal:3307");

        let dsn = Dsn::parse("root@localhost").unwrap();
        assert_eq!(dsn.password, "");
        assert_eq!(dsn.port, 3306);
        assert_eq!(dsn.database, None);

        assert!(Dsn::parse("no-at-sign").is_err());
        assert!(Dsn::parse("user@host:notaport").is_err());
        assert!(Dsn::parse("@host").is_err());
    }

    #[test]
    fn test_split_frame() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[3, 0, 0, 7, b'a', b'b', b'c', 1, 0]);
        let (seq, payload) = split_frame(&mut buf).unwrap();
        assert_eq!(seq, 7);
        assert_eq!(payload, b"abc");
        // Remainder is an incomplete frame.
        assert!(split_frame(&mut buf).is_none());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_split_frame_waits_for_payload() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[5, 0, 0, 0, b'x']);
        assert!(split_frame(&mut buf).is_none());
        buf.extend_from_slice(b"yzab");
        let (_, payload) = split_frame(&mut buf).unwrap();
        assert_eq!(payload, b"xyzab");
    }

    #[test]
    fn test_err_packet_parsing() {
        let mut packet = vec![0xFF];
        packet.extend_from_slice(&1236u16.to_le_bytes());
        packet.push(b'#');
        packet.extend_from_slice(b"HY000");
        packet.extend_from_slice(b"Misconfigured master");
        let err = parse_err_packet(&packet);
        assert_eq!(
            err.to_string(),
            "protocol error: server error 1236: Misconfigured master"
        );
    }

    #[test]
    fn test_eof_detection() {
        assert!(is_eof_packet(&[0xFE, 0, 0, 0, 0]));
        assert!(!is_eof_packet(&[0x00]));
        // A long packet starting with 0xFE is data, not EOF.
        assert!(!is_eof_packet(&[0xFE; 12]));
    }

    #[test]
    fn test_native_password_scramble_shape() {
        assert!(native_password_scramble("", b"12345678").is_empty());
        let scramble = native_password_scramble("secret", b"0123456789abcdefghij");
        assert_eq!(scramble.len(), 20);
        // Scramble must depend on the salt.
        let other = native_password_scramble("secret", b"jihgfedcba9876543210");
        assert_ne!(scramble, other);
    }

    #[test]
    fn test_handshake_parse() {
        let mut data = vec![10];
        data.extend_from_slice(b"8.0.33\0");
        data.extend_from_slice(&99u32.to_le_bytes());
        data.extend_from_slice(b"abcdefgh");
        data.push(0);
        data.extend_from_slice(&((capability::PLUGIN_AUTH & 0xFFFF) as u16).to_le_bytes());
        data.push(45);
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&((capability::PLUGIN_AUTH >> 16) as u16).to_le_bytes());
        data.push(21);
        data.extend_from_slice(&[0u8; 10]);
        data.extend_from_slice(b"ijklmnopqrst\0");
        data.extend_from_slice(b"mysql_native_password\0");

        let handshake = Handshake::parse(&data).unwrap();
        assert_eq!(handshake.server_version, "8.0.33");
        assert_eq!(handshake.connection_id, 99);
        assert_eq!(handshake.auth_plugin_name, "mysql_native_password");
        assert_eq!(handshake.auth_data(), b"abcdefghijklmnopqrst");
        assert_ne!(handshake.capabilities & capability::PLUGIN_AUTH, 0);
    }
}
