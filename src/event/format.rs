//! FormatDescription event: binlog version, server version, per-event
//! post-header lengths, and the checksum algorithm in effect.

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::event::EventType;

/// Checksum algorithm declared by the server for this stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumAlgorithm {
    None,
    Crc32,
    #[default]
    Undefined,
}

impl From<u8> for ChecksumAlgorithm {
    fn from(v: u8) -> Self {
        match v {
            0x00 => Self::None,
            0x01 => Self::Crc32,
            _ => Self::Undefined,
        }
    }
}

/// Server flavor and numeric version recovered from the version string.
#[derive(Debug, Clone, Default)]
pub struct ServerDetails {
    pub flavor: Flavor,
    /// `major * 10000 + minor * 100 + patch`, e.g. 5.7.19 is 50719.
    pub version: u32,
    pub checksum_algorithm: ChecksumAlgorithm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Flavor {
    #[default]
    MySql,
}

/// Description of the binary log format, taken from the first event in
/// the stream and immutable afterwards.
#[derive(Debug, Clone, Default)]
pub struct FormatDescription {
    pub version: u16,
    pub server_version: String,
    pub create_timestamp: u32,
    pub event_header_length: u8,
    /// Post-header length per event type, indexed by `EventType - 1`.
    pub event_type_header_lengths: Vec<u8>,
    pub server_details: ServerDetails,
}

/// Versions newer than this append `algorithm(1) || checksum(4)` to the
/// FormatDescription body.
const CHECKSUM_VERSION_CUTOFF: u32 = 50601;

const DEFAULT_HEADER_LENGTH: usize = 19;

impl FormatDescription {
    /// Decode a FormatDescription event body.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut buf = Buffer::new(data);
        let version = buf.read_u16()?;
        let server_version =
            String::from_utf8_lossy(crate::codec::null_terminated(buf.read(50)?)).into_owned();
        let create_timestamp = buf.read_u32()?;
        let event_header_length = buf.read_u8()?;
        let mut event_type_header_lengths = buf.read_eof().to_vec();

        let numeric_version = parse_version_number(&server_version);
        let mut checksum_algorithm = ChecksumAlgorithm::Undefined;
        if numeric_version > CHECKSUM_VERSION_CUTOFF {
            if data.len() < 5 || event_type_header_lengths.len() < 5 {
                return Err(Error::protocol(
                    "format description too short for checksum trailer",
                ));
            }
            checksum_algorithm = ChecksumAlgorithm::from(data[data.len() - 5]);
            let trimmed = event_type_header_lengths.len() - 5;
            event_type_header_lengths.truncate(trimmed);
        }

        Ok(FormatDescription {
            version,
            server_version,
            create_timestamp,
            event_header_length,
            event_type_header_lengths,
            server_details: ServerDetails {
                flavor: Flavor::MySql,
                version: numeric_version,
                checksum_algorithm,
            },
        })
    }

    /// Event header length in bytes; 19 unless declared otherwise.
    pub fn header_len(&self) -> usize {
        if self.event_header_length > 0 {
            self.event_header_length as usize
        } else {
            DEFAULT_HEADER_LENGTH
        }
    }

    /// Post-header length for the given event type, zero when unknown.
    pub fn post_header_len(&self, event_type: EventType) -> usize {
        let idx = event_type as usize;
        if idx == 0 {
            return 0;
        }
        self.event_type_header_lengths
            .get(idx - 1)
            .copied()
            .unwrap_or(0) as usize
    }

    /// Table ID width for the given event type: a post-header of exactly
    /// six bytes means the ID is stored in four.
    pub fn table_id_size(&self, event_type: EventType) -> usize {
        if self.post_header_len(event_type) == 6 {
            4
        } else {
            6
        }
    }
}

/// Numeric server version the way `mysql_get_server_version` computes it:
/// `5.7.19-log` becomes 50719.
pub fn parse_version_number(v: &str) -> u32 {
    let mut parts = v.splitn(3, '.').map(|token| {
        let digits: String = token.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse::<u32>().unwrap_or(0)
    });
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    let patch = parts.next().unwrap_or(0);
    major * 10000 + minor * 100 + patch
}
