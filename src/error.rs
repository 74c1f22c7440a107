//! Error types for the binlog replication client.
//!
//! Every fallible operation in this crate returns [`crate::Result`]. The
//! variants follow the propagation policy of the reader: `Decode` and
//! `UnknownTableId` are scoped to a single event, `Protocol` poisons the
//! reader, `EndOfStream` is a distinguished terminal value.

use thiserror::Error;

/// Errors surfaced by the replication client.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport read/write failure or peer close.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected packet header byte, truncated event, or any other
    /// violation of the wire protocol. Poisons the reader.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A rows event referenced a table ID that is not in the table map
    /// cache. The stream was likely resumed mid-transaction.
    #[error("unknown table id: {0}")]
    UnknownTableId(u64),

    /// A column value or event body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Deadline elapsed while waiting for a packet. The reader state is
    /// untouched and the call may be retried.
    #[error("read timed out")]
    Timeout,

    /// The server sent an EOF packet ending the dump.
    #[error("end of binlog stream")]
    EndOfStream,

    /// Schema enrichment metadata could not be fetched or applied.
    #[error("schema error: {0}")]
    Schema(String),
}

impl Error {
    /// Create a new protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a new decode error.
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a new schema error.
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// True for errors that end the session rather than a single event.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Protocol(_) | Self::EndOfStream)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::protocol("bad header").is_fatal());
        assert!(Error::EndOfStream.is_fatal());
        assert!(!Error::decode("bad decimal").is_fatal());
        assert!(!Error::UnknownTableId(7).is_fatal());
        assert!(!Error::Timeout.is_fatal());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            Error::UnknownTableId(108).to_string(),
            "unknown table id: 108"
        );
        assert_eq!(Error::Timeout.to_string(), "read timed out");
    }
}
