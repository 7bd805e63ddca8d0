use std::io;

use thiserror::Error;

/// Why a buffer could not be decoded as a ClientHello record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// More bytes are needed before a decision can be made.
    #[error("incomplete TLS record")]
    Incomplete,

    /// A length field points past the bytes that are actually there.
    #[error("truncated {field}")]
    Truncated { field: &'static str },

    #[error("malformed ClientHello: {0}")]
    Malformed(&'static str),

    #[error("not a TLS handshake record (content type {0:#04x})")]
    NotHandshakeRecord(u8),

    #[error("not a ClientHello (handshake type {0:#04x})")]
    NotClientHello(u8),

    #[error("TLS record too large: {len} > {max}")]
    RecordTooLarge { len: usize, max: usize },
}

impl ParseError {
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ParseError::Incomplete)
    }

    /// Traffic that is simply something other than a ClientHello, as opposed
    /// to a ClientHello that is broken.
    pub fn is_foreign_traffic(&self) -> bool {
        matches!(
            self,
            ParseError::NotHandshakeRecord(_)
                | ParseError::NotClientHello(_)
                | ParseError::RecordTooLarge { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("session id is {0} bytes, at most 255 allowed")]
    SessionIdTooLong(usize),

    #[error("{field} length {len} does not fit its length field")]
    LengthOverflow { field: &'static str, len: usize },
}

#[derive(Debug, Error)]
pub enum InjectError {
    #[error("invalid packet header: {0}")]
    Header(&'static str),

    #[error("rebuilt packet would be {0} bytes")]
    PacketTooLarge(usize),

    #[error("re-encoding ClientHello failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("capture device write failed: {0}")]
    Device(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("ClientHello carries no server name, nowhere to connect")]
    DestinationUnresolved,

    #[error("no complete TLS record within {0}s")]
    FirstRecordTimeout(u64),

    #[error("first record is not an interceptable ClientHello: {0}")]
    NotInterceptable(ParseError),
}
