use std::io;

use thiserror::Error;

/// The broad category of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    InvalidArgument,
    Connect,
    Timeout,
    Protocol,
    Decode,
    Io,
}

#[derive(Error, Debug)]
pub enum PingError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("could not connect to {addr}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out during {0}")]
    Timeout(&'static str),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("IO error during ping")]
    Io(#[source] io::Error),
}

impl PingError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PingError::InvalidArgument(_) => FailureKind::InvalidArgument,
            PingError::Connect { .. } => FailureKind::Connect,
            PingError::Timeout(_) => FailureKind::Timeout,
            PingError::Protocol(_) => FailureKind::Protocol,
            PingError::Decode(_) => FailureKind::Decode,
            PingError::Io(_) => FailureKind::Io,
        }
    }

    /// Classifies a failed connection attempt; running out of time is a timeout.
    pub(crate) fn connect(addr: impl ToString, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => PingError::Timeout("connect"),
            _ => PingError::Connect {
                addr: addr.to_string(),
                source,
            },
        }
    }

    /// Classifies an I/O error raised while talking to an already connected peer.
    pub(crate) fn from_io(stage: &'static str, e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => PingError::Timeout(stage),
            io::ErrorKind::UnexpectedEof => {
                PingError::Protocol(ProtocolViolation::Truncated(stage))
            }
            _ => PingError::Io(e),
        }
    }
}

/// The server answered, but not in the shape the protocol requires.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("reply too short ({0} bytes)")]
    ShortReply(usize),

    #[error("received packet type {actual:#04x}, expected {expected:#04x}")]
    WrongType { expected: u8, actual: u8 },

    #[error("challenge token {0:?} is not a number")]
    BadChallenge(String),

    #[error("player list marker found {0} times, expected exactly once")]
    Sentinel(usize),

    #[error("declared response length {0} is too small for a status response")]
    UndersizedResponse(i32),

    #[error("declared payload length {0} is negative")]
    NegativeLength(i32),

    #[error("payload length {payload} does not fit a {total}-byte response")]
    PayloadExceedsFrame { total: i32, payload: i32 },

    #[error("connection closed during {0}")]
    Truncated(&'static str),
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("VarInt too large!")]
    VarIntTooLarge,

    #[error("JSON parse error")]
    Json(#[from] serde_json::Error),

    #[error("status response is missing `{0}`")]
    MissingField(&'static str),
}
