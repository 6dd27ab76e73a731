use std::fmt::Display;
use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A symbol id in the payload has no entry in the session's table. Either the stream is
    /// corrupt or the reader's session was built from a different writer's history.
    #[error("symbol lookup failed: {0}")]
    Lookup(#[from] SymbolError),
    #[error("malformed session block: {0}")]
    MalformedSessionBlock(String),
    #[error("malformed payload at offset {offset}: {reason}")]
    MalformedPayload { offset: usize, reason: String },
    #[error("{0} unread bytes remain after the payload")]
    TrailingBytes(usize),
    #[error("record frame of {0} bytes exceeds the u32 length prefix")]
    FrameTooLarge(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("{0}")]
    Message(String),
}

impl Error {
    /// Only I/O failures may succeed on a retry, after the caller repositions the stream.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Io(_))
    }

    pub(crate) fn malformed_payload(offset: usize, reason: impl Display) -> Self {
        Error::MalformedPayload {
            offset,
            reason: reason.to_string(),
        }
    }
}

impl serde::ser::Error for Error {
    fn custom<T: Display>(msg: T) -> Self {
        Error::Message(msg.to_string())
    }
}

impl serde::de::Error for Error {
    fn custom<T: Display>(msg: T) -> Self {
        Error::Message(msg.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SymbolError {
    #[error("symbol id {symbol_id} is not below the table size {table_size}")]
    UnknownId { symbol_id: usize, table_size: usize },
    #[error("symbol id {0} does not fit in a machine word")]
    IdOverflow(u128),
}
