use std::fmt;

/// Crate-wide error taxonomy. Each variant carries enough context for a log
/// line; none of them carry a nested error trait object, matching the rest of
/// the core (no dynamic error chaining is needed at this layer).
#[derive(Debug)]
pub enum Error {
    /// A document path was required and a collection path was given, or vice versa.
    InvalidPath(String),
    /// `get`/`delete` found no value at the given key.
    NotFound(String),
    /// An I/O or transaction failure surfaced by the key-value engine.
    EngineError(String),
    /// A frame or item payload was not valid JSON where JSON was required.
    DecodeError(String),
    /// An incoming WebSocket frame was not a text frame, or had no recognizable operation.
    ProtocolError(String),
    /// A read failed on the WebSocket itself; the session must tear down.
    ConnectionError(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidPath(msg) => write!(f, "invalid path: {msg}"),
            Error::NotFound(msg) => write!(f, "not found: {msg}"),
            Error::EngineError(msg) => write!(f, "engine error: {msg}"),
            Error::DecodeError(msg) => write!(f, "decode error: {msg}"),
            Error::ProtocolError(msg) => write!(f, "protocol error: {msg}"),
            Error::ConnectionError(msg) => write!(f, "connection error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::DecodeError(err.to_string())
    }
}

impl Error {
    /// A short machine-readable code, used in logs and in outgoing error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidPath(_) => "E-STORE-INVALIDPATH",
            Error::NotFound(_) => "E-STORE-NOTFOUND",
            Error::EngineError(_) => "E-STORE-ENGINE",
            Error::DecodeError(_) => "E-STORE-DECODE",
            Error::ProtocolError(_) => "E-STORE-PROTOCOL",
            Error::ConnectionError(_) => "E-STORE-CONNECTION",
        }
    }
}
