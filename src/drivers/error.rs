use thiserror::Error;

/// Construction-time store configuration errors. These are fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("ring buffer capacity must be greater than zero")]
    CapacityInvalid,
}

/// A resolved frame whose payload could not be turned into physical values.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    #[error("payload too short: signal needs {needed} bytes, frame has {actual}")]
    PayloadTooShort { needed: usize, actual: usize },
    #[error("signal {signal} out of range: {value} not in [{minimum}, {maximum}]")]
    OutOfRange {
        signal: String,
        value: f64,
        minimum: f64,
        maximum: f64,
    },
    #[error("value {value} cannot be encoded into signal {signal}")]
    Unencodable { signal: String, value: f64 },
}

/// Errors raised while loading a signal database.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read schema: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse schema: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("duplicate frame id 0x{0:X}")]
    DuplicateId(u32),
    #[error("signal {signal} in {message} does not fit a {length}-byte frame")]
    SignalOutsideFrame {
        message: String,
        signal: String,
        length: usize,
    },
    #[error("signal {signal} in {message} has invalid width {bits}")]
    InvalidWidth {
        message: String,
        signal: String,
        bits: u32,
    },
    #[error("signal {signal} in {message} has a zero scale factor")]
    ZeroFactor { message: String, signal: String },
}

/// Faults raised by the frame transport. Forwarded verbatim, never retried here.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("malformed frame line {line:?}: {reason}")]
    Malformed { line: String, reason: &'static str },
    #[error("adapter rejected command {0:?}")]
    Rejected(String),
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Whether the link is gone. A malformed line is reported but the
    /// stream can continue past it.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::Malformed { .. })
    }
}
