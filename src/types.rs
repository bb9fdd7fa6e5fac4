// src/types.rs
use crate::drivers::TransportError;

/// One raw transport-level frame.
#[derive(Clone, Debug, PartialEq)]
pub struct RawFrame {
    pub id: u32,
    pub extended: bool,
    pub payload: Vec<u8>,
    /// Absolute capture time in seconds.
    pub timestamp: f64,
}

impl RawFrame {
    pub fn new(id: u32, payload: impl Into<Vec<u8>>, timestamp: f64) -> Self {
        Self {
            id,
            extended: id > 0x7FF,
            payload: payload.into(),
            timestamp,
        }
    }
}

/// Messages sent from the ingest thread to the viewer.
#[derive(Debug)]
pub enum StreamEvent {
    /// Channels seen for the first time, one batch per frame.
    NewChannels(Vec<String>),
    /// Transport-level fault, forwarded as received.
    TransportFault(TransportError),
    /// The ingest loop has exited.
    Stopped,
}
