//! Decode database: maps a raw frame id to a message layout and turns
//! payload bytes into named physical values.
//!
//! The core only depends on the [`Schema`] and [`MessageDescriptor`] traits.
//! [`SignalDatabase`] is the JSON-backed implementation shipped with the
//! viewer. Bit numbering follows the DBC convention: Intel signals give the
//! position of their least significant bit, Motorola signals the position of
//! their most significant bit in the sawtooth layout.
use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::drivers::{DecodeError, SchemaError};

/// Decoded `(signal name, physical value)` pairs in layout order.
pub type DecodedSignals<'a> = Vec<(&'a str, f64)>;

pub trait MessageDescriptor {
    fn decode(&self, payload: &[u8]) -> Result<DecodedSignals<'_>, DecodeError>;
}

pub trait Schema {
    type Message: MessageDescriptor;

    fn resolve(&self, raw_id: u32) -> Option<&Self::Message>;
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    #[default]
    LittleEndian,
    BigEndian,
}

fn default_factor() -> f64 {
    1.0
}

#[derive(Clone, Debug, Deserialize)]
pub struct SignalSpec {
    pub name: String,
    pub start_bit: u32,
    pub length: u32,
    #[serde(default)]
    pub byte_order: ByteOrder,
    #[serde(default)]
    pub signed: bool,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub minimum: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
}

impl SignalSpec {
    /// Payload bit positions covered by the signal, most significant first.
    fn bit_positions(&self) -> Vec<u32> {
        match self.byte_order {
            ByteOrder::LittleEndian => (0..self.length)
                .rev()
                .map(|i| self.start_bit + i)
                .collect(),
            ByteOrder::BigEndian => {
                let mut positions = Vec::with_capacity(self.length as usize);
                let mut pos = self.start_bit;
                for i in 0..self.length {
                    positions.push(pos);
                    if i + 1 == self.length {
                        break;
                    }
                    if pos % 8 == 0 {
                        pos += 15;
                    } else {
                        pos -= 1;
                    }
                }
                positions
            }
        }
    }

    /// Number of payload bytes needed to cover the signal.
    fn bytes_needed(&self) -> usize {
        self.bit_positions()
            .iter()
            .map(|&bit| bit as usize / 8 + 1)
            .max()
            .unwrap_or(0)
    }

    fn extract_raw(&self, payload: &[u8]) -> u64 {
        let mut raw = 0u64;
        for bit in self.bit_positions() {
            let byte = payload[bit as usize / 8];
            raw = (raw << 1) | u64::from((byte >> (bit % 8)) & 1);
        }
        raw
    }

    fn insert_raw(&self, payload: &mut [u8], raw: u64) {
        let positions = self.bit_positions();
        let width = positions.len();
        for (i, bit) in positions.into_iter().enumerate() {
            let value = (raw >> (width - 1 - i)) & 1;
            let byte = &mut payload[bit as usize / 8];
            let mask = 1u8 << (bit % 8);
            if value == 1 {
                *byte |= mask;
            } else {
                *byte &= !mask;
            }
        }
    }

    fn to_physical(&self, raw: u64) -> f64 {
        let integer = if self.signed && self.length < 64 && (raw >> (self.length - 1)) & 1 == 1 {
            (raw | (u64::MAX << self.length)) as i64 as f64
        } else if self.signed {
            raw as i64 as f64
        } else {
            raw as f64
        };
        integer * self.factor + self.offset
    }

    fn check_range(&self, value: f64) -> Result<(), DecodeError> {
        let minimum = self.minimum.unwrap_or(f64::NEG_INFINITY);
        let maximum = self.maximum.unwrap_or(f64::INFINITY);
        if value < minimum || value > maximum {
            return Err(DecodeError::OutOfRange {
                signal: self.name.clone(),
                value,
                minimum,
                maximum,
            });
        }
        Ok(())
    }

    fn to_raw(&self, value: f64) -> Result<u64, DecodeError> {
        let unencodable = || DecodeError::Unencodable {
            signal: self.name.clone(),
            value,
        };
        if !value.is_finite() || self.check_range(value).is_err() {
            return Err(unencodable());
        }
        // Nearest grid point first; a bound that is off the raw grid may
        // need the neighbour on the inner side.
        let exact = (value - self.offset) / self.factor;
        let scaled = [exact.round(), exact.floor(), exact.ceil()]
            .into_iter()
            .find(|raw| self.check_range(raw * self.factor + self.offset).is_ok())
            .ok_or_else(unencodable)?;
        let bits = self.length;
        if self.signed {
            let (lo, hi) = if bits == 64 {
                (i64::MIN as f64, i64::MAX as f64)
            } else {
                (-((1i64 << (bits - 1)) as f64), ((1i64 << (bits - 1)) - 1) as f64)
            };
            if scaled < lo || scaled > hi {
                return Err(unencodable());
            }
            let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
            Ok((scaled as i64 as u64) & mask)
        } else {
            let hi = if bits == 64 {
                u64::MAX as f64
            } else {
                ((1u64 << bits) - 1) as f64
            };
            if scaled < 0.0 || scaled > hi {
                return Err(unencodable());
            }
            Ok(scaled as u64)
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct MessageSpec {
    pub name: String,
    pub id: u32,
    #[serde(default)]
    pub extended: bool,
    #[serde(default = "default_length")]
    pub length: usize,
    pub signals: Vec<SignalSpec>,
}

fn default_length() -> usize {
    8
}

impl MessageSpec {
    fn validate(&self) -> Result<(), SchemaError> {
        for signal in &self.signals {
            if signal.length == 0 || signal.length > 64 {
                return Err(SchemaError::InvalidWidth {
                    message: self.name.clone(),
                    signal: signal.name.clone(),
                    bits: signal.length,
                });
            }
            if signal.factor == 0.0 {
                return Err(SchemaError::ZeroFactor {
                    message: self.name.clone(),
                    signal: signal.name.clone(),
                });
            }
            let fits = match signal.byte_order {
                ByteOrder::LittleEndian => {
                    (signal.start_bit + signal.length) as usize <= self.length * 8
                }
                // Walking the sawtooth past bit 7 of the last byte lands
                // beyond the frame, which bytes_needed reports.
                ByteOrder::BigEndian => {
                    (signal.start_bit as usize) < self.length * 8
                        && signal.bytes_needed() <= self.length
                }
            };
            if !fits {
                return Err(SchemaError::SignalOutsideFrame {
                    message: self.name.clone(),
                    signal: signal.name.clone(),
                    length: self.length,
                });
            }
        }
        Ok(())
    }

    /// Packs physical values into a payload; signals missing from `values`
    /// are encoded as zero raw. Values outside a signal's declared range
    /// are rejected.
    pub fn encode(&self, values: &HashMap<&str, f64>) -> Result<Vec<u8>, DecodeError> {
        let mut payload = vec![0u8; self.length];
        for signal in &self.signals {
            let raw = match values.get(signal.name.as_str()) {
                Some(&value) => signal.to_raw(value)?,
                None => 0,
            };
            signal.insert_raw(&mut payload, raw);
        }
        Ok(payload)
    }
}

impl MessageDescriptor for MessageSpec {
    fn decode(&self, payload: &[u8]) -> Result<DecodedSignals<'_>, DecodeError> {
        let mut decoded = Vec::with_capacity(self.signals.len());
        for signal in &self.signals {
            let needed = signal.bytes_needed();
            if payload.len() < needed {
                return Err(DecodeError::PayloadTooShort {
                    needed,
                    actual: payload.len(),
                });
            }
            let value = signal.to_physical(signal.extract_raw(payload));
            signal.check_range(value)?;
            decoded.push((signal.name.as_str(), value));
        }
        Ok(decoded)
    }
}

#[derive(Deserialize)]
struct DatabaseFile {
    messages: Vec<MessageSpec>,
}

/// JSON-backed signal database.
pub struct SignalDatabase {
    messages: Vec<MessageSpec>,
    by_id: HashMap<u32, usize>,
}

impl SignalDatabase {
    pub fn from_messages(messages: Vec<MessageSpec>) -> Result<Self, SchemaError> {
        let mut by_id = HashMap::with_capacity(messages.len());
        for (idx, message) in messages.iter().enumerate() {
            message.validate()?;
            if by_id.insert(message.id, idx).is_some() {
                return Err(SchemaError::DuplicateId(message.id));
            }
        }
        Ok(Self { messages, by_id })
    }

    pub fn from_json(text: &str) -> Result<Self, SchemaError> {
        let file: DatabaseFile = serde_json::from_str(text)?;
        Self::from_messages(file.messages)
    }

    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let text = std::fs::read_to_string(path)?;
        let db = Self::from_json(&text)?;
        log::info!(
            "schema loaded: {} ({} messages)",
            path.display(),
            db.messages.len()
        );
        Ok(db)
    }

    pub fn messages(&self) -> &[MessageSpec] {
        &self.messages
    }
}

impl Schema for SignalDatabase {
    type Message = MessageSpec;

    fn resolve(&self, raw_id: u32) -> Option<&MessageSpec> {
        self.by_id.get(&raw_id).map(|&idx| &self.messages[idx])
    }
}
