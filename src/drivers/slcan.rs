//! Serial-line CAN (Lawicel ASCII protocol) transport.
//!
//! Frames arrive as `\r`-terminated lines: `tIIILDD..` for 11-bit ids and
//! `TIIIIIIIILDD..` for 29-bit ids, optionally followed by a 4-digit adapter
//! timestamp which is ignored in favour of the host clock.
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use crate::drivers::source::host_timestamp;
use crate::drivers::{FrameSource, TransportError};
use crate::types::RawFrame;

const SERIAL_BAUD: u32 = 115_200;
const READ_TIMEOUT: Duration = Duration::from_millis(50);
const MAX_LINE: usize = 64;
/// Virtual entry always offered next to real ports.
pub const SIMULATED_DEVICE: &str = "simulate";

/// Lawicel bitrate command for a CAN bitrate in bit/s.
pub fn bitrate_command(bitrate: u32) -> Option<&'static str> {
    Some(match bitrate {
        10_000 => "S0",
        20_000 => "S1",
        50_000 => "S2",
        100_000 => "S3",
        125_000 => "S4",
        250_000 => "S5",
        500_000 => "S6",
        800_000 => "S7",
        1_000_000 => "S8",
        _ => return None,
    })
}

fn malformed(line: &str, reason: &'static str) -> TransportError {
    TransportError::Malformed {
        line: line.to_owned(),
        reason,
    }
}

fn parse_hex(line: &str, digits: &str, reason: &'static str) -> Result<u32, TransportError> {
    u32::from_str_radix(digits, 16).map_err(|_| malformed(line, reason))
}

/// Parses one line (without the trailing `\r`).
///
/// Returns `Ok(None)` for acknowledgements, remote frames and other lines
/// that carry no data frame.
pub fn parse_line(line: &str, timestamp: f64) -> Result<Option<RawFrame>, TransportError> {
    let Some(kind) = line.chars().next() else {
        return Ok(None);
    };
    let (id_digits, extended) = match kind {
        't' => (3, false),
        'T' => (8, true),
        // Remote frames, acks and status replies carry no payload.
        _ => return Ok(None),
    };
    if !line.is_ascii() {
        return Err(malformed(line, "non-ascii characters"));
    }
    let header = 1 + id_digits + 1;
    if line.len() < header {
        return Err(malformed(line, "truncated header"));
    }
    let id = parse_hex(line, &line[1..1 + id_digits], "bad identifier")?;
    if (!extended && id > 0x7FF) || id > 0x1FFF_FFFF {
        return Err(malformed(line, "identifier out of range"));
    }
    let dlc = parse_hex(line, &line[1 + id_digits..header], "bad length")? as usize;
    if dlc > 8 {
        return Err(malformed(line, "length above 8"));
    }
    let data_end = header + dlc * 2;
    if line.len() < data_end {
        return Err(malformed(line, "truncated payload"));
    }
    let payload = (0..dlc)
        .map(|i| {
            let start = header + i * 2;
            parse_hex(line, &line[start..start + 2], "bad payload byte").map(|b| b as u8)
        })
        .collect::<Result<Vec<u8>, _>>()?;
    // Anything else must be the optional 16-bit adapter timestamp.
    let rest = line.len() - data_end;
    if rest != 0 && rest != 4 {
        return Err(malformed(line, "trailing characters"));
    }
    Ok(Some(RawFrame {
        id,
        extended,
        payload,
        timestamp,
    }))
}

/// Splits a byte stream into `\r`-terminated lines.
#[derive(Default)]
struct LineAssembler {
    buf: Vec<u8>,
}

impl LineAssembler {
    /// Feeds one byte; returns a finished line when `\r` arrives.
    fn push(&mut self, byte: u8) -> Option<String> {
        match byte {
            b'\r' => {
                let line = String::from_utf8_lossy(&self.buf).into_owned();
                self.buf.clear();
                Some(line)
            }
            // Bell = adapter error reply; \n may follow \r on some firmware.
            0x07 | b'\n' => None,
            _ => {
                if self.buf.len() < MAX_LINE {
                    self.buf.push(byte);
                }
                None
            }
        }
    }
}

/// Frame source backed by an SLCAN adapter on a serial port.
pub struct SlcanSource<P: Read + Write = Box<dyn serialport::SerialPort>> {
    port: P,
    lines: LineAssembler,
    scratch: [u8; 256],
    ready: std::collections::VecDeque<RawFrame>,
}

impl SlcanSource {
    /// Opens `path`, configures `bitrate` and opens the CAN channel.
    pub fn open(path: &str, bitrate: u32) -> Result<Self, TransportError> {
        let port = serialport::new(path, SERIAL_BAUD)
            .timeout(READ_TIMEOUT)
            .open()?;
        let mut source = Self::from_port(port);
        source.configure(bitrate)?;
        log::info!("slcan adapter opened: {path} at {bitrate} bit/s");
        Ok(source)
    }
}

impl<P: Read + Write> SlcanSource<P> {
    pub fn from_port(port: P) -> Self {
        Self {
            port,
            lines: LineAssembler::default(),
            scratch: [0; 256],
            ready: std::collections::VecDeque::new(),
        }
    }

    fn command(&mut self, cmd: &str) -> Result<(), TransportError> {
        self.port.write_all(cmd.as_bytes())?;
        self.port.write_all(b"\r")?;
        self.port.flush()?;
        Ok(())
    }

    fn configure(&mut self, bitrate: u32) -> Result<(), TransportError> {
        let speed =
            bitrate_command(bitrate).ok_or_else(|| TransportError::Rejected(format!("bitrate {bitrate}")))?;
        // Close first in case the adapter was left open by a previous session.
        self.command("C")?;
        self.command(speed)?;
        self.command("O")
    }

    /// Closes the CAN channel on the adapter.
    pub fn close(&mut self) -> Result<(), TransportError> {
        self.command("C")
    }
}

impl<P: Read + Write> FrameSource for SlcanSource<P> {
    fn next_frame(&mut self) -> Result<Option<RawFrame>, TransportError> {
        if let Some(frame) = self.ready.pop_front() {
            return Ok(Some(frame));
        }
        let read = match self.port.read(&mut self.scratch) {
            Ok(0) => return Err(TransportError::Closed),
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::TimedOut || err.kind() == ErrorKind::WouldBlock => {
                return Ok(None)
            }
            Err(err) => return Err(err.into()),
        };
        let timestamp = host_timestamp();
        // Good frames from this read stay queued even if a line is corrupt.
        let mut fault = None;
        for &byte in &self.scratch[..read] {
            let Some(line) = self.lines.push(byte) else {
                continue;
            };
            match parse_line(&line, timestamp) {
                Ok(Some(frame)) => self.ready.push_back(frame),
                Ok(None) => {}
                Err(err) => fault = fault.or(Some(err)),
            }
        }
        match fault {
            Some(err) => Err(err),
            None => Ok(self.ready.pop_front()),
        }
    }
}

impl<P: Read + Write> Drop for SlcanSource<P> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::debug!("failed to close slcan channel: {err}");
        }
    }
}

/// Serial devices that may host an adapter, plus the simulated entry.
pub fn list_ports() -> Vec<String> {
    let mut devices = match serialport::available_ports() {
        Ok(ports) => {
            log::info!("device scan found {} serial port(s)", ports.len());
            ports.into_iter().map(|p| p.port_name).collect()
        }
        Err(err) => {
            log::error!("error scanning serial ports: {err}");
            Vec::new()
        }
    };
    devices.push(SIMULATED_DEVICE.to_owned());
    devices
}
