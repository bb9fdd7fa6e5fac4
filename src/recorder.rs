// src/recorder.rs
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::drivers::ManualSource;
use crate::types::RawFrame;

/// Interface name written on every line.
const CHANNEL: &str = "can0";

/// One candump-style log line: `(1700000000.123456) can0 123#DEADBEEF`.
pub fn format_line(frame: &RawFrame) -> String {
    let id = if frame.extended {
        format!("{:08X}", frame.id)
    } else {
        format!("{:03X}", frame.id)
    };
    let data: String = frame.payload.iter().map(|b| format!("{b:02X}")).collect();
    format!("({:.6}) {CHANNEL} {id}#{data}", frame.timestamp)
}

/// Reads back a line written by [`format_line`]; anything else is `None`.
pub fn parse_line(line: &str) -> Option<RawFrame> {
    let (stamp, rest) = line.trim().strip_prefix('(')?.split_once(") ")?;
    let timestamp: f64 = stamp.parse().ok()?;
    let (_, frame) = rest.split_once(' ')?;
    let (id, data) = frame.split_once('#')?;
    if data.len() % 2 != 0 || data.len() > 16 {
        return None;
    }
    let payload = (0..data.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(data.get(i..i + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    Some(RawFrame {
        id: u32::from_str_radix(id, 16).ok()?,
        extended: id.len() > 3,
        payload,
        timestamp,
    })
}

/// Loads a recording for playback. Unreadable lines are skipped.
pub fn open_replay(path: &Path) -> io::Result<ManualSource> {
    let reader = BufReader::new(File::open(path)?);
    let mut source = ManualSource::new(Vec::new());
    let (mut frames, mut skipped) = (0usize, 0usize);
    for line in reader.lines() {
        match parse_line(&line?) {
            Some(frame) => {
                source.push(frame);
                frames += 1;
            }
            None => skipped += 1,
        }
    }
    log::info!("replaying {frames} frames from {}", path.display());
    if skipped > 0 {
        log::warn!("replay skipped {skipped} unreadable lines");
    }
    Ok(source)
}

/// Writes every raw frame pulled from the transport to a log file.
pub struct FrameRecorder<W: Write = BufWriter<File>> {
    writer: W,
    frames: u64,
}

impl FrameRecorder {
    /// Creates `dir/can_recording_<unix-seconds>.log`.
    pub fn create(dir: &Path) -> io::Result<(Self, PathBuf)> {
        fs::create_dir_all(dir)?;
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let path = dir.join(format!("can_recording_{stamp}.log"));
        let file = File::create(&path)?;
        log::info!("recording to {}", path.display());
        Ok((Self::new(BufWriter::new(file)), path))
    }
}

impl<W: Write> FrameRecorder<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, frames: 0 }
    }

    pub fn record(&mut self, frame: &RawFrame) -> io::Result<()> {
        writeln!(self.writer, "{}", format_line(frame))?;
        self.frames += 1;
        Ok(())
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Flushes and hands back the writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}
