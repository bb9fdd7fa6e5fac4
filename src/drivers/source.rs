use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::drivers::schema::{MessageSpec, SignalSpec};
use crate::drivers::{SignalDatabase, TransportError};
use crate::types::RawFrame;

/// Something that yields raw frames on demand.
///
/// `Ok(None)` means nothing is available right now; the caller may poll
/// again. An error is a transport-level fault.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<RawFrame>, TransportError>;
}

/// In-memory source useful for tests and deterministic playback.
pub struct ManualSource {
    queue: VecDeque<RawFrame>,
}

impl ManualSource {
    pub fn new(frames: impl IntoIterator<Item = RawFrame>) -> Self {
        Self {
            queue: frames.into_iter().collect(),
        }
    }

    pub fn push(&mut self, frame: RawFrame) {
        self.queue.push_back(frame);
    }
}

impl FrameSource for ManualSource {
    fn next_frame(&mut self) -> Result<Option<RawFrame>, TransportError> {
        Ok(self.queue.pop_front())
    }
}

/// Host wall clock in seconds, used as the absolute capture timestamp.
pub fn host_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

const DEFAULT_MIDPOINT: f64 = 50.0;
const DEFAULT_AMPLITUDE: f64 = 50.0;
const MIN_AMPLITUDE: f64 = 1.0;

/// Midpoint and amplitude of the sine driven through a signal.
fn signal_range(signal: &SignalSpec) -> (f64, f64) {
    match (signal.minimum, signal.maximum) {
        (Some(min), Some(max)) => {
            let amp = (max - min) / 2.0;
            let amp = if amp == 0.0 { MIN_AMPLITUDE } else { amp };
            ((min + max) / 2.0, amp)
        }
        _ => (DEFAULT_MIDPOINT, DEFAULT_AMPLITUDE),
    }
}

/// Stable per-name spread so each trace gets its own frequency.
fn name_spread(name: &str) -> u32 {
    name.bytes().fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b))) % 7
}

/// Hardware-free producer: encodes sine waves through the schema so the
/// decoder sees the same bytes real hardware would send.
pub struct SyntheticSource {
    messages: Vec<MessageSpec>,
    interval: Duration,
    noise: f64,
    pending: VecDeque<RawFrame>,
    next_round: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(db: &SignalDatabase, max_messages: usize, interval: Duration) -> Self {
        let messages: Vec<MessageSpec> =
            db.messages().iter().take(max_messages).cloned().collect();
        log::info!(
            "synthetic source: replaying {}/{} messages",
            messages.len(),
            db.messages().len()
        );
        Self {
            messages,
            interval,
            noise: 0.0,
            pending: VecDeque::new(),
            next_round: None,
        }
    }

    /// Adds uniform noise of +/- `amplitude` (as a fraction of each
    /// signal's amplitude) on top of the sine.
    pub fn with_noise(mut self, amplitude: f64) -> Self {
        self.noise = amplitude.abs();
        self
    }

    /// One frame per replayed message, sampled at absolute time `t`.
    pub fn frames_at(&self, t: f64) -> Vec<RawFrame> {
        let mut rng = rand::thread_rng();
        let mut frames = Vec::with_capacity(self.messages.len());
        for (idx, message) in self.messages.iter().enumerate() {
            let mut values: HashMap<&str, f64> = HashMap::with_capacity(message.signals.len());
            for signal in &message.signals {
                let (mid, amp) = signal_range(signal);
                let freq = 0.1 * (idx + 1) as f64 + 0.05 * f64::from(name_spread(&signal.name));
                let mut value = mid + amp * (t * 2.0 * std::f64::consts::PI * freq).sin();
                if self.noise > 0.0 {
                    value += amp * rng.gen_range(-self.noise..=self.noise);
                }
                // Keep noise and rounding inside what the schema accepts.
                if let Some(min) = signal.minimum {
                    value = value.max(min);
                }
                if let Some(max) = signal.maximum {
                    value = value.min(max);
                }
                values.insert(signal.name.as_str(), value);
            }
            match message.encode(&values) {
                Ok(payload) => frames.push(RawFrame {
                    id: message.id,
                    extended: message.extended,
                    payload,
                    timestamp: t,
                }),
                Err(err) => log::debug!("synthetic encode error for {}: {err}", message.name),
            }
        }
        frames
    }
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> Result<Option<RawFrame>, TransportError> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(Some(frame));
        }
        let now = Instant::now();
        if self.next_round.is_some_and(|due| now < due) {
            return Ok(None);
        }
        self.next_round = Some(now + self.interval);
        self.pending.extend(self.frames_at(host_timestamp()));
        Ok(self.pending.pop_front())
    }
}
