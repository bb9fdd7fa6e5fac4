use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Selectable time windows; `None` shows the whole buffer.
pub const TIME_WINDOWS: &[(&str, Option<f64>)] = &[
    ("win_10s", Some(10.0)),
    ("win_30s", Some(30.0)),
    ("win_60s", Some(60.0)),
    ("win_120s", Some(120.0)),
    ("win_300s", Some(300.0)),
    ("win_all", None),
];

pub const REFRESH_RATES_HZ: &[u32] = &[5, 10, 20, 30];

pub const CAN_BITRATES: &[u32] = &[125_000, 250_000, 500_000, 1_000_000];

pub const MAX_PLOT_COUNT: usize = 4;

/// Looks up a window key such as `win_30s`.
pub fn window_seconds(key: &str) -> Option<Option<f64>> {
    TIME_WINDOWS
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, secs)| *secs)
}

pub fn window_label(seconds: Option<f64>) -> String {
    match seconds {
        Some(s) => format!("{s}s"),
        None => "All".to_owned(),
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ViewerConfig {
    /// Samples kept per channel.
    pub buffer_capacity: usize,
    pub refresh_hz: u32,
    /// Key into [`TIME_WINDOWS`].
    pub time_window: String,
    pub plot_count: usize,
    pub max_lines_per_plot: usize,
    /// Fraction of the visible value span added above and below.
    pub y_range_padding: f64,
    pub bitrate: u32,
    pub log_dir: Option<PathBuf>,
    pub replay_interval_ms: u64,
    pub replay_max_messages: usize,
    /// Write every raw frame to `record_dir` while a session runs.
    pub record: bool,
    pub record_dir: PathBuf,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 50_000,
            refresh_hz: 30,
            time_window: "win_30s".to_owned(),
            plot_count: 3,
            max_lines_per_plot: 10,
            y_range_padding: 50e-3,
            bitrate: 500_000,
            log_dir: Some(PathBuf::from("logs")),
            replay_interval_ms: 10,
            replay_max_messages: 5,
            record: false,
            record_dir: PathBuf::from("recordings"),
        }
    }
}

impl ViewerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity == 0 {
            bail!("buffer_capacity must be greater than zero");
        }
        if !REFRESH_RATES_HZ.contains(&self.refresh_hz) {
            bail!(
                "refresh_hz {} not one of {:?}",
                self.refresh_hz,
                REFRESH_RATES_HZ
            );
        }
        if window_seconds(&self.time_window).is_none() {
            bail!("unknown time window {:?}", self.time_window);
        }
        if !CAN_BITRATES.contains(&self.bitrate) {
            bail!("bitrate {} not one of {:?}", self.bitrate, CAN_BITRATES);
        }
        if !(1..=MAX_PLOT_COUNT).contains(&self.plot_count) {
            bail!("plot_count must be between 1 and {MAX_PLOT_COUNT}");
        }
        if self.max_lines_per_plot == 0 {
            bail!("max_lines_per_plot must be greater than zero");
        }
        if !(0.0..1.0).contains(&self.y_range_padding) {
            bail!("y_range_padding must be in [0, 1)");
        }
        Ok(())
    }

    /// Window length for the configured key; `None` is full history.
    pub fn window(&self) -> Option<f64> {
        window_seconds(&self.time_window).flatten()
    }

    /// Recording directory when recording is enabled.
    pub fn recording(&self) -> Option<PathBuf> {
        self.record.then(|| self.record_dir.clone())
    }
}
