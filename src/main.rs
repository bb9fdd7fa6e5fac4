// src/main.rs
#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]
mod config;
mod drivers;
mod engine;
mod gui;
mod logging;
mod recorder;
mod types;

use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use eframe::egui;

use crate::config::{window_seconds, ViewerConfig};
use crate::drivers::slcan::SIMULATED_DEVICE;
use crate::drivers::{list_ports, ChannelStore, Layout, TickSchedule, WindowedConsumer};
use crate::engine::{Session, SessionSettings, Transport};
use crate::types::StreamEvent;

/// Live CAN telemetry viewer.
#[derive(Parser, Debug)]
#[command(name = "canscope", version, about)]
struct Cli {
    /// Viewer settings (JSON); missing fields take defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Signal database (JSON).
    #[arg(long, required_unless_present = "list_ports")]
    schema: Option<PathBuf>,

    /// Serial device of an SLCAN adapter.
    #[arg(long, conflicts_with = "simulate")]
    port: Option<String>,

    /// Use the synthetic producer (default when no port is given).
    #[arg(long)]
    simulate: bool,

    #[arg(long)]
    bitrate: Option<u32>,

    /// Time window key, e.g. `win_30s` or `win_all`.
    #[arg(long)]
    window: Option<String>,

    #[arg(long)]
    refresh_hz: Option<u32>,

    /// Samples kept per channel.
    #[arg(long)]
    capacity: Option<usize>,

    /// Run without a window and log a summary every second.
    #[arg(long)]
    headless: bool,

    /// Headless run time in seconds.
    #[arg(long, default_value_t = 10.0)]
    duration: f64,

    /// Noise added by the synthetic producer, as a fraction of amplitude.
    #[arg(long, default_value_t = 0.02)]
    noise: f64,

    /// Play back a frame recording instead of a live source.
    #[arg(long, value_name = "LOG", conflicts_with_all = ["port", "simulate"])]
    replay: Option<PathBuf>,

    /// Record raw frames to the configured recording directory.
    #[arg(long)]
    record: bool,

    /// Print serial devices and exit.
    #[arg(long)]
    list_ports: bool,
}

impl Cli {
    fn viewer_config(&self) -> Result<ViewerConfig> {
        let mut config = match &self.config {
            Some(path) => ViewerConfig::load(path)?,
            None => ViewerConfig::default(),
        };
        if let Some(bitrate) = self.bitrate {
            config.bitrate = bitrate;
        }
        if let Some(window) = &self.window {
            config.time_window = window.clone();
        }
        if let Some(hz) = self.refresh_hz {
            config.refresh_hz = hz;
        }
        if let Some(capacity) = self.capacity {
            config.buffer_capacity = capacity;
        }
        config.record |= self.record;
        config.validate().context("invalid viewer settings")?;
        Ok(config)
    }

    fn transport(&self, config: &ViewerConfig) -> Transport {
        let synthetic = Transport::Synthetic {
            max_messages: config.replay_max_messages,
            interval: Duration::from_millis(config.replay_interval_ms),
            noise: self.noise,
        };
        if let Some(path) = &self.replay {
            return Transport::Replay { path: path.clone() };
        }
        if self.simulate {
            return synthetic;
        }
        match self.port.as_deref() {
            Some(port) if port != SIMULATED_DEVICE => Transport::Slcan {
                port: port.to_owned(),
                bitrate: config.bitrate,
            },
            _ => synthetic,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.viewer_config()?;
    if let Some(path) = logging::init(config.log_dir.as_deref())? {
        log::info!("logging to {}", path.display());
    }

    if cli.list_ports {
        for port in list_ports() {
            println!("{port}");
        }
        return Ok(());
    }

    let schema_path = cli
        .schema
        .clone()
        .ok_or_else(|| anyhow!("--schema is required"))?;
    let store = Arc::new(ChannelStore::new(config.buffer_capacity)?);
    let (tx, rx) = channel();
    let settings = SessionSettings {
        schema_path,
        transport: cli.transport(&config),
        record_dir: config.recording(),
    };

    // 启动后台采集线程
    let mut session = Session::new(settings, Arc::clone(&store), tx);
    session.start()?;
    log::info!(
        "viewer: window {:?}, refresh {} Hz, capacity {}",
        window_seconds(&config.time_window).flatten(),
        config.refresh_hz,
        config.buffer_capacity
    );

    let consumer = WindowedConsumer::new(
        store,
        config.window(),
        config.plot_count,
        config.max_lines_per_plot,
    );

    if cli.headless {
        return run_headless(&config, consumer, rx, session, cli.duration);
    }

    let viewport = egui::ViewportBuilder::default()
        .with_inner_size([1280.0, 800.0])
        .with_min_inner_size([800.0, 500.0])
        .with_title("canscope");
    let options = eframe::NativeOptions {
        viewport,
        ..Default::default()
    };
    eframe::run_native(
        "canscope",
        options,
        Box::new(move |_cc| Box::new(gui::ViewerApp::new(&config, consumer, rx, session))),
    )
    .map_err(|err| anyhow!("viewer window failed: {err}"))
}

/// Spreads the discovered channels over the surfaces, filling each one up
/// to its line limit.
fn select_all(consumer: &mut WindowedConsumer, max_lines: usize) {
    let names = consumer.store().channel_names();
    let surfaces = consumer.surfaces().len();
    for (idx, chunk) in names.chunks(max_lines.max(1)).take(surfaces).enumerate() {
        consumer.select_channels(idx, chunk.to_vec());
    }
}

/// Same tick loop as the window, without rendering.
fn run_headless(
    config: &ViewerConfig,
    mut consumer: WindowedConsumer,
    events: Receiver<StreamEvent>,
    mut session: Session,
    duration: f64,
) -> Result<()> {
    let mut schedule = TickSchedule::from_hz(config.refresh_hz);
    let started = Instant::now();
    let mut last_report = started;
    let mut ticks = 0u64;
    let mut stopped = false;

    while !stopped && started.elapsed().as_secs_f64() < duration {
        for event in events.try_iter() {
            match event {
                StreamEvent::NewChannels(_) => select_all(&mut consumer, config.max_lines_per_plot),
                StreamEvent::TransportFault(err) => log::error!("transport fault: {err}"),
                StreamEvent::Stopped => stopped = true,
            }
        }

        let now = Instant::now();
        if schedule.due(now) {
            let frames = consumer.tick();
            ticks += 1;
            if now.duration_since(last_report) >= Duration::from_secs(1) {
                last_report = now;
                let points: usize = frames
                    .iter()
                    .flat_map(|f| &f.series)
                    .map(|s| s.visible_times().len())
                    .sum();
                let layout = match frames.first().map(|f| f.layout) {
                    Some(Layout::Window { span, offset, .. }) => {
                        format!("window {span}s @ +{offset:.2}s")
                    }
                    Some(Layout::AutoFit) => "auto-fit".to_owned(),
                    Some(Layout::Manual) => "manual".to_owned(),
                    Some(Layout::Hold) | None => "waiting".to_owned(),
                };
                log::info!(
                    "{} channels (capacity {}), {} frames, {} ticks, {} visible points, {}",
                    consumer.store().channel_count(),
                    consumer.store().capacity(),
                    session.frames_seen(),
                    ticks,
                    points,
                    layout
                );
            }
        }
        thread::sleep(schedule.remaining(Instant::now()).max(Duration::from_millis(1)));
    }

    session.stop();
    log::info!("session finished after {ticks} ticks");
    Ok(())
}
