// src/gui.rs
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::time::Instant;

use eframe::egui;
use egui_plot::{Legend, Line, Plot, PlotBounds, PlotPoints};

use crate::config::{window_label, window_seconds, ViewerConfig, MAX_PLOT_COUNT, REFRESH_RATES_HZ, TIME_WINDOWS};
use crate::drivers::{
    visible_bounds, Layout, SeriesView, SurfaceFrame, TickSchedule, ValueBounds, WindowedConsumer,
};
use crate::engine::Session;
use crate::types::StreamEvent;

/// Points handed to egui_plot per line; longer series are peak-decimated.
const MAX_PLOT_POINTS: usize = 4_000;

/// Per-plot UI state that the consumer does not own.
#[derive(Default)]
struct PlotPanel {
    selected: Vec<String>,
    filter: String,
    /// Absolute x-range to apply once after leaving offset mode.
    pending_x: Option<(f64, f64)>,
    /// Last value range, reused when a tick has no visible points.
    last_y: Option<ValueBounds>,
    /// The plot is in egui_plot's own auto-bounds mode.
    auto_fit: bool,
}

pub struct ViewerApp {
    // 数据与消费者
    consumer: WindowedConsumer,
    events: Receiver<StreamEvent>,
    session: Session,
    schedule: TickSchedule,
    frames: Vec<SurfaceFrame>,

    // 界面状态
    channel_names: Vec<String>,
    panels: Vec<PlotPanel>,
    window_key: String,
    refresh_hz: u32,
    y_padding: f64,
    max_lines: usize,
    status: String,
    errors: usize,
    record: bool,
    record_dir: PathBuf,
}

impl ViewerApp {
    pub fn new(
        config: &ViewerConfig,
        consumer: WindowedConsumer,
        events: Receiver<StreamEvent>,
        session: Session,
    ) -> Self {
        let panels = consumer
            .surfaces()
            .iter()
            .map(|_| PlotPanel::default())
            .collect();
        Self {
            consumer,
            events,
            session,
            schedule: TickSchedule::from_hz(config.refresh_hz),
            frames: Vec::new(),
            channel_names: Vec::new(),
            panels,
            window_key: config.time_window.clone(),
            refresh_hz: config.refresh_hz,
            y_padding: config.y_range_padding,
            max_lines: config.max_lines_per_plot,
            status: "Connected - streaming...".to_owned(),
            errors: 0,
            record: config.record,
            record_dir: config.record_dir.clone(),
        }
    }

    /// Restarts acquisition from an empty store.
    fn start_session(&mut self) {
        match self.session.start() {
            Ok(()) => {
                self.errors = 0;
                self.channel_names.clear();
                self.frames.clear();
                for panel in &mut self.panels {
                    panel.pending_x = None;
                    panel.last_y = None;
                }
                self.consumer.request_fit();
                self.status = "Connected - streaming...".to_owned();
            }
            Err(err) => {
                log::error!("failed to start session: {err:#}");
                self.status = format!("Error: {err:#}");
            }
        }
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                StreamEvent::NewChannels(_) => {
                    self.channel_names = self.consumer.store().channel_names();
                    self.status = format!(
                        "Streaming... {} signals discovered",
                        self.channel_names.len()
                    );
                }
                StreamEvent::TransportFault(err) => {
                    self.errors += 1;
                    self.status = format!("Error: {err}");
                }
                // A restart may leave the previous run's notice queued.
                StreamEvent::Stopped if self.session.is_running() => {}
                StreamEvent::Stopped => {
                    if !self.status.starts_with("Stopped") {
                        self.status = format!("Stopped: {}", self.status);
                    }
                }
            }
        }
    }

    fn toolbar(&mut self, ui: &mut egui::Ui) {
        ui.horizontal(|ui| {
            let running = self.session.is_running();
            if ui.add_enabled(!running, egui::Button::new("Start")).clicked() {
                self.start_session();
            }
            if ui.add_enabled(running, egui::Button::new("Stop")).clicked() {
                self.session.stop();
                self.status = "Stopped".to_owned();
            }
            let record = ui.add_enabled(!running, egui::Checkbox::new(&mut self.record, "Record"));
            if record.changed() {
                self.session
                    .set_record_dir(self.record.then(|| self.record_dir.clone()));
            }

            ui.separator();
            let mut chosen_window = None;
            egui::ComboBox::from_label("Time window")
                .selected_text(window_label(window_seconds(&self.window_key).flatten()))
                .show_ui(ui, |ui| {
                    for (key, secs) in TIME_WINDOWS {
                        let selected = self.window_key == *key;
                        if ui.selectable_label(selected, window_label(*secs)).clicked() {
                            chosen_window = Some(*key);
                        }
                    }
                });
            if let Some(key) = chosen_window {
                self.window_key = key.to_owned();
                self.consumer.set_window(window_seconds(key).flatten());
                for panel in &mut self.panels {
                    panel.pending_x = None;
                }
            }

            ui.separator();
            let mut chosen_rate = None;
            egui::ComboBox::from_label("Refresh")
                .selected_text(format!("{} Hz", self.refresh_hz))
                .show_ui(ui, |ui| {
                    for &hz in REFRESH_RATES_HZ {
                        if ui
                            .selectable_label(self.refresh_hz == hz, format!("{hz} Hz"))
                            .clicked()
                        {
                            chosen_rate = Some(hz);
                        }
                    }
                });
            if let Some(hz) = chosen_rate {
                self.refresh_hz = hz;
                self.schedule.set_hz(hz);
            }

            ui.separator();
            let mut chosen_count = None;
            egui::ComboBox::from_label("Plots")
                .selected_text(self.panels.len().to_string())
                .show_ui(ui, |ui| {
                    for count in 1..=MAX_PLOT_COUNT {
                        if ui
                            .selectable_label(self.panels.len() == count, count.to_string())
                            .clicked()
                        {
                            chosen_count = Some(count);
                        }
                    }
                });
            if let Some(count) = chosen_count {
                self.consumer.set_surface_count(count);
                self.panels.resize_with(count, PlotPanel::default);
                self.frames.clear();
            }

            ui.separator();
            if ui.button("Fit").clicked() {
                self.consumer.request_fit();
            }
            if !self.consumer.window().auto_scroll {
                ui.label("auto-scroll paused (middle-click a plot to resume)");
            }
        });
    }

    fn selectors(&mut self, ui: &mut egui::Ui) {
        for idx in 0..self.panels.len() {
            egui::CollapsingHeader::new(format!("Plot {}", idx + 1))
                .default_open(true)
                .show(ui, |ui| {
                    let panel = &mut self.panels[idx];
                    ui.add(
                        egui::TextEdit::singleline(&mut panel.filter).hint_text("Filter signals..."),
                    );
                    let filter = panel.filter.to_lowercase();
                    let mut changed = false;
                    egui::ScrollArea::vertical()
                        .id_source(("selector", idx))
                        .max_height(220.0)
                        .show(ui, |ui| {
                            for name in &self.channel_names {
                                if !filter.is_empty() && !name.to_lowercase().contains(&filter) {
                                    continue;
                                }
                                let mut checked = panel.selected.contains(name);
                                let full = panel.selected.len() >= self.max_lines;
                                let enabled = checked || !full;
                                let response =
                                    ui.add_enabled(enabled, egui::Checkbox::new(&mut checked, name));
                                if response.changed() {
                                    if checked {
                                        panel.selected.push(name.clone());
                                    } else {
                                        panel.selected.retain(|n| n != name);
                                    }
                                    changed = true;
                                }
                            }
                        });
                    if changed {
                        self.consumer.select_channels(idx, panel.selected.clone());
                        // Unknown names are dropped by the consumer.
                        if let Some(surface) = self.consumer.surfaces().get(idx) {
                            panel.selected = surface.channels().to_vec();
                        }
                    }
                });
        }
    }

    fn plots(&mut self, ui: &mut egui::Ui) {
        let count = self.panels.len().max(1);
        let spacing = ui.spacing().item_spacing.y;
        let height = (ui.available_height() - spacing * (count as f32 - 1.0)) / count as f32;
        for idx in 0..self.panels.len() {
            let frame = self.frames.get(idx);
            let axis = frame.map(|f| f.axis).unwrap_or_default();
            let label = if axis.offset == 0.0 {
                "Time [s]".to_owned()
            } else {
                format!("Time [s] (0 = {} s)", axis.label(0.0, 1))
            };
            let panel = &mut self.panels[idx];
            let y_padding = self.y_padding;
            let fitting = matches!(frame.map(|f| f.layout), Some(Layout::AutoFit));
            let entering_fit = fitting && !panel.auto_fit;
            panel.auto_fit = fitting;
            let mut plot = Plot::new(("surface", idx))
                .legend(Legend::default())
                .height(height.max(80.0))
                .x_axis_label(label)
                .label_formatter(move |name, value| {
                    format!("{name}\nt = {:.3} s\ny = {:.3}", axis.elapsed(value.x), value.y)
                });
            if entering_fit {
                // Drops remembered bounds so auto-bounds take over again.
                plot = plot.reset();
            }
            let shown = plot.show(ui, |plot_ui| {
                if let Some(frame) = frame {
                    for series in &frame.series {
                        let points = series_points(series, &frame.layout);
                        plot_ui.line(Line::new(PlotPoints::from(points)).name(&series.channel));
                    }
                    let current = plot_ui.plot_bounds();
                    if let Some(bounds) = layout_bounds(frame, panel, current, y_padding) {
                        plot_ui.set_plot_bounds(bounds);
                    }
                }
                plot_ui.plot_bounds()
            });

            let response = &shown.response;
            let scrolled = response.hovered()
                && ui.input(|i| i.scroll_delta != egui::Vec2::ZERO || i.zoom_delta() != 1.0);
            if response.clicked_by(egui::PointerButton::Middle) {
                self.consumer.request_fit();
            } else if response.dragged() || scrolled {
                let visible = (shown.inner.min()[0], shown.inner.max()[0]);
                if let Some(absolute) = self.consumer.user_navigated(visible) {
                    for panel in &mut self.panels {
                        panel.pending_x = Some(absolute);
                    }
                }
            }
        }
    }
}

/// Plot coordinates for one series. In window mode only the visible slice
/// (plus one neighbour each side) is emitted, shifted by the offset.
fn series_points(series: &SeriesView, layout: &Layout) -> Vec<[f64; 2]> {
    let data = &series.data;
    if data.is_empty() {
        return Vec::new();
    }
    let points: Vec<[f64; 2]> = match *layout {
        Layout::Window { offset, .. } => {
            let lo = series.visible.start.saturating_sub(1);
            let hi = (series.visible.end + 1).min(data.len());
            (lo..hi)
                .map(|k| [data.times[k] - offset, data.values[k]])
                .collect()
        }
        _ => data
            .times
            .iter()
            .zip(&data.values)
            .map(|(&t, &v)| [t, v])
            .collect(),
    };
    decimate_peaks(points, MAX_PLOT_POINTS)
}

/// Keeps the min and max of each bucket so spikes survive decimation.
fn decimate_peaks(points: Vec<[f64; 2]>, max_points: usize) -> Vec<[f64; 2]> {
    if points.len() <= max_points || max_points < 2 {
        return points;
    }
    let buckets = max_points / 2;
    let size = (points.len() + buckets - 1) / buckets;
    let mut out = Vec::with_capacity(buckets * 2);
    for chunk in points.chunks(size) {
        let (mut lo, mut hi) = (chunk[0], chunk[0]);
        for p in chunk {
            if p[1] < lo[1] {
                lo = *p;
            }
            if p[1] > hi[1] {
                hi = *p;
            }
        }
        if lo[0] <= hi[0] {
            out.push(lo);
            out.push(hi);
        } else {
            out.push(hi);
            out.push(lo);
        }
    }
    out
}

/// Bounds to force on the plot this frame, if any. Full-history and hold
/// layouts leave the plot alone.
fn layout_bounds(
    frame: &SurfaceFrame,
    panel: &mut PlotPanel,
    current: PlotBounds,
    y_padding: f64,
) -> Option<PlotBounds> {
    match frame.layout {
        Layout::Window { span, y_bounds, .. } => {
            if y_bounds.is_some() {
                panel.last_y = y_bounds;
            }
            let y = panel.last_y.unwrap_or(ValueBounds { min: -1.0, max: 1.0 }).padded(y_padding);
            Some(PlotBounds::from_min_max([0.0, y.min], [span, y.max]))
        }
        Layout::Manual => {
            let pending = panel.pending_x.take();
            let x = pending.unwrap_or((current.min()[0], current.max()[0]));
            manual_bounds(&frame.series, x, current, y_padding, pending.is_some())
        }
        Layout::AutoFit | Layout::Hold => None,
    }
}

/// Manual exploration keeps the user's x range and auto-ranges y over the
/// samples inside it. Without samples the y range is left as is, unless a
/// new x range has to be applied.
fn manual_bounds(
    series: &[SeriesView],
    x: (f64, f64),
    current: PlotBounds,
    y_padding: f64,
    force: bool,
) -> Option<PlotBounds> {
    let y = match visible_bounds(series, x.0, x.1) {
        Some(bounds) => bounds.padded(y_padding),
        None if force => ValueBounds {
            min: current.min()[1],
            max: current.max()[1],
        },
        None => return None,
    };
    Some(PlotBounds::from_min_max([x.0, y.min], [x.1, y.max]))
}

impl eframe::App for ViewerApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.drain_events();

        let now = Instant::now();
        if self.schedule.due(now) {
            self.frames = self.consumer.tick();
        }

        egui::TopBottomPanel::top("toolbar").show(ctx, |ui| self.toolbar(ui));
        egui::TopBottomPanel::bottom("status").show(ctx, |ui| {
            ui.horizontal(|ui| {
                ui.label(&self.status);
                ui.separator();
                ui.label(format!("{} frames", self.session.frames_seen()));
                if self.errors > 0 {
                    ui.separator();
                    ui.colored_label(egui::Color32::LIGHT_RED, format!("{} errors", self.errors));
                }
            });
        });
        egui::SidePanel::left("signals")
            .resizable(true)
            .default_width(250.0)
            .show(ctx, |ui| {
                egui::ScrollArea::vertical().show(ui, |ui| self.selectors(ui));
            });
        egui::CentralPanel::default().show(ctx, |ui| self.plots(ui));

        ctx.request_repaint_after(self.schedule.remaining(Instant::now()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimation_keeps_peaks() {
        let mut points: Vec<[f64; 2]> = (0..10_000).map(|i| [i as f64, 0.0]).collect();
        points[5_123][1] = 99.0;
        points[7_000][1] = -42.0;
        let out = decimate_peaks(points, 1_000);
        assert!(out.len() <= 1_000);
        assert!(out.iter().any(|p| p == &[5_123.0, 99.0]));
        assert!(out.iter().any(|p| p == &[7_000.0, -42.0]));
        assert!(out.windows(2).all(|w| w[0][0] <= w[1][0]));
    }

    fn series(times: &[f64], values: &[f64]) -> Vec<SeriesView> {
        vec![SeriesView {
            channel: "s".into(),
            data: crate::drivers::SeriesSnapshot {
                times: times.to_vec(),
                values: values.to_vec(),
            },
            visible: 0..times.len(),
        }]
    }

    #[test]
    fn manual_y_follows_samples_inside_x_range() {
        let data = series(&[0.0, 1.0, 2.0, 3.0], &[100.0, 5.0, 7.0, -50.0]);
        let current = PlotBounds::from_min_max([0.0, -1.0], [10.0, 1.0]);
        let bounds = manual_bounds(&data, (0.5, 2.5), current, 0.0, false).unwrap();
        assert_eq!(bounds.min(), [0.5, 5.0]);
        assert_eq!(bounds.max(), [2.5, 7.0]);
    }

    #[test]
    fn manual_range_without_samples() {
        let data = series(&[0.0, 1.0], &[1.0, 2.0]);
        let current = PlotBounds::from_min_max([0.0, -3.0], [1.0, 3.0]);
        assert!(manual_bounds(&data, (5.0, 6.0), current, 0.05, false).is_none());
        // A pending handoff still moves x and keeps the current y.
        let bounds = manual_bounds(&data, (5.0, 6.0), current, 0.05, true).unwrap();
        assert_eq!(bounds.min(), [5.0, -3.0]);
        assert_eq!(bounds.max(), [6.0, 3.0]);
    }

    #[test]
    fn full_history_leaves_bounds_to_the_plot() {
        let frame = SurfaceFrame {
            layout: Layout::AutoFit,
            axis: Default::default(),
            series: series(&[0.0, 1.0], &[1.0, 2.0]),
        };
        let mut panel = PlotPanel::default();
        let current = PlotBounds::from_min_max([0.0, 0.0], [1.0, 1.0]);
        assert!(layout_bounds(&frame, &mut panel, current, 0.05).is_none());
    }

    #[test]
    fn short_series_are_untouched() {
        let points = vec![[0.0, 1.0], [1.0, 2.0]];
        assert_eq!(decimate_peaks(points.clone(), 1_000), points);
    }
}
