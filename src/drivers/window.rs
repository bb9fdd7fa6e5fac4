//! Periodic consumer that turns store snapshots into per-surface render
//! instructions.
//!
//! In fixed-window mode the surface keeps a constant display interval
//! `[0, span]` and every series is translated by a single scalar `offset`
//! (render x = relative time - offset). Per tick that costs two binary
//! searches per channel plus a min/max over the visible slice, instead of
//! re-deriving the axis range and every draw path.
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::drivers::{ChannelStore, SeriesSnapshot};

/// Min/max of the values visible on one surface.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ValueBounds {
    pub min: f64,
    pub max: f64,
}

impl ValueBounds {
    fn of(values: &[f64]) -> Option<Self> {
        let mut iter = values.iter().copied();
        let first = iter.next()?;
        Some(iter.fold(Self { min: first, max: first }, |b, v| Self {
            min: b.min.min(v),
            max: b.max.max(v),
        }))
    }

    fn union(self, other: Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Widens both ends by `fraction` of the span. A flat span is widened
    /// around its value so the axis never collapses.
    pub fn padded(self, fraction: f64) -> Self {
        let span = self.max - self.min;
        let basis = if span > 0.0 {
            span
        } else {
            self.max.abs().max(1.0)
        };
        let pad = basis * fraction;
        Self {
            min: self.min - pad,
            max: self.max + pad,
        }
    }
}

/// Tick labelling for an offset surface: render coordinate `x` is shown as
/// elapsed time `x + offset`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct OffsetAxis {
    pub offset: f64,
}

impl OffsetAxis {
    pub fn elapsed(&self, x: f64) -> f64 {
        x + self.offset
    }

    pub fn label(&self, x: f64, decimals: usize) -> String {
        format!("{:.*}", decimals, self.elapsed(x))
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DisplayWindow {
    pub auto_scroll: bool,
    /// `None` shows the full history.
    pub window_seconds: Option<f64>,
}

/// How a surface must place its axes this tick.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Layout {
    /// Fixed window requested but the store has no data yet; keep whatever
    /// the surface shows.
    Hold,
    /// Full history: auto-fit both axes, no offset.
    AutoFit,
    /// Fixed interval `[0, span]`, series shifted by `-offset`. Without
    /// bounds the surface keeps its previous value range.
    Window {
        span: f64,
        offset: f64,
        y_bounds: Option<ValueBounds>,
    },
    /// The user is navigating; coordinates are absolute.
    Manual,
}

/// What the surfaces must do right after a policy transition.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PolicyChange {
    AutoFit,
    FixedInterval { span: f64, offset: f64 },
}

#[derive(Clone, Debug)]
pub struct SeriesView {
    pub channel: String,
    pub data: SeriesSnapshot,
    /// Indices of `data` inside the visible interval.
    pub visible: Range<usize>,
}

impl SeriesView {
    pub fn visible_times(&self) -> &[f64] {
        &self.data.times[self.visible.clone()]
    }
}

#[derive(Clone, Debug)]
pub struct SurfaceFrame {
    pub layout: Layout,
    pub axis: OffsetAxis,
    pub series: Vec<SeriesView>,
}

/// One plot: an ordered channel selection and its current offset.
#[derive(Clone, Debug, Default)]
pub struct Surface {
    channels: Vec<String>,
    offset: f64,
}

impl Surface {
    pub fn channels(&self) -> &[String] {
        &self.channels
    }
}

pub struct WindowedConsumer {
    store: Arc<ChannelStore>,
    window: DisplayWindow,
    surfaces: Vec<Surface>,
    max_lines: usize,
}

impl WindowedConsumer {
    pub fn new(
        store: Arc<ChannelStore>,
        window_seconds: Option<f64>,
        surface_count: usize,
        max_lines: usize,
    ) -> Self {
        let mut consumer = Self {
            store,
            window: DisplayWindow {
                auto_scroll: true,
                window_seconds,
            },
            surfaces: vec![Surface::default(); surface_count.max(1)],
            max_lines: max_lines.max(1),
        };
        consumer.apply_policy();
        consumer
    }

    pub fn window(&self) -> DisplayWindow {
        self.window
    }

    pub fn surfaces(&self) -> &[Surface] {
        &self.surfaces
    }

    pub fn store(&self) -> &Arc<ChannelStore> {
        &self.store
    }

    /// Grows or shrinks the surface list; new surfaces join the current policy.
    pub fn set_surface_count(&mut self, count: usize) {
        self.surfaces.resize_with(count.max(1), Surface::default);
        if self.window.auto_scroll {
            self.apply_policy();
        }
    }

    /// Replaces a surface's channel selection, keeping at most `max_lines`.
    /// Returns how many channels were accepted.
    pub fn select_channels(&mut self, surface: usize, mut channels: Vec<String>) -> usize {
        let Some(target) = self.surfaces.get_mut(surface) else {
            return 0;
        };
        channels.truncate(self.max_lines);
        target.channels = channels;
        target.channels.len()
    }

    /// Switches between full history (`None`) and a fixed window. Always
    /// re-enables auto-scroll.
    pub fn set_window(&mut self, window_seconds: Option<f64>) -> PolicyChange {
        self.window.window_seconds = window_seconds;
        self.window.auto_scroll = true;
        match window_seconds {
            Some(w) => log::info!("time window changed to {w}s"),
            None => log::info!("time window changed to all"),
        }
        self.apply_policy()
    }

    /// The user asked to fit the view again: resume auto-scroll.
    pub fn request_fit(&mut self) -> PolicyChange {
        self.window.auto_scroll = true;
        self.apply_policy()
    }

    /// Manual pan/zoom gesture on a surface showing `visible` in render
    /// coordinates.
    ///
    /// Disables auto-scroll. On the transition out of offset mode returns
    /// the interval converted back to absolute time; afterwards (and when
    /// no offset was active) returns `None` and coordinates stay absolute.
    pub fn user_navigated(&mut self, visible: (f64, f64)) -> Option<(f64, f64)> {
        if !self.window.auto_scroll {
            return None;
        }
        self.window.auto_scroll = false;
        // All surfaces share the offset in position-offset mode.
        let offset = self.surfaces.first().map_or(0.0, |s| s.offset);
        for surface in &mut self.surfaces {
            surface.offset = 0.0;
        }
        log::debug!("auto-scroll disabled by user navigation");
        (offset != 0.0).then(|| (visible.0 + offset, visible.1 + offset))
    }

    fn apply_policy(&mut self) -> PolicyChange {
        for surface in &mut self.surfaces {
            surface.offset = 0.0;
        }
        let Some(span) = self.window.window_seconds else {
            return PolicyChange::AutoFit;
        };
        // Jump straight to the newest data so the first tick does not flash
        // the stale [0, span] interval.
        let offset = self.current_left_edge(span).unwrap_or(0.0);
        for surface in &mut self.surfaces {
            surface.offset = offset;
        }
        PolicyChange::FixedInterval { span, offset }
    }

    fn current_left_edge(&self, span: f64) -> Option<f64> {
        self.store
            .latest_timestamp()
            .map(|t_max| (t_max - span).max(0.0))
    }

    fn full_series(&self, surface: &Surface) -> Vec<SeriesView> {
        surface
            .channels
            .iter()
            .filter_map(|name| {
                let data = self.store.snapshot(name)?;
                let visible = 0..data.len();
                Some(SeriesView {
                    channel: name.clone(),
                    data,
                    visible,
                })
            })
            .collect()
    }

    pub fn tick(&mut self) -> Vec<SurfaceFrame> {
        let window = self.window;
        match (window.auto_scroll, window.window_seconds) {
            // Navigation pauses auto-range in either mode.
            (false, _) => self.untranslated(Layout::Manual),
            (true, None) => self.untranslated(Layout::AutoFit),
            (true, Some(span)) => match self.current_left_edge(span) {
                Some(t_min) => self.windowed(span, t_min),
                None => self.untranslated(Layout::Hold),
            },
        }
    }

    fn untranslated(&self, layout: Layout) -> Vec<SurfaceFrame> {
        self.surfaces
            .iter()
            .map(|surface| SurfaceFrame {
                layout,
                axis: OffsetAxis::default(),
                series: self.full_series(surface),
            })
            .collect()
    }

    fn windowed(&mut self, span: f64, t_min: f64) -> Vec<SurfaceFrame> {
        let t_max = t_min + span;
        let mut frames = Vec::with_capacity(self.surfaces.len());
        for idx in 0..self.surfaces.len() {
            self.surfaces[idx].offset = t_min;
            let mut series = Vec::new();
            for name in &self.surfaces[idx].channels {
                let Some(data) = self.store.snapshot(name) else {
                    continue;
                };
                let visible = data.visible_range(t_min, t_max);
                series.push(SeriesView {
                    channel: name.clone(),
                    data,
                    visible,
                });
            }
            let y_bounds = visible_bounds(&series, t_min, t_max);
            frames.push(SurfaceFrame {
                layout: Layout::Window {
                    span,
                    offset: t_min,
                    y_bounds,
                },
                axis: OffsetAxis { offset: t_min },
                series,
            });
        }
        frames
    }
}

/// Value range of every sample with a timestamp in `[t_lo, t_hi]`, across
/// all series. Used for the y axis while exploring manually.
pub fn visible_bounds(series: &[SeriesView], t_lo: f64, t_hi: f64) -> Option<ValueBounds> {
    series
        .iter()
        .filter_map(|s| ValueBounds::of(&s.data.values[s.data.visible_range(t_lo, t_hi)]))
        .reduce(ValueBounds::union)
}

/// Fixed-cadence tick gate. A late tick is simply delayed; ticks never
/// stack up or overlap.
#[derive(Clone, Debug)]
pub struct TickSchedule {
    interval: Duration,
    last: Option<Instant>,
}

impl TickSchedule {
    pub fn from_hz(hz: u32) -> Self {
        Self {
            interval: Self::interval_for(hz),
            last: None,
        }
    }

    fn interval_for(hz: u32) -> Duration {
        Duration::from_millis(1000 / u64::from(hz.max(1)))
    }

    pub fn set_hz(&mut self, hz: u32) {
        self.interval = Self::interval_for(hz);
        log::info!("refresh rate changed to {hz} Hz");
    }

    /// Returns true (and records the tick) when a tick is due at `now`.
    pub fn due(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// Time left until the next tick is due.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.last
            .map(|last| self.interval.saturating_sub(now.duration_since(last)))
            .unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_ramp(n: usize) -> Arc<ChannelStore> {
        let store = Arc::new(ChannelStore::new(1_000).unwrap());
        for i in 0..n {
            store.append("ramp", i as f64, (i % 17) as f64);
        }
        store
    }

    fn consumer(store: &Arc<ChannelStore>, window: Option<f64>) -> WindowedConsumer {
        let mut consumer = WindowedConsumer::new(Arc::clone(store), window, 1, 10);
        consumer.select_channels(0, vec!["ramp".into()]);
        consumer
    }

    #[test]
    fn fixed_window_selects_trailing_interval() {
        let store = store_with_ramp(100);
        let mut consumer = consumer(&store, Some(10.0));
        let frames = consumer.tick();
        let frame = &frames[0];
        match frame.layout {
            Layout::Window { span, offset, .. } => {
                assert_eq!(span, 10.0);
                assert_eq!(offset, 89.0);
            }
            other => panic!("unexpected layout {other:?}"),
        }
        let series = &frame.series[0];
        let expected: Vec<f64> = (89..100).map(|t| t as f64).collect();
        assert_eq!(series.visible_times(), expected.as_slice());
        assert_eq!(consumer.surfaces()[0].offset, 89.0);
        assert_eq!(frame.axis.elapsed(0.0), 89.0);
        assert_eq!(frame.axis.label(10.0, 1), "99.0");
    }

    #[test]
    fn window_bounds_cover_only_visible_values() {
        let store = Arc::new(ChannelStore::new(100).unwrap());
        for i in 0..50 {
            // Large spike early on, outside the final window.
            let value = if i == 3 { 1_000.0 } else { (i % 5) as f64 };
            store.append("a", i as f64, value);
            store.append("b", i as f64, -(i as f64));
        }
        let mut consumer = WindowedConsumer::new(Arc::clone(&store), Some(5.0), 1, 10);
        consumer.select_channels(0, vec!["a".into(), "b".into(), "missing".into()]);
        let frames = consumer.tick();
        match frames[0].layout {
            Layout::Window { y_bounds, .. } => {
                assert_eq!(y_bounds, Some(ValueBounds { min: -49.0, max: 4.0 }));
            }
            other => panic!("unexpected layout {other:?}"),
        }
        assert_eq!(frames[0].series.len(), 2);
    }

    #[test]
    fn short_history_clamps_left_edge_to_zero() {
        let store = store_with_ramp(4);
        let mut consumer = consumer(&store, Some(30.0));
        let frames = consumer.tick();
        assert!(matches!(frames[0].layout, Layout::Window { offset, .. } if offset == 0.0));
        assert_eq!(frames[0].series[0].visible, 0..4);
    }

    #[test]
    fn empty_store_holds_in_fixed_window_mode() {
        let store = Arc::new(ChannelStore::new(10).unwrap());
        let mut consumer = consumer(&store, Some(10.0));
        let frames = consumer.tick();
        assert_eq!(frames[0].layout, Layout::Hold);
        assert!(frames[0].series.is_empty());
    }

    #[test]
    fn window_without_visible_points_has_no_bounds() {
        let store = Arc::new(ChannelStore::new(10).unwrap());
        store.append("ramp", 0.0, 1.0);
        store.append("other", 50.0, 1.0);
        let mut consumer = consumer(&store, Some(10.0));
        let frames = consumer.tick();
        assert!(matches!(
            frames[0].layout,
            Layout::Window { y_bounds: None, offset, .. } if offset == 40.0
        ));
    }

    #[test]
    fn full_history_autofits_without_offset() {
        let store = store_with_ramp(20);
        let mut consumer = consumer(&store, None);
        let frames = consumer.tick();
        assert_eq!(frames[0].layout, Layout::AutoFit);
        assert_eq!(frames[0].axis.offset, 0.0);
        assert_eq!(frames[0].series[0].visible, 0..20);
        assert_eq!(consumer.surfaces()[0].offset, 0.0);
    }

    #[test]
    fn navigating_full_history_stops_autofit() {
        let store = store_with_ramp(100);
        let mut consumer = consumer(&store, None);
        assert_eq!(consumer.tick()[0].layout, Layout::AutoFit);
        // No offset to undo in full-history mode.
        assert_eq!(consumer.user_navigated((10.0, 20.0)), None);
        let frames = consumer.tick();
        assert_eq!(frames[0].layout, Layout::Manual);
        assert_eq!(frames[0].series[0].visible, 0..100);

        assert_eq!(consumer.request_fit(), PolicyChange::AutoFit);
        assert_eq!(consumer.tick()[0].layout, Layout::AutoFit);
    }

    #[test]
    fn visible_bounds_follow_the_time_range() {
        let store = store_with_ramp(40);
        let mut consumer = consumer(&store, None);
        let frames = consumer.tick();
        let series = &frames[0].series;
        // ramp is t % 17: [17, 20] holds 0..=3.
        assert_eq!(
            visible_bounds(series, 17.0, 20.0),
            Some(ValueBounds { min: 0.0, max: 3.0 })
        );
        assert_eq!(visible_bounds(series, 500.0, 600.0), None);
    }

    #[test]
    fn entering_fixed_window_jumps_to_latest_edge() {
        let store = store_with_ramp(100);
        let mut consumer = consumer(&store, None);
        let change = consumer.set_window(Some(20.0));
        assert_eq!(change, PolicyChange::FixedInterval { span: 20.0, offset: 79.0 });
        assert_eq!(consumer.surfaces()[0].offset, 79.0);
        assert_eq!(consumer.set_window(None), PolicyChange::AutoFit);
        assert_eq!(consumer.surfaces()[0].offset, 0.0);
    }

    #[test]
    fn navigation_converts_to_absolute_exactly_once() {
        let store = store_with_ramp(100);
        let mut consumer = consumer(&store, Some(10.0));
        consumer.tick();
        assert_eq!(consumer.user_navigated((2.0, 8.0)), Some((91.0, 97.0)));
        assert!(!consumer.window().auto_scroll);
        assert_eq!(consumer.surfaces()[0].offset, 0.0);
        assert_eq!(consumer.user_navigated((91.0, 97.0)), None);

        let frames = consumer.tick();
        assert_eq!(frames[0].layout, Layout::Manual);
        assert_eq!(frames[0].axis.offset, 0.0);
        assert_eq!(frames[0].series[0].visible, 0..100);
    }

    #[test]
    fn fit_request_resumes_scrolling_from_latest_timestamp() {
        let store = store_with_ramp(100);
        let mut consumer = consumer(&store, Some(10.0));
        consumer.user_navigated((0.0, 10.0));
        store.append("ramp", 150.0, 0.0);
        let change = consumer.request_fit();
        assert_eq!(change, PolicyChange::FixedInterval { span: 10.0, offset: 140.0 });
        let frames = consumer.tick();
        assert!(matches!(frames[0].layout, Layout::Window { offset, .. } if offset == 140.0));
        assert_eq!(frames[0].series[0].visible_times(), &[150.0]);
    }

    #[test]
    fn selection_is_capped_and_new_surfaces_share_offset() {
        let store = store_with_ramp(100);
        let mut consumer = WindowedConsumer::new(Arc::clone(&store), Some(10.0), 1, 2);
        let accepted = consumer.select_channels(0, vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(accepted, 2);
        assert_eq!(consumer.select_channels(5, vec!["a".into()]), 0);
        consumer.set_surface_count(3);
        assert_eq!(consumer.surfaces().len(), 3);
        assert!(consumer.surfaces().iter().all(|s| s.offset == 89.0));
    }

    #[test]
    fn padding_widens_bounds() {
        let padded = ValueBounds { min: 0.0, max: 10.0 }.padded(0.05);
        assert_eq!(padded, ValueBounds { min: -0.5, max: 10.5 });
        let flat = ValueBounds { min: 4.0, max: 4.0 }.padded(0.5);
        assert_eq!(flat, ValueBounds { min: 2.0, max: 6.0 });
    }

    #[test]
    fn ticks_are_delayed_not_stacked() {
        let mut schedule = TickSchedule::from_hz(10);
        let start = Instant::now();
        assert!(schedule.due(start));
        assert!(!schedule.due(start + Duration::from_millis(50)));
        assert_eq!(
            schedule.remaining(start + Duration::from_millis(40)),
            Duration::from_millis(60)
        );
        assert!(schedule.due(start + Duration::from_millis(350)));
        assert!(!schedule.due(start + Duration::from_millis(360)));
        schedule.set_hz(5);
        assert_eq!(schedule.interval, Duration::from_millis(200));
    }
}
