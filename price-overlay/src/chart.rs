//! One recompute pass over the whole pipeline
//!
//! [`recompute`] is a pure function of a [`ChartState`], the current [`ChartInputs`] and the
//! [`EngineConfig`]. It merges the source batches, computes indicators over the actual-only
//! prices and candles over actuals plus upcoming predictions, evaluates alerts, then resolves
//! the viewport over whichever series the display mode shows. The resulting
//! [`ChartSnapshot`] is immutable; viewport operations produce a new snapshot without
//! redoing the data stages.

use crate::{
    alerts::{Alert, AlertEvaluator, Notice},
    candles::{Candle, CandleAggregator, price_domain},
    config::EngineConfig,
    error::OverlayError,
    indicators::{IndicatorEngine, IndicatorLine, IndicatorSelection, IndicatorSeries},
    merge::{MergeStats, MergeWindow, TimeBucketMerger},
    types::{DisplayPoint, SourceBatch, TimeBucket, actual_points, prediction_points},
    viewport::{Viewport, ViewportController, ViewportSettings, closest_index},
};
use chrono::{DateTime, TimeDelta, Utc};
use derive_more::{Constructor, Display};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Horizon predicted points are shown for with every preset range
pub const PRESET_FUTURE_HOURS: i64 = 24;

/// How far back (and ahead) of "now" the merged series reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, Deserialize, Serialize)]
#[serde(tag = "range", rename_all = "snake_case")]
pub enum TimeRange {
    #[display("24h")]
    Day,
    #[default]
    #[display("48h")]
    TwoDays,
    #[display("7d")]
    Week,
    #[display("30d")]
    Month,
    #[display("custom({past_hours}h/{future_hours}h)")]
    Custom { past_hours: i64, future_hours: i64 },
}

impl TimeRange {
    pub fn past(&self) -> TimeDelta {
        match self {
            TimeRange::Day => TimeDelta::hours(24),
            TimeRange::TwoDays => TimeDelta::hours(48),
            TimeRange::Week => TimeDelta::days(7),
            TimeRange::Month => TimeDelta::days(30),
            TimeRange::Custom { past_hours, .. } => TimeDelta::hours((*past_hours).max(0)),
        }
    }

    pub fn future(&self) -> TimeDelta {
        match self {
            TimeRange::Custom { future_hours, .. } => TimeDelta::hours((*future_hours).max(0)),
            _ => TimeDelta::hours(PRESET_FUTURE_HOURS),
        }
    }

    /// `[now - past, now + future]`
    pub fn window(&self, now: DateTime<Utc>) -> MergeWindow {
        MergeWindow::around(now, self.past(), self.future())
    }
}

/// Which series the chart draws and the viewport indexes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMode {
    /// Merged hourly series with indicator overlays
    #[default]
    #[display("line")]
    Line,
    /// Historical and forecast candles
    #[display("candles")]
    Candles,
}

/// User facing chart configuration, passed into and returned from every recompute.
///
/// `viewport: None` follows the whole series as it grows.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChartState {
    pub selection: IndicatorSelection,
    pub interval_hours: u32,
    pub time_range: TimeRange,
    pub mode: DisplayMode,
    pub viewport: Option<Viewport>,
}

impl Default for ChartState {
    fn default() -> Self {
        Self {
            selection: IndicatorSelection::default(),
            interval_hours: 1,
            time_range: TimeRange::default(),
            mode: DisplayMode::default(),
            viewport: None,
        }
    }
}

impl ChartState {
    /// Default state using the configured candle interval
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            interval_hours: config.candle_interval_hours,
            ..Self::default()
        }
    }

    pub fn with_selection(mut self, selection: IndicatorSelection) -> Self {
        self.selection = selection;
        self
    }

    /// Changing the interval re-buckets the candle series, so the viewport starts over
    pub fn with_interval_hours(mut self, hours: u32) -> Self {
        if self.interval_hours != hours && self.mode == DisplayMode::Candles {
            self.viewport = None;
        }
        self.interval_hours = hours;
        self
    }

    pub fn with_time_range(mut self, time_range: TimeRange) -> Self {
        self.time_range = time_range;
        self
    }

    /// Switching mode switches the indexed series, so the viewport starts over
    pub fn with_mode(mut self, mode: DisplayMode) -> Self {
        if self.mode != mode {
            self.viewport = None;
        }
        self.mode = mode;
        self
    }

    pub fn with_viewport(mut self, viewport: Option<Viewport>) -> Self {
        self.viewport = viewport;
        self
    }
}

/// Everything a recompute reads besides the chart state
#[derive(Debug, Clone, PartialEq, Constructor)]
pub struct ChartInputs {
    pub batches: Vec<SourceBatch>,
    pub alerts: Vec<Alert>,
    pub now: DateTime<Utc>,
}

/// Interaction applied to the viewport of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ViewportOp {
    ZoomIn,
    ZoomOut,
    Reset,
    JumpToNow,
    Pan { delta_pixels: f64, width: f64 },
    Brush { start: usize, end: usize },
}

/// Immutable result of one recompute pass
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartSnapshot {
    pub state: ChartState,
    pub now: DateTime<Utc>,
    pub points: Vec<DisplayPoint>,
    pub candles: Vec<Candle>,
    pub notices: Vec<Notice>,
    /// Index into the displayed series closest to `now`
    pub now_index: Option<usize>,
    /// Resolved viewport over the displayed series
    pub viewport: Option<Viewport>,
    #[serde(skip)]
    pub buckets: Vec<TimeBucket>,
    #[serde(skip)]
    pub indicators: IndicatorSeries,
    #[serde(skip)]
    pub stats: MergeStats,
    #[serde(skip)]
    settings: ViewportSettings,
    #[serde(skip)]
    domain_padding: f64,
}

/// Run the full pipeline for `state` over `inputs`.
///
/// Fails only on invalid parameters (zero candle interval, invalid Bollinger settings);
/// bad or missing data yields empty outputs.
pub fn recompute(
    state: &ChartState,
    inputs: &ChartInputs,
    config: &EngineConfig,
) -> Result<ChartSnapshot, OverlayError> {
    let merged = TimeBucketMerger::new(inputs.now, state.time_range.window(inputs.now))
        .with_future_tolerance(TimeDelta::seconds(config.actual_future_tolerance_secs))
        .merge_with_stats(&inputs.batches);

    let actuals = actual_points(&merged.buckets);
    let prices: Vec<f64> = actuals.iter().map(|point| point.price).collect();
    let indicators = IndicatorEngine::from_config(config).compute(&prices, &state.selection)?;
    let points = display_points(&merged.buckets, &indicators);

    let candles = CandleAggregator::new(state.interval_hours)?
        .with_forecast_volume(config.forecast_volume)
        .build(&actuals, &prediction_points(&merged.buckets), inputs.now);

    let notices =
        AlertEvaluator::from_config(config).evaluate(&merged.buckets, &inputs.alerts, inputs.now);

    let mut snapshot = ChartSnapshot {
        state: state.clone(),
        now: inputs.now,
        points,
        candles,
        notices,
        now_index: None,
        viewport: None,
        buckets: merged.buckets,
        indicators,
        stats: merged.stats,
        settings: ViewportSettings::from_config(config),
        domain_padding: config.domain_padding,
    };

    let times = snapshot.display_times();
    snapshot.now_index = closest_index(&times, inputs.now);
    let controller = ViewportController::restore(times.len(), snapshot.settings, state.viewport);
    snapshot.adopt(&controller);

    debug!(
        mode = %state.mode,
        buckets = snapshot.buckets.len(),
        candles = snapshot.candles.len(),
        notices = snapshot.notices.len(),
        viewport = ?snapshot.viewport,
        "recomputed chart"
    );

    Ok(snapshot)
}

impl ChartSnapshot {
    /// Number of points in the displayed series
    pub fn len(&self) -> usize {
        match self.state.mode {
            DisplayMode::Line => self.points.len(),
            DisplayMode::Candles => self.candles.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Timestamps of the displayed series
    pub fn display_times(&self) -> Vec<DateTime<Utc>> {
        match self.state.mode {
            DisplayMode::Line => self.points.iter().map(|point| point.timestamp).collect(),
            DisplayMode::Candles => self.candles.iter().map(|candle| candle.timestamp).collect(),
        }
    }

    /// Snapshot with `op` applied to the viewport. Data stages are reused as is.
    pub fn apply(&self, op: ViewportOp) -> ChartSnapshot {
        let mut controller = ViewportController::restore(self.len(), self.settings, self.viewport);
        match op {
            ViewportOp::ZoomIn => controller.zoom_in(),
            ViewportOp::ZoomOut => controller.zoom_out(),
            ViewportOp::Reset => controller.reset(),
            ViewportOp::JumpToNow => controller.jump_to_now(&self.display_times(), self.now),
            ViewportOp::Pan {
                delta_pixels,
                width,
            } => controller.pan(delta_pixels, width),
            ViewportOp::Brush { start, end } => controller.set(start, end),
        }

        let mut next = self.clone();
        next.adopt(&controller);
        debug!(?op, viewport = ?next.viewport, "applied viewport operation");
        next
    }

    /// Display points inside the viewport. In candle mode, the points covered by the
    /// visible candles.
    pub fn visible_points(&self) -> &[DisplayPoint] {
        let Some(viewport) = self.viewport else {
            return &[];
        };
        match self.state.mode {
            DisplayMode::Line => &self.points[viewport.start..=viewport.end],
            DisplayMode::Candles => {
                let from = self.candles[viewport.start].timestamp;
                let until = self.candles[viewport.end].timestamp + self.interval();
                let start = self.points.partition_point(|point| point.timestamp < from);
                let end = self.points.partition_point(|point| point.timestamp < until);
                &self.points[start..end.max(start)]
            }
        }
    }

    /// Candles inside the viewport. In line mode, the candles overlapping the visible points.
    pub fn visible_candles(&self) -> &[Candle] {
        let Some(viewport) = self.viewport else {
            return &[];
        };
        match self.state.mode {
            DisplayMode::Candles => &self.candles[viewport.start..=viewport.end],
            DisplayMode::Line => {
                let from = self.points[viewport.start].timestamp;
                let to = self.points[viewport.end].timestamp;
                let interval = self.interval();
                let start = self
                    .candles
                    .partition_point(|candle| candle.timestamp + interval <= from);
                let end = self.candles.partition_point(|candle| candle.timestamp <= to);
                &self.candles[start..end.max(start)]
            }
        }
    }

    /// Padded Y domain of the visible candles
    pub fn visible_domain(&self) -> Option<(f64, f64)> {
        price_domain(self.visible_candles(), self.domain_padding)
    }

    fn interval(&self) -> TimeDelta {
        TimeDelta::hours(i64::from(self.state.interval_hours))
    }

    /// Record the controller's viewport. A viewport covering the whole series is stored in
    /// the state as `None` so it keeps following the series as it grows.
    fn adopt(&mut self, controller: &ViewportController) {
        self.viewport = controller.viewport();
        let full = (!controller.is_empty()).then(|| Viewport::new(0, controller.len() - 1));
        self.state.viewport = if self.viewport == full {
            None
        } else {
            self.viewport
        };
    }
}

/// One display point per merged bucket. Indicator values are mapped back from the
/// actual-only sub-series, so buckets without an actual price carry none.
fn display_points(buckets: &[TimeBucket], indicators: &IndicatorSeries) -> Vec<DisplayPoint> {
    let mut actual_index = 0;
    buckets
        .iter()
        .map(|bucket| {
            let mut point = DisplayPoint::from(bucket);
            if bucket.actual_price.is_some() {
                for (line, _) in indicators.lines() {
                    *indicator_slot(&mut point, line) = indicators.value(line, actual_index);
                }
                actual_index += 1;
            }
            point
        })
        .collect()
}

fn indicator_slot(point: &mut DisplayPoint, line: IndicatorLine) -> &mut Option<f64> {
    match line {
        IndicatorLine::Sma20 => &mut point.sma20,
        IndicatorLine::Sma50 => &mut point.sma50,
        IndicatorLine::Ema12 => &mut point.ema12,
        IndicatorLine::Ema26 => &mut point.ema26,
        IndicatorLine::BbUpper => &mut point.bb_upper,
        IndicatorLine::BbMiddle => &mut point.bb_middle,
        IndicatorLine::BbLower => &mut point.bb_lower,
    }
}
