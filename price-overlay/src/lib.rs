//! Price Overlay - time-series reconciliation and technical analysis for a market dashboard
//!
//! Three independently timestamped feeds (observed prices, a vendor forecast and an AI
//! prediction with confidence band) are merged into one hour-keyed series. On top of it
//! the library computes:
//! - SMA / EMA / Bollinger Bands over the observed prices
//! - OHLC candles, including synthetic forecast candles chained from the last price
//! - a zoomable, pannable viewport over the displayed series
//! - advisory alert notices
//!
//! Every stage is a pure function; [`chart::recompute`] runs them in order and returns an
//! immutable [`ChartSnapshot`]. The [`live`] module drives recomputes from a channel of
//! triggers for callers that receive data asynchronously.

pub mod alerts;
pub mod candles;
pub mod chart;
pub mod config;
pub mod error;
pub mod indicators;
pub mod live;
pub mod merge;
pub mod time;
pub mod types;
pub mod viewport;

pub use alerts::{Alert, AlertCondition, AlertEvaluator, Notice};
pub use candles::{Candle, CandleAggregator, price_domain};
pub use chart::{
    ChartInputs, ChartSnapshot, ChartState, DisplayMode, TimeRange, ViewportOp, recompute,
};
pub use config::{EngineConfig, ForecastVolume};
pub use error::OverlayError;
pub use indicators::{
    Indicator, IndicatorEngine, IndicatorLine, IndicatorSelection, IndicatorSeries, bollinger,
    ema, sma,
};
pub use live::{SnapshotReceiver, Trigger, spawn_recompute_loop};
pub use merge::{MergeStats, MergeWindow, TimeBucketMerger};
pub use types::{DisplayPoint, RawPoint, SourceBatch, SourceKind, TimeBucket};
pub use viewport::{Viewport, ViewportController};
