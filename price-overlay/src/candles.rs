//! OHLC candle aggregation and forecast candle synthesis
//!
//! Historical candles bucket the actual-price sub-series into interval-aligned OHLC bars.
//! Forecast candles are synthesized from prediction points after "now": each one opens at
//! the previous candle's close and closes at the predicted price.

use crate::{
    config::ForecastVolume,
    error::OverlayError,
    time::align_to_interval,
    types::{ActualPoint, PredictionPoint},
};
use chrono::{DateTime, TimeDelta, Utc};
use itertools::Itertools;
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::Serialize;
use tracing::debug;

/// OHLC candle, either observed or synthesized from predictions
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    /// Start of the interval bucket
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Mean of positive volume samples. Estimated (non-authoritative) on forecast candles.
    pub volume: f64,
    pub is_forecast: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_lower: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_upper: Option<f64>,
}

impl Candle {
    /// `low <= min(open, close)` and `high >= max(open, close)`
    pub fn is_consistent(&self) -> bool {
        self.low <= self.open.min(self.close) && self.high >= self.open.max(self.close)
    }

    pub fn is_bullish(&self) -> bool {
        self.close >= self.open
    }

    /// Lowest value drawn for this candle, including the confidence band
    pub fn floor(&self) -> f64 {
        self.confidence_lower.map_or(self.low, |lower| lower.min(self.low))
    }

    /// Highest value drawn for this candle, including the confidence band
    pub fn ceiling(&self) -> f64 {
        self.confidence_upper.map_or(self.high, |upper| upper.max(self.high))
    }
}

/// Buckets prices into candles of a fixed interval
#[derive(Debug, Clone, PartialEq)]
pub struct CandleAggregator {
    interval: TimeDelta,
    forecast_volume: ForecastVolume,
}

impl CandleAggregator {
    pub fn new(interval_hours: u32) -> Result<Self, OverlayError> {
        if interval_hours == 0 {
            return Err(OverlayError::InvalidInterval {
                hours: interval_hours,
            });
        }

        Ok(Self {
            interval: TimeDelta::hours(i64::from(interval_hours)),
            forecast_volume: ForecastVolume::default(),
        })
    }

    pub fn with_forecast_volume(mut self, policy: ForecastVolume) -> Self {
        self.forecast_volume = policy;
        self
    }

    pub fn interval(&self) -> TimeDelta {
        self.interval
    }

    /// Historical candles, then forecast candles chained from the last actual price.
    pub fn build(
        &self,
        actuals: &[ActualPoint],
        predictions: &[PredictionPoint],
        now: DateTime<Utc>,
    ) -> Vec<Candle> {
        let mut candles = self.aggregate(actuals);
        let last_actual = actuals.iter().max_by_key(|point| point.time).map(|point| point.price);
        let forecast = self.forecast(&candles, predictions, last_actual, now);
        candles.extend(forecast);
        candles
    }

    /// Aggregate observed prices into ascending, non-overlapping candles.
    pub fn aggregate(&self, points: &[ActualPoint]) -> Vec<Candle> {
        let mut sorted: Vec<&ActualPoint> = points.iter().collect();
        sorted.sort_by_key(|point| point.time);

        let chunks = sorted
            .into_iter()
            .chunk_by(|point| align_to_interval(point.time, self.interval));

        let mut candles = Vec::new();
        for (start, bucket) in &chunks {
            let mut bucket = bucket.peekable();
            let Some(first) = bucket.peek().map(|point| point.price) else {
                continue;
            };

            let mut candle = Candle {
                timestamp: start,
                open: first,
                high: first,
                low: first,
                close: first,
                volume: 0.0,
                is_forecast: false,
                confidence_lower: None,
                confidence_upper: None,
            };
            let mut volume_sum = 0.0;
            let mut volume_samples = 0usize;

            for point in bucket {
                candle.high = candle.high.max(point.price);
                candle.low = candle.low.min(point.price);
                candle.close = point.price;
                if let Some(volume) = point.volume.filter(|volume| *volume > 0.0) {
                    volume_sum += volume;
                    volume_samples += 1;
                }
            }

            if volume_samples > 0 {
                candle.volume = volume_sum / volume_samples as f64;
            }
            candles.push(candle);
        }

        candles
    }

    /// Synthesize forecast candles from predictions strictly after `now`.
    ///
    /// Buckets that end at or before `now`, or that start at or before the last historical
    /// candle, are skipped so forecast candles never overlap observed ones.
    pub fn forecast(
        &self,
        history: &[Candle],
        predictions: &[PredictionPoint],
        last_actual: Option<f64>,
        now: DateTime<Utc>,
    ) -> Vec<Candle> {
        let last_start = history.last().map(|candle| candle.timestamp);
        let base_volume = history.last().map_or(0.0, |candle| candle.volume);
        let mut volume = VolumeEstimator::new(self.forecast_volume, base_volume);

        let mut upcoming: Vec<&PredictionPoint> =
            predictions.iter().filter(|point| point.time > now).collect();
        upcoming.sort_by_key(|point| point.time);

        let chunks = upcoming
            .into_iter()
            .chunk_by(|point| align_to_interval(point.time, self.interval));

        let mut previous_close = last_actual.or_else(|| history.last().map(|candle| candle.close));
        let mut candles = Vec::new();

        for (start, bucket) in &chunks {
            if start + self.interval <= now || last_start.is_some_and(|last| start <= last) {
                continue;
            }

            let bucket: Vec<&PredictionPoint> = bucket.collect();
            let (Some(first), Some(last)) = (bucket.first(), bucket.last()) else {
                continue;
            };

            let open = previous_close.unwrap_or(first.price);
            let close = last.price;
            let confidence_lower = bucket.iter().filter_map(|point| point.lower).reduce(f64::min);
            let confidence_upper = bucket.iter().filter_map(|point| point.upper).reduce(f64::max);

            let mut high = open.max(close);
            let mut low = open.min(close);
            for point in &bucket {
                high = high.max(point.price);
                low = low.min(point.price);
            }
            if let Some(lower) = confidence_lower {
                low = low.min(lower);
            }
            if let Some(upper) = confidence_upper {
                high = high.max(upper);
            }

            candles.push(Candle {
                timestamp: start,
                open,
                high,
                low,
                close,
                volume: volume.next(),
                is_forecast: true,
                confidence_lower,
                confidence_upper,
            });
            previous_close = Some(close);
        }

        debug!(
            forecast_candles = candles.len(),
            interval_hours = self.interval.num_hours(),
            "synthesized forecast candles"
        );

        candles
    }
}

/// Placeholder volume for forecast candles
struct VolumeEstimator {
    base: f64,
    jitter: Option<(StdRng, f64)>,
}

impl VolumeEstimator {
    fn new(policy: ForecastVolume, base: f64) -> Self {
        let jitter = match policy {
            ForecastVolume::RepeatLast => None,
            ForecastVolume::Jitter { seed, amplitude }
                if amplitude.is_finite() && amplitude > 0.0 =>
            {
                Some((StdRng::seed_from_u64(seed), amplitude))
            }
            ForecastVolume::Jitter { .. } => None,
        };
        Self { base, jitter }
    }

    fn next(&mut self) -> f64 {
        match &mut self.jitter {
            None => self.base,
            Some((rng, amplitude)) => {
                let amplitude = *amplitude;
                self.base * (1.0 + rng.random_range(-amplitude..=amplitude))
            }
        }
    }
}

/// Padded Y domain covering every OHLC value and confidence bound.
///
/// A flat series (zero span) is padded by `padding` of its magnitude, at least `1.0`.
pub fn price_domain(candles: &[Candle], padding: f64) -> Option<(f64, f64)> {
    let min = candles.iter().map(Candle::floor).reduce(f64::min)?;
    let max = candles.iter().map(Candle::ceiling).reduce(f64::max)?;

    let span = max - min;
    let pad = if span > f64::EPSILON {
        span * padding
    } else {
        (max.abs() * padding).max(1.0)
    };

    Some((min - pad, max + pad))
}
