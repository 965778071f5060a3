//! Engine configuration
//!
//! Every tunable constant of the pipeline lives in [`EngineConfig`]. Defaults match the
//! dashboard's behaviour; a handful of values can be overridden from the environment.

use crate::error::OverlayError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// How synthesized forecast candles estimate their volume.
///
/// Forecast volume is never observed, so either policy is a placeholder for display only.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ForecastVolume {
    /// Repeat the last historical candle's volume.
    #[default]
    RepeatLast,
    /// Last historical volume scaled by a seeded random factor in `1 ± amplitude`.
    Jitter { seed: u64, amplitude: f64 },
}

/// Configuration for the merge / indicator / candle / viewport / alert pipeline.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fewer actual points than this and no indicator is computed
    pub min_points: usize,
    pub bollinger_period: usize,
    pub bollinger_multiplier: f64,
    pub candle_interval_hours: u32,
    /// Fraction of the price span added above and below the candle Y domain
    pub domain_padding: f64,
    /// Smallest number of points a viewport may span
    pub min_span: usize,
    pub zoom_in_factor: f64,
    pub zoom_out_factor: f64,
    /// Number of points shown by "jump to now"
    pub jump_window: usize,
    pub pan_speed: f64,
    /// Actual prices stamped up to this many seconds in the future are still accepted
    pub actual_future_tolerance_secs: i64,
    pub spike_threshold: f64,
    pub negative_threshold: f64,
    /// Number of upcoming predicted points scanned by timing and volatility rules
    pub lookahead_points: usize,
    /// Root mean square deviation from the first predicted price, in price units
    pub volatility_threshold: f64,
    pub forecast_volume: ForecastVolume,
    /// Window in which live triggers are coalesced into one recompute
    pub debounce_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_points: 5,
            bollinger_period: 20,
            bollinger_multiplier: 2.0,
            candle_interval_hours: 1,
            domain_padding: 0.10,
            min_span: 5,
            zoom_in_factor: 0.6,
            zoom_out_factor: 1.5,
            jump_window: 24,
            pan_speed: 1.0,
            actual_future_tolerance_secs: 60,
            spike_threshold: 100.0,
            negative_threshold: 0.0,
            lookahead_points: 24,
            volatility_threshold: 50.0,
            forecast_volume: ForecastVolume::RepeatLast,
            debounce_ms: 150,
        }
    }
}

impl EngineConfig {
    /// Load defaults overlaid with `OVERLAY_*` environment variables.
    pub fn from_env() -> Result<Self, OverlayError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Overlay values looked up by `lookup` onto this configuration.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, OverlayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = parse_override(&lookup, "OVERLAY_BOLLINGER_PERIOD")? {
            self.bollinger_period = value;
        }
        if let Some(value) = parse_override(&lookup, "OVERLAY_CANDLE_INTERVAL_HOURS")? {
            self.candle_interval_hours = value;
        }
        if let Some(value) = parse_override(&lookup, "OVERLAY_DEBOUNCE_MS")? {
            self.debounce_ms = value;
        }
        if let Some(value) = parse_override(&lookup, "OVERLAY_SPIKE_THRESHOLD")? {
            self.spike_threshold = value;
        }
        Ok(self)
    }

    /// Set the candle interval
    pub fn with_candle_interval_hours(mut self, hours: u32) -> Self {
        self.candle_interval_hours = hours;
        self
    }

    /// Set Bollinger period and multiplier
    pub fn with_bollinger(mut self, period: usize, multiplier: f64) -> Self {
        self.bollinger_period = period;
        self.bollinger_multiplier = multiplier;
        self
    }

    /// Set the forecast volume policy
    pub fn with_forecast_volume(mut self, policy: ForecastVolume) -> Self {
        self.forecast_volume = policy;
        self
    }

    /// Set the live debounce window
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = debounce.as_millis() as u64;
        self
    }

    /// Set the pan speed factor
    pub fn with_pan_speed(mut self, pan_speed: f64) -> Self {
        self.pan_speed = pan_speed;
        self
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

fn parse_override<F, T>(lookup: &F, key: &str) -> Result<Option<T>, OverlayError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| OverlayError::Config {
                key: key.to_string(),
                value: raw,
            }),
    }
}
