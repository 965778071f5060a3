//! Technical indicators over the actual-price sub-series
//!
//! Every output array is index-aligned with its input. Positions inside the warm-up period
//! are `None`, never `0.0`.

use crate::{config::EngineConfig, error::OverlayError};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Simple Moving Average: arithmetic mean of the trailing `period` values.
pub fn sma(values: &[f64], period: usize) -> Result<Vec<Option<f64>>, OverlayError> {
    check_period(period)?;

    let mut output = vec![None; values.len()];
    let mut window_sum = 0.0;

    for (index, value) in values.iter().enumerate() {
        window_sum += value;
        if index >= period {
            window_sum -= values[index - period];
        }
        if index + 1 >= period {
            output[index] = Some(window_sum / period as f64);
        }
    }

    Ok(output)
}

/// Exponential Moving Average seeded with the SMA of the first `period` values.
///
/// `ema[i] = (value[i] - ema[i-1]) * 2 / (period + 1) + ema[i-1]`
pub fn ema(values: &[f64], period: usize) -> Result<Vec<Option<f64>>, OverlayError> {
    check_period(period)?;

    let mut output = vec![None; values.len()];
    if values.len() < period {
        return Ok(output);
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let seed = values[..period].iter().sum::<f64>() / period as f64;
    output[period - 1] = Some(seed);

    let mut previous = seed;
    for index in period..values.len() {
        let current = (values[index] - previous) * multiplier + previous;
        output[index] = Some(current);
        previous = current;
    }

    Ok(output)
}

/// Bollinger Bands output, three arrays aligned with the input
#[derive(Debug, Clone, PartialEq)]
pub struct BollingerBands {
    pub upper: Vec<Option<f64>>,
    pub middle: Vec<Option<f64>>,
    pub lower: Vec<Option<f64>>,
}

/// Bollinger Bands: SMA ± `multiplier` × population standard deviation (divisor `period`).
pub fn bollinger(
    values: &[f64],
    period: usize,
    multiplier: f64,
) -> Result<BollingerBands, OverlayError> {
    if !multiplier.is_finite() || multiplier < 0.0 {
        return Err(OverlayError::InvalidMultiplier(multiplier));
    }

    let middle = sma(values, period)?;
    let mut upper = vec![None; values.len()];
    let mut lower = vec![None; values.len()];

    for (index, mean) in middle.iter().enumerate() {
        let Some(mean) = mean else {
            continue;
        };

        let window = &values[index + 1 - period..=index];
        let variance = window
            .iter()
            .map(|value| {
                let diff = value - mean;
                diff * diff
            })
            .sum::<f64>()
            / period as f64;
        let band = multiplier * variance.sqrt();

        upper[index] = Some(mean + band);
        lower[index] = Some(mean - band);
    }

    Ok(BollingerBands {
        upper,
        middle,
        lower,
    })
}

fn check_period(period: usize) -> Result<(), OverlayError> {
    if period == 0 {
        Err(OverlayError::InvalidPeriod { period })
    } else {
        Ok(())
    }
}

/// A selectable indicator, identified in preferences by its lowercase id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub enum Indicator {
    #[display("sma20")]
    Sma20,
    #[display("sma50")]
    Sma50,
    #[display("ema12")]
    Ema12,
    #[display("ema26")]
    Ema26,
    #[display("bollinger")]
    Bollinger,
}

impl Indicator {
    pub const ALL: [Indicator; 5] = [
        Indicator::Sma20,
        Indicator::Sma50,
        Indicator::Ema12,
        Indicator::Ema26,
        Indicator::Bollinger,
    ];

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|indicator| indicator.to_string().eq_ignore_ascii_case(id.trim()))
    }

    /// Output lines produced by this indicator
    pub fn lines(&self) -> &'static [IndicatorLine] {
        match self {
            Indicator::Sma20 => &[IndicatorLine::Sma20],
            Indicator::Sma50 => &[IndicatorLine::Sma50],
            Indicator::Ema12 => &[IndicatorLine::Ema12],
            Indicator::Ema26 => &[IndicatorLine::Ema26],
            Indicator::Bollinger => &[
                IndicatorLine::BbUpper,
                IndicatorLine::BbMiddle,
                IndicatorLine::BbLower,
            ],
        }
    }
}

/// One output array of the indicator engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorLine {
    #[display("sma20")]
    Sma20,
    #[display("sma50")]
    Sma50,
    #[display("ema12")]
    Ema12,
    #[display("ema26")]
    Ema26,
    #[display("bb_upper")]
    BbUpper,
    #[display("bb_middle")]
    BbMiddle,
    #[display("bb_lower")]
    BbLower,
}

/// User preference: which indicators to draw, in selection order without duplicates.
///
/// Persisted as a JSON list of ids, e.g. `["sma20","bollinger"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndicatorSelection(Vec<Indicator>);

impl Default for IndicatorSelection {
    fn default() -> Self {
        Self(vec![Indicator::Sma20])
    }
}

impl IndicatorSelection {
    pub fn none() -> Self {
        Self(Vec::new())
    }

    pub fn new<I>(indicators: I) -> Self
    where
        I: IntoIterator<Item = Indicator>,
    {
        let mut selection = Self::none();
        for indicator in indicators {
            selection.insert(indicator);
        }
        selection
    }

    pub fn contains(&self, indicator: Indicator) -> bool {
        self.0.contains(&indicator)
    }

    pub fn insert(&mut self, indicator: Indicator) {
        if !self.contains(indicator) {
            self.0.push(indicator);
        }
    }

    pub fn remove(&mut self, indicator: Indicator) {
        self.0.retain(|selected| *selected != indicator);
    }

    /// Flip an indicator on or off, as a checkbox does
    pub fn toggle(&mut self, indicator: Indicator) {
        if self.contains(indicator) {
            self.remove(indicator);
        } else {
            self.insert(indicator);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Indicator> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "[]".to_string())
    }

    /// Read a stored preference. Unknown ids are skipped; a payload that is not a list of
    /// strings is an error so the caller can fall back to the default.
    pub fn from_json(payload: &str) -> Result<Self, OverlayError> {
        Ok(serde_json::from_str(payload)?)
    }
}

impl Serialize for IndicatorSelection {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_seq(self.0.iter().map(ToString::to_string))
    }
}

impl<'de> Deserialize<'de> for IndicatorSelection {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let ids = Vec::<String>::deserialize(deserializer)?;
        let indicators = ids.iter().filter_map(|id| {
            let indicator = Indicator::from_id(id);
            if indicator.is_none() {
                warn!(id = %id, "ignoring unknown indicator in preference");
            }
            indicator
        });
        Ok(Self::new(indicators))
    }
}

/// Computed indicator arrays, each aligned with the actual-only sub-series
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndicatorSeries {
    lines: BTreeMap<IndicatorLine, Vec<Option<f64>>>,
}

impl IndicatorSeries {
    pub fn get(&self, line: IndicatorLine) -> Option<&[Option<f64>]> {
        self.lines.get(&line).map(Vec::as_slice)
    }

    /// Value of `line` at `index`, `None` if not computed or still warming up
    pub fn value(&self, line: IndicatorLine, index: usize) -> Option<f64> {
        self.lines.get(&line).and_then(|values| values.get(index).copied().flatten())
    }

    pub fn lines(&self) -> impl Iterator<Item = (IndicatorLine, &[Option<f64>])> {
        self.lines.iter().map(|(line, values)| (*line, values.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    fn insert(&mut self, line: IndicatorLine, values: Vec<Option<f64>>) {
        self.lines.insert(line, values);
    }
}

/// Computes the selected indicators over a chronological price array
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorEngine {
    min_points: usize,
    bollinger_period: usize,
    bollinger_multiplier: f64,
}

impl Default for IndicatorEngine {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl IndicatorEngine {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            min_points: config.min_points,
            bollinger_period: config.bollinger_period,
            bollinger_multiplier: config.bollinger_multiplier,
        }
    }

    pub fn compute(
        &self,
        values: &[f64],
        selection: &IndicatorSelection,
    ) -> Result<IndicatorSeries, OverlayError> {
        let mut series = IndicatorSeries::default();
        if values.len() < self.min_points {
            debug!(
                points = values.len(),
                min_points = self.min_points,
                "too few actual points for indicators"
            );
            return Ok(series);
        }

        for indicator in selection.iter() {
            match indicator {
                Indicator::Sma20 => series.insert(IndicatorLine::Sma20, sma(values, 20)?),
                Indicator::Sma50 => series.insert(IndicatorLine::Sma50, sma(values, 50)?),
                Indicator::Ema12 => series.insert(IndicatorLine::Ema12, ema(values, 12)?),
                Indicator::Ema26 => series.insert(IndicatorLine::Ema26, ema(values, 26)?),
                Indicator::Bollinger => {
                    let bands =
                        bollinger(values, self.bollinger_period, self.bollinger_multiplier)?;
                    series.insert(IndicatorLine::BbUpper, bands.upper);
                    series.insert(IndicatorLine::BbMiddle, bands.middle);
                    series.insert(IndicatorLine::BbLower, bands.lower);
                }
            }
        }

        Ok(series)
    }
}
