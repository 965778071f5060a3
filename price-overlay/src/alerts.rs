//! Advisory notices derived from the merged series
//!
//! Evaluation is a pure function of the merged buckets, the configured alerts and "now".
//! Notices come out in a fixed rule order: spike, negative price, optimal timing,
//! volatility, then user thresholds in alert order. Remembering which notices were already
//! delivered is the caller's job.

use crate::{
    config::EngineConfig,
    time::hours_between,
    types::{PredictionPoint, TimeBucket},
};
use chrono::{DateTime, Utc};
use derive_more::{Constructor, Display};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Direction a user threshold fires in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertCondition {
    #[display("above")]
    Above,
    #[display("below")]
    Below,
}

/// A user configured price threshold
#[derive(Debug, Clone, Copy, PartialEq, Constructor, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub threshold_value: f64,
    pub condition: AlertCondition,
    pub is_active: bool,
}

impl Alert {
    pub fn is_crossed_by(&self, price: f64) -> bool {
        match self.condition {
            AlertCondition::Above => price > self.threshold_value,
            AlertCondition::Below => price < self.threshold_value,
        }
    }
}

/// An advisory message for the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    /// First upcoming predicted price above the spike threshold
    Spike {
        at: DateTime<Utc>,
        price: f64,
        hours_until: i64,
    },
    /// First upcoming predicted price below the negative threshold
    NegativePrice {
        at: DateTime<Utc>,
        price: f64,
        hours_until: i64,
    },
    /// Cheapest point among the next predicted points
    OptimalTiming { at: DateTime<Utc>, price: f64 },
    /// Predicted prices swing widely around where they start
    Volatility { std_dev: f64, first_price: f64 },
    /// A user alert is crossed by the latest actual price, or will be by a predicted price
    ThresholdCrossed {
        alert: Alert,
        at: DateTime<Utc>,
        price: f64,
        predicted: bool,
    },
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notice::Spike {
                at,
                price,
                hours_until,
            } => write!(
                f,
                "Price spike expected in {}h: {:.2} at {}",
                hours_until,
                price,
                at.format("%Y-%m-%d %H:%M")
            ),
            Notice::NegativePrice {
                at,
                price,
                hours_until,
            } => write!(
                f,
                "Negative price expected in {}h: {:.2} at {}",
                hours_until,
                price,
                at.format("%Y-%m-%d %H:%M")
            ),
            Notice::OptimalTiming { at, price } => write!(
                f,
                "Lowest predicted price {:.2} at {}",
                price,
                at.format("%Y-%m-%d %H:%M")
            ),
            Notice::Volatility {
                std_dev,
                first_price,
            } => write!(
                f,
                "High volatility expected: predicted prices deviate {:.2} from {:.2}",
                std_dev, first_price
            ),
            Notice::ThresholdCrossed {
                alert,
                at,
                price,
                predicted,
            } => write!(
                f,
                "{} price {:.2} is {} your {:.2} threshold at {}",
                if *predicted { "Predicted" } else { "Current" },
                price,
                alert.condition,
                alert.threshold_value,
                at.format("%Y-%m-%d %H:%M")
            ),
        }
    }
}

/// Scans the merged series for threshold conditions
#[derive(Debug, Clone, PartialEq)]
pub struct AlertEvaluator {
    spike_threshold: f64,
    negative_threshold: f64,
    lookahead_points: usize,
    volatility_threshold: f64,
}

impl Default for AlertEvaluator {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl AlertEvaluator {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            spike_threshold: config.spike_threshold,
            negative_threshold: config.negative_threshold,
            lookahead_points: config.lookahead_points,
            volatility_threshold: config.volatility_threshold,
        }
    }

    pub fn evaluate(
        &self,
        buckets: &[TimeBucket],
        alerts: &[Alert],
        now: DateTime<Utc>,
    ) -> Vec<Notice> {
        let upcoming: Vec<PredictionPoint> = buckets
            .iter()
            .filter(|bucket| bucket.time() > now)
            .filter_map(TimeBucket::prediction)
            .collect();
        let next = &upcoming[..upcoming.len().min(self.lookahead_points)];

        let mut notices = Vec::new();

        if let Some(point) = upcoming.iter().find(|point| point.price > self.spike_threshold) {
            notices.push(Notice::Spike {
                at: point.time,
                price: point.price,
                hours_until: hours_until(now, point.time),
            });
        }

        if let Some(point) = upcoming.iter().find(|point| point.price < self.negative_threshold) {
            notices.push(Notice::NegativePrice {
                at: point.time,
                price: point.price,
                hours_until: hours_until(now, point.time),
            });
        }

        // Earliest of equal minima
        if let Some(point) = next
            .iter()
            .reduce(|best, point| if point.price < best.price { point } else { best })
        {
            notices.push(Notice::OptimalTiming {
                at: point.time,
                price: point.price,
            });
        }

        if let Some(notice) = self.volatility(next) {
            notices.push(notice);
        }

        let latest_actual = buckets.iter().rev().find_map(TimeBucket::actual);
        for alert in alerts.iter().filter(|alert| alert.is_active) {
            let current = latest_actual
                .filter(|point| alert.is_crossed_by(point.price))
                .map(|point| (point.time, point.price, false));
            let predicted = || {
                upcoming
                    .iter()
                    .find(|point| alert.is_crossed_by(point.price))
                    .map(|point| (point.time, point.price, true))
            };

            if let Some((at, price, predicted)) = current.or_else(predicted) {
                notices.push(Notice::ThresholdCrossed {
                    alert: *alert,
                    at,
                    price,
                    predicted,
                });
            }
        }

        debug!(
            upcoming = upcoming.len(),
            alerts = alerts.len(),
            notices = notices.len(),
            "evaluated alerts"
        );

        notices
    }

    /// Root mean square deviation of `next` from its first price, in price units
    fn volatility(&self, next: &[PredictionPoint]) -> Option<Notice> {
        if next.len() < 2 {
            return None;
        }
        let first_price = next[0].price;

        let n = next.len() as f64;
        let variance = next
            .iter()
            .map(|point| (point.price - first_price).powi(2))
            .sum::<f64>()
            / n;
        let std_dev = variance.sqrt();

        (std_dev > self.volatility_threshold).then_some(Notice::Volatility {
            std_dev,
            first_price,
        })
    }
}

fn hours_until(now: DateTime<Utc>, at: DateTime<Utc>) -> i64 {
    hours_between(now, at).ceil().max(0.0) as i64
}
