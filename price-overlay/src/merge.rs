//! Hour-bucket merge of independently timestamped feeds
//!
//! Every source batch is first collapsed per hour (later points in the batch win), then
//! written into the shared bucket map according to [`MERGE_POLICY`]:
//!
//! | source       | fields                                    | write policy | gate                    |
//! |--------------|-------------------------------------------|--------------|-------------------------|
//! | `actual`     | `actual_price`, `volume`                  | fill empty   | hour start <= now + tol |
//! | `forecast`   | `forecast_price`                          | overwrite    | none                    |
//! | `prediction` | `ai_price`, `ai_lower`, `ai_upper`, `ai_confidence` | overwrite | none           |
//!
//! A bucket is created for every in-window hour any source reports, even if the gate then
//! rejects the fields, so gaps stay visible in the merged series.

use crate::{
    time::{HourKey, parse_timestamp},
    types::{RawPoint, SourceBatch, SourceKind, TimeBucket},
};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::BTreeMap;
use tracing::debug;

/// A single merged field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    ActualPrice,
    Volume,
    ForecastPrice,
    AiPrice,
    AiLower,
    AiUpper,
    AiConfidence,
}

impl Field {
    fn read(&self, point: &RawPoint) -> Option<f64> {
        match self {
            Field::ActualPrice => point.actual_price,
            Field::Volume => point.volume_proxy,
            Field::ForecastPrice => point.forecast_price,
            Field::AiPrice => point.ai_price,
            Field::AiLower => point.ai_lower,
            Field::AiUpper => point.ai_upper,
            Field::AiConfidence => point.ai_confidence,
        }
    }

    fn value(&self, bucket: &TimeBucket) -> Option<f64> {
        match self {
            Field::ActualPrice => bucket.actual_price,
            Field::Volume => bucket.volume,
            Field::ForecastPrice => bucket.forecast_price,
            Field::AiPrice => bucket.ai_price,
            Field::AiLower => bucket.ai_lower,
            Field::AiUpper => bucket.ai_upper,
            Field::AiConfidence => bucket.ai_confidence,
        }
    }

    fn slot<'a>(&self, bucket: &'a mut TimeBucket) -> &'a mut Option<f64> {
        match self {
            Field::ActualPrice => &mut bucket.actual_price,
            Field::Volume => &mut bucket.volume,
            Field::ForecastPrice => &mut bucket.forecast_price,
            Field::AiPrice => &mut bucket.ai_price,
            Field::AiLower => &mut bucket.ai_lower,
            Field::AiUpper => &mut bucket.ai_upper,
            Field::AiConfidence => &mut bucket.ai_confidence,
        }
    }
}

/// How a source writes into a bucket field that may already hold a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    /// Only set the field if it is still empty
    FillEmpty,
    /// Replace whatever is there
    Overwrite,
}

/// One row of the merge policy table
#[derive(Debug, Clone, Copy)]
pub struct MergeRule {
    pub source: SourceKind,
    pub fields: &'static [Field],
    pub policy: WritePolicy,
    /// Reject values whose hour starts after "now" (plus tolerance)
    pub not_after_now: bool,
}

pub const MERGE_POLICY: [MergeRule; 3] = [
    MergeRule {
        source: SourceKind::Actual,
        fields: &[Field::ActualPrice, Field::Volume],
        policy: WritePolicy::FillEmpty,
        not_after_now: true,
    },
    MergeRule {
        source: SourceKind::Forecast,
        fields: &[Field::ForecastPrice],
        policy: WritePolicy::Overwrite,
        not_after_now: false,
    },
    MergeRule {
        source: SourceKind::Prediction,
        fields: &[
            Field::AiPrice,
            Field::AiLower,
            Field::AiUpper,
            Field::AiConfidence,
        ],
        policy: WritePolicy::Overwrite,
        not_after_now: false,
    },
];

/// Policy row for a source
pub fn rule_for(source: SourceKind) -> &'static MergeRule {
    match source {
        SourceKind::Actual => &MERGE_POLICY[0],
        SourceKind::Forecast => &MERGE_POLICY[1],
        SourceKind::Prediction => &MERGE_POLICY[2],
    }
}

/// Inclusive `[past, future]` window the merged series is restricted to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeWindow {
    pub past: DateTime<Utc>,
    pub future: DateTime<Utc>,
}

impl MergeWindow {
    pub fn new(past: DateTime<Utc>, future: DateTime<Utc>) -> Self {
        Self { past, future }
    }

    /// Window reaching `past` back and `future` ahead of `now`
    pub fn around(now: DateTime<Utc>, past: TimeDelta, future: TimeDelta) -> Self {
        Self::new(now - past, now + future)
    }

    /// True if the hour bucket overlaps the window
    pub fn contains(&self, key: HourKey) -> bool {
        key.start() >= HourKey::of(self.past).start() && key.start() <= self.future
    }
}

/// Counters describing what happened to the input points
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub accepted: usize,
    /// Unparsable timestamps
    pub malformed: usize,
    pub out_of_window: usize,
    /// Actual values rejected because their hour lies in the future
    pub future_actuals: usize,
}

/// Result of a merge pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Merged {
    pub buckets: Vec<TimeBucket>,
    pub stats: MergeStats,
}

/// Merges raw point lists into one ascending hour-keyed series
#[derive(Debug, Clone)]
pub struct TimeBucketMerger {
    now: DateTime<Utc>,
    window: MergeWindow,
    future_tolerance: TimeDelta,
}

impl TimeBucketMerger {
    pub fn new(now: DateTime<Utc>, window: MergeWindow) -> Self {
        Self {
            now,
            window,
            future_tolerance: TimeDelta::seconds(60),
        }
    }

    pub fn with_future_tolerance(mut self, tolerance: TimeDelta) -> Self {
        self.future_tolerance = tolerance;
        self
    }

    /// Merge and keep only the buckets
    pub fn merge(&self, batches: &[SourceBatch]) -> Vec<TimeBucket> {
        self.merge_with_stats(batches).buckets
    }

    pub fn merge_with_stats(&self, batches: &[SourceBatch]) -> Merged {
        let mut stats = MergeStats::default();
        let mut buckets: BTreeMap<HourKey, TimeBucket> = BTreeMap::new();
        let gate = self.now + self.future_tolerance;

        for batch in batches {
            let rule = rule_for(batch.kind);

            for (key, collapsed) in self.collapse(batch, rule, &mut stats) {
                let bucket = buckets.entry(key).or_insert_with(|| TimeBucket::empty(key));

                if rule.not_after_now && key.start() > gate {
                    if rule.fields.iter().any(|field| field.value(&collapsed).is_some()) {
                        stats.future_actuals += 1;
                    }
                    continue;
                }

                for field in rule.fields {
                    write(field.slot(bucket), field.value(&collapsed), rule.policy);
                }
            }
        }

        debug!(
            buckets = buckets.len(),
            accepted = stats.accepted,
            malformed = stats.malformed,
            out_of_window = stats.out_of_window,
            future_actuals = stats.future_actuals,
            "merged source batches"
        );

        Merged {
            buckets: buckets.into_values().collect(),
            stats,
        }
    }

    /// Collapse one batch to a single partial bucket per hour. Later points overwrite
    /// earlier ones field by field.
    fn collapse(
        &self,
        batch: &SourceBatch,
        rule: &MergeRule,
        stats: &mut MergeStats,
    ) -> BTreeMap<HourKey, TimeBucket> {
        let mut collapsed: BTreeMap<HourKey, TimeBucket> = BTreeMap::new();

        for point in &batch.points {
            let Some(time) = parse_timestamp(&point.timestamp) else {
                stats.malformed += 1;
                continue;
            };

            let key = HourKey::of(time);
            if !self.window.contains(key) {
                stats.out_of_window += 1;
                continue;
            }

            stats.accepted += 1;
            let partial = collapsed.entry(key).or_insert_with(|| TimeBucket::empty(key));
            for field in rule.fields {
                write(field.slot(partial), field.read(point), WritePolicy::Overwrite);
            }
        }

        collapsed
    }
}

fn write(slot: &mut Option<f64>, value: Option<f64>, policy: WritePolicy) {
    let Some(value) = value else {
        return;
    };

    match policy {
        WritePolicy::Overwrite => *slot = Some(value),
        WritePolicy::FillEmpty => {
            if slot.is_none() {
                *slot = Some(value);
            }
        }
    }
}
