//! Live recompute driver
//!
//! Owns the latest source batches, alerts and chart state, and turns a stream of
//! [`Trigger`]s into [`ChartSnapshot`]s published on a `watch` channel. Triggers arriving
//! within the debounce window of the first one are coalesced into a single recompute.
//! Viewport operations alone reuse the previous snapshot instead of recomputing.

use crate::{
    alerts::Alert,
    chart::{ChartInputs, ChartSnapshot, ChartState, ViewportOp, recompute},
    config::EngineConfig,
    time::{HourKey, parse_timestamp},
    types::{RawPoint, SourceBatch, SourceKind},
};
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, btree_map::Entry},
    sync::Arc,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, timeout_at},
};
use tracing::{debug, info, warn};

/// Latest published snapshot, `None` until the first recompute succeeds
pub type SnapshotReceiver = watch::Receiver<Option<Arc<ChartSnapshot>>>;

/// Something that changes what the chart shows
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Replace every point previously received from this source
    Replace(SourceBatch),
    /// Add points to those previously received from this source
    Append(SourceBatch),
    Alerts(Vec<Alert>),
    /// New indicator selection, interval, time range or display mode
    Configure(ChartState),
    Viewport(ViewportOp),
    /// Process what is pending, then stop
    Shutdown,
}

/// Spawn the recompute loop. It runs until [`Trigger::Shutdown`] is received or every
/// trigger sender is dropped.
///
/// `clock` supplies "now" for each recompute.
pub fn spawn_recompute_loop<C>(
    config: EngineConfig,
    state: ChartState,
    clock: C,
    mut triggers: mpsc::Receiver<Trigger>,
) -> (JoinHandle<()>, SnapshotReceiver)
where
    C: Fn() -> DateTime<Utc> + Send + 'static,
{
    let (snapshot_tx, snapshot_rx) = watch::channel(None);

    let handle = tokio::spawn(async move {
        let debounce = config.debounce();
        let mut inputs = LiveInputs::new(state);
        info!(debounce_ms = config.debounce_ms, "starting recompute loop");

        while let Some(first) = triggers.recv().await {
            let deadline = Instant::now() + debounce;
            let mut burst = vec![first];

            while !matches!(burst.last(), Some(Trigger::Shutdown)) {
                match timeout_at(deadline, triggers.recv()).await {
                    Ok(Some(trigger)) => burst.push(trigger),
                    Ok(None) | Err(_) => break,
                }
            }

            debug!(triggers = burst.len(), "coalesced triggers");
            let mut shutdown = false;
            for trigger in burst {
                shutdown |= inputs.absorb(trigger);
            }

            if let Some(snapshot) = inputs.refresh(&config, clock()) {
                snapshot_tx.send_replace(Some(snapshot));
            }

            if shutdown {
                break;
            }
        }

        info!("recompute loop stopped");
    });

    (handle, snapshot_rx)
}

/// Everything the driver keeps between recomputes
#[derive(Debug)]
struct LiveInputs {
    batches: BTreeMap<SourceKind, SourceBatch>,
    alerts: Vec<Alert>,
    state: ChartState,
    latest: Option<Arc<ChartSnapshot>>,
    dirty: bool,
    pending_ops: Vec<ViewportOp>,
}

impl LiveInputs {
    fn new(state: ChartState) -> Self {
        Self {
            batches: BTreeMap::new(),
            alerts: Vec::new(),
            state,
            latest: None,
            dirty: false,
            pending_ops: Vec::new(),
        }
    }

    /// Record a trigger. Returns true for [`Trigger::Shutdown`].
    fn absorb(&mut self, trigger: Trigger) -> bool {
        match trigger {
            Trigger::Replace(batch) => {
                debug!(source = %batch.kind, points = batch.points.len(), "replacing source batch");
                self.batches.insert(batch.kind, batch);
                self.dirty = true;
            }
            Trigger::Append(batch) => {
                debug!(
                    source = %batch.kind,
                    points = batch.points.len(),
                    "appending to source batch"
                );
                self.batches
                    .entry(batch.kind)
                    .or_insert_with(|| SourceBatch::new(batch.kind, Vec::new()))
                    .points
                    .extend(batch.points);
                self.dirty = true;
            }
            Trigger::Alerts(alerts) => {
                self.alerts = alerts;
                self.dirty = true;
            }
            Trigger::Configure(state) => {
                self.state = state;
                self.dirty = true;
            }
            Trigger::Viewport(op) => self.pending_ops.push(op),
            Trigger::Shutdown => return true,
        }
        false
    }

    /// Produce the next snapshot, if anything changed since the last one
    fn refresh(&mut self, config: &EngineConfig, now: DateTime<Utc>) -> Option<Arc<ChartSnapshot>> {
        let ops = std::mem::take(&mut self.pending_ops);

        let base = match &self.latest {
            Some(latest) if !self.dirty => {
                if ops.is_empty() {
                    return None;
                }
                ChartSnapshot::clone(latest)
            }
            _ => {
                if !self.dirty && ops.is_empty() {
                    return None;
                }
                self.dirty = false;
                self.prune(now);

                let inputs = ChartInputs::new(
                    self.batches.values().cloned().collect(),
                    self.alerts.clone(),
                    now,
                );
                match recompute(&self.state, &inputs, config) {
                    Ok(snapshot) => snapshot,
                    Err(error) => {
                        warn!(%error, "recompute failed, keeping previous snapshot");
                        return None;
                    }
                }
            }
        };

        let snapshot = ops.into_iter().fold(base, |snapshot, op| snapshot.apply(op));
        self.state = snapshot.state.clone();

        let snapshot = Arc::new(snapshot);
        self.latest = Some(Arc::clone(&snapshot));
        Some(snapshot)
    }

    /// Keep at most one point per hour from the start of the chart window onward.
    /// Unparsable points are dropped.
    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = HourKey::of(self.state.time_range.window(now).past);

        for batch in self.batches.values_mut() {
            let before = batch.points.len();
            let mut hours: BTreeMap<HourKey, RawPoint> = BTreeMap::new();

            for point in batch.points.drain(..) {
                let Some(key) = parse_timestamp(&point.timestamp).map(HourKey::of) else {
                    continue;
                };
                if key < cutoff {
                    continue;
                }
                match hours.entry(key) {
                    Entry::Occupied(mut earlier) => earlier.get_mut().overlay(point),
                    Entry::Vacant(slot) => {
                        slot.insert(point);
                    }
                }
            }

            batch.points = hours.into_values().collect();
            if batch.points.len() < before {
                debug!(
                    source = %batch.kind,
                    dropped = before - batch.points.len(),
                    kept = batch.points.len(),
                    "pruned source batch"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{chart::DisplayMode, viewport::Viewport};
    use chrono::{TimeDelta, TimeZone};
    use std::time::Duration;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 10, 0).unwrap()
    }

    fn actuals(hours: std::ops::Range<i64>) -> SourceBatch {
        let hour = now() - TimeDelta::minutes(10);
        let points = hours
            .map(|back| {
                RawPoint::at((hour - TimeDelta::hours(back)).to_rfc3339())
                    .with_actual(30.0 + back as f64)
                    .with_volume(7000.0)
            })
            .collect();
        SourceBatch::new(SourceKind::Actual, points)
    }

    fn predictions(hours: i64) -> SourceBatch {
        let hour = now() - TimeDelta::minutes(10);
        let points = (1..=hours)
            .map(|ahead| {
                RawPoint::at((hour + TimeDelta::hours(ahead)).to_rfc3339())
                    .with_prediction(35.0, Some(30.0), Some(40.0))
            })
            .collect();
        SourceBatch::new(SourceKind::Prediction, points)
    }

    fn spawn(config: EngineConfig) -> (mpsc::Sender<Trigger>, JoinHandle<()>, SnapshotReceiver) {
        let (trigger_tx, trigger_rx) = mpsc::channel(16);
        let (handle, snapshots) =
            spawn_recompute_loop(config, ChartState::default(), now, trigger_rx);
        (trigger_tx, handle, snapshots)
    }

    fn latest(snapshots: &SnapshotReceiver) -> Arc<ChartSnapshot> {
        snapshots.borrow().clone().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_coalesced_into_one_snapshot() {
        let (triggers, _handle, mut snapshots) = spawn(EngineConfig::default());

        triggers.send(Trigger::Replace(actuals(0..10))).await.unwrap();
        triggers.send(Trigger::Replace(predictions(5))).await.unwrap();
        triggers
            .send(Trigger::Configure(ChartState::default().with_mode(DisplayMode::Candles)))
            .await
            .unwrap();

        snapshots.changed().await.unwrap();
        let snapshot = latest(&snapshots);
        assert_eq!(snapshot.buckets.len(), 15);
        assert_eq!(snapshot.state.mode, DisplayMode::Candles);
        assert!(!snapshots.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_append_extends_previous_points() {
        let (triggers, _handle, mut snapshots) = spawn(EngineConfig::default());

        triggers.send(Trigger::Replace(actuals(5..10))).await.unwrap();
        snapshots.changed().await.unwrap();
        assert_eq!(latest(&snapshots).buckets.len(), 5);

        triggers.send(Trigger::Append(actuals(0..5))).await.unwrap();
        snapshots.changed().await.unwrap();
        assert_eq!(latest(&snapshots).buckets.len(), 10);

        triggers.send(Trigger::Replace(actuals(0..2))).await.unwrap();
        snapshots.changed().await.unwrap();
        assert_eq!(latest(&snapshots).buckets.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_appends_are_bounded_by_the_time_range() {
        let (triggers, _handle, mut snapshots) = spawn(EngineConfig::default());

        // Two day window: hours 0..=48 back from the current hour are kept
        triggers.send(Trigger::Append(actuals(0..200))).await.unwrap();
        snapshots.changed().await.unwrap();
        let snapshot = latest(&snapshots);
        assert_eq!(snapshot.buckets.len(), 49);
        assert_eq!(snapshot.stats.accepted, 49);
        assert_eq!(snapshot.stats.out_of_window, 0);

        for _ in 0..5 {
            triggers.send(Trigger::Append(actuals(0..200))).await.unwrap();
            snapshots.changed().await.unwrap();
        }
        let snapshot = latest(&snapshots);
        assert_eq!(snapshot.buckets.len(), 49);
        assert_eq!(snapshot.stats.accepted, 49);
        assert_eq!(snapshot.stats.out_of_window, 0);
    }

    #[test]
    fn test_prune_folds_points_of_the_same_hour() {
        let hour = (now() - TimeDelta::minutes(10)).to_rfc3339();
        let mut inputs = LiveInputs::new(ChartState::default());

        inputs.absorb(Trigger::Append(SourceBatch::new(
            SourceKind::Actual,
            vec![
                RawPoint::at(hour.clone()).with_actual(10.0).with_volume(500.0),
                RawPoint::at("garbage").with_actual(1.0),
            ],
        )));
        inputs.absorb(Trigger::Append(SourceBatch::new(
            SourceKind::Actual,
            vec![RawPoint::at(hour.clone()).with_actual(12.0)],
        )));
        inputs.absorb(Trigger::Append(actuals(100..120)));
        assert_eq!(inputs.batches[&SourceKind::Actual].points.len(), 23);

        let snapshot = inputs.refresh(&EngineConfig::default(), now()).unwrap();
        assert_eq!(
            inputs.batches[&SourceKind::Actual].points,
            vec![RawPoint::at(hour).with_actual(12.0).with_volume(500.0)]
        );
        assert_eq!(snapshot.buckets.len(), 1);
        assert_eq!(snapshot.buckets[0].actual_price, Some(12.0));
        assert_eq!(snapshot.buckets[0].volume, Some(500.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_viewport_ops_reuse_data_and_persist() {
        let (triggers, _handle, mut snapshots) = spawn(EngineConfig::default());

        triggers.send(Trigger::Replace(actuals(0..40))).await.unwrap();
        snapshots.changed().await.unwrap();
        let first = latest(&snapshots);
        assert_eq!(first.viewport, Some(Viewport::new(0, 39)));

        triggers
            .send(Trigger::Viewport(ViewportOp::Brush { start: 5, end: 20 }))
            .await
            .unwrap();
        snapshots.changed().await.unwrap();
        let brushed = latest(&snapshots);
        assert_eq!(brushed.viewport, Some(Viewport::new(5, 20)));
        assert_eq!(brushed.points, first.points);

        // The brushed viewport carries into the next recompute
        triggers.send(Trigger::Append(predictions(3))).await.unwrap();
        snapshots.changed().await.unwrap();
        let next = latest(&snapshots);
        assert_eq!(next.buckets.len(), 43);
        assert_eq!(next.viewport, Some(Viewport::new(5, 20)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggers_after_debounce_window_recompute_again() {
        let config = EngineConfig::default().with_debounce(Duration::from_millis(100));
        let (triggers, _handle, mut snapshots) = spawn(config);

        triggers.send(Trigger::Replace(actuals(0..3))).await.unwrap();
        snapshots.changed().await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        triggers.send(Trigger::Replace(actuals(0..6))).await.unwrap();
        snapshots.changed().await.unwrap();
        assert_eq!(latest(&snapshots).buckets.len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_recompute_keeps_previous_snapshot() {
        let (triggers, handle, mut snapshots) = spawn(EngineConfig::default());

        triggers.send(Trigger::Replace(actuals(0..8))).await.unwrap();
        snapshots.changed().await.unwrap();

        triggers
            .send(Trigger::Configure(ChartState::default().with_interval_hours(0)))
            .await
            .unwrap();
        triggers.send(Trigger::Shutdown).await.unwrap();
        handle.await.unwrap();

        assert!(!snapshots.has_changed().unwrap_or(false));
        assert_eq!(latest(&snapshots).buckets.len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_when_senders_drop() {
        let (triggers, handle, snapshots) = spawn(EngineConfig::default());
        drop(triggers);
        handle.await.unwrap();
        assert!(snapshots.borrow().is_none());
    }
}
