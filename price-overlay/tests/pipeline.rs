// End-to-end tests for the recompute pipeline
//
// Source batches are fed through `recompute` the way a dashboard shell would, and the
// resulting snapshot is checked against the merge, indicator, candle, viewport and alert
// contracts.
//
// Run with: cargo test --test pipeline

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use price_overlay::{
    Alert, AlertCondition, ChartInputs, ChartState, DisplayMode, EngineConfig, ForecastVolume,
    Indicator, IndicatorSelection, Notice, RawPoint, SourceBatch, SourceKind, TimeRange,
    ViewportOp, recompute, sma, time::HourKey,
};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Helpers
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn time(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, hour, minute, 0).unwrap()
}

fn batch(kind: SourceKind, points: Vec<RawPoint>) -> SourceBatch {
    SourceBatch::new(kind, points)
}

/// `hours` hourly actuals ending at the hour containing `now`, following a seeded walk
fn random_walk(now: DateTime<Utc>, hours: i64, seed: u64) -> SourceBatch {
    let mut rng = StdRng::seed_from_u64(seed);
    let last = HourKey::of(now).start();
    let mut price = 60.0;
    let points = (0..hours)
        .rev()
        .map(|back| {
            price = (price + rng.random_range(-4.0..4.0_f64)).max(1.0);
            RawPoint::at((last - TimeDelta::hours(back)).to_rfc3339())
                .with_actual(price)
                .with_volume(rng.random_range(8000.0..11000.0))
        })
        .collect();
    batch(SourceKind::Actual, points)
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn merges_actual_and_prediction_into_one_bucket() {
    init_tracing();

    let inputs = ChartInputs::new(
        vec![
            batch(
                SourceKind::Actual,
                vec![RawPoint::at("2024-01-01T00:00:00Z").with_actual(50.0)],
            ),
            batch(
                SourceKind::Prediction,
                vec![RawPoint::at("2024-01-01T00:00:00Z").with_prediction(
                    55.0,
                    Some(50.0),
                    Some(60.0),
                )],
            ),
        ],
        vec![],
        time(0, 30),
    );

    let snapshot = recompute(&ChartState::default(), &inputs, &EngineConfig::default()).unwrap();

    assert_eq!(snapshot.buckets.len(), 1);
    let bucket = &snapshot.buckets[0];
    assert_eq!(bucket.actual_price, Some(50.0));
    assert_eq!(bucket.ai_price, Some(55.0));
    assert_eq!(bucket.ai_lower, Some(50.0));
    assert_eq!(bucket.ai_upper, Some(60.0));

    let point = serde_json::to_value(&snapshot.points[0]).unwrap();
    assert_eq!(point["actual"], 50.0);
    assert_eq!(point["aiPrediction"], 55.0);
    assert_eq!(point["aiLower"], 50.0);
    assert_eq!(point["aiUpper"], 60.0);
    assert!(point.get("aesoForecast").is_none());
}

#[test]
fn merging_the_same_batch_twice_is_idempotent() {
    init_tracing();
    let now = time(23, 15);
    let actual = random_walk(now, 20, 7);
    let forecast = batch(
        SourceKind::Forecast,
        (0..30)
            .map(|hour| {
                RawPoint::at(format!("2024-01-01 {:02}:00", hour % 24)).with_forecast(hour as f64)
            })
            .collect(),
    );

    let once = ChartInputs::new(vec![actual.clone(), forecast.clone()], vec![], now);
    let twice = ChartInputs::new(
        vec![actual.clone(), actual, forecast.clone(), forecast],
        vec![],
        now,
    );

    let config = EngineConfig::default();
    let state = ChartState::default();
    assert_eq!(
        recompute(&state, &once, &config).unwrap().buckets,
        recompute(&state, &twice, &config).unwrap().buckets
    );
}

#[test]
fn sma_of_short_series_is_right_aligned() {
    assert_eq!(
        sma(&[10.0, 20.0, 30.0, 40.0], 3).unwrap(),
        vec![None, None, Some(20.0), Some(30.0)]
    );
}

#[test]
fn forecast_candles_chain_from_last_actual() {
    init_tracing();

    let inputs = ChartInputs::new(
        vec![
            batch(
                SourceKind::Actual,
                vec![RawPoint::at("2024-01-01T12:00:00Z").with_actual(100.0)],
            ),
            batch(
                SourceKind::Prediction,
                vec![
                    RawPoint::at("2024-01-01T13:00:00Z").with_prediction(110.0, None, None),
                    RawPoint::at("2024-01-01 14:00").with_prediction(90.0, None, None),
                ],
            ),
        ],
        vec![],
        time(12, 30),
    );
    let state = ChartState::default().with_mode(DisplayMode::Candles);

    let snapshot = recompute(&state, &inputs, &EngineConfig::default()).unwrap();
    let forecast: Vec<_> = snapshot.candles.iter().filter(|candle| candle.is_forecast).collect();

    assert_eq!(forecast.len(), 2);
    assert_eq!((forecast[0].open, forecast[0].close), (100.0, 110.0));
    assert_eq!((forecast[1].open, forecast[1].close), (110.0, 90.0));
    assert!(snapshot.candles.iter().all(|candle| candle.is_consistent()));
    assert_eq!(snapshot.len(), 3);

    let candle = serde_json::to_value(forecast[0]).unwrap();
    assert_eq!(candle["isForecast"], true);
    assert_eq!(candle["timestamp"], "2024-01-01T13:00:00Z");
    assert!(candle.get("confidenceLower").is_none());
}

#[test]
fn above_threshold_alert_reports_spike_at_point_time() {
    init_tracing();

    let inputs = ChartInputs::new(
        vec![batch(
            SourceKind::Prediction,
            vec![RawPoint::at("2024-01-01T03:00:00Z").with_prediction(105.0, None, None)],
        )],
        vec![Alert::new(100.0, AlertCondition::Above, true)],
        time(0, 30),
    );

    let snapshot = recompute(&ChartState::default(), &inputs, &EngineConfig::default()).unwrap();

    assert!(snapshot.notices.contains(&Notice::Spike {
        at: time(3, 0),
        price: 105.0,
        hours_until: 3,
    }));
    assert!(snapshot.notices.iter().any(|notice| matches!(
        notice,
        Notice::ThresholdCrossed { at, predicted: true, .. } if *at == time(3, 0)
    )));
}

#[test]
fn viewport_span_survives_random_operations() {
    init_tracing();
    let now = Utc.with_ymd_and_hms(2024, 2, 1, 8, 45, 0).unwrap();
    let state = ChartState::default().with_time_range(TimeRange::Month);
    let inputs = ChartInputs::new(vec![random_walk(now, 300, 11)], vec![], now);

    let mut snapshot = recompute(&state, &inputs, &EngineConfig::default()).unwrap();
    let mut rng = StdRng::seed_from_u64(3);

    for _ in 0..500 {
        let op = match rng.random_range(0..6) {
            0 => ViewportOp::ZoomIn,
            1 => ViewportOp::ZoomOut,
            2 => ViewportOp::Reset,
            3 => ViewportOp::JumpToNow,
            4 => ViewportOp::Pan {
                delta_pixels: rng.random_range(-2000.0..2000.0),
                width: rng.random_range(100.0..1600.0),
            },
            _ => ViewportOp::Brush {
                start: rng.random_range(0..400),
                end: rng.random_range(0..400),
            },
        };

        snapshot = snapshot.apply(op);
        let viewport = snapshot.viewport.unwrap();
        assert!(viewport.end - viewport.start >= 4, "{op:?} left {viewport:?}");
        assert!(viewport.end < snapshot.len());
    }
}

#[test]
fn tolerates_malformed_rows_from_feed_payload() {
    init_tracing();
    let payload = r#"[
        {"timestamp": "2024-01-01T05:00:00Z", "actualPrice": 42.5, "volumeProxy": 9100},
        {"timestamp": "2024-01-01 06:00", "actualPrice": "43.75"},
        {"timestamp": "yesterday", "actualPrice": 1000},
        {"timestamp": "2024-01-01T07:00:00", "actualPrice": "n/a"},
        {"actualPrice": 44}
    ]"#;
    let points: Vec<RawPoint> = serde_json::from_str(payload).unwrap();

    let inputs = ChartInputs::new(vec![batch(SourceKind::Actual, points)], vec![], time(8, 0));
    let snapshot = recompute(&ChartState::default(), &inputs, &EngineConfig::default()).unwrap();

    assert_eq!(snapshot.stats.malformed, 2);
    assert_eq!(snapshot.buckets.len(), 3);
    assert_eq!(snapshot.buckets[0].volume, Some(9100.0));
    assert_eq!(snapshot.buckets[1].actual_price, Some(43.75));
    assert!(snapshot.buckets[2].is_empty());
}

#[test]
fn indicator_preference_drives_display_points() {
    init_tracing();
    let stored = r#"["bollinger", "unknown", "ema26", "bollinger"]"#;
    let selection = IndicatorSelection::from_json(stored).unwrap();
    assert_eq!(
        selection,
        IndicatorSelection::new([Indicator::Bollinger, Indicator::Ema26])
    );
    assert_eq!(selection.to_json(), r#"["bollinger","ema26"]"#);

    let now = time(23, 59);
    let inputs = ChartInputs::new(vec![random_walk(now, 24, 5)], vec![], now);
    let snapshot = recompute(
        &ChartState::default().with_selection(selection),
        &inputs,
        &EngineConfig::default(),
    )
    .unwrap();

    let last = serde_json::to_value(snapshot.points.last().unwrap()).unwrap();
    for key in ["bb_upper", "bb_middle", "bb_lower"] {
        assert!(last.get(key).is_some(), "missing {key}");
    }
    assert!(last.get("sma20").is_none());
    // ema26 needs 26 actual points
    assert!(last.get("ema26").is_none());
}

#[test]
fn seeded_forecast_volume_is_reproducible() {
    init_tracing();
    let now = time(12, 30);
    let predictions = batch(
        SourceKind::Prediction,
        (13..20)
            .map(|hour| {
                RawPoint::at(format!("2024-01-01T{hour:02}:00:00Z"))
                    .with_prediction(70.0, None, None)
            })
            .collect(),
    );
    let inputs = ChartInputs::new(vec![random_walk(now, 12, 9), predictions], vec![], now);
    let config = EngineConfig::default().with_forecast_volume(ForecastVolume::Jitter {
        seed: 42,
        amplitude: 0.05,
    });
    let state = ChartState::default().with_mode(DisplayMode::Candles);

    let first = recompute(&state, &inputs, &config).unwrap();
    let second = recompute(&state, &inputs, &config).unwrap();
    assert_eq!(first.candles, second.candles);

    let base = first.candles.iter().rfind(|candle| !candle.is_forecast).unwrap().volume;
    let forecast: Vec<_> = first.candles.iter().filter(|candle| candle.is_forecast).collect();
    assert_eq!(forecast.len(), 7);
    for candle in forecast {
        assert!((candle.volume - base).abs() <= base * 0.05 + 1e-9);
    }
}
