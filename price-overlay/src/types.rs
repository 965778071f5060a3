/// Core data types for the price overlay
///
/// Raw points match the JSON rows returned by the three source feeds; display points match
/// what the rendering layer consumes.
use crate::time::HourKey;
use chrono::{DateTime, Utc};
use derive_more::{Constructor, Display};
use serde::{Deserialize, Deserializer, Serialize, de::IgnoredAny};

/// Which feed a batch of raw points came from
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Observed prices and load
    #[display("actual")]
    Actual,
    /// Vendor forecast
    #[display("forecast")]
    Forecast,
    /// AI prediction with confidence band
    #[display("prediction")]
    Prediction,
}

/// One observation from a source feed
///
/// Numeric fields tolerate numeric strings; anything else that is not a finite number is
/// treated as absent rather than failing the row.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPoint {
    #[serde(default, deserialize_with = "lenient_string")]
    pub timestamp: String,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub actual_price: Option<f64>,
    #[serde(
        default,
        alias = "load",
        alias = "ail",
        deserialize_with = "lenient_f64",
        skip_serializing_if = "Option::is_none"
    )]
    pub volume_proxy: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub forecast_price: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub ai_price: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub ai_lower: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub ai_upper: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub ai_confidence: Option<f64>,
}

impl RawPoint {
    /// Point with only a timestamp set
    pub fn at(timestamp: impl Into<String>) -> Self {
        Self {
            timestamp: timestamp.into(),
            ..Default::default()
        }
    }

    pub fn with_actual(mut self, price: f64) -> Self {
        self.actual_price = Some(price);
        self
    }

    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume_proxy = Some(volume);
        self
    }

    pub fn with_forecast(mut self, price: f64) -> Self {
        self.forecast_price = Some(price);
        self
    }

    pub fn with_prediction(mut self, price: f64, lower: Option<f64>, upper: Option<f64>) -> Self {
        self.ai_price = Some(price);
        self.ai_lower = lower;
        self.ai_upper = upper;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.ai_confidence = Some(confidence);
        self
    }

    /// Take the timestamp and every present field of a later point for the same hour
    pub fn overlay(&mut self, later: RawPoint) {
        fn take(slot: &mut Option<f64>, value: Option<f64>) {
            if value.is_some() {
                *slot = value;
            }
        }

        self.timestamp = later.timestamp;
        take(&mut self.actual_price, later.actual_price);
        take(&mut self.volume_proxy, later.volume_proxy);
        take(&mut self.forecast_price, later.forecast_price);
        take(&mut self.ai_price, later.ai_price);
        take(&mut self.ai_lower, later.ai_lower);
        take(&mut self.ai_upper, later.ai_upper);
        take(&mut self.ai_confidence, later.ai_confidence);
    }
}

/// A list of raw points delivered by one feed
#[derive(Debug, Clone, PartialEq, Constructor, Deserialize, Serialize)]
pub struct SourceBatch {
    pub kind: SourceKind,
    pub points: Vec<RawPoint>,
}

/// One hour of merged data. Holds at most one value per field.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TimeBucket {
    pub key: HourKey,
    pub actual_price: Option<f64>,
    pub volume: Option<f64>,
    pub forecast_price: Option<f64>,
    pub ai_price: Option<f64>,
    pub ai_lower: Option<f64>,
    pub ai_upper: Option<f64>,
    pub ai_confidence: Option<f64>,
}

impl TimeBucket {
    pub fn empty(key: HourKey) -> Self {
        Self {
            key,
            actual_price: None,
            volume: None,
            forecast_price: None,
            ai_price: None,
            ai_lower: None,
            ai_upper: None,
            ai_confidence: None,
        }
    }

    /// Start of the hour
    pub fn time(&self) -> DateTime<Utc> {
        self.key.start()
    }

    /// True if no field has been set (a gap in every feed)
    pub fn is_empty(&self) -> bool {
        self.actual_price.is_none()
            && self.volume.is_none()
            && self.forecast_price.is_none()
            && self.ai_price.is_none()
            && self.ai_lower.is_none()
            && self.ai_upper.is_none()
            && self.ai_confidence.is_none()
    }

    pub fn actual(&self) -> Option<ActualPoint> {
        self.actual_price.map(|price| ActualPoint {
            time: self.time(),
            price,
            volume: self.volume,
        })
    }

    pub fn prediction(&self) -> Option<PredictionPoint> {
        self.ai_price.map(|price| PredictionPoint {
            time: self.time(),
            price,
            lower: self.ai_lower,
            upper: self.ai_upper,
            confidence: self.ai_confidence,
        })
    }
}

/// An observed price, taken from a bucket with `actual_price` set
#[derive(Debug, Clone, Copy, PartialEq, Constructor)]
pub struct ActualPoint {
    pub time: DateTime<Utc>,
    pub price: f64,
    pub volume: Option<f64>,
}

/// A predicted price with optional confidence band
#[derive(Debug, Clone, Copy, PartialEq, Constructor)]
pub struct PredictionPoint {
    pub time: DateTime<Utc>,
    pub price: f64,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub confidence: Option<f64>,
}

/// The chronological `actual_price` sub-sequence of a merged series
pub fn actual_points(buckets: &[TimeBucket]) -> Vec<ActualPoint> {
    buckets.iter().filter_map(TimeBucket::actual).collect()
}

/// The chronological `ai_price` sub-sequence of a merged series
pub fn prediction_points(buckets: &[TimeBucket]) -> Vec<PredictionPoint> {
    buckets.iter().filter_map(TimeBucket::prediction).collect()
}

/// One point handed to the rendering layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayPoint {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aeso_forecast: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_prediction: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_lower: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_upper: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sma20: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sma50: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ema12: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ema26: Option<f64>,
    #[serde(rename = "bb_upper", skip_serializing_if = "Option::is_none")]
    pub bb_upper: Option<f64>,
    #[serde(rename = "bb_middle", skip_serializing_if = "Option::is_none")]
    pub bb_middle: Option<f64>,
    #[serde(rename = "bb_lower", skip_serializing_if = "Option::is_none")]
    pub bb_lower: Option<f64>,
}

impl From<&TimeBucket> for DisplayPoint {
    fn from(bucket: &TimeBucket) -> Self {
        Self {
            timestamp: bucket.time(),
            actual: bucket.actual_price,
            aeso_forecast: bucket.forecast_price,
            ai_prediction: bucket.ai_price,
            ai_lower: bucket.ai_lower,
            ai_upper: bucket.ai_upper,
            confidence_score: bucket.ai_confidence,
            volume: bucket.volume,
            sma20: None,
            sma50: None,
            ema12: None,
            ema26: None,
            bb_upper: None,
            bb_middle: None,
            bb_lower: None,
        }
    }
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Lenient {
        Number(f64),
        Text(String),
        Other(IgnoredAny),
    }

    let value = match Lenient::deserialize(deserializer)? {
        Lenient::Number(value) => Some(value),
        Lenient::Text(text) => text.trim().parse::<f64>().ok(),
        Lenient::Other(_) => None,
    };

    Ok(value.filter(|value| value.is_finite()))
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Lenient {
        Text(String),
        Other(IgnoredAny),
    }

    Ok(match Lenient::deserialize(deserializer)? {
        Lenient::Text(text) => text,
        Lenient::Other(_) => String::new(),
    })
}
