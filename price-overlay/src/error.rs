use thiserror::Error;

/// All errors generated in `price-overlay`.
///
/// Bad market data never surfaces here: malformed points are dropped and short
/// series produce `None` entries. These variants describe misuse of the API
/// (zero periods, zero intervals) and unreadable configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OverlayError {
    #[error("indicator period must be at least 1, got {period}")]
    InvalidPeriod { period: usize },

    #[error("candle interval must be at least 1 hour, got {hours}")]
    InvalidInterval { hours: u32 },

    #[error("bollinger multiplier must be finite and non-negative, got {0}")]
    InvalidMultiplier(f64),

    #[error("indicator preference is not a list of identifiers: {0}")]
    Preference(String),

    #[error("invalid configuration value for {key}: {value}")]
    Config { key: String, value: String },
}

impl OverlayError {
    /// Determine if an error was caused by the caller passing invalid parameters, as opposed to
    /// reading an external payload (preferences, environment).
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_programmer_error(&self) -> bool {
        match self {
            OverlayError::InvalidPeriod { .. }
            | OverlayError::InvalidInterval { .. }
            | OverlayError::InvalidMultiplier(_) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for OverlayError {
    fn from(value: serde_json::Error) -> Self {
        Self::Preference(value.to_string())
    }
}
