//! Projector configuration.
//!
//! [`ProjectionOptions`] deserializes from the camelCase JSON document
//! operators already use for projections:
//!
//! ```json
//! {
//!   "signal": false,
//!   "cacheSize": 100,
//!   "blockSize": 1000,
//!   "sleep": 100,
//!   "timeout": 1000,
//!   "lockout": 0,
//!   "retries": [0, 5, 10],
//!   "detectionWindow": "PT1M"
//! }
//! ```
//!
//! Every key is optional; missing keys take the defaults below.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default retry schedule for gap detection, in milliseconds.
pub const DEFAULT_RETRIES: [u64; 20] = [
    0, 5, 10, 25, 50, 100, 150, 200, 250, 300, 350, 400, 450, 500, 1000, 1000, 1000, 2000, 2000,
    5000,
];

/// Longest span accepted for `timeout`, `lockout` and `detectionWindow`, in
/// milliseconds (100 years). Longer spans overflow timestamp arithmetic.
pub const MAX_SPAN_MILLIS: u64 = 100 * 365 * 86_400_000;

/// Error returned for an invalid projector configuration.
#[derive(Debug, thiserror::Error)]
pub enum OptionsError {
    /// A threshold that must be positive was zero.
    #[error("option '{0}' must be greater than zero")]
    Zero(&'static str),

    /// A span was longer than [`MAX_SPAN_MILLIS`].
    #[error("option '{0}' exceeds the maximum span of {MAX_SPAN_MILLIS} ms")]
    TooLarge(&'static str),

    /// The token-bucket form of `sleep` had a zero rate or window.
    #[error("sleep bucket [{rate}, {per_seconds}] must have a positive rate and window")]
    InvalidBucket { rate: u32, per_seconds: u32 },

    /// `detectionWindow` is not a supported ISO-8601 duration.
    #[error("invalid detection window '{value}': {reason}")]
    InvalidDuration { value: String, reason: &'static str },

    /// The options document could not be parsed.
    #[error("invalid options document: {0}")]
    Json(#[from] serde_json::Error),
}

/// Idle delay: a plain number of milliseconds or a `[rate, perSeconds]`
/// token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SleepOption {
    Millis(u64),
    Bucket(u32, u32),
}

impl Default for SleepOption {
    fn default() -> Self {
        Self::Millis(100)
    }
}

/// Tuning knobs shared by query and persistent projectors.
///
/// Validated by the projector builders; an invalid configuration is fatal at
/// construction time, never mid-run.
///
/// # Examples
///
/// ```
/// use eventfold_projector::ProjectionOptions;
///
/// let options = ProjectionOptions::from_json(r#"{"blockSize": 50, "retries": [5, 10]}"#)
///     .expect("options should parse");
/// assert_eq!(options.block_size, 50);
/// assert_eq!(options.cache_size, 100);
/// assert_eq!(options.retries, vec![5, 10]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ProjectionOptions {
    /// Listen for Ctrl-C and stop the run cooperatively.
    ///
    /// Default: `false`.
    pub signal: bool,

    /// Number of stream names remembered as existing when emitting.
    ///
    /// Default: 100.
    pub cache_size: usize,

    /// Events handled between two persists of a persistent projection.
    ///
    /// Default: 1000.
    pub block_size: u64,

    /// Delay applied after a cycle that loaded no events.
    ///
    /// Default: 100 ms.
    pub sleep: SleepOption,

    /// Lock lifetime in milliseconds; `locked_until = now + timeout`.
    ///
    /// Default: 1000.
    pub timeout: u64,

    /// Minimum milliseconds between two lock refreshes.
    ///
    /// Default: 0 (refresh every cycle).
    pub lockout: u64,

    /// Gap retry delays in milliseconds; one entry per tolerated retry.
    pub retries: Vec<u64>,

    /// ISO-8601 duration after which an unfilled gap is confirmed without
    /// waiting for the retry schedule, e.g. `"PT1M"`.
    pub detection_window: Option<String>,
}

impl Default for ProjectionOptions {
    fn default() -> Self {
        Self {
            signal: false,
            cache_size: 100,
            block_size: 1000,
            sleep: SleepOption::default(),
            timeout: 1000,
            lockout: 0,
            retries: DEFAULT_RETRIES.to_vec(),
            detection_window: None,
        }
    }
}

impl ProjectionOptions {
    /// Parse and validate a JSON options document.
    ///
    /// # Errors
    ///
    /// Returns [`OptionsError::Json`] for malformed documents or unknown
    /// keys, and any error [`validate`](Self::validate) reports.
    pub fn from_json(json: &str) -> Result<Self, OptionsError> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Check every option for a usable value.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.cache_size == 0 {
            return Err(OptionsError::Zero("cacheSize"));
        }
        if self.block_size == 0 {
            return Err(OptionsError::Zero("blockSize"));
        }
        if self.timeout == 0 {
            return Err(OptionsError::Zero("timeout"));
        }
        if self.timeout > MAX_SPAN_MILLIS {
            return Err(OptionsError::TooLarge("timeout"));
        }
        if self.lockout > MAX_SPAN_MILLIS {
            return Err(OptionsError::TooLarge("lockout"));
        }
        if let SleepOption::Bucket(rate, per_seconds) = self.sleep
            && (rate == 0 || per_seconds == 0)
        {
            return Err(OptionsError::InvalidBucket { rate, per_seconds });
        }
        if let Some(window) = self.detection_window()?
            && window > chrono::Duration::milliseconds(clamp_millis(MAX_SPAN_MILLIS))
        {
            return Err(OptionsError::TooLarge("detectionWindow"));
        }
        Ok(())
    }

    /// Set [`signal`](Self::signal).
    pub fn with_signal(mut self, signal: bool) -> Self {
        self.signal = signal;
        self
    }

    /// Set [`cache_size`](Self::cache_size).
    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    /// Set [`block_size`](Self::block_size).
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set [`sleep`](Self::sleep).
    pub fn with_sleep(mut self, sleep: SleepOption) -> Self {
        self.sleep = sleep;
        self
    }

    /// Set [`timeout`](Self::timeout), in milliseconds.
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = timeout_ms;
        self
    }

    /// Set [`lockout`](Self::lockout), in milliseconds.
    pub fn with_lockout(mut self, lockout_ms: u64) -> Self {
        self.lockout = lockout_ms;
        self
    }

    /// Set the gap retry schedule, in milliseconds.
    pub fn with_retries(mut self, retries: Vec<u64>) -> Self {
        self.retries = retries;
        self
    }

    /// Set the ISO-8601 detection window, e.g. `"PT1M"`.
    pub fn with_detection_window(mut self, window: impl Into<String>) -> Self {
        self.detection_window = Some(window.into());
        self
    }

    /// Gap retry schedule as durations.
    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retries.iter().copied().map(Duration::from_millis).collect()
    }

    /// Lock lifetime.
    pub fn lock_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(clamp_millis(self.timeout))
    }

    /// Minimum interval between lock refreshes.
    pub fn lock_lockout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(clamp_millis(self.lockout))
    }

    /// Parsed detection window.
    ///
    /// # Errors
    ///
    /// Returns [`OptionsError::InvalidDuration`] if the string is not a
    /// supported ISO-8601 duration.
    pub fn detection_window(&self) -> Result<Option<chrono::Duration>, OptionsError> {
        self.detection_window
            .as_deref()
            .map(parse_iso8601_duration)
            .transpose()
    }
}

fn clamp_millis(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

/// Parse an ISO-8601 duration such as `PT30S`, `PT1.5S`, `P1DT2H` or `P2W`.
///
/// Years and months are rejected: their length depends on the calendar, and
/// a detection window has to be a fixed span.
///
/// # Errors
///
/// Returns [`OptionsError::InvalidDuration`] describing the first problem.
pub fn parse_iso8601_duration(value: &str) -> Result<chrono::Duration, OptionsError> {
    let invalid = |reason| OptionsError::InvalidDuration {
        value: value.to_owned(),
        reason,
    };

    let rest = value
        .strip_prefix('P')
        .ok_or_else(|| invalid("must start with 'P'"))?;
    if rest.is_empty() {
        return Err(invalid("no components"));
    }

    let mut total_millis: f64 = 0.0;
    let mut in_time = false;
    let mut components = 0;
    let mut number = String::new();
    let mut last_unit_seen_time = false;

    for ch in rest.chars() {
        match ch {
            'T' => {
                if in_time || !number.is_empty() {
                    return Err(invalid("misplaced 'T'"));
                }
                in_time = true;
                last_unit_seen_time = false;
            }
            '0'..='9' | '.' | ',' => number.push(if ch == ',' { '.' } else { ch }),
            unit => {
                if number.is_empty() {
                    return Err(invalid("unit without a number"));
                }
                let amount: f64 = number.parse().map_err(|_| invalid("malformed number"))?;
                let millis_per_unit = match (in_time, unit) {
                    (false, 'W') => 7.0 * 86_400_000.0,
                    (false, 'D') => 86_400_000.0,
                    (false, 'Y') | (false, 'M') => {
                        return Err(invalid("years and months are not fixed durations"));
                    }
                    (true, 'H') => 3_600_000.0,
                    (true, 'M') => 60_000.0,
                    (true, 'S') => 1_000.0,
                    _ => return Err(invalid("unknown unit")),
                };
                if number.contains('.') && !(in_time && unit == 'S') {
                    return Err(invalid("only seconds may be fractional"));
                }
                total_millis += amount * millis_per_unit;
                components += 1;
                last_unit_seen_time = in_time;
                number.clear();
            }
        }
    }

    if !number.is_empty() {
        return Err(invalid("trailing number without a unit"));
    }
    if components == 0 || (in_time && !last_unit_seen_time) {
        return Err(invalid("no components"));
    }
    if !total_millis.is_finite() || total_millis > i64::MAX as f64 {
        return Err(invalid("out of range"));
    }

    Ok(chrono::Duration::milliseconds(total_millis.round() as i64))
}
