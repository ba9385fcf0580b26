//! Policy configuration, parsed from the `"weighted_round_robin"` JSON stanza
//!
//! All keys are optional and unknown keys are ignored, so a newer control
//! plane can ship extra fields without breaking older clients:
//!
//! ```ignore
//! {
//!     "enableOobLoadReport": false,
//!     "oobReportingPeriod": "10s",
//!     "blackoutPeriod": "10s",
//!     "weightUpdatePeriod": "1s",
//!     "weightExpirationPeriod": "180s",
//!     "errorUtilizationPenalty": 1.0
//! }
//! ```
//!
//! Durations are strings with an `s` or `ms` suffix, fractions allowed.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name under which this policy is registered.
pub const POLICY_NAME: &str = "weighted_round_robin";

/// Lower bound imposed on `weightUpdatePeriod`.
const MIN_WEIGHT_UPDATE_PERIOD: Duration = Duration::from_millis(100);
/// Lower bound imposed on `oobReportingPeriod`.
const MIN_OOB_REPORTING_PERIOD: Duration = Duration::from_millis(1);

/// Configuration of the weighted-round-robin policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WeightedRoundRobinConfig {
    /// Use periodic out-of-band load reports instead of per-call trailers.
    pub enable_oob_load_report: bool,
    /// Interval requested for out-of-band load reports.
    #[serde(with = "duration_str")]
    pub oob_reporting_period: Duration,
    /// Interval after an endpoint's first report during which its weight is
    /// suppressed.
    #[serde(with = "duration_str")]
    pub blackout_period: Duration,
    /// Interval between scheduler rebuilds.
    #[serde(with = "duration_str")]
    pub weight_update_period: Duration,
    /// Interval after the last report past which a weight no longer counts.
    #[serde(with = "duration_str")]
    pub weight_expiration_period: Duration,
    /// Multiplier applied to the error rate when computing weights.
    pub error_utilization_penalty: f32,
}

impl Default for WeightedRoundRobinConfig {
    fn default() -> Self {
        Self {
            enable_oob_load_report: false,
            oob_reporting_period: Duration::from_secs(10),
            blackout_period: Duration::from_secs(10),
            weight_update_period: Duration::from_secs(1),
            weight_expiration_period: Duration::from_secs(3 * 60),
            error_utilization_penalty: 1.0,
        }
    }
}

impl WeightedRoundRobinConfig {
    /// Parses a configuration from its JSON stanza and validates it.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies the documented lower bounds and rejects invalid values.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.error_utilization_penalty < 0.0 {
            return Err(ConfigError::NegativeErrorUtilizationPenalty);
        }
        self.weight_update_period = self.weight_update_period.max(MIN_WEIGHT_UPDATE_PERIOD);
        self.oob_reporting_period = self.oob_reporting_period.max(MIN_OOB_REPORTING_PERIOD);
        Ok(())
    }
}

/// Configuration validation errors, surfaced to the config parser.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid weighted_round_robin config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("errorUtilizationPenalty must be non-negative")]
    NegativeErrorUtilizationPenalty,
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs_f64()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        parse(&value).ok_or_else(|| {
            de::Error::custom(format!(
                "invalid duration {value:?}, expected \"<n>s\" or \"<n>ms\""
            ))
        })
    }

    fn parse(value: &str) -> Option<Duration> {
        let (number, scale) = match value.strip_suffix("ms") {
            Some(number) => (number, 1e-3),
            None => (value.strip_suffix('s')?, 1.0),
        };
        let seconds = number.parse::<f64>().ok()?;
        if seconds < 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(seconds * scale).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = WeightedRoundRobinConfig::default();
        assert!(!config.enable_oob_load_report);
        assert_eq!(config.oob_reporting_period, Duration::from_secs(10));
        assert_eq!(config.blackout_period, Duration::from_secs(10));
        assert_eq!(config.weight_update_period, Duration::from_secs(1));
        assert_eq!(config.weight_expiration_period, Duration::from_secs(180));
        assert_eq!(config.error_utilization_penalty, 1.0);
    }

    #[test]
    fn empty_stanza_yields_defaults() {
        let config = WeightedRoundRobinConfig::from_json("{}").unwrap();
        assert_eq!(config, WeightedRoundRobinConfig::default());
    }

    #[test]
    fn parses_all_keys() {
        let config = WeightedRoundRobinConfig::from_json(
            r#"{
                "enableOobLoadReport": true,
                "oobReportingPeriod": "5s",
                "blackoutPeriod": "0s",
                "weightUpdatePeriod": "500ms",
                "weightExpirationPeriod": "60s",
                "errorUtilizationPenalty": 2.5
            }"#,
        )
        .unwrap();
        assert!(config.enable_oob_load_report);
        assert_eq!(config.oob_reporting_period, Duration::from_secs(5));
        assert_eq!(config.blackout_period, Duration::ZERO);
        assert_eq!(config.weight_update_period, Duration::from_millis(500));
        assert_eq!(config.weight_expiration_period, Duration::from_secs(60));
        assert_eq!(config.error_utilization_penalty, 2.5);
    }

    #[test]
    fn clamps_weight_update_period() {
        let config =
            WeightedRoundRobinConfig::from_json(r#"{"weightUpdatePeriod": "10ms"}"#).unwrap();
        assert_eq!(config.weight_update_period, Duration::from_millis(100));
    }

    #[test]
    fn rejects_negative_penalty() {
        let err = WeightedRoundRobinConfig::from_json(r#"{"errorUtilizationPenalty": -1.0}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::NegativeErrorUtilizationPenalty));
    }

    #[test]
    fn rejects_malformed_durations() {
        for json in [
            r#"{"blackoutPeriod": "10"}"#,
            r#"{"blackoutPeriod": "tens"}"#,
            r#"{"blackoutPeriod": "-1s"}"#,
            r#"{"blackoutPeriod": 10}"#,
        ] {
            assert!(WeightedRoundRobinConfig::from_json(json).is_err(), "{json}");
        }
    }

    #[test]
    fn ignores_unknown_keys() {
        let config = WeightedRoundRobinConfig::from_json(r#"{"futureKnob": {"a": 1}}"#).unwrap();
        assert_eq!(config, WeightedRoundRobinConfig::default());
    }

    #[test]
    fn duration_round_trip() {
        let mut config = WeightedRoundRobinConfig::default();
        config.blackout_period = Duration::from_millis(250);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: WeightedRoundRobinConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
