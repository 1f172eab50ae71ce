// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Gateway configuration.
//!
//! The gateway consumes plain settings supplied at startup. Loading them
//! from files or the environment is the embedding application's job;
//! [`GatewayConfig::from_json`] accepts an already-read JSON document.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Settings for a [`Gateway`](crate::Gateway).
///
/// Durations are (de)serialized as integer milliseconds. Missing fields
/// take their default.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use attrgate::GatewayConfig;
///
/// let config = GatewayConfig::default()
///     .with_poll_interval(Duration::from_millis(500))
///     .with_pool_capacity(20);
/// assert!(config.validate().is_ok());
///
/// let config = GatewayConfig::from_json(r#"{"delivery_interval": 2000}"#).unwrap();
/// assert_eq!(config.delivery_interval, Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Period of polling listeners.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Period of each client's delivery loop.
    #[serde(with = "duration_ms")]
    pub delivery_interval: Duration,
    /// Maximum number of pooled device handles.
    pub pool_capacity: usize,
    /// Lifetime of cached attribute metadata.
    #[serde(with = "duration_ms")]
    pub cache_ttl: Duration,
    /// Number of batches buffered per client before backpressure applies.
    pub outbound_capacity: usize,
    /// Consecutive dropped batches after which a client is closed.
    pub max_consecutive_drops: u32,
    /// Consecutive poll failures after which an ERROR event is emitted.
    pub max_poll_failures: u32,
    /// Delay before retrying a failed poll.
    #[serde(with = "duration_ms")]
    pub poll_backoff: Duration,
}

impl GatewayConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON configuration document and validates it.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` if the document is malformed, or
    /// `ConfigError::Invalid` if a setting is out of range.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the polling period.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the delivery tick period.
    #[must_use]
    pub fn with_delivery_interval(mut self, interval: Duration) -> Self {
        self.delivery_interval = interval;
        self
    }

    /// Sets the device handle pool capacity.
    #[must_use]
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    /// Sets the metadata cache lifetime.
    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Sets the per-client outbound channel capacity.
    #[must_use]
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    /// Sets how many consecutive dropped batches close a client.
    #[must_use]
    pub fn with_max_consecutive_drops(mut self, drops: u32) -> Self {
        self.max_consecutive_drops = drops;
        self
    }

    /// Sets how many consecutive poll failures produce an ERROR event.
    #[must_use]
    pub fn with_max_poll_failures(mut self, failures: u32) -> Self {
        self.max_poll_failures = failures;
        self
    }

    /// Sets the delay before a failed poll is retried.
    #[must_use]
    pub fn with_poll_backoff(mut self, backoff: Duration) -> Self {
        self.poll_backoff = backoff;
        self
    }

    /// Checks that every setting is usable.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive_duration(field: &'static str, value: Duration) -> Result<(), ConfigError> {
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
            Ok(())
        }

        fn positive_count(field: &'static str, value: u64) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
            Ok(())
        }

        positive_duration("poll_interval", self.poll_interval)?;
        positive_duration("delivery_interval", self.delivery_interval)?;
        positive_duration("cache_ttl", self.cache_ttl)?;
        positive_duration("poll_backoff", self.poll_backoff)?;
        positive_count("pool_capacity", self.pool_capacity as u64)?;
        positive_count("outbound_capacity", self.outbound_capacity as u64)?;
        positive_count("max_consecutive_drops", u64::from(self.max_consecutive_drops))?;
        positive_count("max_poll_failures", u64::from(self.max_poll_failures))?;
        Ok(())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            delivery_interval: Duration::from_secs(1),
            pool_capacity: 100,
            cache_ttl: Duration::from_secs(10),
            outbound_capacity: 16,
            max_consecutive_drops: 10,
            max_poll_failures: 3,
            poll_backoff: Duration::from_secs(1),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = GatewayConfig::default();

        assert_eq!(config.delivery_interval, Duration::from_secs(1));
        assert_eq!(config.pool_capacity, 100);
        assert_eq!(config.cache_ttl, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_overrides() {
        let config = GatewayConfig::new()
            .with_poll_interval(Duration::from_millis(250))
            .with_delivery_interval(Duration::from_millis(100))
            .with_pool_capacity(4)
            .with_outbound_capacity(2)
            .with_max_consecutive_drops(3);

        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.delivery_interval, Duration::from_millis(100));
        assert_eq!(config.pool_capacity, 4);
        assert_eq!(config.outbound_capacity, 2);
        assert_eq!(config.max_consecutive_drops, 3);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = GatewayConfig::new().with_pool_capacity(0).validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "pool_capacity",
                ..
            }
        ));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = GatewayConfig::new()
            .with_delivery_interval(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "delivery_interval",
                ..
            }
        ));
    }

    #[test]
    fn from_json_fills_defaults() {
        let config = GatewayConfig::from_json(r#"{"poll_interval": 500, "pool_capacity": 8}"#)
            .unwrap();

        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.pool_capacity, 8);
        assert_eq!(config.cache_ttl, Duration::from_secs(10));
    }

    #[test]
    fn from_json_rejects_garbage_and_invalid_values() {
        assert!(matches!(
            GatewayConfig::from_json("not json"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            GatewayConfig::from_json(r#"{"outbound_capacity": 0}"#),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn json_round_trip_uses_milliseconds() {
        let json = serde_json::to_value(GatewayConfig::default()).unwrap();
        assert_eq!(json["poll_interval"], 3000);
        assert_eq!(json["cache_ttl"], 10_000);
    }
}
