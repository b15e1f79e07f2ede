// Copyright 2024-2025, The Weir Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration shared by all connectors.
//!
//! All connection parameters and tunables come from environment variables,
//! read once at startup into these typed structs. Flows assembled in tests
//! use the same structs deserialized from structured values instead.

use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::ConnectorType;

/// Connector configuration, the parts applicable to all connectors.
/// Connector-specific settings live in the `config` map.
#[derive(Clone, Debug, Default)]
pub struct ConnectorConfig {
    /// Connector type, resolved against the builder registry
    pub connector_type: ConnectorType,
    /// Connector-specific configuration map
    pub config: weir_config::Map,
    /// Reconnect behavior on connection loss
    pub reconnect: Reconnect,
}

impl ConnectorConfig {
    /// a config of the given type with no connector-specific settings
    #[must_use]
    pub fn of_type(connector_type: impl Into<ConnectorType>) -> Self {
        Self {
            connector_type: connector_type.into(),
            config: None,
            reconnect: Reconnect::default(),
        }
    }

    /// attach a connector-specific configuration map
    #[must_use]
    pub fn with_config(mut self, config: weir_config::Value) -> Self {
        self.config = Some(config);
        self
    }

    /// attach a reconnect policy
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: Reconnect) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// Reconnect strategies for controlling if and how to re-run `connect`
/// after a connector reported connection loss.
///
/// This is distinct from the batch write retry policy: it governs the
/// connector-level connection, not a single write.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", deny_unknown_fields)]
pub enum Reconnect {
    /// No reconnection, fail fast
    None,
    /// Configurable retries with jittered exponential growth
    Retry {
        /// interval to wait after the first failing connect attempt
        interval_ms: u64,
        /// growth rate applied to the interval between consecutive attempts
        #[serde(default = "default_growth_rate")]
        growth_rate: f64,
        /// maximum number of retries to execute, unlimited if absent
        max_retries: Option<u64>,
        /// randomize the grown interval
        #[serde(default = "weir_common::default_true")]
        randomized: bool,
    },
}

fn default_growth_rate() -> f64 {
    1.5
}

impl Default for Reconnect {
    fn default() -> Self {
        Self::None
    }
}

/// Batching knobs for the sink driver: flush when `max_batch_size` records
/// are buffered or `flush_interval_ms` has elapsed since the first buffered
/// record, whichever comes first.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BatchingConfig {
    /// flush once this many records are buffered
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// flush this many milliseconds after the first buffered record
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

fn default_max_batch_size() -> usize {
    1000
}

fn default_flush_interval_ms() -> u64 {
    1000
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

/// Test-mode stop conditions: stop the flow cleanly after `records`
/// published records and/or after `seconds`. Absent both, run until
/// shutdown.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StopAfter {
    /// stop after this many published records
    #[serde(default)]
    pub records: Option<u64>,
    /// stop after this many seconds
    #[serde(default)]
    pub seconds: Option<u64>,
}

impl StopAfter {
    /// true if neither stop condition is set
    #[must_use]
    pub fn is_unset(&self) -> bool {
        self.records.is_none() && self.seconds.is_none()
    }
}

/// Read an environment variable, parsed, falling back to a default.
///
/// # Errors
/// if the variable is set but does not parse
pub fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}")),
        Err(_) => Ok(default),
    }
}

/// Read a required environment variable, parsed.
///
/// # Errors
/// if the variable is unset or does not parse
pub fn env_required<T>(key: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw =
        std::env::var(key).map_err(|_| anyhow::anyhow!("missing environment variable {key}"))?;
    raw.parse()
        .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}"))
}

/// Read an optional environment variable, parsed.
///
/// # Errors
/// if the variable is set but does not parse
pub fn env_opt<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}")),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use weir_config::Impl;

    #[derive(Deserialize)]
    struct Wrapper {
        batching: BatchingConfig,
        #[serde(default)]
        stop_after: StopAfter,
    }
    impl Impl for Wrapper {}

    #[test]
    fn batching_defaults() -> anyhow::Result<()> {
        let v = simd_json::json!({"batching": {}});
        let w = Wrapper::new(&v)?;
        assert_eq!(w.batching, BatchingConfig::default());
        assert_eq!(w.batching.max_batch_size, 1000);
        assert_eq!(w.batching.flush_interval_ms, 1000);
        assert!(w.stop_after.is_unset());
        Ok(())
    }

    #[test]
    fn stop_after() -> anyhow::Result<()> {
        let v = simd_json::json!({
            "batching": {"max_batch_size": 10, "flush_interval_ms": 100},
            "stop_after": {"records": 10, "seconds": 20}
        });
        let w = Wrapper::new(&v)?;
        assert_eq!(w.stop_after.records, Some(10));
        assert_eq!(w.stop_after.seconds, Some(20));
        assert!(!w.stop_after.is_unset());
        Ok(())
    }

    #[test]
    fn reconnect_serde() -> anyhow::Result<()> {
        #[derive(Deserialize)]
        struct R {
            reconnect: Reconnect,
        }
        impl Impl for R {}

        let v = simd_json::json!({"reconnect": "none"});
        assert!(matches!(R::new(&v)?.reconnect, Reconnect::None));

        let v = simd_json::json!({"reconnect": {"retry": {"interval_ms": 123, "max_retries": 3}}});
        let r = R::new(&v)?;
        assert!(matches!(
            r.reconnect,
            Reconnect::Retry {
                interval_ms: 123,
                max_retries: Some(3),
                randomized: true,
                ..
            }
        ));
        Ok(())
    }

    #[test]
    #[serial(env)]
    fn env_helpers() -> anyhow::Result<()> {
        std::env::remove_var("WEIR_TEST_KNOB");
        assert_eq!(env_or("WEIR_TEST_KNOB", 3_u32)?, 3);
        assert_eq!(env_opt::<u32>("WEIR_TEST_KNOB")?, None);
        assert!(env_required::<u32>("WEIR_TEST_KNOB").is_err());

        std::env::set_var("WEIR_TEST_KNOB", "42");
        assert_eq!(env_or("WEIR_TEST_KNOB", 3_u32)?, 42);
        assert_eq!(env_opt::<u32>("WEIR_TEST_KNOB")?, Some(42));
        assert_eq!(env_required::<u32>("WEIR_TEST_KNOB")?, 42);

        std::env::set_var("WEIR_TEST_KNOB", "not-a-number");
        assert!(env_or("WEIR_TEST_KNOB", 3_u32).is_err());
        std::env::remove_var("WEIR_TEST_KNOB");
        Ok(())
    }
}
