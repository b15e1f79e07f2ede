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

//! Record transforms, applied by the source driver between normalization and
//! publish. Domain validation and enrichment live here, never inside the
//! delivery retry path.

use value_trait::prelude::*;

use crate::record::Value;
use weir_common::time::millitime;
use weir_config::{Impl, NameWithConfig};

/// Errors from assembling a transform chain
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    /// no transform registered under that name
    #[error("Unknown transform '{0}'")]
    Unknown(String),
}

/// A stateless per-record transform.
///
/// Returning `Ok(None)` drops the record.
pub trait Transform: Send + Sync {
    /// name, for the logs
    fn name(&self) -> &'static str;

    /// transform one normalized payload
    ///
    /// # Errors
    /// if the payload is structurally beyond repair
    fn apply(&self, value: Value) -> anyhow::Result<Option<Value>>;
}

/// instantiate a transform chain from its configuration
pub(crate) fn make_transforms(
    configs: &[NameWithConfig],
) -> anyhow::Result<Vec<Box<dyn Transform>>> {
    configs.iter().map(lookup).collect()
}

fn lookup(config: &NameWithConfig) -> anyhow::Result<Box<dyn Transform>> {
    match config.name.as_str() {
        "solar_quality" => Ok(Box::new(SolarQuality::from_config(config)?)),
        other => Err(TransformError::Unknown(other.to_string()).into()),
    }
}

/// Validation and enrichment for solar panel telemetry.
///
/// Distilled from heuristics that used to be copy-pasted into every writer
/// script: recompute implausible power readings, derive efficiency and an
/// inverter status, and refuse records that cannot be attributed to a panel.
pub(crate) struct SolarQuality {
    panel_area: f64,
    high_temp_threshold: f64,
    low_efficiency_threshold: f64,
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct SolarQualityConfig {
    /// panel surface in square meters, for the efficiency computation
    #[serde(default = "default_panel_area")]
    panel_area: f64,
    /// temperature above which the inverter reports `high_temperature`
    #[serde(default = "default_high_temp")]
    high_temp_threshold: f64,
    /// efficiency below which the inverter reports `low_efficiency`
    #[serde(default = "default_low_efficiency")]
    low_efficiency_threshold: f64,
}

fn default_panel_area() -> f64 {
    2.0
}

fn default_high_temp() -> f64 {
    85.0
}

fn default_low_efficiency() -> f64 {
    15.0
}

impl Impl for SolarQualityConfig {}

impl SolarQuality {
    fn from_config(config: &NameWithConfig) -> anyhow::Result<Self> {
        let config = match config.config.as_ref() {
            Some(raw) => SolarQualityConfig::new(raw)?,
            None => SolarQualityConfig {
                panel_area: default_panel_area(),
                high_temp_threshold: default_high_temp(),
                low_efficiency_threshold: default_low_efficiency(),
            },
        };
        Ok(Self {
            panel_area: config.panel_area,
            high_temp_threshold: config.high_temp_threshold,
            low_efficiency_threshold: config.low_efficiency_threshold,
        })
    }
}

impl Transform for SolarQuality {
    fn name(&self) -> &'static str {
        "solar_quality"
    }

    fn apply(&self, mut value: Value) -> anyhow::Result<Option<Value>> {
        if value.get("panel_id").is_none() {
            debug!("[Transform::solar_quality] Dropping record without panel_id.");
            return Ok(None);
        }

        // recompute power where the electrical readings disagree with it
        let voltage = value.get("voltage").and_then(ValueAsScalar::cast_f64);
        let current = value.get("current").and_then(ValueAsScalar::cast_f64);
        if let (Some(voltage), Some(current)) = (voltage, current) {
            let computed = voltage * current;
            let reported = value.get("power_output").and_then(ValueAsScalar::cast_f64);
            let recompute = reported.map_or(true, |reported| {
                let reference = computed.abs().max(f64::EPSILON);
                (reported - computed).abs() / reference > 0.1
            });
            if recompute {
                if let Some(reported) = reported {
                    debug!(
                        "[Transform::solar_quality] power_output {reported} disagrees with V*I {computed}, recomputing."
                    );
                }
                value.insert("power_output", computed)?;
            }
        }

        let power = value
            .get("power_output")
            .and_then(ValueAsScalar::cast_f64)
            .unwrap_or_default();

        if let Some(irradiance) = value.get("irradiance").and_then(ValueAsScalar::cast_f64) {
            if irradiance > 0.0 {
                let efficiency = power / (irradiance * self.panel_area) * 100.0;
                value.insert("efficiency", efficiency)?;
            }
        }

        let temperature = value
            .get("temperature")
            .and_then(ValueAsScalar::cast_f64)
            .unwrap_or(25.0);
        let efficiency = value
            .get("efficiency")
            .and_then(ValueAsScalar::cast_f64)
            .unwrap_or_default();
        let status = if power > 0.0 {
            if temperature > self.high_temp_threshold {
                "high_temperature"
            } else if efficiency < self.low_efficiency_threshold {
                "low_efficiency"
            } else {
                "operational"
            }
        } else {
            "inactive"
        };
        value.insert("inverter_status", status)?;
        value.insert("quality_checked_at", millitime())?;
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simd_json::json;

    fn solar() -> SolarQuality {
        SolarQuality {
            panel_area: 2.0,
            high_temp_threshold: 85.0,
            low_efficiency_threshold: 15.0,
        }
    }

    fn apply(value: Value) -> Option<Value> {
        solar().apply(value).expect("transform failed")
    }

    #[test]
    fn drops_records_without_panel_id() {
        assert!(apply(json!({"voltage": 24.0, "current": 10.0})).is_none());
    }

    #[test]
    fn recomputes_missing_power() {
        let out = apply(json!({"panel_id": "LONDON_001", "voltage": 24.0, "current": 10.0}))
            .expect("kept");
        assert_eq!(Some(240.0), out.get("power_output").and_then(ValueAsScalar::cast_f64));
    }

    #[test]
    fn recomputes_implausible_power() {
        let out = apply(json!({
            "panel_id": "LONDON_001",
            "voltage": 24.0,
            "current": 10.0,
            "power_output": 500.0
        }))
        .expect("kept");
        // more than 10% off from 240W, the electrical readings win
        assert_eq!(Some(240.0), out.get("power_output").and_then(ValueAsScalar::cast_f64));
    }

    #[test]
    fn keeps_plausible_power() {
        let out = apply(json!({
            "panel_id": "LONDON_001",
            "voltage": 24.0,
            "current": 10.0,
            "power_output": 250.0
        }))
        .expect("kept");
        assert_eq!(Some(250.0), out.get("power_output").and_then(ValueAsScalar::cast_f64));
    }

    #[test]
    fn computes_efficiency() {
        let out = apply(json!({
            "panel_id": "LONDON_001",
            "voltage": 24.0,
            "current": 10.0,
            "irradiance": 800.0
        }))
        .expect("kept");
        let efficiency = out
            .get("efficiency")
            .and_then(ValueAsScalar::cast_f64)
            .expect("efficiency");
        // 240 / (800 * 2.0) * 100
        assert!((efficiency - 15.0).abs() < f64::EPSILON);
        assert_eq!(Some("operational"), out.get("inverter_status").and_then(ValueAsScalar::as_str));
    }

    #[test]
    fn flags_high_temperature() {
        let out = apply(json!({
            "panel_id": "ATHENS_003",
            "voltage": 24.0,
            "current": 10.0,
            "temperature": 92.3
        }))
        .expect("kept");
        assert_eq!(
            Some("high_temperature"),
            out.get("inverter_status").and_then(ValueAsScalar::as_str)
        );
    }

    #[test]
    fn flags_low_efficiency() {
        let out = apply(json!({
            "panel_id": "OSLO_002",
            "voltage": 24.0,
            "current": 1.0,
            "irradiance": 900.0
        }))
        .expect("kept");
        // 24 / 1800 * 100 = 1.33%
        assert_eq!(
            Some("low_efficiency"),
            out.get("inverter_status").and_then(ValueAsScalar::as_str)
        );
    }

    #[test]
    fn zero_power_is_inactive() {
        let out = apply(json!({"panel_id": "LONDON_001", "voltage": 24.0, "current": 0.0}))
            .expect("kept");
        assert_eq!(
            Some("inactive"),
            out.get("inverter_status").and_then(ValueAsScalar::as_str)
        );
        assert!(out.get("quality_checked_at").is_some());
    }

    #[test]
    fn unknown_transform_is_rejected() {
        let config = NameWithConfig {
            name: "uppercase".to_string(),
            config: None,
        };
        assert!(make_transforms(std::slice::from_ref(&config)).is_err());
    }

    #[test]
    fn configurable_thresholds() -> anyhow::Result<()> {
        let config = NameWithConfig {
            name: "solar_quality".to_string(),
            config: Some(json!({"high_temp_threshold": 60.0})),
        };
        let chain = make_transforms(std::slice::from_ref(&config))?;
        let out = chain[0]
            .apply(json!({
                "panel_id": "LONDON_001",
                "voltage": 24.0,
                "current": 10.0,
                "temperature": 70.0
            }))?
            .expect("kept");
        assert_eq!(
            Some("high_temperature"),
            out.get("inverter_status").and_then(ValueAsScalar::as_str)
        );
        Ok(())
    }
}
