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

//! The `solar_telemetry` connector generates synthetic solar panel telemetry
//! for a fleet across ten European metro sites.
//!
//! Per tick it emits one record per panel, following a day-curve signal
//! model: irradiance is a bell curve over the local solar hour (zero at
//! night), power follows irradiance with temperature derating and per-panel
//! age degradation, voltage sits around 24 V nominal and current is derived
//! from power and voltage.
//!
//! ## Configuration
//!
//! * `panels_per_location`: panels simulated per site (default: 10,
//!   `SOLAR_PANELS_PER_LOCATION`)
//! * `interval_ms`: milliseconds between ticks (default: 1000,
//!   `SOLAR_INTERVAL_MS`)

use std::collections::VecDeque;

use chrono::Timelike;
use chrono_tz::Tz;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use simd_json::json;
use weir_common::{alias, time::nanotime};
use weir_config::Impl;

use crate::{
    config::{env_or, ConnectorConfig},
    errors::error_connector_def,
    source::{Source, SourceAddr, SourceContext, SourceManagerBuilder, SourceReply, DEFAULT_STREAM},
    record::RawValue,
    Connector, ConnectorBuilder, ConnectorType,
};

const NANOS_PER_MILLI: u64 = 1_000_000;
const SECONDS_PER_YEAR: f64 = 365.0 * 24.0 * 3600.0;

/// a metro site hosting part of the fleet
struct Site {
    id: &'static str,
    name: &'static str,
    latitude: f64,
    longitude: f64,
    timezone: Tz,
    /// W/m² at peak sun
    peak_irradiance: f64,
}

const SITES: &[Site] = &[
    Site {
        id: "LONDON",
        name: "London, UK",
        latitude: 51.5074,
        longitude: -0.1278,
        timezone: Tz::Europe__London,
        peak_irradiance: 850.0,
    },
    Site {
        id: "MADRID",
        name: "Madrid, Spain",
        latitude: 40.4168,
        longitude: -3.7038,
        timezone: Tz::Europe__Madrid,
        peak_irradiance: 950.0,
    },
    Site {
        id: "BERLIN",
        name: "Berlin, Germany",
        latitude: 52.52,
        longitude: 13.405,
        timezone: Tz::Europe__Berlin,
        peak_irradiance: 900.0,
    },
    Site {
        id: "ROME",
        name: "Rome, Italy",
        latitude: 41.9028,
        longitude: 12.4964,
        timezone: Tz::Europe__Rome,
        peak_irradiance: 920.0,
    },
    Site {
        id: "PARIS",
        name: "Paris, France",
        latitude: 48.8566,
        longitude: 2.3522,
        timezone: Tz::Europe__Paris,
        peak_irradiance: 870.0,
    },
    Site {
        id: "AMSTERDAM",
        name: "Amsterdam, Netherlands",
        latitude: 52.3676,
        longitude: 4.9041,
        timezone: Tz::Europe__Amsterdam,
        peak_irradiance: 830.0,
    },
    Site {
        id: "VIENNA",
        name: "Vienna, Austria",
        latitude: 48.2082,
        longitude: 16.3738,
        timezone: Tz::Europe__Vienna,
        peak_irradiance: 880.0,
    },
    Site {
        id: "DUBLIN",
        name: "Dublin, Ireland",
        latitude: 53.3498,
        longitude: -6.2603,
        timezone: Tz::Europe__Dublin,
        peak_irradiance: 800.0,
    },
    Site {
        id: "PRAGUE",
        name: "Prague, Czech Republic",
        latitude: 50.0755,
        longitude: 14.4378,
        timezone: Tz::Europe__Prague,
        peak_irradiance: 860.0,
    },
    Site {
        id: "ATHENS",
        name: "Athens, Greece",
        latitude: 37.9838,
        longitude: 23.7275,
        timezone: Tz::Europe__Athens,
        peak_irradiance: 980.0,
    },
];

#[derive(Deserialize, Clone, Copy, Debug)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    /// panels simulated per site
    #[serde(default = "default_panels_per_location")]
    panels_per_location: usize,
    /// milliseconds between ticks
    #[serde(default = "default_interval_ms")]
    interval_ms: u64,
}

fn default_panels_per_location() -> usize {
    10
}

fn default_interval_ms() -> u64 {
    1_000
}

impl Impl for Config {}

impl Config {
    fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            panels_per_location: env_or("SOLAR_PANELS_PER_LOCATION", default_panels_per_location())?,
            interval_ms: env_or("SOLAR_INTERVAL_MS", default_interval_ms())?,
        })
    }
}

/// builder for the `solar_telemetry` connector
#[derive(Debug, Default)]
pub struct Builder {}

#[async_trait::async_trait]
impl ConnectorBuilder for Builder {
    fn connector_type(&self) -> ConnectorType {
        "solar_telemetry".into()
    }

    async fn build(
        &self,
        alias: &alias::Connector,
        config: &ConnectorConfig,
    ) -> anyhow::Result<Box<dyn Connector>> {
        let config = match config.config.as_ref() {
            Some(raw) => Config::new(raw).map_err(|e| error_connector_def(alias, &e))?,
            None => Config::from_env()?,
        };
        Ok(Box::new(SolarTelemetry { config }))
    }
}

struct SolarTelemetry {
    config: Config,
}

#[async_trait::async_trait]
impl Connector for SolarTelemetry {
    async fn create_source(
        &mut self,
        ctx: SourceContext,
        builder: SourceManagerBuilder,
    ) -> anyhow::Result<Option<SourceAddr>> {
        let mut rng = SmallRng::from_entropy();
        let source = SolarSource {
            fleet: Fleet::provision(self.config.panels_per_location, &mut rng),
            interval_ns: self.config.interval_ms * NANOS_PER_MILLI,
            sim_time: nanotime(),
            next: 0,
            pending: VecDeque::new(),
            rng,
        };
        Ok(Some(builder.spawn(source, ctx)))
    }
}

struct Panel {
    id: String,
    site: &'static Site,
    /// W, already scaled by panel efficiency
    base_power: f64,
    /// W/m², site peak with per-panel variation
    base_irradiance: f64,
    efficiency: f64,
    /// fraction of output lost per year
    degradation_rate: f64,
    age_secs: f64,
}

impl Panel {
    fn provision(site: &'static Site, number: usize, rng: &mut SmallRng) -> Self {
        // normal jitter clamped, sigma 0.05
        let efficiency = Normal::new(1.0f64, 0.05)
            .map_or(1.0, |normal| normal.sample(rng))
            .clamp(0.8, 1.2);
        Self {
            id: format!("PANEL_{}_{}", site.id, number),
            site,
            base_power: 250.0 * efficiency,
            base_irradiance: site.peak_irradiance * rng.gen_range(0.95..=1.05),
            efficiency,
            degradation_rate: rng.gen_range(0.005..=0.02),
            age_secs: 0.0,
        }
    }

    /// one telemetry record at the given simulated timestamp (ns)
    fn record(&self, timestamp: u64, rng: &mut SmallRng) -> simd_json::OwnedValue {
        let hour = local_solar_hour(timestamp, self.site.timezone);
        let intensity = solar_intensity(hour);

        let mut temperature = 25.0 + intensity * 15.0 + 0.5 * (hour - 12.0) / 6.0;
        let degradation = 1.0 - self.age_secs * self.degradation_rate / SECONDS_PER_YEAR;
        let power = self.base_power * intensity * degradation * (1.0 - 0.004 * (temperature - 25.0));
        let irradiance = self.base_irradiance * intensity * self.efficiency;
        let voltage = 24.0 * (1.0 - 0.002 * (temperature - 25.0)) * rng.gen_range(0.98..=1.02);

        let power = (power * rng.gen_range(0.98..=1.02)).max(0.0);
        temperature += rng.gen_range(-0.5..=0.5);
        let irradiance = (irradiance * rng.gen_range(0.97..=1.03)).max(0.0);
        let voltage = (voltage * rng.gen_range(0.998..=1.002)).max(0.0);
        let current = if voltage > 0.0 { power / voltage } else { 0.0 };
        let current = (current * rng.gen_range(0.99..=1.01)).max(0.0);

        json!({
            "panel_id": self.id.clone(),
            "location_id": self.site.id,
            "location_name": self.site.name,
            "latitude": self.site.latitude,
            "longitude": self.site.longitude,
            "timezone": self.site.timezone.name(),
            "power_output": round1(power),
            "unit_power": "W",
            "temperature": round1(temperature),
            "unit_temp": "C",
            "irradiance": round1(irradiance),
            "unit_irradiance": "W/m²",
            "voltage": round1(voltage),
            "unit_voltage": "V",
            "current": round1(current),
            "unit_current": "A",
            "inverter_status": if power > 0.0 { "OK" } else { "STANDBY" },
            "timestamp": timestamp
        })
    }
}

struct Fleet {
    panels: Vec<Panel>,
}

impl Fleet {
    fn provision(panels_per_location: usize, rng: &mut SmallRng) -> Self {
        let mut panels = Vec::with_capacity(SITES.len() * panels_per_location);
        for site in SITES {
            for number in 1..=panels_per_location {
                panels.push(Panel::provision(site, number, rng));
            }
        }
        Self { panels }
    }

    #[allow(clippy::cast_precision_loss)]
    fn tick(&mut self, timestamp: u64, interval_ns: u64, rng: &mut SmallRng) -> Vec<(String, simd_json::OwnedValue)> {
        let age_step = interval_ns as f64 / 1e9;
        self.panels
            .iter_mut()
            .map(|panel| {
                panel.age_secs += age_step;
                (panel.site.id.to_string(), panel.record(timestamp, rng))
            })
            .collect()
    }
}

/// Normalized solar intensity over the local hour: a Gaussian bell centered
/// on solar noon, zero at night, with sunrise/sunset ramps.
fn solar_intensity(hour: f64) -> f64 {
    if !(5.0..=19.0).contains(&hour) {
        return 0.0;
    }
    let delta = hour - 12.0;
    let sigma = 4.0f64;
    let intensity = (-0.5 * (delta / sigma).powi(2)).exp();
    if hour < 6.0 {
        intensity * (hour - 5.0)
    } else if hour >= 18.0 {
        intensity * (19.0 - hour)
    } else {
        intensity
    }
}

/// fractional local hour at the site for a ns-since-epoch timestamp
#[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
fn local_solar_hour(timestamp_ns: u64, tz: Tz) -> f64 {
    let secs = (timestamp_ns / 1_000_000_000) as i64;
    chrono::DateTime::from_timestamp(secs, 0).map_or(12.0, |utc| {
        let local = utc.with_timezone(&tz);
        f64::from(local.hour()) + f64::from(local.minute()) / 60.0
    })
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

struct SolarSource {
    fleet: Fleet,
    interval_ns: u64,
    /// simulated clock, advanced one interval per tick
    sim_time: u64,
    /// wall-clock deadline (ns) for the next tick
    next: u64,
    pending: VecDeque<(String, simd_json::OwnedValue)>,
    rng: SmallRng,
}

#[async_trait::async_trait]
impl Source for SolarSource {
    async fn pull_data(
        &mut self,
        _pull_id: &mut u64,
        _ctx: &SourceContext,
    ) -> anyhow::Result<SourceReply> {
        if self.pending.is_empty() {
            let now = nanotime();
            if now < self.next {
                return Ok(SourceReply::Empty((self.next - now) / NANOS_PER_MILLI));
            }
            self.pending = self
                .fleet
                .tick(self.sim_time, self.interval_ns, &mut self.rng)
                .into();
            self.sim_time += self.interval_ns;
            self.next = now + self.interval_ns;
        }
        match self.pending.pop_front() {
            Some((key, payload)) => Ok(SourceReply::Data {
                payload: RawValue::Structured(payload),
                key: Some(key),
                stream: DEFAULT_STREAM,
            }),
            None => Ok(SourceReply::Empty(self.interval_ns / NANOS_PER_MILLI)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use value_trait::prelude::*;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(42)
    }

    #[test]
    fn night_is_dark() {
        assert_eq!(0.0, solar_intensity(0.0));
        assert_eq!(0.0, solar_intensity(4.9));
        assert_eq!(0.0, solar_intensity(19.5));
        assert_eq!(0.0, solar_intensity(23.0));
    }

    #[test]
    fn noon_is_peak() {
        let noon = solar_intensity(12.0);
        assert!((noon - 1.0).abs() < f64::EPSILON);
        assert!(solar_intensity(9.0) < noon);
        assert!(solar_intensity(15.0) < noon);
        // ramps stay below the plain bell
        assert!(solar_intensity(5.5) < solar_intensity(6.5));
    }

    #[test]
    fn panel_ids_unique_per_site() {
        let mut rng = rng();
        let fleet = Fleet::provision(5, &mut rng);
        assert_eq!(SITES.len() * 5, fleet.panels.len());
        let mut ids: Vec<&str> = fleet.panels.iter().map(|p| p.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(SITES.len() * 5, ids.len());
        assert!(fleet.panels.iter().any(|p| p.id == "PANEL_LONDON_1"));
        assert!(fleet.panels.iter().any(|p| p.id == "PANEL_ATHENS_5"));
    }

    #[test]
    fn record_carries_all_fields_and_units() {
        let mut rng = rng();
        let panel = Panel::provision(&SITES[0], 1, &mut rng);
        // noon UTC on 2024-06-21
        let noon_ns = 1_718_971_200_000_000_000_u64;
        let record = panel.record(noon_ns, &mut rng);
        for field in [
            "panel_id",
            "location_id",
            "location_name",
            "latitude",
            "longitude",
            "timezone",
            "power_output",
            "unit_power",
            "temperature",
            "unit_temp",
            "irradiance",
            "unit_irradiance",
            "voltage",
            "unit_voltage",
            "current",
            "unit_current",
            "inverter_status",
            "timestamp",
        ] {
            assert!(record.get(field).is_some(), "missing field {field}");
        }
        assert_eq!(Some("W"), record.get_str("unit_power"));
        assert_eq!(Some("Europe/London"), record.get_str("timezone"));
        assert_eq!(Some(noon_ns), record.get_u64("timestamp"));
    }

    #[test]
    fn night_record_is_idle() {
        let mut rng = rng();
        let panel = Panel::provision(&SITES[2], 1, &mut rng); // Berlin
        // midnight UTC is night everywhere in Europe
        let midnight_ns = 1_719_014_400_000_000_000_u64;
        let record = panel.record(midnight_ns, &mut rng);
        assert_eq!(Some(0.0), record.get_f64("power_output"));
        assert_eq!(Some(0.0), record.get_f64("irradiance"));
        assert_eq!(Some("STANDBY"), record.get_str("inverter_status"));
    }

    #[test]
    fn daytime_power_is_positive() {
        let mut rng = rng();
        let panel = Panel::provision(&SITES[1], 1, &mut rng); // Madrid
        let noon_ns = 1_718_971_200_000_000_000_u64;
        let record = panel.record(noon_ns, &mut rng);
        assert!(record.get_f64("power_output").unwrap_or_default() > 0.0);
        assert!(record.get_f64("irradiance").unwrap_or_default() > 0.0);
        assert_eq!(Some("OK"), record.get_str("inverter_status"));
        let power = record.get_f64("power_output").unwrap_or_default();
        let voltage = record.get_f64("voltage").unwrap_or_default();
        let current = record.get_f64("current").unwrap_or_default();
        // current tracks power / voltage within the jitter band
        assert!((current - power / voltage).abs() / (power / voltage) < 0.05);
    }
}
