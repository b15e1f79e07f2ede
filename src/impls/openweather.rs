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

//! The `openweather` connector polls current conditions from the OpenWeather
//! REST API for a configured list of cities, one record per city per sweep.
//!
//! Error handling mirrors the API contract: 401 means the key is bad and is
//! reported as a hard error, 404 skips the offending city, 429 and server
//! errors wait out the poll interval.

use std::time::Duration;

use reqwest::StatusCode;
use simd_json::json;
use value_trait::prelude::*;
use weir_common::alias;
use weir_config::Impl;

use crate::{
    config::{env_or, env_required, ConnectorConfig},
    errors::error_connector_def,
    record::RawValue,
    source::{Source, SourceAddr, SourceContext, SourceManagerBuilder, SourceReply, DEFAULT_STREAM},
    Connector, ConnectorBuilder, ConnectorType,
};

const DEFAULT_ENDPOINT: &str = "https://api.openweathermap.org/data/2.5";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    api_key: String,
    /// cities polled round-robin, one sweep per poll interval
    cities: Vec<String>,
    #[serde(default = "default_poll_interval_secs")]
    poll_interval_secs: u64,
    #[serde(default = "default_endpoint")]
    endpoint: String,
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

impl Impl for Config {}

impl Config {
    fn from_env() -> anyhow::Result<Self> {
        let cities: String = env_or("OPENWEATHER_CITIES", "Berlin".to_string())?;
        Ok(Self {
            api_key: env_required("OPENWEATHER_API_KEY")?,
            cities: cities
                .split(',')
                .map(str::trim)
                .filter(|city| !city.is_empty())
                .map(ToString::to_string)
                .collect(),
            poll_interval_secs: env_or(
                "OPENWEATHER_POLL_INTERVAL_SECS",
                DEFAULT_POLL_INTERVAL_SECS,
            )?,
            endpoint: default_endpoint(),
        })
    }
}

/// builder for the `openweather` connector
#[derive(Debug, Default)]
pub struct Builder {}

#[async_trait::async_trait]
impl ConnectorBuilder for Builder {
    fn connector_type(&self) -> ConnectorType {
        "openweather".into()
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
        if config.cities.is_empty() {
            return Err(error_connector_def(alias, &"no cities configured").into());
        }
        Ok(Box::new(OpenWeather { config }))
    }
}

struct OpenWeather {
    config: Config,
}

#[async_trait::async_trait]
impl Connector for OpenWeather {
    async fn create_source(
        &mut self,
        ctx: SourceContext,
        builder: SourceManagerBuilder,
    ) -> anyhow::Result<Option<SourceAddr>> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        let source = OpenWeatherSource {
            config: self.config.clone(),
            client,
            cursor: 0,
        };
        Ok(Some(builder.spawn(source, ctx)))
    }
}

struct OpenWeatherSource {
    config: Config,
    client: reqwest::Client,
    /// index of the next city in the current sweep
    cursor: usize,
}

#[async_trait::async_trait]
impl Source for OpenWeatherSource {
    async fn pull_data(
        &mut self,
        _pull_id: &mut u64,
        ctx: &SourceContext,
    ) -> anyhow::Result<SourceReply> {
        let poll_ms = self.config.poll_interval_secs * 1000;
        loop {
            let Some(city) = self.config.cities.get(self.cursor) else {
                self.cursor = 0;
                return Ok(SourceReply::Empty(poll_ms));
            };
            self.cursor += 1;

            let url = format!("{}/weather", self.config.endpoint);
            let response = self
                .client
                .get(&url)
                .query(&[
                    ("q", city.as_str()),
                    ("appid", self.config.api_key.as_str()),
                    ("units", "metric"),
                ])
                .send()
                .await?;

            match response.status() {
                StatusCode::OK => {
                    let mut raw = response.bytes().await?.to_vec();
                    let data = simd_json::to_owned_value(&mut raw)?;
                    return Ok(SourceReply::Data {
                        payload: RawValue::Structured(weather_record(&data)),
                        key: Some(city.clone()),
                        stream: DEFAULT_STREAM,
                    });
                }
                StatusCode::UNAUTHORIZED => {
                    return Err(anyhow::anyhow!("authentication failed, check the API key"));
                }
                StatusCode::NOT_FOUND => {
                    warn!("{ctx} City '{city}' not found, skipping.");
                }
                status if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() => {
                    warn!("{ctx} OpenWeather replied {status}, backing off.");
                    return Ok(SourceReply::Empty(poll_ms));
                }
                status => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(anyhow::anyhow!("unexpected reply {status}: {body}"));
                }
            }
        }
    }
}

/// Flatten an API reply into one record.
fn weather_record(data: &simd_json::OwnedValue) -> simd_json::OwnedValue {
    let weather = data
        .get_array("weather")
        .and_then(|conditions| conditions.first());
    json!({
        "city": data.get_str("name").unwrap_or_default(),
        "country": data.get("sys").and_then(|s| s.get_str("country")).unwrap_or_default(),
        "timestamp": data.get_u64("dt").unwrap_or_default(),
        "temperature": data.get("main").and_then(|m| m.get_f64("temp")).unwrap_or_default(),
        "feels_like": data.get("main").and_then(|m| m.get_f64("feels_like")).unwrap_or_default(),
        "humidity": data.get("main").and_then(|m| m.get_u64("humidity")).unwrap_or_default(),
        "pressure": data.get("main").and_then(|m| m.get_u64("pressure")).unwrap_or_default(),
        "weather_main": weather.and_then(|w| w.get_str("main")).unwrap_or_default(),
        "weather_description": weather.and_then(|w| w.get_str("description")).unwrap_or_default(),
        "wind_speed": data.get("wind").and_then(|w| w.get_f64("speed")).unwrap_or_default(),
        "wind_direction": data.get("wind").and_then(|w| w.get_u64("deg")).unwrap_or_default(),
        "cloudiness": data.get("clouds").and_then(|c| c.get_u64("all")).unwrap_or_default(),
        "visibility": data.get_u64("visibility").unwrap_or_default(),
        "coordinates": {
            "lat": data.get("coord").and_then(|c| c.get_f64("lat")).unwrap_or_default(),
            "lon": data.get("coord").and_then(|c| c.get_f64("lon")).unwrap_or_default()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_reply_is_flattened() {
        let reply = json!({
            "coord": {"lon": 13.4105, "lat": 52.5244},
            "weather": [{"id": 800, "main": "Clear", "description": "clear sky"}],
            "main": {
                "temp": 21.3,
                "feels_like": 20.9,
                "pressure": 1017,
                "humidity": 48
            },
            "visibility": 10000,
            "wind": {"speed": 3.6, "deg": 250},
            "clouds": {"all": 0},
            "dt": 1_700_000_000_u64,
            "sys": {"country": "DE"},
            "name": "Berlin"
        });
        let record = weather_record(&reply);
        assert_eq!(Some("Berlin"), record.get_str("city"));
        assert_eq!(Some("DE"), record.get_str("country"));
        assert_eq!(Some(21.3), record.get_f64("temperature"));
        assert_eq!(Some(48), record.get_u64("humidity"));
        assert_eq!(Some("Clear"), record.get_str("weather_main"));
        assert_eq!(Some(250), record.get_u64("wind_direction"));
        assert_eq!(
            Some(52.5244),
            record.get("coordinates").and_then(|c| c.get_f64("lat"))
        );
    }

    #[test]
    fn partial_reply_yields_defaults() {
        let reply = json!({"name": "Atlantis"});
        let record = weather_record(&reply);
        assert_eq!(Some("Atlantis"), record.get_str("city"));
        assert_eq!(Some(""), record.get_str("country"));
        assert_eq!(Some(0.0), record.get_f64("temperature"));
    }

    #[test]
    fn city_list_splitting() -> anyhow::Result<()> {
        let mut raw = br#"{
            "api_key": "secret",
            "cities": ["Berlin", "Madrid"]
        }"#
        .to_vec();
        let value = simd_json::to_owned_value(&mut raw)?;
        let config = Config::new(&value)?;
        assert_eq!(vec!["Berlin", "Madrid"], config.cities);
        assert_eq!(DEFAULT_POLL_INTERVAL_SECS, config.poll_interval_secs);
        assert_eq!(DEFAULT_ENDPOINT, config.endpoint);
        Ok(())
    }
}
