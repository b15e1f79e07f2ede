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

//! The `opensky` connector polls live aircraft state vectors from the
//! OpenSky Network REST API, optionally restricted to a bounding box.
//! Each state vector becomes one record.
//!
//! Anonymous access works with tight rate limits, credentials raise them.
//! 429 and 503 replies back off for the poll interval.

use std::{collections::VecDeque, time::Duration};

use reqwest::StatusCode;
use simd_json::json;
use value_trait::prelude::*;
use weir_common::alias;
use weir_config::Impl;

use crate::{
    config::{env_opt, env_or, ConnectorConfig},
    errors::error_connector_def,
    record::RawValue,
    source::{Source, SourceAddr, SourceContext, SourceManagerBuilder, SourceReply, DEFAULT_STREAM},
    Connector, ConnectorBuilder, ConnectorType,
};

const DEFAULT_ENDPOINT: &str = "https://opensky-network.org/api";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// a lat/lon bounding box, as the API expects it
#[derive(Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub(crate) struct BoundingBox {
    lamin: f64,
    lamax: f64,
    lomin: f64,
    lomax: f64,
}

impl std::str::FromStr for BoundingBox {
    type Err = anyhow::Error;

    /// parses `"lamin,lamax,lomin,lomax"`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<f64> = s
            .split(',')
            .map(|part| part.trim().parse())
            .collect::<Result<_, _>>()
            .map_err(|e| anyhow::anyhow!("invalid bounding box '{s}': {e}"))?;
        match parts.as_slice() {
            [lamin, lamax, lomin, lomax] => Ok(Self {
                lamin: *lamin,
                lamax: *lamax,
                lomin: *lomin,
                lomax: *lomax,
            }),
            _ => Err(anyhow::anyhow!(
                "invalid bounding box '{s}': expected lamin,lamax,lomin,lomax"
            )),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    bbox: Option<BoundingBox>,
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
        Ok(Self {
            username: env_opt("OPENSKY_USERNAME")?,
            password: env_opt("OPENSKY_PASSWORD")?,
            bbox: env_opt("OPENSKY_BBOX")?,
            poll_interval_secs: env_or("OPENSKY_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS)?,
            endpoint: default_endpoint(),
        })
    }
}

/// builder for the `opensky` connector
#[derive(Debug, Default)]
pub struct Builder {}

#[async_trait::async_trait]
impl ConnectorBuilder for Builder {
    fn connector_type(&self) -> ConnectorType {
        "opensky".into()
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
        Ok(Box::new(OpenSky { config }))
    }
}

struct OpenSky {
    config: Config,
}

#[async_trait::async_trait]
impl Connector for OpenSky {
    async fn create_source(
        &mut self,
        ctx: SourceContext,
        builder: SourceManagerBuilder,
    ) -> anyhow::Result<Option<SourceAddr>> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        let source = OpenSkySource {
            config: self.config.clone(),
            client,
            pending: VecDeque::new(),
        };
        Ok(Some(builder.spawn(source, ctx)))
    }
}

struct OpenSkySource {
    config: Config,
    client: reqwest::Client,
    /// state vectors left over from the last sweep
    pending: VecDeque<simd_json::OwnedValue>,
}

#[async_trait::async_trait]
impl Source for OpenSkySource {
    async fn pull_data(
        &mut self,
        _pull_id: &mut u64,
        ctx: &SourceContext,
    ) -> anyhow::Result<SourceReply> {
        let poll_ms = self.config.poll_interval_secs * 1000;
        if let Some(record) = self.pending.pop_front() {
            return Ok(SourceReply::Data {
                payload: RawValue::Structured(record),
                key: None,
                stream: DEFAULT_STREAM,
            });
        }

        let url = format!("{}/states/all", self.config.endpoint);
        let mut request = self.client.get(&url);
        if let Some(bbox) = self.config.bbox {
            request = request.query(&[
                ("lamin", bbox.lamin),
                ("lamax", bbox.lamax),
                ("lomin", bbox.lomin),
                ("lomax", bbox.lomax),
            ]);
        }
        if let Some(username) = self.config.username.as_ref() {
            request = request.basic_auth(username, self.config.password.as_ref());
        }
        let response = request.send().await?;

        match response.status() {
            StatusCode::OK => {
                let mut raw = response.bytes().await?.to_vec();
                let data = simd_json::to_owned_value(&mut raw)?;
                let time = data.get_u64("time").unwrap_or_default();
                self.pending = data
                    .get_array("states")
                    .map(|states| states.iter().filter_map(|s| state_record(s, time)).collect())
                    .unwrap_or_default();
                match self.pending.pop_front() {
                    Some(record) => Ok(SourceReply::Data {
                        payload: RawValue::Structured(record),
                        key: None,
                        stream: DEFAULT_STREAM,
                    }),
                    None => {
                        debug!("{ctx} No aircraft in the configured area.");
                        Ok(SourceReply::Empty(poll_ms))
                    }
                }
            }
            status if status == StatusCode::TOO_MANY_REQUESTS
                || status == StatusCode::SERVICE_UNAVAILABLE =>
            {
                warn!("{ctx} OpenSky replied {status}, backing off.");
                Ok(SourceReply::Empty(poll_ms))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(anyhow::anyhow!("unexpected reply {status}: {body}"))
            }
        }
    }
}

/// One state vector (a positional array in the API reply) becomes one
/// record. Vectors without an icao24 are dropped.
fn state_record(state: &simd_json::OwnedValue, time: u64) -> Option<simd_json::OwnedValue> {
    let fields = state.as_array()?;
    let icao24 = fields.first()?.as_str()?;
    let at = |idx: usize| fields.get(idx);
    Some(json!({
        "icao24": icao24,
        "callsign": at(1).and_then(ValueAsScalar::as_str).map(str::trim).unwrap_or_default(),
        "origin_country": at(2).and_then(ValueAsScalar::as_str).unwrap_or_default(),
        "longitude": at(5).and_then(ValueAsScalar::as_f64),
        "latitude": at(6).and_then(ValueAsScalar::as_f64),
        "baro_altitude": at(7).and_then(ValueAsScalar::as_f64),
        "on_ground": at(8).and_then(ValueAsScalar::as_bool).unwrap_or_default(),
        "velocity": at(9).and_then(ValueAsScalar::as_f64),
        "true_track": at(10).and_then(ValueAsScalar::as_f64),
        "time": time
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_parses() -> anyhow::Result<()> {
        let bbox: BoundingBox = "52.3, 52.7, 13.0, 13.7".parse()?;
        assert_eq!(
            BoundingBox {
                lamin: 52.3,
                lamax: 52.7,
                lomin: 13.0,
                lomax: 13.7
            },
            bbox
        );
        assert!("52.3,52.7,13.0".parse::<BoundingBox>().is_err());
        assert!("a,b,c,d".parse::<BoundingBox>().is_err());
        Ok(())
    }

    #[test]
    fn state_vector_is_mapped() {
        let state = json!([
            "3c6444",
            "DLH9LF  ",
            "Germany",
            1_700_000_000_u64,
            1_700_000_010_u64,
            13.4,
            52.5,
            11_582.4,
            false,
            231.8,
            86.7,
            0.0
        ]);
        let record = state_record(&state, 1_700_000_010).expect("should map");
        assert_eq!(Some("3c6444"), record.get_str("icao24"));
        assert_eq!(Some("DLH9LF"), record.get_str("callsign"));
        assert_eq!(Some("Germany"), record.get_str("origin_country"));
        assert_eq!(Some(13.4), record.get_f64("longitude"));
        assert_eq!(Some(false), record.get_bool("on_ground"));
        assert_eq!(Some(86.7), record.get_f64("true_track"));
        assert_eq!(Some(1_700_000_010), record.get_u64("time"));
    }

    #[test]
    fn vector_without_icao24_is_dropped() {
        assert!(state_record(&json!([]), 0).is_none());
        assert!(state_record(&json!({"icao24": "not an array"}), 0).is_none());
        assert!(state_record(&json!([null, "CS"]), 0).is_none());
    }

    #[test]
    fn null_position_is_kept_as_null() {
        let state = json!(["3c6444", null, "Germany", null, null, null, null, null, true]);
        let record = state_record(&state, 7).expect("should map");
        assert_eq!(Some("3c6444"), record.get_str("icao24"));
        assert!(record.get("longitude").is_some());
        assert!(record.get_f64("longitude").is_none());
        assert_eq!(Some(true), record.get_bool("on_ground"));
    }
}
