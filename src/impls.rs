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

//! The connector catalog.

/// blockchain.info WebSocket source
#[cfg(feature = "blockchain")]
pub mod blockchain;
/// ClickHouse sink
#[cfg(feature = "clickhouse")]
pub mod clickhouse;
/// Google Cloud Storage CSV bucket source
#[cfg(feature = "gcs")]
pub mod gcs_bucket;
/// Google Cloud Storage object sink
#[cfg(feature = "gcs")]
pub mod gcs_writer;
/// OpenSky REST poller
#[cfg(feature = "http-poll")]
pub mod opensky;
/// OpenWeather REST poller
#[cfg(feature = "http-poll")]
pub mod openweather;
/// QuestDB sink
#[cfg(feature = "questdb")]
pub mod questdb;
/// synthetic solar telemetry source
#[cfg(feature = "solar")]
pub mod solar;
/// TimescaleDB sink
#[cfg(feature = "timescale")]
pub mod timescale;

use crate::{ConnectorBuilder, ConnectorType};

/// All connector builders compiled into this binary.
#[must_use]
pub fn builtin_connector_types() -> Vec<Box<dyn ConnectorBuilder + 'static>> {
    vec![
        #[cfg(feature = "solar")]
        Box::<solar::Builder>::default(),
        #[cfg(feature = "blockchain")]
        Box::<blockchain::Builder>::default(),
        #[cfg(feature = "http-poll")]
        Box::<openweather::Builder>::default(),
        #[cfg(feature = "http-poll")]
        Box::<opensky::Builder>::default(),
        #[cfg(feature = "gcs")]
        Box::<gcs_bucket::Builder>::default(),
        #[cfg(feature = "gcs")]
        Box::<gcs_writer::Builder>::default(),
        #[cfg(feature = "clickhouse")]
        Box::<clickhouse::Builder>::default(),
        #[cfg(feature = "questdb")]
        Box::<questdb::Builder>::default(),
        #[cfg(feature = "timescale")]
        Box::<timescale::Builder>::default(),
    ]
}

/// Look up the builder for a connector type.
pub(crate) fn builder_for(connector_type: &ConnectorType) -> Option<Box<dyn ConnectorBuilder>> {
    builtin_connector_types()
        .into_iter()
        .find(|b| b.connector_type() == *connector_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_builtins() {
        for builder in builtin_connector_types() {
            let ty = builder.connector_type();
            assert!(builder_for(&ty).is_some(), "missing builder for {ty}");
        }
        assert!(builder_for(&ConnectorType::from("does_not_exist")).is_none());
    }

    #[cfg(feature = "solar")]
    #[test]
    fn solar_is_registered() {
        assert!(builder_for(&ConnectorType::from("solar_telemetry")).is_some());
    }
}
