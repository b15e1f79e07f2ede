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

//! A flow wires one source connector through transforms and a pipe into one
//! sink connector and manages their lifecycle as a unit.

use weir_common::alias;
use weir_config::NameWithConfig;

use crate::{
    channel,
    config::{env_opt, env_or, env_required, BatchingConfig, ConnectorConfig, Reconnect, StopAfter},
    errors::Error,
    impls,
    pipe::pipe,
    system::KillSwitch,
    transform::make_transforms,
    utils::retry::RetryConfig,
    Addr, SinkSpec, SourceSpec,
};

/// Everything needed to assemble one flow.
#[derive(Clone, Debug)]
pub struct FlowConfig {
    /// flow name, used for aliases and the pipe name
    pub name: String,
    /// the source connector
    pub source: ConnectorConfig,
    /// the sink connector
    pub sink: ConnectorConfig,
    /// transforms applied between normalization and publish, in order
    pub transforms: Vec<NameWithConfig>,
    /// pipe capacity in records
    pub pipe_capacity: usize,
    /// sink batching knobs
    pub batching: BatchingConfig,
    /// batch write retry policy
    pub retry: RetryConfig,
    /// test-mode stop conditions
    pub stop_after: StopAfter,
}

impl FlowConfig {
    /// Assemble a flow config from `WEIR_*` environment variables.
    /// Connector-specific settings are read by each connector's own config.
    ///
    /// # Errors
    /// if a variable is set but does not parse, or `WEIR_SINK` is unset
    pub fn from_env() -> anyhow::Result<Self> {
        let source: String = env_or("WEIR_SOURCE", "solar_telemetry".to_string())?;
        let sink: String = env_required("WEIR_SINK")?;
        let transforms = env_or("WEIR_TRANSFORMS", String::new())?
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| NameWithConfig {
                name: name.to_string(),
                config: None,
            })
            .collect();
        let reconnect = Reconnect::Retry {
            interval_ms: 1_000,
            growth_rate: 1.5,
            max_retries: None,
            randomized: true,
        };
        Ok(Self {
            name: env_or("WEIR_FLOW", "main".to_string())?,
            source: ConnectorConfig::of_type(source.as_str()).with_reconnect(reconnect.clone()),
            sink: ConnectorConfig::of_type(sink.as_str()).with_reconnect(reconnect),
            transforms,
            pipe_capacity: env_or("WEIR_PIPE", channel::qsize())?,
            batching: BatchingConfig {
                max_batch_size: env_or("WEIR_BATCH_SIZE", BatchingConfig::default().max_batch_size)?,
                flush_interval_ms: env_or(
                    "WEIR_FLUSH_INTERVAL_MS",
                    BatchingConfig::default().flush_interval_ms,
                )?,
            },
            retry: RetryConfig {
                max_attempts: env_or("WEIR_MAX_ATTEMPTS", RetryConfig::default().max_attempts)?,
                base_delay_ms: env_or::<u64>("WEIR_RETRY_DELAY_SECS", 3)? * 1_000,
                backoff: env_or("WEIR_RETRY_BACKOFF", crate::utils::retry::Backoff::None)?,
                max_delay_ms: env_or::<u64>("WEIR_RETRY_MAX_DELAY_SECS", 60)? * 1_000,
                backpressure_delay_ms: env_or::<u64>("WEIR_BACKPRESSURE_SECS", 30)? * 1_000,
            },
            stop_after: StopAfter {
                records: env_opt("WEIR_STOP_AFTER_RECORDS")?,
                seconds: env_opt("WEIR_STOP_AFTER_SECS")?,
            },
        })
    }
}

/// A running flow.
pub struct Flow {
    alias: alias::Flow,
    source: Addr,
    sink: Addr,
}

impl Flow {
    /// Wire up and start the flow: builds both connectors from the registry,
    /// spawns their halves around a fresh pipe and runs the first connection
    /// attempts.
    ///
    /// # Errors
    /// if a connector type is unknown, a connector fails to build, or the
    /// first connection attempt fails without a retry scheduled
    pub async fn start(config: FlowConfig, kill_switch: KillSwitch) -> anyhow::Result<Self> {
        let alias = alias::Flow::new(config.name.clone());

        let source_alias = alias::Connector::new(
            alias.clone(),
            config.source.connector_type.to_string(),
        );
        let sink_alias =
            alias::Connector::new(alias.clone(), config.sink.connector_type.to_string());

        let source_builder = impls::builder_for(&config.source.connector_type).ok_or_else(|| {
            Error::UnknownConnectorType(
                source_alias.clone(),
                config.source.connector_type.to_string(),
            )
        })?;
        let sink_builder = impls::builder_for(&config.sink.connector_type).ok_or_else(|| {
            Error::UnknownConnectorType(sink_alias.clone(), config.sink.connector_type.to_string())
        })?;

        let source_connector = source_builder.build(&source_alias, &config.source).await?;
        let sink_connector = sink_builder.build(&sink_alias, &config.sink).await?;

        let transforms = make_transforms(&config.transforms)?;
        let (tx, rx) = pipe(&config.name, config.pipe_capacity);

        let source = crate::spawn(
            &source_alias,
            source_connector,
            &config.source.reconnect,
            config.source.connector_type.clone(),
            Some(SourceSpec {
                pipe: tx,
                transforms,
                stop_after: config.stop_after,
                kill_switch,
            }),
            None,
        )
        .await?;
        let sink = crate::spawn(
            &sink_alias,
            sink_connector,
            &config.sink.reconnect,
            config.sink.connector_type.clone(),
            None,
            Some(SinkSpec {
                pipe: rx,
                batching: config.batching,
                retry: config.retry,
            }),
        )
        .await?;

        // the sink must be ready before the source starts reading
        sink.start().await?;
        source.start().await?;
        info!("[Flow::{}] Started.", alias.as_str());

        Ok(Self {
            alias,
            source,
            sink,
        })
    }

    /// the flow alias
    #[must_use]
    pub fn alias(&self) -> &alias::Flow {
        &self.alias
    }

    /// Drain the flow: the source stops reading and closes the pipe, the
    /// sink flushes what is buffered. Returns once both are drained.
    ///
    /// # Errors
    /// if a connector is already stopped
    pub async fn drain(&self) -> anyhow::Result<()> {
        info!("[Flow::{}] Draining...", self.alias.as_str());
        self.source.drain().await?;
        self.sink.drain().await?;
        info!("[Flow::{}] Drained.", self.alias.as_str());
        Ok(())
    }

    /// Stop both connectors.
    ///
    /// # Errors
    /// if a connector is already stopped
    pub async fn stop(&self) -> anyhow::Result<()> {
        self.source.stop().await?;
        self.sink.stop().await?;
        info!("[Flow::{}] Stopped.", self.alias.as_str());
        Ok(())
    }
}
