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

//! The `questdb` connector writes solar telemetry batches into QuestDB over
//! its PostgreSQL wire protocol (port 8812), one multi-row `INSERT` per
//! batch.
//!
//! On connect it creates the table if needed, with `ts` as the designated
//! timestamp and day partitioning. Timestamps travel as millisecond
//! parameters through `to_timestamp()`.

use tokio_postgres::{types::ToSql, Client, NoTls};
use value_trait::prelude::*;
use weir_common::alias;
use weir_config::Impl;

use crate::{
    config::{env_or, ConnectorConfig},
    errors::error_connector_def,
    record::{Batch, Record},
    sink::{BatchSink, SinkAddr, SinkContext, SinkManagerBuilder},
    utils::{
        reconnect::Attempt,
        retry::{self, FailureKind},
    },
    Connector, ConnectorBuilder, ConnectorType, Context,
};

const DEFAULT_TABLE: &str = "solar_data";
/// parameters per inserted row
const COLUMNS: usize = 16;

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_database")]
    database: String,
    #[serde(default = "default_user")]
    user: String,
    #[serde(default = "default_password")]
    password: String,
    #[serde(default = "default_table")]
    table: String,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8812
}

fn default_database() -> String {
    "qdb".to_string()
}

fn default_user() -> String {
    "admin".to_string()
}

fn default_password() -> String {
    "quest".to_string()
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

impl Impl for Config {}

impl Config {
    fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            host: env_or("QUESTDB_HOST", default_host())?,
            port: env_or("QUESTDB_PORT", default_port())?,
            database: env_or("QUESTDB_DATABASE", default_database())?,
            user: env_or("QUESTDB_USER", default_user())?,
            password: env_or("QUESTDB_PASSWORD", default_password())?,
            table: env_or("QUESTDB_TABLE", default_table())?,
        })
    }
}

/// builder for the `questdb` connector
#[derive(Debug, Default)]
pub struct Builder {}

#[async_trait::async_trait]
impl ConnectorBuilder for Builder {
    fn connector_type(&self) -> ConnectorType {
        "questdb".into()
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
        Ok(Box::new(QuestDb { config }))
    }
}

struct QuestDb {
    config: Config,
}

#[async_trait::async_trait]
impl Connector for QuestDb {
    async fn create_sink(
        &mut self,
        ctx: SinkContext,
        builder: SinkManagerBuilder,
    ) -> anyhow::Result<Option<SinkAddr>> {
        let sink = QuestDbSink {
            config: self.config.clone(),
            client: None,
        };
        Ok(Some(builder.spawn(sink, ctx)))
    }
}

struct QuestDbSink {
    config: Config,
    client: Option<Client>,
}

#[async_trait::async_trait]
impl BatchSink for QuestDbSink {
    async fn connect(&mut self, ctx: &SinkContext, _attempt: &Attempt) -> anyhow::Result<bool> {
        self.client = None;
        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&self.config.host)
            .port(self.config.port)
            .dbname(&self.config.database)
            .user(&self.config.user)
            .password(&self.config.password);
        let (client, connection) = match pg_config.connect(NoTls).await {
            Ok(connected) => connected,
            Err(e) if e.as_db_error().is_none() => {
                // no server reply at all, treat as connection level
                warn!("{ctx} Connection failed: {e}");
                ctx.notifier().connection_lost().await?;
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        let task_ctx = ctx.clone();
        tokio::task::spawn(async move {
            if let Err(e) = connection.await {
                error!("{task_ctx} Connection closed: {e}");
            }
        });
        client
            .execute(create_table_ddl(&self.config.table).as_str(), &[])
            .await?;
        info!(
            "{ctx} Connected to {}:{}, writing to table '{}'.",
            self.config.host, self.config.port, self.config.table
        );
        self.client = Some(client);
        Ok(true)
    }

    async fn write_batch(&mut self, batch: &Batch, _ctx: &SinkContext) -> anyhow::Result<()> {
        let client = self.client.as_ref().ok_or(
            crate::errors::GenericImplementationError::ClientNotAvailable("questdb"),
        )?;
        let rows: Vec<SqlRow> = batch
            .records
            .iter()
            .map(|record| SqlRow::new(record, &batch.pipe))
            .collect();
        let statement = insert_statement(&self.config.table, rows.len());
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(rows.len() * COLUMNS);
        for row in &rows {
            row.push_params(&mut params);
        }
        client.execute(statement.as_str(), &params).await?;
        Ok(())
    }

    fn classify(&self, error: &anyhow::Error) -> FailureKind {
        match error.downcast_ref::<tokio_postgres::Error>() {
            Some(e) if e.is_closed() => FailureKind::TransientConnection,
            _ => retry::classify(error),
        }
    }
}

fn create_table_ddl(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            ts TIMESTAMP,
            panel_id STRING,
            location_id STRING,
            location_name STRING,
            latitude DOUBLE,
            longitude DOUBLE,
            timezone STRING,
            power_output DOUBLE,
            temperature DOUBLE,
            irradiance DOUBLE,
            voltage DOUBLE,
            current DOUBLE,
            inverter_status STRING,
            pipe STRING,
            \"offset\" LONG,
            ingested_at TIMESTAMP
        ) timestamp(ts) PARTITION BY DAY"
    )
}

/// multi-row insert with per-row `to_timestamp()` millisecond parameters
fn insert_statement(table: &str, rows: usize) -> String {
    let mut statement = format!(
        "INSERT INTO {table} (ts, panel_id, location_id, location_name, latitude, \
         longitude, timezone, power_output, temperature, irradiance, voltage, \
         current, inverter_status, pipe, \"offset\", ingested_at) VALUES "
    );
    for row in 0..rows {
        if row > 0 {
            statement.push_str(", ");
        }
        let base = row * COLUMNS;
        statement.push_str(&format!("(to_timestamp(${})", base + 1));
        for column in 2..COLUMNS {
            statement.push_str(&format!(", ${}", base + column));
        }
        statement.push_str(&format!(", to_timestamp(${}))", base + COLUMNS));
    }
    statement
}

/// one record flattened into owned SQL parameters
struct SqlRow {
    ts_ms: i64,
    panel_id: String,
    location_id: String,
    location_name: String,
    latitude: f64,
    longitude: f64,
    timezone: String,
    power_output: f64,
    temperature: f64,
    irradiance: f64,
    voltage: f64,
    current: f64,
    inverter_status: String,
    pipe: String,
    offset: i64,
    ingested_ms: i64,
}

impl SqlRow {
    #[allow(clippy::cast_possible_wrap)]
    fn new(record: &Record, pipe: &str) -> Self {
        let payload = &record.payload;
        let field = |name: &str| payload.get_str(name).unwrap_or_default().to_string();
        let number = |name: &str| payload.get_f64(name).unwrap_or_default();
        let ts_ns = payload.get_u64("timestamp").unwrap_or(record.ingest_ns);
        Self {
            ts_ms: (ts_ns / 1_000_000) as i64,
            panel_id: field("panel_id"),
            location_id: field("location_id"),
            location_name: field("location_name"),
            latitude: number("latitude"),
            longitude: number("longitude"),
            timezone: field("timezone"),
            power_output: number("power_output"),
            temperature: number("temperature"),
            irradiance: number("irradiance"),
            voltage: number("voltage"),
            current: number("current"),
            inverter_status: field("inverter_status"),
            pipe: pipe.to_string(),
            offset: record.offset as i64,
            ingested_ms: (record.ingest_ns / 1_000_000) as i64,
        }
    }

    fn push_params<'a>(&'a self, params: &mut Vec<&'a (dyn ToSql + Sync)>) {
        params.push(&self.ts_ms);
        params.push(&self.panel_id);
        params.push(&self.location_id);
        params.push(&self.location_name);
        params.push(&self.latitude);
        params.push(&self.longitude);
        params.push(&self.timezone);
        params.push(&self.power_output);
        params.push(&self.temperature);
        params.push(&self.irradiance);
        params.push(&self.voltage);
        params.push(&self.current);
        params.push(&self.inverter_status);
        params.push(&self.pipe);
        params.push(&self.offset);
        params.push(&self.ingested_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simd_json::json;

    #[test]
    fn insert_statement_shape() {
        let statement = insert_statement("solar_data", 2);
        assert!(statement.starts_with("INSERT INTO solar_data (ts, panel_id"));
        assert!(statement.contains("(to_timestamp($1), $2"));
        assert!(statement.contains(", to_timestamp($16)), (to_timestamp($17), $18"));
        assert!(statement.ends_with("to_timestamp($32))"));
    }

    #[test]
    fn sql_row_converts_timestamps_to_millis() {
        let record = Record {
            payload: json!({
                "panel_id": "PANEL_PRAGUE_7",
                "power_output": 120.5,
                "timestamp": 1_700_000_000_123_456_789_u64
            }),
            key: None,
            offset: 7,
            stream: 0,
            ingest_ns: 1_700_000_001_000_000_000,
        };
        let row = SqlRow::new(&record, "main");
        assert_eq!(1_700_000_000_123, row.ts_ms);
        assert_eq!(1_700_000_001_000, row.ingested_ms);
        assert_eq!("PANEL_PRAGUE_7", row.panel_id);
        assert!((row.power_output - 120.5).abs() < f64::EPSILON);
        assert_eq!("main", row.pipe);
        assert_eq!(7, row.offset);
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
        row.push_params(&mut params);
        assert_eq!(COLUMNS, params.len());
    }

    #[test]
    fn ddl_designates_the_timestamp() {
        let ddl = create_table_ddl("solar_data");
        assert!(ddl.contains("timestamp(ts) PARTITION BY DAY"));
        assert!(ddl.contains("panel_id STRING"));
        assert!(ddl.contains("power_output DOUBLE"));
    }
}
