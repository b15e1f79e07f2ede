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

//! The `timescale` connector writes solar telemetry batches into a
//! TimescaleDB (or plain PostgreSQL) table, one multi-row `INSERT` per
//! batch.
//!
//! On connect it creates the table and, when the timescaledb extension is
//! present, turns it into a hypertable on the `timestamp` column. Records
//! without a `panel_id` are dropped before writing. A server shutting down
//! (`admin_shutdown`, 57P01) counts as overload for the retry policy.

use tokio_postgres::{error::SqlState, types::ToSql, Client, NoTls};
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
const COLUMNS: usize = 17;

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_dbname")]
    dbname: String,
    #[serde(default = "default_user")]
    user: String,
    #[serde(default)]
    password: String,
    #[serde(default = "default_table")]
    table: String,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_dbname() -> String {
    "postgres".to_string()
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

impl Impl for Config {}

impl Config {
    fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            host: env_or("TIMESCALE_HOST", default_host())?,
            port: env_or("TIMESCALE_PORT", default_port())?,
            dbname: env_or("TIMESCALE_DBNAME", default_dbname())?,
            user: env_or("TIMESCALE_USER", default_user())?,
            password: env_or("TIMESCALE_PASSWORD", String::new())?,
            table: env_or("TIMESCALE_TABLE", default_table())?,
        })
    }
}

/// builder for the `timescale` connector
#[derive(Debug, Default)]
pub struct Builder {}

#[async_trait::async_trait]
impl ConnectorBuilder for Builder {
    fn connector_type(&self) -> ConnectorType {
        "timescale".into()
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
        Ok(Box::new(Timescale { config }))
    }
}

struct Timescale {
    config: Config,
}

#[async_trait::async_trait]
impl Connector for Timescale {
    async fn create_sink(
        &mut self,
        ctx: SinkContext,
        builder: SinkManagerBuilder,
    ) -> anyhow::Result<Option<SinkAddr>> {
        let sink = TimescaleSink {
            config: self.config.clone(),
            client: None,
        };
        Ok(Some(builder.spawn(sink, ctx)))
    }
}

struct TimescaleSink {
    config: Config,
    client: Option<Client>,
}

#[async_trait::async_trait]
impl BatchSink for TimescaleSink {
    async fn connect(&mut self, ctx: &SinkContext, _attempt: &Attempt) -> anyhow::Result<bool> {
        self.client = None;
        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&self.config.host)
            .port(self.config.port)
            .dbname(&self.config.dbname)
            .user(&self.config.user)
            .password(&self.config.password);
        let (client, connection) = match pg_config.connect(NoTls).await {
            Ok(connected) => connected,
            Err(e) if e.as_db_error().is_none() => {
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
        self.ensure_hypertable(&client, ctx).await?;
        info!(
            "{ctx} Connected to {}:{}, writing to table '{}'.",
            self.config.host, self.config.port, self.config.table
        );
        self.client = Some(client);
        Ok(true)
    }

    async fn write_batch(&mut self, batch: &Batch, ctx: &SinkContext) -> anyhow::Result<()> {
        let client = self.client.as_ref().ok_or(
            crate::errors::GenericImplementationError::ClientNotAvailable("timescale"),
        )?;
        let rows: Vec<SqlRow> = batch
            .records
            .iter()
            .filter_map(|record| SqlRow::new(record, &batch.pipe))
            .collect();
        let dropped = batch.len() - rows.len();
        if dropped > 0 {
            warn!("{ctx} Dropped {dropped} records without a panel_id.");
        }
        if rows.is_empty() {
            return Ok(());
        }
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
            Some(e) if e.code() == Some(&SqlState::ADMIN_SHUTDOWN) => FailureKind::ServerOverload,
            Some(e) if e.is_closed() => FailureKind::TransientConnection,
            _ => retry::classify(error),
        }
    }
}

impl TimescaleSink {
    /// turn the table into a hypertable where the extension allows it,
    /// plain PostgreSQL is fine too
    async fn ensure_hypertable(&self, client: &Client, ctx: &SinkContext) -> anyhow::Result<()> {
        let check = "SELECT EXISTS (SELECT 1 FROM timescaledb_information.hypertables \
                     WHERE hypertable_name = $1)";
        match client.query_one(check, &[&self.config.table]).await {
            Ok(row) => {
                let is_hypertable: bool = row.get(0);
                if !is_hypertable {
                    let create = format!(
                        "SELECT create_hypertable('{}', 'timestamp', if_not_exists => TRUE)",
                        self.config.table
                    );
                    client.execute(create.as_str(), &[]).await?;
                    info!("{ctx} Created hypertable '{}'.", self.config.table);
                }
            }
            Err(e) => {
                info!("{ctx} timescaledb extension not available ({e}), using a plain table.");
            }
        }
        Ok(())
    }
}

fn create_table_ddl(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            timestamp TIMESTAMPTZ NOT NULL,
            panel_id TEXT NOT NULL,
            location_id TEXT,
            location_name TEXT,
            latitude DOUBLE PRECISION,
            longitude DOUBLE PRECISION,
            timezone TEXT,
            power_output DOUBLE PRECISION,
            temperature DOUBLE PRECISION,
            irradiance DOUBLE PRECISION,
            voltage DOUBLE PRECISION,
            current DOUBLE PRECISION,
            inverter_status TEXT,
            original_timestamp BIGINT,
            pipe TEXT,
            \"offset\" BIGINT,
            ingested_at TIMESTAMPTZ
        )"
    )
}

/// multi-row insert, timestamps travel as epoch seconds through
/// `to_timestamp()`
fn insert_statement(table: &str, rows: usize) -> String {
    let mut statement = format!(
        "INSERT INTO {table} (timestamp, panel_id, location_id, location_name, \
         latitude, longitude, timezone, power_output, temperature, irradiance, \
         voltage, current, inverter_status, original_timestamp, pipe, \"offset\", \
         ingested_at) VALUES "
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

/// one record flattened into owned SQL parameters, `None` when the record
/// has no `panel_id`
struct SqlRow {
    ts_secs: f64,
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
    original_timestamp: i64,
    pipe: String,
    offset: i64,
    ingested_secs: f64,
}

impl SqlRow {
    #[allow(clippy::cast_possible_wrap, clippy::cast_precision_loss)]
    fn new(record: &Record, pipe: &str) -> Option<Self> {
        let payload = &record.payload;
        let panel_id = payload.get_str("panel_id")?.to_string();
        let field = |name: &str| payload.get_str(name).unwrap_or_default().to_string();
        let number = |name: &str| payload.get_f64(name).unwrap_or_default();
        let ts_ns = payload.get_u64("timestamp").unwrap_or(record.ingest_ns);
        Some(Self {
            ts_secs: (ts_ns / 1_000_000) as f64 / 1000.0,
            panel_id,
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
            original_timestamp: ts_ns as i64,
            pipe: pipe.to_string(),
            offset: record.offset as i64,
            ingested_secs: (record.ingest_ns / 1_000_000) as f64 / 1000.0,
        })
    }

    fn push_params<'a>(&'a self, params: &mut Vec<&'a (dyn ToSql + Sync)>) {
        params.push(&self.ts_secs);
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
        params.push(&self.original_timestamp);
        params.push(&self.pipe);
        params.push(&self.offset);
        params.push(&self.ingested_secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simd_json::json;

    fn record(payload: simd_json::OwnedValue) -> Record {
        Record {
            payload,
            key: None,
            offset: 3,
            stream: 0,
            ingest_ns: 1_700_000_002_500_000_000,
        }
    }

    #[test]
    fn record_without_panel_id_is_dropped() {
        let record = record(json!({"power_output": 55.0}));
        assert!(SqlRow::new(&record, "main").is_none());
    }

    #[test]
    fn timestamps_become_epoch_seconds() {
        let record = record(json!({
            "panel_id": "PANEL_DUBLIN_2",
            "timestamp": 1_700_000_000_250_000_000_u64
        }));
        let row = SqlRow::new(&record, "main").expect("panel_id is present");
        assert!((row.ts_secs - 1_700_000_000.25).abs() < 1e-9);
        assert!((row.ingested_secs - 1_700_000_002.5).abs() < 1e-9);
        assert_eq!(1_700_000_000_250_000_000, row.original_timestamp);
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
        row.push_params(&mut params);
        assert_eq!(COLUMNS, params.len());
    }

    #[test]
    fn insert_statement_shape() {
        let statement = insert_statement("solar_data", 2);
        assert!(statement.contains("(to_timestamp($1), $2"));
        assert!(statement.contains(", to_timestamp($17)), (to_timestamp($18), $19"));
        assert!(statement.ends_with("to_timestamp($34))"));
    }

    #[test]
    fn ddl_quotes_the_offset_column() {
        let ddl = create_table_ddl("solar_data");
        assert!(ddl.contains("timestamp TIMESTAMPTZ NOT NULL"));
        assert!(ddl.contains("\"offset\" BIGINT"));
        assert!(ddl.contains("original_timestamp BIGINT"));
    }
}
