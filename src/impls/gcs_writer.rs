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

//! The `gcs_writer` connector archives each batch as one object in a Google
//! Cloud Storage bucket, either as CSV with a header row or as JSON Lines.
//!
//! Object names are deterministic per batch
//! (`<prefix>/<stem>-<unix_ms>-<offset>.<ext>`, from the first record), so a
//! retried upload overwrites its earlier, possibly partial self instead of
//! duplicating data. The bucket is checked on connect.

use chrono::TimeZone;
use value_trait::prelude::*;
use weir_common::alias;
use weir_config::Impl;

use crate::{
    config::{env_or, env_opt, env_required, ConnectorConfig},
    errors::error_connector_def,
    impls::gcs_bucket::FileFormat,
    record::{Batch, Record},
    sink::{BatchSink, SinkAddr, SinkContext, SinkManagerBuilder},
    utils::{
        gcs::{GcsError, ObjectClient, DEFAULT_ENDPOINT, DEFAULT_UPLOAD_ENDPOINT},
        reconnect::Attempt,
        retry::{self, FailureKind},
    },
    Connector, ConnectorBuilder, ConnectorType,
};

const DEFAULT_STEM: &str = "solar_data";

/// columns of the CSV rendition, in order
const CSV_COLUMNS: &[&str] = &[
    "timestamp",
    "datetime",
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
];

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    bucket: String,
    /// objects are written under this prefix
    #[serde(default)]
    folder_path: Option<String>,
    #[serde(default = "default_file_format")]
    file_format: FileFormat,
    /// first component of every object name
    #[serde(default = "default_stem")]
    object_stem: String,
    #[serde(default = "default_endpoint")]
    endpoint: String,
    #[serde(default = "default_upload_endpoint")]
    upload_endpoint: String,
}

fn default_file_format() -> FileFormat {
    FileFormat::Csv
}

fn default_stem() -> String {
    DEFAULT_STEM.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_upload_endpoint() -> String {
    DEFAULT_UPLOAD_ENDPOINT.to_string()
}

impl Impl for Config {}

impl Config {
    fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            bucket: env_required("GS_BUCKET")?,
            folder_path: env_opt("GS_FOLDER_PATH")?,
            file_format: env_or("GS_FILE_FORMAT", default_file_format())?,
            object_stem: env_or("GCS_OBJECT_STEM", default_stem())?,
            endpoint: default_endpoint(),
            upload_endpoint: default_upload_endpoint(),
        })
    }
}

/// builder for the `gcs_writer` connector
#[derive(Debug, Default)]
pub struct Builder {}

#[async_trait::async_trait]
impl ConnectorBuilder for Builder {
    fn connector_type(&self) -> ConnectorType {
        "gcs_writer".into()
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
        Ok(Box::new(GcsWriter { config }))
    }
}

struct GcsWriter {
    config: Config,
}

#[async_trait::async_trait]
impl Connector for GcsWriter {
    async fn create_sink(
        &mut self,
        ctx: SinkContext,
        builder: SinkManagerBuilder,
    ) -> anyhow::Result<Option<SinkAddr>> {
        let sink = GcsWriterSink {
            config: self.config.clone(),
            client: None,
        };
        Ok(Some(builder.spawn(sink, ctx)))
    }
}

struct GcsWriterSink {
    config: Config,
    client: Option<ObjectClient>,
}

#[async_trait::async_trait]
impl BatchSink for GcsWriterSink {
    async fn connect(&mut self, ctx: &SinkContext, _attempt: &Attempt) -> anyhow::Result<bool> {
        let client = ObjectClient::new(&self.config.endpoint, &self.config.upload_endpoint)?;
        if !client.bucket_exists(&self.config.bucket).await? {
            return Err(anyhow::anyhow!(
                "bucket '{}' does not exist or is not visible",
                self.config.bucket
            ));
        }
        info!("{ctx} Writing to bucket '{}'.", self.config.bucket);
        self.client = Some(client);
        Ok(true)
    }

    async fn write_batch(&mut self, batch: &Batch, ctx: &SinkContext) -> anyhow::Result<()> {
        let client = self.client.as_ref().ok_or(
            crate::errors::GenericImplementationError::ClientNotAvailable("gcs_writer"),
        )?;
        let name = self.object_name(batch);
        let (content_type, body) = match self.config.file_format {
            FileFormat::Csv => ("text/csv", csv_body(&batch.records)?),
            FileFormat::Json => ("application/x-ndjson", json_lines_body(&batch.records)),
        };
        client
            .upload_object(&self.config.bucket, &name, content_type, body)
            .await?;
        debug!("{ctx} Wrote {} records to '{name}'.", batch.len());
        Ok(())
    }

    fn classify(&self, error: &anyhow::Error) -> FailureKind {
        match error.downcast_ref::<GcsError>() {
            Some(e) => e.kind(),
            None => retry::classify(error),
        }
    }
}

impl GcsWriterSink {
    /// deterministic name from the first record, stable across retries
    fn object_name(&self, batch: &Batch) -> String {
        let (ms, offset) = batch
            .records
            .first()
            .map(|record| (record.ingest_ns / 1_000_000, record.offset))
            .unwrap_or_default();
        let file = format!(
            "{}-{ms}-{offset}{}",
            self.config.object_stem,
            self.config.file_format.extension()
        );
        match self.config.folder_path.as_deref() {
            Some(prefix) => format!("{}/{file}", prefix.trim_end_matches('/')),
            None => file,
        }
    }
}

/// render the payload field as a CSV cell, strings bare and everything
/// else as its JSON rendition
fn csv_field(record: &Record, column: &str) -> String {
    if column == "datetime" {
        let ns = record
            .payload
            .get_u64("timestamp")
            .unwrap_or(record.ingest_ns);
        #[allow(clippy::cast_possible_wrap)]
        return chrono::Utc
            .timestamp_opt((ns / 1_000_000_000) as i64, 0)
            .single()
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
    }
    match record.payload.get(column) {
        Some(value) => value
            .as_str()
            .map_or_else(|| value.encode(), ToString::to_string),
        None => String::new(),
    }
}

fn csv_body(records: &[Record]) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CSV_COLUMNS)?;
    for record in records {
        let row: Vec<String> = CSV_COLUMNS
            .iter()
            .map(|column| csv_field(record, column))
            .collect();
        writer.write_record(&row)?;
    }
    writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("finishing the csv body: {e}"))
}

fn json_lines_body(records: &[Record]) -> Vec<u8> {
    let mut body = Vec::new();
    for record in records {
        body.extend_from_slice(record.payload.encode().as_bytes());
        body.push(b'\n');
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simd_json::json;

    fn record(offset: u64) -> Record {
        Record {
            payload: json!({
                "panel_id": format!("PANEL_VIENNA_{offset}"),
                "location_id": "VIENNA",
                "power_output": 140.2,
                "unit_power": "W",
                "inverter_status": "OK",
                "timestamp": 1_700_000_000_000_000_000_u64
            }),
            key: Some("VIENNA".to_string()),
            offset,
            stream: 0,
            ingest_ns: 1_700_000_000_500_000_000,
        }
    }

    fn config() -> Config {
        Config {
            bucket: "archive".to_string(),
            folder_path: Some("solar/".to_string()),
            file_format: FileFormat::Csv,
            object_stem: DEFAULT_STEM.to_string(),
            endpoint: default_endpoint(),
            upload_endpoint: default_upload_endpoint(),
        }
    }

    #[test]
    fn object_names_are_deterministic() {
        let sink = GcsWriterSink {
            config: config(),
            client: None,
        };
        let batch = Batch {
            pipe: "main".to_string(),
            records: vec![record(12), record(13)],
        };
        let name = sink.object_name(&batch);
        assert_eq!("solar/solar_data-1700000000500-12.csv", name);
        // same batch, same name
        assert_eq!(name, sink.object_name(&batch));
    }

    #[test]
    fn csv_body_has_header_and_rows() -> anyhow::Result<()> {
        let body = csv_body(&[record(1)])?;
        let text = String::from_utf8(body)?;
        let mut lines = text.lines();
        let header = lines.next().unwrap_or_default();
        assert!(header.starts_with("timestamp,datetime,panel_id"));
        let row = lines.next().unwrap_or_default();
        assert!(row.contains("PANEL_VIENNA_1"));
        assert!(row.contains("2023-11-14 22:13:20"));
        assert!(row.contains("140.2"));
        assert!(row.contains(",OK"));
        assert!(lines.next().is_none());
        Ok(())
    }

    #[test]
    fn json_lines_body_is_one_document_per_line() {
        let body = json_lines_body(&[record(1), record(2)]);
        let text = String::from_utf8(body).expect("valid utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(2, lines.len());
        assert!(lines[0].contains("PANEL_VIENNA_1"));
        assert!(lines[1].contains("PANEL_VIENNA_2"));
    }
}
