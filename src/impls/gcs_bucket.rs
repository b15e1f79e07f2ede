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

//! The `gcs_bucket` connector sweeps a Google Cloud Storage bucket for data
//! files under a configured prefix and emits one record per row.
//!
//! Objects already seen are remembered by name and skipped on later sweeps.
//! CSV objects are parsed with their header row, `json` objects are read as
//! JSON Lines. Every record is enriched with `_source_object`, `_row` and
//! `_bucket` provenance fields. An empty sweep sleeps for the poll
//! interval.

use std::collections::{HashSet, VecDeque};

use simd_json::json;
use weir_common::alias;
use weir_config::Impl;

use crate::{
    config::{env_opt, env_or, env_required, ConnectorConfig},
    errors::error_connector_def,
    record::RawValue,
    source::{Source, SourceAddr, SourceContext, SourceManagerBuilder, SourceReply, DEFAULT_STREAM},
    utils::{
        gcs::{ObjectClient, DEFAULT_ENDPOINT, DEFAULT_UPLOAD_ENDPOINT},
        reconnect::Attempt,
    },
    Connector, ConnectorBuilder, ConnectorType,
};

const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// format of the stored objects
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub(crate) enum FileFormat {
    /// comma separated with a header row
    Csv,
    /// one JSON document per line
    Json,
}

impl FileFormat {
    pub(crate) fn extension(self) -> &'static str {
        match self {
            Self::Csv => ".csv",
            Self::Json => ".json",
        }
    }
}

impl std::str::FromStr for FileFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" | "jsonl" => Ok(Self::Json),
            other => Err(anyhow::anyhow!("invalid file format: {other}")),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    bucket: String,
    /// only objects under this prefix are considered
    #[serde(default)]
    folder_path: Option<String>,
    #[serde(default = "default_file_format")]
    file_format: FileFormat,
    #[serde(default = "default_poll_interval_secs")]
    poll_interval_secs: u64,
    #[serde(default = "default_endpoint")]
    endpoint: String,
}

fn default_file_format() -> FileFormat {
    FileFormat::Csv
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
            bucket: env_required("GS_BUCKET")?,
            folder_path: env_opt("GS_FOLDER_PATH")?,
            file_format: env_or("GS_FILE_FORMAT", default_file_format())?,
            poll_interval_secs: env_or("GS_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS)?,
            endpoint: default_endpoint(),
        })
    }
}

/// builder for the `gcs_bucket` connector
#[derive(Debug, Default)]
pub struct Builder {}

#[async_trait::async_trait]
impl ConnectorBuilder for Builder {
    fn connector_type(&self) -> ConnectorType {
        "gcs_bucket".into()
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
        Ok(Box::new(GcsBucket { config }))
    }
}

struct GcsBucket {
    config: Config,
}

#[async_trait::async_trait]
impl Connector for GcsBucket {
    async fn create_source(
        &mut self,
        ctx: SourceContext,
        builder: SourceManagerBuilder,
    ) -> anyhow::Result<Option<SourceAddr>> {
        let source = BucketSource {
            config: self.config.clone(),
            client: None,
            processed: HashSet::new(),
            pending: VecDeque::new(),
        };
        Ok(Some(builder.spawn(source, ctx)))
    }
}

struct BucketSource {
    config: Config,
    client: Option<ObjectClient>,
    /// names of objects already emitted
    processed: HashSet<String>,
    pending: VecDeque<(String, simd_json::OwnedValue)>,
}

#[async_trait::async_trait]
impl Source for BucketSource {
    async fn connect(&mut self, ctx: &SourceContext, _attempt: &Attempt) -> anyhow::Result<bool> {
        let client = ObjectClient::new(&self.config.endpoint, DEFAULT_UPLOAD_ENDPOINT)?;
        if !client.bucket_exists(&self.config.bucket).await? {
            return Err(anyhow::anyhow!(
                "bucket '{}' does not exist or is not visible",
                self.config.bucket
            ));
        }
        info!("{ctx} Watching bucket '{}'.", self.config.bucket);
        self.client = Some(client);
        Ok(true)
    }

    async fn pull_data(
        &mut self,
        _pull_id: &mut u64,
        ctx: &SourceContext,
    ) -> anyhow::Result<SourceReply> {
        if let Some((key, record)) = self.pending.pop_front() {
            return Ok(SourceReply::Data {
                payload: RawValue::Structured(record),
                key: Some(key),
                stream: DEFAULT_STREAM,
            });
        }
        self.sweep(ctx).await?;
        match self.pending.pop_front() {
            Some((key, record)) => Ok(SourceReply::Data {
                payload: RawValue::Structured(record),
                key: Some(key),
                stream: DEFAULT_STREAM,
            }),
            None => Ok(SourceReply::Empty(self.config.poll_interval_secs * 1000)),
        }
    }
}

impl BucketSource {
    /// one full pass over the bucket listing, downloading everything new
    async fn sweep(&mut self, ctx: &SourceContext) -> anyhow::Result<()> {
        let client = self
            .client
            .as_ref()
            .ok_or(crate::errors::GenericImplementationError::ClientNotAvailable(
                "gcs_bucket",
            ))?;
        let mut page_token: Option<String> = None;
        loop {
            let page = client
                .list_objects(
                    &self.config.bucket,
                    self.config.folder_path.as_deref(),
                    page_token.as_deref(),
                )
                .await?;
            for object in page.objects {
                if !object.name.ends_with(self.config.file_format.extension())
                    || self.processed.contains(&object.name)
                {
                    continue;
                }
                debug!("{ctx} Reading object '{}'.", object.name);
                let content = client.download(&self.config.bucket, &object.name).await?;
                let records = match self.config.file_format {
                    FileFormat::Csv => csv_records(&object.name, &self.config.bucket, &content)?,
                    FileFormat::Json => {
                        json_line_records(&object.name, &self.config.bucket, content)
                    }
                };
                info!(
                    "{ctx} Object '{}' yielded {} records.",
                    object.name,
                    records.len()
                );
                self.pending.extend(records);
                self.processed.insert(object.name);
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(())
    }
}

/// parse a CSV object, one record per data row keyed `<object>_<row>`
fn csv_records(
    object: &str,
    bucket: &str,
    content: &[u8],
) -> anyhow::Result<Vec<(String, simd_json::OwnedValue)>> {
    let mut reader = csv::Reader::from_reader(content);
    let headers = reader.headers()?.clone();
    let mut records = Vec::new();
    for (idx, row) in reader.records().enumerate() {
        let row = row?;
        let mut record = simd_json::owned::Object::with_capacity(headers.len() + 3);
        for (header, field) in headers.iter().zip(row.iter()) {
            record.insert(header.to_string(), field.into());
        }
        let row_number = idx + 1;
        insert_provenance(&mut record, object, bucket, row_number);
        records.push((format!("{object}_{row_number}"), record.into()));
    }
    Ok(records)
}

/// parse a JSON Lines object, silently dropping lines that do not parse
fn json_line_records(
    object: &str,
    bucket: &str,
    content: Vec<u8>,
) -> Vec<(String, simd_json::OwnedValue)> {
    let mut records = Vec::new();
    let mut row_number = 0;
    for line in content.split(|b| *b == b'\n') {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let mut raw = line.to_vec();
        let Ok(value) = simd_json::to_owned_value(&mut raw) else {
            continue;
        };
        row_number += 1;
        let mut record = match value {
            simd_json::OwnedValue::Object(fields) => *fields,
            other => {
                let mut fields = simd_json::owned::Object::with_capacity(4);
                fields.insert("value".to_string(), other);
                fields
            }
        };
        insert_provenance(&mut record, object, bucket, row_number);
        records.push((format!("{object}_{row_number}"), record.into()));
    }
    records
}

fn insert_provenance(
    record: &mut simd_json::owned::Object,
    object: &str,
    bucket: &str,
    row_number: usize,
) {
    record.insert("_source_object".to_string(), object.into());
    record.insert("_bucket".to_string(), bucket.into());
    record.insert("_row".to_string(), json!(row_number));
}

#[cfg(test)]
mod tests {
    use super::*;
    use value_trait::prelude::*;

    #[test]
    fn csv_rows_become_records() -> anyhow::Result<()> {
        let content = b"panel_id,power_output,temperature\n\
            PANEL_LONDON_1,180.5,31.2\n\
            PANEL_LONDON_2,172.3,30.8\n";
        let records = csv_records("solar/2024.csv", "archive", content)?;
        assert_eq!(2, records.len());
        let (key, first) = &records[0];
        assert_eq!("solar/2024.csv_1", key);
        assert_eq!(Some("PANEL_LONDON_1"), first.get_str("panel_id"));
        assert_eq!(Some("180.5"), first.get_str("power_output"));
        assert_eq!(Some("solar/2024.csv"), first.get_str("_source_object"));
        assert_eq!(Some("archive"), first.get_str("_bucket"));
        assert_eq!(Some(1), first.get_usize("_row"));
        let (key, _) = &records[1];
        assert_eq!("solar/2024.csv_2", key);
        Ok(())
    }

    #[test]
    fn empty_csv_yields_nothing() -> anyhow::Result<()> {
        let records = csv_records("empty.csv", "archive", b"panel_id,power_output\n")?;
        assert!(records.is_empty());
        Ok(())
    }

    #[test]
    fn json_lines_become_records() {
        let content = b"{\"panel_id\": \"PANEL_ROME_4\"}\n\
            \n\
            not json at all\n\
            {\"panel_id\": \"PANEL_ROME_5\"}\n"
            .to_vec();
        let records = json_line_records("batch.json", "archive", content);
        assert_eq!(2, records.len());
        let (key, first) = &records[0];
        assert_eq!("batch.json_1", key);
        assert_eq!(Some("PANEL_ROME_4"), first.get_str("panel_id"));
        assert_eq!(Some("batch.json"), first.get_str("_source_object"));
        let (key, second) = &records[1];
        assert_eq!("batch.json_2", key);
        assert_eq!(Some("PANEL_ROME_5"), second.get_str("panel_id"));
    }

    #[test]
    fn file_format_parsing() -> anyhow::Result<()> {
        assert_eq!(FileFormat::Csv, "csv".parse()?);
        assert_eq!(FileFormat::Json, "JSON".parse()?);
        assert_eq!(FileFormat::Json, "jsonl".parse()?);
        assert!("parquet".parse::<FileFormat>().is_err());
        Ok(())
    }
}
