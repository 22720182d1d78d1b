//! ClickHouse backend over the HTTP interface.
//!
//! ```text
//! CREATE TABLE raw (
//!     timestamp DateTime64(3), asset_id UInt32, attribute_id UInt32,
//!     measurement String, value Float64
//! ) ENGINE = MergeTree ORDER BY (timestamp, asset_id, attribute_id);
//!
//! CREATE TABLE resolution_15_min ( ...same columns... )
//! ENGINE = ReplacingMergeTree ORDER BY (timestamp, asset_id, attribute_id, measurement);
//! ```
//!
//! Re-running a window inserts duplicate keys that `ReplacingMergeTree`
//! collapses on merge; read with `FINAL` to see the replaced rows.

use super::{check_response, Backend, BackendError};
use crate::config::Config;
use crate::harness::DownsampleWindow;
use crate::packet::{Measurement, Packet};
use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

pub struct ClickHouseBackend {
    client: Client,
    url: String,
    user: String,
    password: Option<String>,
    database: String,
    raw_table: String,
    resolution_table: String,
    bucket_secs: u64,
}

#[derive(Serialize)]
struct JsonEachRow<'a> {
    timestamp: String,
    asset_id: u32,
    attribute_id: u32,
    measurement: &'a str,
    value: f64,
}

impl ClickHouseBackend {
    pub async fn connect(config: &Config) -> Result<Self, BackendError> {
        let backend = Self {
            client: Client::new(),
            url: config.clickhouse_url.trim_end_matches('/').to_string(),
            user: config.clickhouse_user.clone(),
            password: config.clickhouse_password.clone(),
            database: config.clickhouse_database.clone(),
            raw_table: config.raw_table.clone(),
            resolution_table: config.resolution_table.clone(),
            bucket_secs: config.bucket().as_secs().max(1),
        };
        let response = backend
            .client
            .get(format!("{}/ping", backend.url))
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        check_response(response).await?;
        Ok(backend)
    }

    fn request(&self) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(format!("{}/", self.url))
            .header("X-ClickHouse-User", &self.user)
            .header("X-ClickHouse-Database", &self.database);
        if let Some(password) = &self.password {
            request = request.header("X-ClickHouse-Key", password);
        }
        request
    }
}

fn insert_query(raw_table: &str) -> String {
    format!(
        "INSERT INTO {raw_table} (timestamp, asset_id, attribute_id, measurement, value) FORMAT JSONEachRow"
    )
}

fn encode_rows(packets: &[Packet]) -> Result<Vec<u8>, BackendError> {
    let mut body = Vec::with_capacity(packets.len() * 96);
    for packet in packets {
        serde_json::to_writer(
            &mut body,
            &JsonEachRow {
                timestamp: packet
                    .timestamp
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
                asset_id: packet.asset_id,
                attribute_id: packet.attribute_id,
                measurement: packet.measurement.as_str(),
                value: packet.value,
            },
        )?;
        body.push(b'\n');
    }
    Ok(body)
}

fn downsample_query(raw_table: &str, resolution_table: &str) -> String {
    format!(
        r#"
        INSERT INTO {resolution_table} (timestamp, asset_id, attribute_id, measurement, value)
        SELECT
            toStartOfInterval(timestamp, toIntervalSecond({{bucket:UInt32}})) AS bucket_start,
            asset_id,
            attribute_id,
            {{mean:String}} AS label,
            avg(value)
        FROM {raw_table}
        WHERE timestamp >= fromUnixTimestamp64Milli({{start_ms:Int64}}, 'UTC')
          AND timestamp < fromUnixTimestamp64Milli({{end_ms:Int64}}, 'UTC')
          AND measurement = {{raw:String}}
        GROUP BY bucket_start, asset_id, attribute_id
        "#
    )
}

#[async_trait]
impl Backend for ClickHouseBackend {
    fn name(&self) -> &str {
        "clickhouse"
    }

    async fn insert(&self, packets: Vec<Packet>) -> Result<(), BackendError> {
        if packets.is_empty() {
            return Ok(());
        }
        let body = encode_rows(&packets)?;
        let response = self
            .request()
            .query(&[
                ("query", insert_query(&self.raw_table)),
                ("date_time_input_format", "best_effort".to_string()),
            ])
            .body(body)
            .send()
            .await?;
        check_response(response).await?;
        tracing::debug!(rows = packets.len(), "inserted packet batch");
        Ok(())
    }

    async fn downsample(&self, window: DownsampleWindow) -> Result<(), BackendError> {
        let response = self
            .request()
            .query(&[
                ("param_bucket", self.bucket_secs.to_string()),
                ("param_mean", Measurement::Mean.as_str().to_string()),
                ("param_raw", Measurement::Raw.as_str().to_string()),
                ("param_start_ms", window.start.timestamp_millis().to_string()),
                ("param_end_ms", window.end.timestamp_millis().to_string()),
            ])
            .body(downsample_query(&self.raw_table, &self.resolution_table))
            .send()
            .await?;
        check_response(response).await?;
        tracing::debug!(%window, "downsampled window");
        Ok(())
    }
}
