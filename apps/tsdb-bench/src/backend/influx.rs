//! InfluxDB v2 backend: line protocol writes and a Flux downsampling task.
//!
//! Points land in the raw bucket as measurement `raw` with `asset_id` and
//! `attribute_id` tags. Downsampled points go to the resolution bucket as
//! measurement `mean`; a series/timestamp pair is unique in Influx, so a
//! repeated window overwrites its previous output.

use super::{check_response, Backend, BackendError};
use crate::config::Config;
use crate::harness::DownsampleWindow;
use crate::packet::{Measurement, Packet};
use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::Client;
use std::fmt::Write as _;
use std::time::Duration;

pub struct InfluxBackend {
    client: Client,
    url: String,
    token: String,
    org: String,
    bucket: String,
    resolution_bucket: String,
    bucket_secs: u64,
}

impl InfluxBackend {
    pub async fn connect(config: &Config) -> Result<Self, BackendError> {
        let token = config.influx_token.clone().ok_or_else(|| {
            BackendError::Unavailable("BENCH_INFLUX_TOKEN is required for influx".to_string())
        })?;
        let backend = Self {
            client: Client::new(),
            url: config.influx_url.trim_end_matches('/').to_string(),
            token,
            org: config.influx_org.clone(),
            bucket: config.influx_bucket.clone(),
            resolution_bucket: config.influx_resolution_bucket.clone(),
            bucket_secs: config.bucket().as_secs().max(1),
        };
        let response = backend
            .client
            .get(format!("{}/health", backend.url))
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        check_response(response).await?;
        Ok(backend)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.header("Authorization", format!("Token {}", self.token))
    }
}

fn encode_line_protocol(packets: &[Packet]) -> String {
    let mut body = String::with_capacity(packets.len() * 64);
    for packet in packets {
        let _ = writeln!(
            body,
            "{},asset_id={},attribute_id={} value={} {}",
            packet.measurement,
            packet.asset_id,
            packet.attribute_id,
            packet.value,
            packet.timestamp.timestamp_millis()
        );
    }
    body
}

fn downsample_flux(
    bucket: &str,
    resolution_bucket: &str,
    org: &str,
    window: &DownsampleWindow,
    bucket_secs: u64,
) -> String {
    format!(
        r#"from(bucket: "{bucket}")
  |> range(start: {start}, stop: {stop})
  |> filter(fn: (r) => r._measurement == "{raw}" and r._field == "value")
  |> aggregateWindow(every: {bucket_secs}s, fn: mean, createEmpty: false, timeSrc: "_start")
  |> set(key: "_measurement", value: "{mean}")
  |> to(bucket: "{resolution_bucket}", org: "{org}")
"#,
        start = window.start.to_rfc3339_opts(SecondsFormat::Millis, true),
        stop = window.end.to_rfc3339_opts(SecondsFormat::Millis, true),
        raw = Measurement::Raw,
        mean = Measurement::Mean,
    )
}

#[async_trait]
impl Backend for InfluxBackend {
    fn name(&self) -> &str {
        "influx"
    }

    async fn insert(&self, packets: Vec<Packet>) -> Result<(), BackendError> {
        if packets.is_empty() {
            return Ok(());
        }
        let body = encode_line_protocol(&packets);
        let request = self
            .client
            .post(format!("{}/api/v2/write", self.url))
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ms"),
            ])
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body);
        let response = self.authorized(request).send().await?;
        check_response(response).await?;
        tracing::debug!(points = packets.len(), "wrote packet batch");
        Ok(())
    }

    async fn downsample(&self, window: DownsampleWindow) -> Result<(), BackendError> {
        let flux = downsample_flux(
            &self.bucket,
            &self.resolution_bucket,
            &self.org,
            &window,
            self.bucket_secs,
        );
        let request = self
            .client
            .post(format!("{}/api/v2/query", self.url))
            .query(&[("org", self.org.as_str())])
            .header("Content-Type", "application/vnd.flux")
            .header("Accept", "application/csv")
            .body(flux);
        let response = self.authorized(request).send().await?;
        let response = check_response(response).await?;
        // Drain the echoed rows so the whole query is inside the timing.
        let _ = response.bytes().await?;
        tracing::debug!(%window, "downsampled window");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{downsample_flux, encode_line_protocol};
    use crate::harness::DownsampleWindow;
    use crate::packet::{Measurement, Packet};
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    #[test]
    fn line_protocol_tags_ids_and_uses_millis() {
        let ts = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let body = encode_line_protocol(&[Packet {
            timestamp: ts,
            asset_id: 4,
            attribute_id: 9,
            measurement: Measurement::Raw,
            value: 3.5,
        }]);
        assert_eq!(body, "raw,asset_id=4,attribute_id=9 value=3.5 1700000000123\n");
    }

    #[test]
    fn flux_script_covers_window_and_targets_resolution_bucket() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 7, 0).unwrap();
        let window = DownsampleWindow::containing(now, Duration::from_secs(900));
        let flux = downsample_flux("raw", "resolution_15_min", "bench", &window, 900);
        assert!(flux.starts_with(r#"from(bucket: "raw")"#));
        assert!(flux.contains("range(start: 2024-01-01T00:00:00.000Z, stop: 2024-01-01T00:15:00.000Z)"));
        assert!(flux.contains("aggregateWindow(every: 900s, fn: mean"));
        assert!(flux.contains(r#"set(key: "_measurement", value: "mean")"#));
        assert!(flux.contains(r#"to(bucket: "resolution_15_min", org: "bench")"#));
    }
}
