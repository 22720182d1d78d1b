//! TimescaleDB backend.
//!
//! Expects both tables to exist as hypertables on `timestamp`:
//!
//! ```text
//! CREATE TABLE raw (
//!     "timestamp"    TIMESTAMPTZ      NOT NULL,
//!     "asset_id"     BIGINT           NOT NULL,
//!     "attribute_id" BIGINT           NOT NULL,
//!     "measurement"  TEXT             NOT NULL,
//!     "value"        DOUBLE PRECISION NOT NULL
//! );
//! SELECT create_hypertable('raw', 'timestamp');
//!
//! CREATE TABLE resolution_15_min (
//!     -- same columns as raw
//!     UNIQUE ("timestamp", asset_id, attribute_id, measurement)
//! );
//! SELECT create_hypertable('resolution_15_min', 'timestamp');
//! ```

use super::{Backend, BackendError};
use crate::config::Config;
use crate::harness::DownsampleWindow;
use crate::packet::{Measurement, Packet};
use async_trait::async_trait;
use chrono::SecondsFormat;
use sqlx::postgres::{PgPoolCopyExt, PgPoolOptions};
use sqlx::PgPool;
use std::fmt::Write as _;
use std::time::Duration;

pub struct TimescaleBackend {
    pool: PgPool,
    raw_table: String,
    resolution_table: String,
    bucket_secs: u64,
}

impl TimescaleBackend {
    pub async fn connect(config: &Config) -> Result<Self, BackendError> {
        let database_url = config.database_url.as_deref().ok_or_else(|| {
            BackendError::Unavailable(
                "BENCH_DATABASE_URL or DATABASE_URL is required for timescale".to_string(),
            )
        })?;
        let pool = PgPoolOptions::new()
            .max_connections(config.db_pool_size)
            .connect(database_url)
            .await?;
        Ok(Self::new(
            pool,
            config.raw_table.clone(),
            config.resolution_table.clone(),
            config.bucket(),
        ))
    }

    pub fn new(pool: PgPool, raw_table: String, resolution_table: String, bucket: Duration) -> Self {
        Self {
            pool,
            raw_table,
            resolution_table,
            bucket_secs: bucket.as_secs().max(1),
        }
    }

    fn copy_statement(&self) -> String {
        format!(
            "COPY {} (timestamp, asset_id, attribute_id, measurement, value) FROM STDIN WITH (FORMAT csv)",
            self.raw_table
        )
    }
}

/// `time_bucket` defaults to a 2000-01-03 origin; buckets must start on
/// multiples of the bucket width from the Unix epoch to line up with
/// `DownsampleWindow`.
fn downsample_statement(raw_table: &str, resolution_table: &str) -> String {
    format!(
        r#"
        INSERT INTO {resolution_table} (timestamp, asset_id, attribute_id, measurement, value)
        SELECT
            time_bucket($3::interval, timestamp, TIMESTAMPTZ '1970-01-01 00:00:00+00') AS bucket,
            asset_id,
            attribute_id,
            $4 AS measurement,
            avg(value)
        FROM {raw_table}
        WHERE timestamp >= $1
          AND timestamp < $2
          AND measurement = $5
        GROUP BY bucket, asset_id, attribute_id
        ON CONFLICT (timestamp, asset_id, attribute_id, measurement)
        DO UPDATE SET value = EXCLUDED.value
        "#
    )
}

fn encode_csv(packets: &[Packet]) -> String {
    let mut out = String::with_capacity(packets.len() * 64);
    for packet in packets {
        let _ = writeln!(
            out,
            "{},{},{},{},{}",
            packet.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            packet.asset_id,
            packet.attribute_id,
            packet.measurement,
            packet.value
        );
    }
    out
}

#[async_trait]
impl Backend for TimescaleBackend {
    fn name(&self) -> &str {
        "timescale"
    }

    async fn insert(&self, packets: Vec<Packet>) -> Result<(), BackendError> {
        if packets.is_empty() {
            return Ok(());
        }
        let body = encode_csv(&packets);
        let statement = self.copy_statement();
        let mut copy = self.pool.copy_in_raw(&statement).await?;
        copy.send(body.into_bytes()).await?;
        let rows = copy.finish().await?;
        tracing::debug!(rows, table = %self.raw_table, "copied packet batch");
        Ok(())
    }

    async fn downsample(&self, window: DownsampleWindow) -> Result<(), BackendError> {
        let statement = downsample_statement(&self.raw_table, &self.resolution_table);
        let result = sqlx::query(&statement)
            .bind(window.start)
            .bind(window.end)
            .bind(format!("{} seconds", self.bucket_secs))
            .bind(Measurement::Mean.as_str())
            .bind(Measurement::Raw.as_str())
            .execute(&self.pool)
            .await?;
        tracing::debug!(
            rows = result.rows_affected(),
            table = %self.resolution_table,
            %window,
            "downsampled window"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{downsample_statement, encode_csv, TimescaleBackend};
    use crate::backend::Backend;
    use crate::harness::DownsampleWindow;
    use crate::packet::{Measurement, Packet};
    use anyhow::Result;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use sqlx::postgres::PgPoolOptions;
    use sqlx::PgPool;
    use std::env;
    use std::time::Duration;

    #[test]
    fn csv_rows_follow_copy_column_order() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let body = encode_csv(&[
            Packet {
                timestamp: ts,
                asset_id: 3,
                attribute_id: 7,
                measurement: Measurement::Raw,
                value: 42.5,
            },
            Packet {
                timestamp: ts,
                asset_id: 3,
                attribute_id: 8,
                measurement: Measurement::Raw,
                value: 0.0,
            },
        ]);
        assert_eq!(
            body,
            "2024-01-01T00:00:00.000000Z,3,7,raw,42.5\n2024-01-01T00:00:00.000000Z,3,8,raw,0\n"
        );
    }

    #[test]
    fn downsample_buckets_from_unix_epoch() {
        let sql = downsample_statement("raw", "resolution_15_min");
        assert!(sql.contains(
            "time_bucket($3::interval, timestamp, TIMESTAMPTZ '1970-01-01 00:00:00+00')"
        ));
        assert!(sql.contains("INSERT INTO resolution_15_min"));
        assert!(sql.contains("FROM raw"));
    }

    async fn setup_test_pool(database_url: &str, schema: &str) -> Result<PgPool> {
        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
            .execute(&admin_pool)
            .await?;
        drop(admin_pool);

        let schema_name = schema.to_string();
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .after_connect(move |conn, _meta| {
                let schema = schema_name.clone();
                Box::pin(async move {
                    sqlx::query(&format!("SET search_path TO {}, public", schema))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;

        for table in ["raw", "resolution_15_min"] {
            let unique = if table == "raw" {
                ""
            } else {
                ", UNIQUE (timestamp, asset_id, attribute_id, measurement)"
            };
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    timestamp timestamptz not null,
                    asset_id bigint not null,
                    attribute_id bigint not null,
                    measurement text not null,
                    value double precision not null
                    {unique}
                )
                "#
            ))
            .execute(&pool)
            .await?;
        }

        Ok(pool)
    }

    #[tokio::test]
    async fn test_timescale_downsample_is_idempotent() -> Result<()> {
        if env::var("BENCH_INTEGRATION_TEST").ok().as_deref() != Some("1") {
            return Ok(());
        }
        let database_url = match env::var("BENCH_TEST_DATABASE_URL") {
            Ok(value) => value,
            Err(_) => return Ok(()),
        };

        let schema = format!("bench_test_{}", std::process::id());
        let pool = setup_test_pool(&database_url, &schema).await?;
        let bucket = Duration::from_secs(15 * 60);
        let backend = TimescaleBackend::new(
            pool.clone(),
            "raw".to_string(),
            "resolution_15_min".to_string(),
            bucket,
        );

        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap();
        let packets = [10.0, 20.0, 30.0]
            .into_iter()
            .enumerate()
            .map(|(i, value)| Packet {
                timestamp: ts + ChronoDuration::seconds(i as i64),
                asset_id: 1,
                attribute_id: 1,
                measurement: Measurement::Raw,
                value,
            })
            .collect();
        backend.insert(packets).await?;

        let window = DownsampleWindow::containing(ts, bucket);
        backend.downsample(window).await?;
        backend.downsample(window).await?;

        let rows: Vec<(f64,)> = sqlx::query_as(
            "SELECT value FROM resolution_15_min WHERE asset_id = 1 AND attribute_id = 1 AND measurement = 'mean'",
        )
        .fetch_all(&pool)
        .await?;
        assert_eq!(rows.len(), 1);
        assert!((rows[0].0 - 20.0).abs() < 1e-9);

        sqlx::query(&format!("DROP SCHEMA {} CASCADE", schema))
            .execute(&pool)
            .await?;
        Ok(())
    }
}
