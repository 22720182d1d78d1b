//! SingleStore backend (MySQL wire protocol).
//!
//! ```text
//! CREATE TABLE raw (
//!     timestamp DATETIME(6),
//!     asset_id INT NOT NULL,
//!     attribute_id INT NOT NULL,
//!     measurement VARCHAR(8) NOT NULL,
//!     value DOUBLE NOT NULL,
//!     SHARD(attribute_id),
//!     KEY(timestamp)
//! );
//! CREATE TABLE resolution_15_min (
//!     -- same columns as raw
//!     SHARD(attribute_id),
//!     UNIQUE KEY(timestamp, asset_id, attribute_id, measurement),
//!     KEY(timestamp)
//! );
//! ```

use super::{Backend, BackendError};
use crate::config::Config;
use crate::harness::DownsampleWindow;
use crate::packet::{Measurement, Packet};
use async_trait::async_trait;
use futures::future::try_join_all;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySql, MySqlPool, QueryBuilder};
use std::time::Duration;

const BINDS_PER_ROW: usize = 5;

/// Largest chunk whose placeholders fit in one MySQL prepared statement.
pub const MAX_CHUNK_ROWS: usize = u16::MAX as usize / BINDS_PER_ROW;

pub struct SingleStoreBackend {
    pool: MySqlPool,
    raw_table: String,
    resolution_table: String,
    bucket_secs: u64,
    chunk_size: usize,
}

impl SingleStoreBackend {
    pub async fn connect(config: &Config) -> Result<Self, BackendError> {
        let database_url = config.database_url.as_deref().ok_or_else(|| {
            BackendError::Unavailable(
                "BENCH_DATABASE_URL or DATABASE_URL is required for singlestore".to_string(),
            )
        })?;
        let pool = MySqlPoolOptions::new()
            .max_connections(config.db_pool_size)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool,
            raw_table: config.raw_table.clone(),
            resolution_table: config.resolution_table.clone(),
            bucket_secs: bucket_secs(config.bucket()),
            chunk_size: config.singlestore_chunk_size.clamp(1, MAX_CHUNK_ROWS),
        })
    }

    async fn insert_chunk(&self, chunk: &[Packet]) -> Result<u64, BackendError> {
        let mut builder: QueryBuilder<MySql> = QueryBuilder::new(format!(
            "INSERT INTO {} (timestamp, asset_id, attribute_id, measurement, value) ",
            self.raw_table
        ));
        builder.push_values(chunk.iter(), |mut b, packet| {
            b.push_bind(packet.timestamp)
                .push_bind(packet.asset_id)
                .push_bind(packet.attribute_id)
                .push_bind(packet.measurement.as_str())
                .push_bind(packet.value);
        });
        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

fn bucket_secs(bucket: Duration) -> u64 {
    bucket.as_secs().max(1)
}

fn downsample_statement(raw_table: &str, resolution_table: &str) -> String {
    format!(
        r#"
        INSERT INTO {resolution_table} (timestamp, asset_id, attribute_id, measurement, value)
        SELECT
            from_unixtime(unix_timestamp(timestamp) DIV ? * ?) AS bucket,
            asset_id,
            attribute_id,
            ? AS measurement,
            avg(value) AS value
        FROM {raw_table}
        WHERE timestamp >= ?
          AND timestamp < ?
          AND measurement = ?
        GROUP BY bucket, asset_id, attribute_id
        ON DUPLICATE KEY UPDATE value = VALUES(value)
        "#
    )
}

#[async_trait]
impl Backend for SingleStoreBackend {
    fn name(&self) -> &str {
        "singlestore"
    }

    async fn insert(&self, packets: Vec<Packet>) -> Result<(), BackendError> {
        if packets.is_empty() {
            return Ok(());
        }
        let inserted: u64 = try_join_all(
            packets
                .chunks(self.chunk_size)
                .map(|chunk| self.insert_chunk(chunk)),
        )
        .await?
        .into_iter()
        .sum();
        tracing::debug!(
            rows = inserted,
            chunks = packets.len().div_ceil(self.chunk_size),
            "inserted packet batch"
        );
        Ok(())
    }

    async fn downsample(&self, window: DownsampleWindow) -> Result<(), BackendError> {
        let statement = downsample_statement(&self.raw_table, &self.resolution_table);
        let result = sqlx::query(&statement)
            .bind(self.bucket_secs)
            .bind(self.bucket_secs)
            .bind(Measurement::Mean.as_str())
            .bind(window.start)
            .bind(window.end)
            .bind(Measurement::Raw.as_str())
            .execute(&self.pool)
            .await?;
        tracing::debug!(rows = result.rows_affected(), %window, "downsampled window");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{bucket_secs, downsample_statement, BINDS_PER_ROW, MAX_CHUNK_ROWS};
    use std::time::Duration;

    #[test]
    fn downsample_statement_targets_configured_tables() {
        let sql = downsample_statement("raw", "resolution_15_min");
        assert!(sql.contains("INSERT INTO resolution_15_min"));
        assert!(sql.contains("FROM raw"));
        assert!(sql.contains("ON DUPLICATE KEY UPDATE value = VALUES(value)"));
        assert_eq!(sql.matches('?').count(), 6);
    }

    #[test]
    fn max_chunk_fits_placeholder_limit() {
        assert_eq!(MAX_CHUNK_ROWS, 13_107);
        assert!(MAX_CHUNK_ROWS * BINDS_PER_ROW <= 65_535);
        assert!((MAX_CHUNK_ROWS + 1) * BINDS_PER_ROW > 65_535);
    }

    #[test]
    fn bucket_never_rounds_to_zero() {
        assert_eq!(bucket_secs(Duration::from_secs(900)), 900);
        assert_eq!(bucket_secs(Duration::from_millis(10)), 1);
    }
}
