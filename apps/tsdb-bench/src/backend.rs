mod clickhouse;
mod influx;
mod memory;
mod mongo;
mod singlestore;
mod timescale;

pub use clickhouse::ClickHouseBackend;
pub use influx::InfluxBackend;
pub use memory::MemoryBackend;
pub use mongo::MongoDbBackend;
pub use singlestore::{SingleStoreBackend, MAX_CHUNK_ROWS as SINGLESTORE_MAX_CHUNK_ROWS};
pub use timescale::TimescaleBackend;

use crate::config::{BackendKind, Config};
use crate::harness::DownsampleWindow;
use crate::packet::Packet;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Mongo(#[from] mongodb::error::Error),
    #[error("failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("server rejected request with {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("{0}")]
    Unavailable(String),
}

/// The two operations the harness times against a database.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Bulk-writes one generated batch into the raw store.
    async fn insert(&self, packets: Vec<Packet>) -> Result<(), BackendError>;

    /// Averages raw values per bucket/asset/attribute inside `window` and
    /// upserts them into the resolution store with measurement `mean`.
    async fn downsample(&self, window: DownsampleWindow) -> Result<(), BackendError>;
}

pub async fn connect(config: &Config) -> Result<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match config.backend {
        BackendKind::Timescale => Arc::new(
            TimescaleBackend::connect(config)
                .await
                .context("connect to TimescaleDB")?,
        ),
        BackendKind::SingleStore => Arc::new(
            SingleStoreBackend::connect(config)
                .await
                .context("connect to SingleStore")?,
        ),
        BackendKind::ClickHouse => Arc::new(
            ClickHouseBackend::connect(config)
                .await
                .context("connect to ClickHouse")?,
        ),
        BackendKind::Influx => Arc::new(
            InfluxBackend::connect(config)
                .await
                .context("connect to InfluxDB")?,
        ),
        BackendKind::MongoDb => Arc::new(
            MongoDbBackend::connect(config)
                .await
                .context("connect to MongoDB")?,
        ),
        BackendKind::Memory => Arc::new(MemoryBackend::new(config.bucket())),
    };
    tracing::info!(backend = backend.name(), "backend ready");
    Ok(backend)
}

/// Turns a non-success HTTP response into `BackendError::Rejected`.
pub(crate) async fn check_response(
    response: reqwest::Response,
) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Rejected {
        status,
        body: body.trim().to_string(),
    })
}
