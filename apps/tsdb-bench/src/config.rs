use crate::backend::SINGLESTORE_MAX_CHUNK_ROWS;
use crate::harness::RunSettings;
use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Timescale,
    SingleStore,
    ClickHouse,
    Influx,
    MongoDb,
    Memory,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Timescale => "timescale",
            BackendKind::SingleStore => "singlestore",
            BackendKind::ClickHouse => "clickhouse",
            BackendKind::Influx => "influx",
            BackendKind::MongoDb => "mongodb",
            BackendKind::Memory => "memory",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "timescale" | "timescaledb" => Ok(BackendKind::Timescale),
            "singlestore" => Ok(BackendKind::SingleStore),
            "clickhouse" => Ok(BackendKind::ClickHouse),
            "influx" | "influxdb" => Ok(BackendKind::Influx),
            "mongodb" | "mongo" => Ok(BackendKind::MongoDb),
            "memory" => Ok(BackendKind::Memory),
            other => bail!(
                "unknown backend {other:?} (expected timescale, singlestore, clickhouse, influx, mongodb or memory)"
            ),
        }
    }
}

fn setup_config_path() -> Option<PathBuf> {
    env::var("BENCH_SETUP_CONFIG_PATH")
        .ok()
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    backend: Option<String>,
    #[serde(default)]
    prefix: Option<String>,
    #[serde(default)]
    devices: Option<u32>,
    #[serde(default)]
    attributes_per_device: Option<u32>,
    #[serde(default)]
    insert_interval_ms: Option<u64>,
    #[serde(default)]
    downsample_interval_secs: Option<u64>,
    #[serde(default)]
    run_duration_secs: Option<u64>,
    #[serde(default)]
    bucket_secs: Option<u64>,
    #[serde(default)]
    output_path: Option<String>,
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    db_pool_size: Option<u32>,
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path()?;
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "tsdb-bench failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    parse_setup_overrides(contents)
}

fn parse_setup_overrides(contents: String) -> Option<SetupConfigOverrides> {
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(error = %err, "tsdb-bench failed to parse setup config; using env defaults");
            None
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: fmt::Display,
{
    match env_string(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|err| anyhow::anyhow!("{key}={raw:?} is invalid: {err}")),
        None => Ok(None),
    }
}

/// Table, bucket and database names are spliced into query text.
fn validate_identifier(field: &str, value: &str) -> Result<()> {
    let mut chars = value.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!("{field} {value:?} is not a valid identifier");
    }
    Ok(())
}

fn validate_chunk_size(rows: usize) -> Result<()> {
    if rows > SINGLESTORE_MAX_CHUNK_ROWS {
        bail!(
            "singlestore_chunk_size {rows} exceeds {SINGLESTORE_MAX_CHUNK_ROWS} rows per statement"
        );
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct Config {
    pub backend: BackendKind,
    pub prefix: String,
    pub devices: u32,
    pub attributes_per_device: u32,
    pub insert_interval_ms: u64,
    pub downsample_interval_secs: u64,
    pub run_duration_secs: u64,
    pub bucket_secs: u64,
    pub output_path: PathBuf,
    pub database_url: Option<String>,
    pub db_pool_size: u32,
    pub raw_table: String,
    pub resolution_table: String,
    pub singlestore_chunk_size: usize,
    pub clickhouse_url: String,
    pub clickhouse_user: String,
    pub clickhouse_password: Option<String>,
    pub clickhouse_database: String,
    pub influx_url: String,
    pub influx_token: Option<String>,
    pub influx_org: String,
    pub influx_bucket: String,
    pub influx_resolution_bucket: String,
    pub mongodb_url: String,
    pub mongodb_database: String,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let overrides = load_setup_config_overrides().unwrap_or_default();
        Self::resolve(overrides)
    }

    fn resolve(overrides: SetupConfigOverrides) -> Result<Self> {
        let backend = match env_string("BENCH_BACKEND").or(overrides.backend) {
            Some(raw) => raw.parse::<BackendKind>()?,
            None => BackendKind::Memory,
        };
        let prefix = env_string("BENCH_PREFIX")
            .or(overrides.prefix)
            .unwrap_or_else(|| backend.as_str().to_string());

        let devices = env_parse::<u32>("BENCH_DEVICES")?
            .or(overrides.devices)
            .unwrap_or(15_000);
        let attributes_per_device = env_parse::<u32>("BENCH_ATTRIBUTES_PER_DEVICE")?
            .or(overrides.attributes_per_device)
            .unwrap_or(10);
        let insert_interval_ms = env_parse::<u64>("BENCH_INSERT_INTERVAL_MS")?
            .or(overrides.insert_interval_ms)
            .unwrap_or(1_000);
        let downsample_interval_secs = env_parse::<u64>("BENCH_DOWNSAMPLE_INTERVAL_SECS")?
            .or(overrides.downsample_interval_secs)
            .unwrap_or(5 * 60);
        let run_duration_secs = env_parse::<u64>("BENCH_RUN_DURATION_SECS")?
            .or(overrides.run_duration_secs)
            .unwrap_or(60 * 60);
        let bucket_secs = env_parse::<u64>("BENCH_BUCKET_SECS")?
            .or(overrides.bucket_secs)
            .unwrap_or(15 * 60);

        let output_path = env_string("BENCH_OUTPUT_PATH")
            .or(overrides.output_path)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("{prefix}-latency.csv")));

        let database_url = env_string("BENCH_DATABASE_URL")
            .or_else(|| env_string("DATABASE_URL"))
            .or(overrides.database_url);
        let db_pool_size = env_parse::<u32>("BENCH_DB_POOL_SIZE")?
            .or(overrides.db_pool_size)
            .unwrap_or(30);

        let config = Self {
            backend,
            prefix,
            devices,
            attributes_per_device,
            insert_interval_ms,
            downsample_interval_secs,
            run_duration_secs,
            bucket_secs,
            output_path,
            database_url,
            db_pool_size,
            raw_table: env_string("BENCH_RAW_TABLE").unwrap_or_else(|| "raw".to_string()),
            resolution_table: env_string("BENCH_RESOLUTION_TABLE")
                .unwrap_or_else(|| "resolution_15_min".to_string()),
            singlestore_chunk_size: env_parse::<usize>("BENCH_SINGLESTORE_CHUNK_SIZE")?
                .unwrap_or(10_000),
            clickhouse_url: env_string("BENCH_CLICKHOUSE_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8123".to_string()),
            clickhouse_user: env_string("BENCH_CLICKHOUSE_USER")
                .unwrap_or_else(|| "default".to_string()),
            clickhouse_password: env_string("BENCH_CLICKHOUSE_PASSWORD"),
            clickhouse_database: env_string("BENCH_CLICKHOUSE_DATABASE")
                .unwrap_or_else(|| "default".to_string()),
            influx_url: env_string("BENCH_INFLUX_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8086".to_string()),
            influx_token: env_string("BENCH_INFLUX_TOKEN"),
            influx_org: env_string("BENCH_INFLUX_ORG").unwrap_or_else(|| "bench".to_string()),
            influx_bucket: env_string("BENCH_INFLUX_BUCKET").unwrap_or_else(|| "raw".to_string()),
            influx_resolution_bucket: env_string("BENCH_INFLUX_RESOLUTION_BUCKET")
                .unwrap_or_else(|| "resolution_15_min".to_string()),
            mongodb_url: env_string("BENCH_MONGODB_URL")
                .unwrap_or_else(|| "mongodb://127.0.0.1:27017".to_string()),
            mongodb_database: env_string("BENCH_MONGODB_DATABASE")
                .unwrap_or_else(|| "bench".to_string()),
            otlp_endpoint: env_string("OTEL_EXPORTER_OTLP_ENDPOINT"),
        };
        config.validate().context("invalid benchmark configuration")?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("devices", u64::from(self.devices)),
            ("attributes_per_device", u64::from(self.attributes_per_device)),
            ("insert_interval_ms", self.insert_interval_ms),
            ("downsample_interval_secs", self.downsample_interval_secs),
            ("run_duration_secs", self.run_duration_secs),
            ("bucket_secs", self.bucket_secs),
            ("db_pool_size", u64::from(self.db_pool_size)),
            ("singlestore_chunk_size", self.singlestore_chunk_size as u64),
        ] {
            if value == 0 {
                bail!("{field} must be greater than zero");
            }
        }
        validate_chunk_size(self.singlestore_chunk_size)?;
        if self.prefix.is_empty() || self.prefix.contains(',') {
            bail!("prefix {:?} must be non-empty and contain no commas", self.prefix);
        }
        validate_identifier("raw_table", &self.raw_table)?;
        validate_identifier("resolution_table", &self.resolution_table)?;
        validate_identifier("clickhouse_database", &self.clickhouse_database)?;
        validate_identifier("influx_bucket", &self.influx_bucket)?;
        validate_identifier("influx_resolution_bucket", &self.influx_resolution_bucket)?;
        validate_identifier("influx_org", &self.influx_org)?;
        validate_identifier("mongodb_database", &self.mongodb_database)?;
        Ok(())
    }

    pub fn insert_interval(&self) -> Duration {
        Duration::from_millis(self.insert_interval_ms)
    }

    pub fn downsample_interval(&self) -> Duration {
        Duration::from_secs(self.downsample_interval_secs)
    }

    pub fn run_duration(&self) -> Duration {
        Duration::from_secs(self.run_duration_secs)
    }

    pub fn bucket(&self) -> Duration {
        Duration::from_secs(self.bucket_secs)
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            prefix: self.prefix.clone(),
            devices: self.devices,
            attributes_per_device: self.attributes_per_device,
            insert_interval: self.insert_interval(),
            downsample_interval: self.downsample_interval(),
            run_duration: self.run_duration(),
            bucket: self.bucket(),
        }
    }
}
