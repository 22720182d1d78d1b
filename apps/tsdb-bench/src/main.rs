mod backend;
mod config;
mod harness;
mod latency;
mod packet;

use crate::config::Config;
use crate::harness::TestRunner;
use crate::latency::LatencyRecorder;
use anyhow::{Context, Result};
use std::sync::Arc;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tsdb_bench=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "tsdb-bench"),
                KeyValue::new("bench.backend", config.backend.as_str()),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let backend = backend::connect(&config).await?;
    let recorder = Arc::new(
        LatencyRecorder::open(&config.output_path).with_context(|| {
            format!(
                "failed to open latency file {}",
                config.output_path.display()
            )
        })?,
    );
    tracing::info!(
        backend = %config.backend,
        path = %recorder.path().display(),
        "recording latencies"
    );

    let runner = TestRunner::new(backend, recorder.clone(), config.run_settings());
    let stats = runner.stats();
    let outcome = tokio::select! {
        res = runner.run() => res.map(|_| ()).map_err(anyhow::Error::from),
        _ = tokio::signal::ctrl_c() => {
            let snapshot = stats.snapshot();
            tracing::info!(
                state = ?stats.state(),
                inserts_completed = snapshot.inserts_completed,
                downsamples_completed = snapshot.downsamples_completed,
                in_flight = snapshot.in_flight,
                "shutdown signal received; stopping benchmark early"
            );
            Ok(())
        }
    };

    recorder
        .close()
        .context("failed to flush latency file")?;
    outcome
}
