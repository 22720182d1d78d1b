mod stats;
mod window;

#[cfg(test)]
mod tests;

pub use stats::{RunState, RunStats, StatsSnapshot};
pub(crate) use window::align_down;
pub use window::DownsampleWindow;

use crate::backend::{Backend, BackendError};
use crate::latency::{LatencyRecorder, QueryLatency, RecorderError};
use crate::packet::generate_packets;
use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("{backend} insert failed")]
    Insert {
        backend: String,
        #[source]
        source: BackendError,
    },
    #[error("{backend} downsample of {window} failed")]
    Downsample {
        backend: String,
        window: DownsampleWindow,
        #[source]
        source: BackendError,
    },
    #[error("recording {key} failed")]
    Record {
        key: String,
        #[source]
        source: RecorderError,
    },
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub prefix: String,
    pub devices: u32,
    pub attributes_per_device: u32,
    pub insert_interval: Duration,
    pub downsample_interval: Duration,
    pub run_duration: Duration,
    pub bucket: Duration,
}

impl RunSettings {
    fn insert_key(&self) -> String {
        format!("{}.insert", self.prefix)
    }

    fn downsample_key(&self) -> String {
        format!("{}.downsampling", self.prefix)
    }
}

/// Drives the insert and downsample cadences against one backend until the
/// run duration elapses.
///
/// Every tick's work is spawned and never awaited: ticks overlap freely and
/// whatever is still in flight at the deadline is left behind. The first
/// backend or recorder failure ends the run with an error.
pub struct TestRunner {
    backend: Arc<dyn Backend>,
    recorder: Arc<LatencyRecorder>,
    settings: RunSettings,
    stats: Arc<RunStats>,
}

impl TestRunner {
    pub fn new(
        backend: Arc<dyn Backend>,
        recorder: Arc<LatencyRecorder>,
        settings: RunSettings,
    ) -> Self {
        Self {
            backend,
            recorder,
            settings,
            stats: Arc::new(RunStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<RunStats> {
        self.stats.clone()
    }

    pub async fn run(&self) -> Result<StatsSnapshot, HarnessError> {
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<HarnessError>();

        let start = Instant::now();
        let mut insert_ticker = interval_at(
            start + self.settings.insert_interval,
            self.settings.insert_interval,
        );
        insert_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut downsample_ticker = interval_at(
            start + self.settings.downsample_interval,
            self.settings.downsample_interval,
        );
        downsample_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let deadline = tokio::time::sleep(self.settings.run_duration);
        tokio::pin!(deadline);

        self.stats.set_state(RunState::Running);
        tracing::info!(
            backend = self.backend.name(),
            prefix = %self.settings.prefix,
            devices = self.settings.devices,
            attributes_per_device = self.settings.attributes_per_device,
            insert_interval_ms = self.settings.insert_interval.as_millis() as u64,
            downsample_interval_ms = self.settings.downsample_interval.as_millis() as u64,
            run_duration_secs = self.settings.run_duration.as_secs(),
            "benchmark started"
        );

        let outcome = loop {
            tokio::select! {
                biased;
                Some(err) = fatal_rx.recv() => {
                    break Err(err);
                }
                _ = &mut deadline => {
                    break Ok(());
                }
                _ = insert_ticker.tick() => {
                    self.spawn_insert(fatal_tx.clone());
                }
                _ = downsample_ticker.tick() => {
                    self.spawn_downsample(fatal_tx.clone());
                }
            }
        };

        self.stats.set_state(RunState::Stopped);
        let snapshot = self.stats.snapshot();
        match &outcome {
            Ok(()) => tracing::info!(
                inserts_dispatched = snapshot.inserts_dispatched,
                inserts_completed = snapshot.inserts_completed,
                packets_offered = snapshot.packets_offered,
                downsamples_dispatched = snapshot.downsamples_dispatched,
                downsamples_completed = snapshot.downsamples_completed,
                in_flight = snapshot.in_flight,
                max_in_flight = snapshot.max_in_flight,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "benchmark finished"
            ),
            Err(err) => tracing::error!(
                error = %err,
                inserts_completed = snapshot.inserts_completed,
                downsamples_completed = snapshot.downsamples_completed,
                in_flight = snapshot.in_flight,
                "benchmark aborted"
            ),
        }
        outcome.map(|()| snapshot)
    }

    fn spawn_insert(&self, fatal: mpsc::UnboundedSender<HarnessError>) {
        self.stats.inserts_dispatched.fetch_add(1, Ordering::Relaxed);
        let backend = self.backend.clone();
        let recorder = self.recorder.clone();
        let stats = self.stats.clone();
        let key = self.settings.insert_key();
        let devices = self.settings.devices;
        let attributes = self.settings.attributes_per_device;

        tokio::spawn(async move {
            let _in_flight = stats.enter();
            let started_at = Utc::now();
            let packets = generate_packets(started_at, devices, attributes);
            let count = packets.len() as u64;
            stats.packets_offered.fetch_add(count, Ordering::Relaxed);

            match backend.insert(packets).await {
                Ok(()) => {
                    stats.inserts_completed.fetch_add(1, Ordering::Relaxed);
                    spawn_record(recorder, QueryLatency::new(key, started_at), fatal);
                }
                Err(source) => {
                    tracing::error!(error = %source, backend = backend.name(), packets = count, "insert failed");
                    let _ = fatal.send(HarnessError::Insert {
                        backend: backend.name().to_string(),
                        source,
                    });
                }
            }
        });
    }

    fn spawn_downsample(&self, fatal: mpsc::UnboundedSender<HarnessError>) {
        self.stats
            .downsamples_dispatched
            .fetch_add(1, Ordering::Relaxed);
        let backend = self.backend.clone();
        let recorder = self.recorder.clone();
        let stats = self.stats.clone();
        let key = self.settings.downsample_key();
        let bucket = self.settings.bucket;

        tokio::spawn(async move {
            let _in_flight = stats.enter();
            let started_at = Utc::now();
            let window = DownsampleWindow::containing(started_at, bucket);

            match backend.downsample(window).await {
                Ok(()) => {
                    stats
                        .downsamples_completed
                        .fetch_add(1, Ordering::Relaxed);
                    spawn_record(recorder, QueryLatency::new(key, started_at), fatal);
                }
                Err(source) => {
                    tracing::error!(error = %source, backend = backend.name(), %window, "downsample failed");
                    let _ = fatal.send(HarnessError::Downsample {
                        backend: backend.name().to_string(),
                        window,
                        source,
                    });
                }
            }
        });
    }
}

fn spawn_record(
    recorder: Arc<LatencyRecorder>,
    latency: QueryLatency,
    fatal: mpsc::UnboundedSender<HarnessError>,
) {
    tokio::spawn(async move {
        let key = latency.key().to_string();
        let written = tokio::task::spawn_blocking(move || recorder.record(latency))
            .await
            .map_err(RecorderError::from)
            .and_then(|result| result);
        if let Err(source) = written {
            tracing::error!(error = %source, key = %key, "failed to record latency");
            let _ = fatal.send(HarnessError::Record { key, source });
        }
    });
}
