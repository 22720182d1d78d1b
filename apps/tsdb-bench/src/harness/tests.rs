use super::{DownsampleWindow, HarnessError, RunSettings, RunState, TestRunner};
use crate::backend::{Backend, BackendError, MemoryBackend};
use crate::latency::{LatencyRecorder, RecorderError};
use crate::packet::Packet;
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const HOUR: Duration = Duration::from_secs(60 * 60);

fn settings(
    insert_interval: Duration,
    downsample_interval: Duration,
    run_duration: Duration,
) -> RunSettings {
    RunSettings {
        prefix: "memory".to_string(),
        devices: 3,
        attributes_per_device: 2,
        insert_interval,
        downsample_interval,
        run_duration,
        bucket: Duration::from_secs(15 * 60),
    }
}

fn recorded_keys(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| {
            let fields: Vec<&str> = line.split(',').collect();
            assert_eq!(fields.len(), 3, "malformed line {line:?}");
            fields[2].parse::<i64>().expect("integer milliseconds");
            fields[1].to_string()
        })
        .collect()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FailOn {
    Insert,
    Downsample,
}

struct FailingBackend(FailOn);

#[async_trait]
impl Backend for FailingBackend {
    fn name(&self) -> &str {
        "failing"
    }

    async fn insert(&self, _packets: Vec<Packet>) -> Result<(), BackendError> {
        if self.0 == FailOn::Insert {
            return Err(BackendError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }

    async fn downsample(&self, _window: DownsampleWindow) -> Result<(), BackendError> {
        if self.0 == FailOn::Downsample {
            return Err(BackendError::Unavailable("resolution table missing".to_string()));
        }
        Ok(())
    }
}

struct SlowBackend {
    delay: Duration,
    completed: AtomicU64,
}

#[async_trait]
impl Backend for SlowBackend {
    fn name(&self) -> &str {
        "slow"
    }

    async fn insert(&self, _packets: Vec<Packet>) -> Result<(), BackendError> {
        tokio::time::sleep(self.delay).await;
        self.completed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn downsample(&self, _window: DownsampleWindow) -> Result<(), BackendError> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn three_insert_ticks_offer_eighteen_packets() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memory-latency.csv");
    let recorder = Arc::new(LatencyRecorder::open(&path).unwrap());
    let backend = Arc::new(MemoryBackend::new(Duration::from_secs(15 * 60)));

    let runner = TestRunner::new(
        backend.clone(),
        recorder.clone(),
        settings(Duration::from_secs(1), HOUR, Duration::from_millis(3_500)),
    );
    let snapshot = runner.run().await.unwrap();
    recorder.close().unwrap();

    assert_eq!(backend.insert_batches().await, vec![6, 6, 6]);
    assert_eq!(snapshot.inserts_dispatched, 3);
    assert_eq!(snapshot.inserts_completed, 3);
    assert_eq!(snapshot.packets_offered, 18);
    assert_eq!(snapshot.downsamples_dispatched, 0);
    assert_eq!(recorded_keys(&path), vec!["memory.insert"; 3]);
}

#[tokio::test(start_paused = true)]
async fn downsample_ticks_record_under_downsampling_key() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memory-latency.csv");
    let recorder = Arc::new(LatencyRecorder::open(&path).unwrap());
    let backend = Arc::new(MemoryBackend::new(Duration::from_secs(15 * 60)));

    let runner = TestRunner::new(
        backend,
        recorder.clone(),
        settings(HOUR, Duration::from_secs(1), Duration::from_millis(2_500)),
    );
    let snapshot = runner.run().await.unwrap();
    recorder.close().unwrap();

    assert_eq!(snapshot.inserts_dispatched, 0);
    assert_eq!(snapshot.downsamples_dispatched, 2);
    assert_eq!(snapshot.downsamples_completed, 2);
    assert_eq!(recorded_keys(&path), vec!["memory.downsampling"; 2]);
}

#[tokio::test(start_paused = true)]
async fn no_ticks_dispatched_after_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(LatencyRecorder::open(dir.path().join("latency.csv")).unwrap());
    let backend = Arc::new(MemoryBackend::new(Duration::from_secs(60)));

    let runner = TestRunner::new(
        backend.clone(),
        recorder,
        settings(
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_millis(2_500),
        ),
    );
    let stats = runner.stats();
    runner.run().await.unwrap();
    assert_eq!(stats.state(), RunState::Stopped);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(backend.insert_batches().await.len(), 2);
    assert_eq!(stats.snapshot().inserts_dispatched, 2);
    assert_eq!(stats.snapshot().downsamples_dispatched, 2);
}

#[tokio::test(start_paused = true)]
async fn returns_without_waiting_for_in_flight_inserts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("latency.csv");
    let recorder = Arc::new(LatencyRecorder::open(&path).unwrap());
    let backend = Arc::new(SlowBackend {
        delay: Duration::from_secs(10),
        completed: AtomicU64::new(0),
    });

    let runner = TestRunner::new(
        backend.clone(),
        recorder,
        settings(Duration::from_secs(1), HOUR, Duration::from_millis(3_500)),
    );
    let snapshot = runner.run().await.unwrap();

    assert_eq!(snapshot.inserts_dispatched, 3);
    assert_eq!(snapshot.inserts_completed, 0);
    assert_eq!(snapshot.in_flight, 3);
    assert_eq!(snapshot.max_in_flight, 3);
    assert_eq!(backend.completed.load(Ordering::Relaxed), 0);
    assert!(std::fs::read_to_string(&path).unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn insert_failure_aborts_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("latency.csv");
    let recorder = Arc::new(LatencyRecorder::open(&path).unwrap());

    let runner = TestRunner::new(
        Arc::new(FailingBackend(FailOn::Insert)),
        recorder,
        settings(Duration::from_secs(1), HOUR, HOUR),
    );
    let stats = runner.stats();
    let err = runner.run().await.unwrap_err();
    assert_eq!(err.to_string(), "failing insert failed");

    match err {
        HarnessError::Insert { backend, source } => {
            assert_eq!(backend, "failing");
            assert!(matches!(source, BackendError::Unavailable(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(stats.state(), RunState::Stopped);
    assert_eq!(stats.snapshot().inserts_completed, 0);
    assert!(std::fs::read_to_string(&path).unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn downsample_failure_aborts_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("latency.csv");
    let recorder = Arc::new(LatencyRecorder::open(&path).unwrap());

    let runner = TestRunner::new(
        Arc::new(FailingBackend(FailOn::Downsample)),
        recorder,
        settings(HOUR, Duration::from_secs(1), HOUR),
    );
    let stats = runner.stats();
    let err = runner.run().await.unwrap_err();

    match &err {
        HarnessError::Downsample {
            backend,
            window,
            source,
        } => {
            assert_eq!(backend, "failing");
            assert_eq!(window.bucket(), chrono::Duration::minutes(15));
            assert!(matches!(source, BackendError::Unavailable(_)));
            assert_eq!(err.to_string(), format!("failing downsample of {window} failed"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(stats.state(), RunState::Stopped);
    assert_eq!(stats.snapshot().downsamples_dispatched, 1);
    assert_eq!(stats.snapshot().downsamples_completed, 0);
    assert!(std::fs::read_to_string(&path).unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn recorder_failure_aborts_run() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(LatencyRecorder::open(dir.path().join("latency.csv")).unwrap());
    recorder.close().unwrap();

    let runner = TestRunner::new(
        Arc::new(MemoryBackend::new(Duration::from_secs(60))),
        recorder,
        settings(Duration::from_secs(1), HOUR, HOUR),
    );
    let err = runner.run().await.unwrap_err();

    match err {
        HarnessError::Record { key, source } => {
            assert_eq!(key, "memory.insert");
            assert!(matches!(source, RecorderError::Closed));
        }
        other => panic!("unexpected error: {other}"),
    }
}
