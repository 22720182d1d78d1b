use super::{Backend, BackendError};
use crate::harness::{align_down, DownsampleWindow};
use crate::packet::{Measurement, Packet};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;

type SeriesKey = (DateTime<Utc>, u32, u32);
type ResolutionKey = (DateTime<Utc>, u32, u32, Measurement);

#[derive(Debug, Default)]
struct MemoryState {
    /// Raw readings folded into `(sum, count)` per bucket/asset/attribute.
    raw: BTreeMap<SeriesKey, (f64, u64)>,
    resolution: BTreeMap<ResolutionKey, f64>,
    insert_batches: Vec<usize>,
}

/// In-process store used for dry runs and harness tests.
#[derive(Debug)]
pub struct MemoryBackend {
    bucket_ms: i64,
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new(bucket: Duration) -> Self {
        Self {
            bucket_ms: i64::try_from(bucket.as_millis()).unwrap_or(i64::MAX).max(1),
            state: Mutex::new(MemoryState::default()),
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn insert(&self, packets: Vec<Packet>) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        state.insert_batches.push(packets.len());
        for packet in packets
            .iter()
            .filter(|p| p.measurement == Measurement::Raw)
        {
            let bucket = align_down(packet.timestamp, self.bucket_ms);
            let entry = state
                .raw
                .entry((bucket, packet.asset_id, packet.attribute_id))
                .or_insert((0.0, 0));
            entry.0 += packet.value;
            entry.1 += 1;
        }
        Ok(())
    }

    async fn downsample(&self, window: DownsampleWindow) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        let means: Vec<(SeriesKey, f64)> = state
            .raw
            .range((window.start, 0, 0)..(window.end, 0, 0))
            .filter(|(_, (_, count))| *count > 0)
            .map(|(key, (sum, count))| (*key, sum / *count as f64))
            .collect();
        let rows = means.len();
        for ((timestamp, asset_id, attribute_id), mean) in means {
            state
                .resolution
                .insert((timestamp, asset_id, attribute_id, Measurement::Mean), mean);
        }
        tracing::debug!(rows, %window, "downsampled window in memory");
        Ok(())
    }
}

#[cfg(test)]
impl MemoryBackend {
    pub async fn insert_batches(&self) -> Vec<usize> {
        self.state.lock().await.insert_batches.clone()
    }

    pub async fn resolution_rows(&self) -> Vec<(ResolutionKey, f64)> {
        self.state
            .lock()
            .await
            .resolution
            .iter()
            .map(|(key, value)| (*key, *value))
            .collect()
    }
}
