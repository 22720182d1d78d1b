use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Stopped,
}

#[derive(Debug)]
pub struct RunStats {
    running: AtomicBool,
    pub inserts_dispatched: AtomicU64,
    pub inserts_completed: AtomicU64,
    pub packets_offered: AtomicU64,
    pub downsamples_dispatched: AtomicU64,
    pub downsamples_completed: AtomicU64,
    pub in_flight: AtomicU64,
    pub max_in_flight: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub inserts_dispatched: u64,
    pub inserts_completed: u64,
    pub packets_offered: u64,
    pub downsamples_dispatched: u64,
    pub downsamples_completed: u64,
    pub in_flight: u64,
    pub max_in_flight: u64,
}

impl RunStats {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            inserts_dispatched: AtomicU64::new(0),
            inserts_completed: AtomicU64::new(0),
            packets_offered: AtomicU64::new(0),
            downsamples_dispatched: AtomicU64::new(0),
            downsamples_completed: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            max_in_flight: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> RunState {
        if self.running.load(Ordering::Acquire) {
            RunState::Running
        } else {
            RunState::Stopped
        }
    }

    pub(super) fn set_state(&self, state: RunState) {
        self.running
            .store(state == RunState::Running, Ordering::Release);
    }

    /// Marks one operation as in flight until the returned guard drops.
    pub(super) fn enter(self: &Arc<Self>) -> InFlightGuard {
        let current = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_in_flight.fetch_max(current, Ordering::Relaxed);
        InFlightGuard {
            stats: self.clone(),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            inserts_dispatched: self.inserts_dispatched.load(Ordering::Relaxed),
            inserts_completed: self.inserts_completed.load(Ordering::Relaxed),
            packets_offered: self.packets_offered.load(Ordering::Relaxed),
            downsamples_dispatched: self.downsamples_dispatched.load(Ordering::Relaxed),
            downsamples_completed: self.downsamples_completed.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            max_in_flight: self.max_in_flight.load(Ordering::Relaxed),
        }
    }
}

pub(super) struct InFlightGuard {
    stats: Arc<RunStats>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.stats.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
