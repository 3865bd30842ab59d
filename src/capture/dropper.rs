use super::frame_pool::PoolStats;
use crate::assets::{DROP_BACKLOG_CEILING, DROP_BURST_BACKLOG, DROP_BURST_INTERVAL};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Admission thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropPolicy {
    /// Drop whenever more buffers than this are in flight.
    pub backlog_ceiling: usize,
    /// Drop bursty arrivals when more buffers than this are in flight.
    pub burst_backlog: usize,
    /// Arrivals closer together than this count as a burst.
    pub burst_interval: Duration,
}

impl Default for DropPolicy {
    fn default() -> Self {
        Self {
            backlog_ceiling: DROP_BACKLOG_CEILING,
            burst_backlog: DROP_BURST_BACKLOG,
            burst_interval: DROP_BURST_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DropStats {
    pub dropped: u64,
    pub total: u64,
    pub drop_rate_percent: f64,
}

#[derive(Default)]
struct DropperState {
    last_seen: Option<Instant>,
    total: u64,
    dropped: u64,
}

/// Per-stream admission controller deciding whether an incoming sample is
/// converted or discarded.
pub struct FrameDropper {
    state: Mutex<DropperState>,
    policy: DropPolicy,
}

impl Default for FrameDropper {
    fn default() -> Self {
        Self::new(DropPolicy::default())
    }
}

impl FrameDropper {
    pub fn new(policy: DropPolicy) -> Self {
        Self {
            state: Mutex::new(DropperState::default()),
            policy,
        }
    }

    pub fn policy(&self) -> DropPolicy {
        self.policy
    }

    /// Returns `true` when the sample arriving at `now` should be discarded.
    pub fn should_drop(&self, pool: PoolStats, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        let since_last = state
            .last_seen
            .map(|last| now.saturating_duration_since(last));

        let over_ceiling = pool.outstanding > self.policy.backlog_ceiling;
        let burst = since_last.is_some_and(|gap| gap < self.policy.burst_interval)
            && pool.outstanding > self.policy.burst_backlog;
        let drop = over_ceiling || burst;

        state.last_seen = Some(now);
        state.total += 1;
        if drop {
            state.dropped += 1;
        }
        drop
    }

    pub fn stats(&self) -> DropStats {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let drop_rate_percent = if state.total == 0 {
            0.0
        } else {
            state.dropped as f64 / state.total as f64 * 100.0
        };
        DropStats {
            dropped: state.dropped,
            total: state.total,
            drop_rate_percent,
        }
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        *state = DropperState::default();
    }
}
