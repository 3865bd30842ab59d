//! Health counters and diagnostics for capture streams

use crate::capture::{DropStats, PoolStats};
use std::sync::atomic::{AtomicU64, Ordering};

/// Delivery-path counters for one stream
///
/// All fields use atomic operations; they are written from the source's
/// delivery context and read from the control context.
pub struct StreamHealth {
    /// Frames handed to the sink
    pub frames_delivered: AtomicU64,

    /// Bytes handed to the sink
    pub bytes_delivered: AtomicU64,

    /// Samples that arrived after the stream stopped accepting
    pub late_frames: AtomicU64,

    /// Samples rejected before conversion
    pub malformed_samples: AtomicU64,

    /// Sink calls that returned an error or panicked
    pub sink_failures: AtomicU64,
}

impl StreamHealth {
    pub fn new() -> Self {
        Self {
            frames_delivered: AtomicU64::new(0),
            bytes_delivered: AtomicU64::new(0),
            late_frames: AtomicU64::new(0),
            malformed_samples: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
        }
    }

    /// Record a delivered frame; returns the delivered count including it.
    pub fn record_frame(&self, size: usize) -> u64 {
        self.bytes_delivered.fetch_add(size as u64, Ordering::Relaxed);
        self.frames_delivered.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_late_frame(&self) -> u64 {
        self.late_frames.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_malformed(&self) -> u64 {
        self.malformed_samples.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_sink_failure(&self) -> u64 {
        self.sink_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered.load(Ordering::Relaxed)
    }

    pub fn bytes_delivered(&self) -> u64 {
        self.bytes_delivered.load(Ordering::Relaxed)
    }

    pub fn late_frames(&self) -> u64 {
        self.late_frames.load(Ordering::Relaxed)
    }

    pub fn malformed_samples(&self) -> u64 {
        self.malformed_samples.load(Ordering::Relaxed)
    }

    pub fn sink_failures(&self) -> u64 {
        self.sink_failures.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.frames_delivered.store(0, Ordering::Relaxed);
        self.bytes_delivered.store(0, Ordering::Relaxed);
        self.late_frames.store(0, Ordering::Relaxed);
        self.malformed_samples.store(0, Ordering::Relaxed);
        self.sink_failures.store(0, Ordering::Relaxed);
    }
}

impl Default for StreamHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of a stream's pool, dropper and delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamDiagnostics {
    pub outstanding_buffers: usize,
    pub peak_outstanding_buffers: usize,
    pub buffers_created: u64,
    pub frames_seen: u64,
    pub frames_dropped: u64,
    pub frames_delivered: u64,
    pub bytes_delivered: u64,
    pub drop_rate_percent: f64,
    pub late_frames: u64,
    pub malformed_samples: u64,
    pub sink_failures: u64,
}

impl StreamDiagnostics {
    pub fn collect(pool: PoolStats, drops: DropStats, health: &StreamHealth) -> Self {
        Self {
            outstanding_buffers: pool.outstanding,
            peak_outstanding_buffers: pool.peak_outstanding,
            buffers_created: pool.total_created,
            frames_seen: drops.total,
            frames_dropped: drops.dropped,
            frames_delivered: health.frames_delivered(),
            bytes_delivered: health.bytes_delivered(),
            drop_rate_percent: drops.drop_rate_percent,
            late_frames: health.late_frames(),
            malformed_samples: health.malformed_samples(),
            sink_failures: health.sink_failures(),
        }
    }
}

impl std::fmt::Display for StreamDiagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} delivered / {} seen ({} dropped, {:.2}%), {} buffers out (peak {}, {} created), {} late, {} malformed, {} sink failures",
            self.frames_delivered,
            self.frames_seen,
            self.frames_dropped,
            self.drop_rate_percent,
            self.outstanding_buffers,
            self.peak_outstanding_buffers,
            self.buffers_created,
            self.late_frames,
            self.malformed_samples,
            self.sink_failures
        )
    }
}
