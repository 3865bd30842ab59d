use std::time::Duration;

pub const REGION_FRAME_RATE: u32 = 30;
pub const FULL_SCREEN_FRAME_RATE: u32 = 5;
pub const MAX_FRAME_RATE: u32 = 120;

// output format
pub const SOURCE_BYTES_PER_PIXEL: usize = 4;
pub const FRAME_BYTES_PER_PIXEL: usize = 3;

// buffer pool
pub const POOL_MAX_DEPTH: usize = 3;
/// A pooled buffer up to `size / 4` bytes larger than requested may be handed out.
pub const POOL_GROW_TOLERANCE_DIVISOR: usize = 4;
/// Within `size / 10` bytes of overhead a larger buffer is reused without truncation.
pub const POOL_REUSE_OVERHEAD_DIVISOR: usize = 10;

// frame dropper
pub const DROP_BACKLOG_CEILING: usize = 15;
pub const DROP_BURST_BACKLOG: usize = 5;
pub const DROP_BURST_INTERVAL: Duration = Duration::from_millis(16);

// logging cadence on the delivery path
pub const LOG_EVERY_N_FRAMES: u64 = 30;
pub const LOG_EVERY_N_DROPS: u64 = 30;
