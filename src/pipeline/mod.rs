//! Capture pipeline control layer
//!
//! Separates the delivery path (in `capture`) from lifecycle control:
//! - State: stream state machine and the aggregate session status
//! - Health: per-stream counters and diagnostic snapshots
//! - Session: supervises the region and full-screen streams as one unit

pub mod health;
pub mod session;
pub mod state;

pub use health::{StreamDiagnostics, StreamHealth};
pub use session::{CaptureSession, SessionCallbacks, SessionDiagnostics, SessionOptions};
pub use state::{SessionStatus, StatusCell, StreamState};
