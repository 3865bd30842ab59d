//! Stream and session state management

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

/// Stream state machine
///
/// `Idle → Starting → Running → Stopping → Stopped`, with the terminal `Error`
/// reachable from `Starting` or `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created, nothing requested from the source yet
    Idle,

    /// Registration with the source is in progress
    Starting,

    /// Source is delivering samples
    Running {
        /// When the source accepted the stream
        started_at: Instant,
    },

    /// Stop requested, source not yet confirmed
    Stopping,

    /// Stopped normally; cannot be restarted
    Stopped,

    /// Source rejected or lost the stream
    Error,
}

impl StreamState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &StreamState) -> bool {
        use StreamState::*;

        match (self, target) {
            (Idle, Starting) => true,

            (Starting, Running { .. }) => true,
            (Starting, Stopping) => true,
            (Starting, Error) => true,

            (Running { .. }, Stopping) => true,
            (Running { .. }, Error) => true,

            (Stopping, Stopped) => true,
            // a stop request can race a source fault
            (Stopping, Error) => true,

            (Stopped, _) | (Error, _) => false,

            _ => false,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            StreamState::Idle => "Idle",
            StreamState::Starting => "Starting",
            StreamState::Running { .. } => "Running",
            StreamState::Stopping => "Stopping",
            StreamState::Stopped => "Stopped",
            StreamState::Error => "Error",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, StreamState::Running { .. })
    }

    /// Stopped or Error: nothing more will happen on this stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamState::Stopped | StreamState::Error)
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Aggregate status of a capture session as seen by the consumer.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Success = 0,
    InitializationFailed = 1,
    NoDisplaysFound = 2,
    StartCaptureFailed = 3,
    UnknownError = 4,
}

impl SessionStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SessionStatus::Success),
            1 => Some(SessionStatus::InitializationFailed),
            2 => Some(SessionStatus::NoDisplaysFound),
            3 => Some(SessionStatus::StartCaptureFailed),
            4 => Some(SessionStatus::UnknownError),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_success(self) -> bool {
        self == SessionStatus::Success
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            SessionStatus::Success => "success",
            SessionStatus::InitializationFailed => "initialization failed",
            SessionStatus::NoDisplaysFound => "no displays found",
            SessionStatus::StartCaptureFailed => "start capture failed",
            SessionStatus::UnknownError => "unknown error",
        };
        f.write_str(text)
    }
}

/// Lock-free holder for the session status.
#[derive(Debug, Default)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new(status: SessionStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub fn get(&self) -> SessionStatus {
        SessionStatus::from_u8(self.0.load(Ordering::Acquire)).unwrap_or(SessionStatus::UnknownError)
    }

    pub fn set(&self, status: SessionStatus) {
        self.0.store(status as u8, Ordering::Release);
    }
}
