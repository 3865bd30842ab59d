//! Screen capture delivery core.
//!
//! A [`CaptureSession`] drives two [`CaptureStream`]s (a cropped region and the
//! full display) over a platform [`CaptureSource`], converting each raw
//! alpha-first sample to packed RGB888 and handing it to a consumer sink with
//! pooled buffers and backpressure-aware frame dropping.

pub mod assets;
pub mod capture;
pub mod config;
pub mod error;
pub mod pipeline;

pub use capture::{
    CaptureHandle, CaptureSource, CaptureStream, Frame, FrameSink, PixelLayout, RawSample,
    StopObserver, StreamInput, StreamStopped, SyntheticSource,
};
pub use config::{CropRect, SessionConfig, StreamConfig, StreamKind};
pub use error::{CaptureError, ErrorReport};
pub use pipeline::{CaptureSession, SessionCallbacks, SessionStatus, StreamState};
