//! Traits at the seams of the capture pipeline

use super::Frame;
use super::display::DisplayDescriptor;
use super::stream::StreamInput;
use crate::config::{StreamConfig, StreamKind};
use crate::error::CaptureError;
use async_trait::async_trait;

/// Platform capture source.
///
/// `open` registers a stream with the platform and resolves once the source
/// has accepted (or rejected) it. Samples are then pushed into `input` from the
/// source's own delivery context until the returned handle is stopped.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    async fn available_displays(&self) -> Result<Vec<DisplayDescriptor>, CaptureError>;

    async fn find_display(&self, display_id: u32) -> Result<DisplayDescriptor, CaptureError> {
        self.available_displays()
            .await?
            .into_iter()
            .find(|d| d.id == display_id)
            .ok_or(CaptureError::ResourceNotFound { display_id })
    }

    async fn open(
        &self,
        config: StreamConfig,
        input: StreamInput,
    ) -> Result<Box<dyn CaptureHandle>, CaptureError>;
}

/// A registered platform stream.
#[async_trait]
pub trait CaptureHandle: Send {
    /// Ask the source to cease delivery. After this resolves no further sample
    /// reaches the stream input.
    async fn stop(&mut self) -> Result<(), CaptureError>;
}

/// Downstream consumer of converted frames.
///
/// The frame is only valid for the duration of the call.
pub trait FrameSink: Send + Sync {
    fn on_frame_ready(&self, frame: &Frame<'_>) -> anyhow::Result<()>;
}

impl<F> FrameSink for F
where
    F: Fn(&Frame<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn on_frame_ready(&self, frame: &Frame<'_>) -> anyhow::Result<()> {
        self(frame)
    }
}

/// Notification emitted exactly once when a stream stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStopped {
    pub kind: StreamKind,
    /// Session generation that created the stream.
    pub generation: u64,
    /// `None` for a requested stop.
    pub cause: Option<CaptureError>,
}

pub trait StopObserver: Send + Sync {
    fn on_stream_stopped(&self, event: StreamStopped);
}

impl<F> StopObserver for F
where
    F: Fn(StreamStopped) + Send + Sync,
{
    fn on_stream_stopped(&self, event: StreamStopped) {
        self(event)
    }
}
