use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::assets::SOURCE_BYTES_PER_PIXEL;
use crate::capture::display::{DisplayCatalog, DisplayDescriptor, StaticCatalog};
use crate::capture::{CaptureHandle, CaptureSource, PixelLayout, RawSample, StreamInput};
use crate::config::StreamConfig;
use crate::error::CaptureError;

/// Test-pattern capture source.
///
/// Emits a moving gradient at the configured frame rate from a tokio task,
/// cropped to the stream's rectangle. Displays come from a [`DisplayCatalog`].
pub struct SyntheticSource {
    catalog: Arc<dyn DisplayCatalog>,
    layout: PixelLayout,
    row_padding: usize,
    fault_after: Option<u64>,
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new(Arc::new(StaticCatalog::single_full_hd()))
    }
}

impl SyntheticSource {
    pub fn new(catalog: Arc<dyn DisplayCatalog>) -> Self {
        Self {
            catalog,
            layout: PixelLayout::Argb,
            row_padding: 0,
            fault_after: None,
        }
    }

    /// Synthetic source over the operating system's real display list.
    #[cfg(feature = "os-displays")]
    pub fn with_os_displays() -> Self {
        Self::new(Arc::new(crate::capture::display::OsDisplayCatalog))
    }

    pub fn with_layout(mut self, layout: PixelLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Pad every emitted row with `bytes` extra bytes.
    pub fn with_row_padding(mut self, bytes: usize) -> Self {
        self.row_padding = bytes;
        self
    }

    /// Report a runtime fault after `frames` samples instead of running forever.
    pub fn with_fault_after(mut self, frames: u64) -> Self {
        self.fault_after = Some(frames);
        self
    }

    fn fill_pattern(buf: &mut [u8], width: u32, height: u32, stride: usize, tick: u64, layout: PixelLayout) {
        let (r, g, b) = layout.rgb_offsets();
        let alpha = match layout {
            PixelLayout::Argb => 0,
            PixelLayout::Bgra => 3,
        };
        for y in 0..height as usize {
            let row = &mut buf[y * stride..y * stride + width as usize * SOURCE_BYTES_PER_PIXEL];
            for (x, px) in row.chunks_exact_mut(SOURCE_BYTES_PER_PIXEL).enumerate() {
                px[alpha] = 0xFF;
                px[r] = (x as u64 + tick) as u8;
                px[g] = y as u8;
                px[b] = tick as u8;
            }
        }
    }
}

struct SyntheticHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl CaptureHandle for SyntheticHandle {
    async fn stop(&mut self) -> Result<(), CaptureError> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| CaptureError::unknown(format!("Synthetic capture task failed: {}", e)))?;
        }
        Ok(())
    }
}

impl Drop for SyntheticHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl CaptureSource for SyntheticSource {
    async fn available_displays(&self) -> Result<Vec<DisplayDescriptor>, CaptureError> {
        self.catalog
            .available_displays()
            .map_err(|e| CaptureError::unknown(format!("{:#}", e)))
    }

    async fn open(
        &self,
        config: StreamConfig,
        input: StreamInput,
    ) -> Result<Box<dyn CaptureHandle>, CaptureError> {
        let display = self.find_display(config.display_id).await?;
        let crop = config.crop;
        if crop.w == 0 || crop.h == 0 || !crop.fits_within(display.width, display.height) {
            return Err(CaptureError::start_failure(format!(
                "Crop {:?} does not fit display {} ({} x {})",
                crop, display.id, display.width, display.height
            )));
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let layout = self.layout;
        let stride = crop.w as usize * SOURCE_BYTES_PER_PIXEL + self.row_padding;
        let fault_after = self.fault_after;
        let interval = config.frame_interval();

        log::info!(
            "Synthetic capture on {} ({}x{} crop at {},{}) every {:?}",
            display,
            crop.w,
            crop.h,
            crop.x,
            crop.y,
            interval
        );

        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; stride * crop.h as usize];
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut tick: u64 = 0;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if fault_after.is_some_and(|limit| tick >= limit) {
                    input.on_stream_fault(format!("synthetic fault after {} frames", tick));
                    break;
                }

                SyntheticSource::fill_pattern(&mut buf, crop.w, crop.h, stride, tick, layout);
                let sample = RawSample::new(crop.w, crop.h, stride, &buf).with_layout(layout);
                input.on_raw_frame(&sample);
                tick += 1;
            }

            log::debug!("Synthetic capture task ended after {} frames", tick);
        });

        Ok(Box::new(SyntheticHandle {
            cancel,
            task: Some(task),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureStream, Frame, StreamStopped};
    use crate::config::{CropRect, StreamKind};
    use crate::pipeline::state::StreamState;
    use tokio::sync::mpsc;

    fn stream_on(
        source: SyntheticSource,
        config: StreamConfig,
    ) -> (CaptureStream, mpsc::UnboundedReceiver<Vec<u8>>, mpsc::UnboundedReceiver<StreamStopped>) {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let sink = move |frame: &Frame<'_>| -> anyhow::Result<()> {
            frame_tx.send(frame.data.to_vec())?;
            Ok(())
        };
        let observer = move |event: StreamStopped| {
            let _ = stop_tx.send(event);
        };
        let stream = CaptureStream::new(
            StreamKind::Region,
            config,
            Arc::new(source),
            Arc::new(sink),
            Arc::new(observer),
        );
        (stream, frame_rx, stop_rx)
    }

    fn region(crop: CropRect, fps: u32) -> StreamConfig {
        StreamConfig::new(0, crop, fps)
    }

    #[tokio::test]
    async fn test_emits_rgb_frames() {
        let source = SyntheticSource::default().with_row_padding(12);
        let (stream, mut frames, _stopped) = stream_on(source, region(CropRect::new(10, 10, 8, 4), 120));

        stream.start().await.expect("synthetic source starts");
        let first = frames.recv().await.expect("a frame");
        assert_eq!(first.len(), 8 * 4 * 3);
        // red follows x, green follows y
        assert_eq!(first[3], first[0].wrapping_add(1));
        assert_eq!(first[8 * 3 + 1], 1);

        stream.stop();
        assert_eq!(stream.wait_terminal().await, StreamState::Stopped);
    }

    #[tokio::test]
    async fn test_bgra_layout_converts_to_same_pattern() {
        let source = SyntheticSource::default().with_layout(PixelLayout::Bgra);
        let (stream, mut frames, _stopped) = stream_on(source, region(CropRect::new(0, 0, 4, 2), 120));

        stream.start().await.unwrap();
        let frame = frames.recv().await.unwrap();
        // tick 0: r = x, g = y, b = 0
        assert_eq!(&frame[..6], &[0, 0, 0, 1, 0, 0]);
        stream.stop();
    }

    #[tokio::test]
    async fn test_unknown_display() {
        let config = StreamConfig::new(9, CropRect::new(0, 0, 10, 10), 5);
        let (stream, _frames, _stopped) = stream_on(SyntheticSource::default(), config);

        let result = stream.start().await;
        assert_eq!(result, Err(CaptureError::ResourceNotFound { display_id: 9 }));
        assert_eq!(stream.state(), StreamState::Error);
    }

    #[tokio::test]
    async fn test_crop_outside_display_rejected() {
        let (stream, _frames, _stopped) =
            stream_on(SyntheticSource::default(), region(CropRect::new(1900, 0, 100, 100), 30));

        let result = stream.start().await;
        assert!(matches!(result, Err(CaptureError::SourceStartFailure { .. })));
    }

    #[tokio::test]
    async fn test_fault_after_frames() {
        let source = SyntheticSource::default().with_fault_after(2);
        let (stream, mut frames, mut stopped) = stream_on(source, region(CropRect::new(0, 0, 2, 2), 120));

        stream.start().await.unwrap();
        let event = stopped.recv().await.expect("fault notification");
        assert!(matches!(event.cause, Some(CaptureError::SourceRuntimeFault { .. })));
        assert_eq!(stream.state(), StreamState::Error);

        let mut delivered = 0;
        while frames.try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(delivered, 2);
    }
}
