use crate::assets::{FRAME_BYTES_PER_PIXEL, FULL_SCREEN_FRAME_RATE, MAX_FRAME_RATE, REGION_FRAME_RATE};
use crate::error::CaptureError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Which of the two session streams a stream is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Region,
    FullScreen,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Region => write!(f, "region"),
            StreamKind::FullScreen => write!(f, "full-screen"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl CropRect {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    /// Whether this rect lies entirely inside a `width`x`height` surface.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        let right = self.x as u64 + self.w as u64;
        let bottom = self.y as u64 + self.h as u64;
        right <= width as u64 && bottom <= height as u64
    }
}

/// Per-stream capture parameters, fixed for the lifetime of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub display_id: u32,
    pub crop: CropRect,
    pub frame_rate: u32,
}

impl StreamConfig {
    pub fn new(display_id: u32, crop: CropRect, frame_rate: u32) -> Self {
        Self {
            display_id,
            crop,
            frame_rate: frame_rate.max(1),
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.frame_rate.max(1) as u64)
    }

    /// Size in bytes of one converted frame at the configured crop size.
    pub fn frame_len(&self) -> usize {
        self.crop.w as usize * self.crop.h as usize * FRAME_BYTES_PER_PIXEL
    }
}

/// Parameters of a `CaptureSession::start` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(alias = "displayId")]
    pub display_id: u32,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    #[serde(alias = "regionFrameRate")]
    pub region_frame_rate: i32,
    #[serde(alias = "fullScreenFrameRate")]
    pub full_screen_frame_rate: i32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            display_id: 0,
            x: 0,
            y: 0,
            width: 640,
            height: 480,
            region_frame_rate: REGION_FRAME_RATE as i32,
            full_screen_frame_rate: FULL_SCREEN_FRAME_RATE as i32,
        }
    }
}

impl SessionConfig {
    pub fn new(
        display_id: u32,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        region_frame_rate: i32,
        full_screen_frame_rate: i32,
    ) -> Self {
        Self {
            display_id,
            x,
            y,
            width,
            height,
            region_frame_rate,
            full_screen_frame_rate,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, CaptureError> {
        serde_json::from_str(json)
            .map_err(|e| CaptureError::validation(format!("Malformed session config: {}", e)))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            CaptureError::validation(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Validate geometry and frame rates before any resource is touched.
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.x < 0 || self.y < 0 {
            return Err(CaptureError::validation(format!(
                "Region origin must not be negative (got {},{})",
                self.x, self.y
            )));
        }

        if self.width <= 0 || self.height <= 0 {
            return Err(CaptureError::validation(format!(
                "Region width and height must be greater than 0 (got {}x{})",
                self.width, self.height
            )));
        }

        for (name, fps) in [
            ("Region", self.region_frame_rate),
            ("Full-screen", self.full_screen_frame_rate),
        ] {
            if fps <= 0 || fps as u32 > MAX_FRAME_RATE {
                return Err(CaptureError::validation(format!(
                    "{} frame rate must be between 1 and {} fps (got {})",
                    name, MAX_FRAME_RATE, fps
                )));
            }
        }

        Ok(())
    }

    /// Region crop rectangle. Only meaningful after `validate` succeeded.
    pub fn region(&self) -> CropRect {
        CropRect::new(
            self.x.max(0) as u32,
            self.y.max(0) as u32,
            self.width.max(0) as u32,
            self.height.max(0) as u32,
        )
    }

    pub fn region_stream(&self) -> StreamConfig {
        StreamConfig::new(self.display_id, self.region(), self.region_frame_rate.max(1) as u32)
    }

    pub fn full_screen_stream(&self, display_width: u32, display_height: u32) -> StreamConfig {
        StreamConfig::new(
            self.display_id,
            CropRect::new(0, 0, display_width, display_height),
            self.full_screen_frame_rate.max(1) as u32,
        )
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}
