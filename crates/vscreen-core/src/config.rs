use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::edid::{AspectRatio, Edid};
use crate::errors::VScreenError;

/// Smallest and largest supported buffer ring.
pub const MIN_BUFFERS: usize = 2;
pub const MAX_BUFFERS: usize = 3;

/// A mode advertised in the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeConfig {
    pub width: u32,
    pub aspect: AspectRatio,
    #[serde(alias = "refreshHz")]
    pub refresh: u32,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self { width: 1920, aspect: AspectRatio::R16_9, refresh: 60 }
    }
}

/// Configuration of one virtual display capture session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Index passed to the display subsystem's `open`.
    #[serde(alias = "deviceIndex")]
    pub device_index: i32,
    /// Three-letter PNP vendor id.
    pub vendor: String,
    pub modes: Vec<ModeConfig>,
    #[serde(alias = "maxWidth")]
    pub max_width: u32,
    #[serde(alias = "maxHeight")]
    pub max_height: u32,
    #[serde(alias = "targetFPS")]
    pub target_fps: u32,
    #[serde(alias = "bufferCount")]
    pub buffer_count: usize,
    /// Upper bound on a single readiness wait, so a stop request is seen
    /// even when no pacing deadline is near.
    #[serde(alias = "maxWaitMs")]
    pub max_wait_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_index: 1,
            vendor: "PVR".to_owned(),
            modes: vec![ModeConfig::default()],
            max_width: 1920,
            max_height: 1080,
            target_fps: 60,
            buffer_count: MIN_BUFFERS,
            max_wait_ms: 100,
        }
    }
}

impl CaptureConfig {
    /// Parse a JSON config; unspecified fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, VScreenError> {
        let cfg: Self = serde_json::from_str(json)
            .map_err(|e| VScreenError::ConfigurationInvalid { reason: e.to_string() })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), VScreenError> {
        let invalid = |reason: String| -> Result<(), VScreenError> {
            Err(VScreenError::ConfigurationInvalid { reason })
        };

        if self.target_fps == 0 {
            return invalid("target_fps must be at least 1".into());
        }
        if !(MIN_BUFFERS..=MAX_BUFFERS).contains(&self.buffer_count) {
            return invalid(format!(
                "buffer_count {} outside {}..={}",
                self.buffer_count, MIN_BUFFERS, MAX_BUFFERS
            ));
        }
        if self.max_width == 0 || self.max_height == 0 {
            return invalid("max_width and max_height must be non-zero".into());
        }
        if self.max_wait_ms == 0 {
            return invalid("max_wait_ms must be non-zero".into());
        }
        if self.modes.is_empty() {
            return invalid("at least one mode must be advertised".into());
        }
        Ok(())
    }

    /// Pacing period between update requests.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / self.target_fps.max(1) as u64)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    /// Pixel-count limit handed to the display subsystem at connect.
    pub fn max_pixels(&self) -> u32 {
        self.max_width.saturating_mul(self.max_height)
    }

    /// Build the identification descriptor advertising every configured mode.
    pub fn build_edid(&self) -> Result<Edid, VScreenError> {
        let mut edid = Edid::new(&self.vendor)?;
        for mode in &self.modes {
            edid.add_mode(mode.width, mode.aspect, mode.refresh)?;
        }
        tracing::debug!("EDID built: vendor={} modes={}", self.vendor, edid.mode_count());
        Ok(edid)
    }
}
