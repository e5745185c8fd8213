use std::path::PathBuf;

use anyhow::{Context, Result};
use vscreen_core::CaptureConfig;

/// Runtime settings of one grab session.
#[derive(Debug, Clone)]
pub struct Settings {
    pub capture: CaptureConfig,
    /// Frames to write before exiting; 0 runs until Ctrl-C.
    pub frames: u64,
    pub out_dir: PathBuf,
}

impl Settings {
    /// Read `VSCREEN_CONFIG`, `VSCREEN_FPS`, `VSCREEN_FRAMES` and `VSCREEN_OUT`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut capture = match var("VSCREEN_CONFIG") {
            Some(path) => {
                let json = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config {path}"))?;
                CaptureConfig::from_json(&json).with_context(|| format!("Invalid config {path}"))?
            }
            None => CaptureConfig::default(),
        };

        if let Some(fps) = var("VSCREEN_FPS") {
            capture.target_fps = fps.parse().with_context(|| format!("VSCREEN_FPS={fps:?} is not a number"))?;
        }
        capture.validate().context("Invalid capture settings")?;

        let frames = match var("VSCREEN_FRAMES") {
            Some(n) => n.parse().with_context(|| format!("VSCREEN_FRAMES={n:?} is not a number"))?,
            None => 0,
        };
        let out_dir = var("VSCREEN_OUT").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("frames"));

        Ok(Self { capture, frames, out_dir })
    }
}
