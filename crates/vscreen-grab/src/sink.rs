//! Raw frame dump: `frameNNNN.raw` per frame plus a `frames.json` index.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// A frame copied out of the capture ring.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Tightly packed rows, `height * stride` bytes.
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: String,
    pub sequence: u64,
    /// Milliseconds since capture started.
    pub pts_ms: u64,
}

/// One entry of `frames.json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameRecord {
    pub file: String,
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: String,
    pub pts_ms: u64,
    pub bytes: usize,
}

pub struct FrameSink {
    dir: PathBuf,
    records: Vec<FrameRecord>,
}

impl FrameSink {
    pub async fn create(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
        Ok(Self { dir: dir.to_path_buf(), records: Vec::new() })
    }

    pub async fn write(&mut self, frame: &CapturedFrame) -> Result<()> {
        let file = format!("frame{:04}.raw", self.records.len());
        let path = self.dir.join(&file);
        tokio::fs::write(&path, &frame.data)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        debug!("Wrote {} ({} bytes, seq {})", file, frame.data.len(), frame.sequence);

        self.records.push(FrameRecord {
            file,
            sequence: frame.sequence,
            width: frame.width,
            height: frame.height,
            stride: frame.stride,
            format: frame.format.clone(),
            pts_ms: frame.pts_ms,
            bytes: frame.data.len(),
        });
        Ok(())
    }

    /// Write the index and return how many frames were stored.
    pub async fn finish(self) -> Result<usize> {
        let path = self.dir.join("frames.json");
        let json = serde_json::to_vec_pretty(&self.records)?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Wrote {} frame(s) to {}", self.records.len(), self.dir.display());
        Ok(self.records.len())
    }

    /// Drain `rx` into the sink until every sender is gone.
    pub async fn run(mut self, mut rx: mpsc::Receiver<CapturedFrame>) -> Result<usize> {
        while let Some(frame) = rx.recv().await {
            self.write(&frame).await?;
        }
        self.finish().await
    }
}
