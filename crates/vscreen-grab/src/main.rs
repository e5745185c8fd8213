//! vscreen-grab: plug in a virtual monitor and dump what the compositor draws.
//!
//! # Pipeline
//!
//! ```text
//! CaptureConfig ──► EDID ──► evdi / simulator ──► VirtualDisplay
//!                                                     │ get_frame()  (blocking thread)
//!                                                     ▼
//!                                         Bytes copy ──► tokio mpsc ──► FrameSink
//!                                                                         │
//!                                                     frameNNNN.raw + frames.json
//! ```
//!
//! # Environment
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `VSCREEN_CONFIG` | JSON `CaptureConfig` path | built-in defaults |
//! | `VSCREEN_FPS` | capture rate override | config value |
//! | `VSCREEN_FRAMES` | frames to write, 0 = until Ctrl-C | 0 |
//! | `VSCREEN_OUT` | output directory | `frames` |

mod settings;
mod sink;

use std::time::Instant;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vscreen_capture::{CaptureError, FrameReceiver, VirtualDisplay};
use vscreen_core::CaptureConfig;

use settings::Settings;
use sink::{CapturedFrame, FrameSink};

/// Frames buffered between the capture thread and the writer.
const FRAME_QUEUE: usize = 8;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("vscreen-grab v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::from_env()?;
    let (display, frames) = open_display(&settings.capture)?;
    let sink = FrameSink::create(&settings.out_dir).await?;

    let (tx, rx) = mpsc::channel(FRAME_QUEUE);
    let writer = tokio::spawn(sink.run(rx));
    let limit = settings.frames;
    let mut consumer = tokio::task::spawn_blocking(move || pump(frames, tx, limit));

    let pumped = tokio::select! {
        res = &mut consumer => Some(res),
        res = tokio::signal::ctrl_c() => {
            res.context("Failed to listen for Ctrl-C")?;
            info!("Ctrl-C received, stopping capture");
            None
        }
    };

    let stats = display.stats();
    tokio::task::spawn_blocking(move || display.stop()).await?;

    let delivered = match pumped {
        Some(res) => res?,
        None => consumer.await?,
    }?;
    let written = writer.await??;

    info!("Capture finished: delivered={} written={}", delivered, written);
    info!("Stats: {}", serde_json::to_string(&stats)?);
    Ok(())
}

#[cfg(all(feature = "evdi", target_os = "linux"))]
fn open_display(config: &CaptureConfig) -> Result<(VirtualDisplay, FrameReceiver)> {
    let device = vscreen_capture::EvdiDevice::open(config.device_index)
        .with_context(|| format!("Failed to open evdi device {}", config.device_index))?;
    VirtualDisplay::open(device, config).context("Failed to start capture")
}

#[cfg(not(all(feature = "evdi", target_os = "linux")))]
fn open_display(config: &CaptureConfig) -> Result<(VirtualDisplay, FrameReceiver)> {
    use vscreen_capture::{Completion, SimulatedDevice};

    warn!("Built without evdi support, capturing from the simulated display");
    let (device, _control) = SimulatedDevice::new(Completion::Synchronous);
    VirtualDisplay::open(device, config).context("Failed to start capture")
}

/// Capture thread: copy each frame out of the ring and hand it to the writer.
/// Returns the number of frames forwarded.
fn pump(mut frames: FrameReceiver, tx: mpsc::Sender<CapturedFrame>, limit: u64) -> Result<u64> {
    let start = Instant::now();
    let mut fps = FpsCounter::new();
    let mut last_log = Instant::now();
    let mut sent = 0u64;

    loop {
        let captured = match frames.get_frame() {
            Ok(frame) => CapturedFrame {
                data: Bytes::copy_from_slice(frame.data()),
                width: frame.width(),
                height: frame.height(),
                stride: frame.stride(),
                format: frame.pixel_format().to_string(),
                sequence: frame.sequence(),
                pts_ms: start.elapsed().as_millis() as u64,
            },
            Err(CaptureError::Stopped) => break,
            Err(e) => return Err(e).context("Capture failed"),
        };

        if tx.blocking_send(captured).is_err() {
            warn!("Frame writer gone, stopping capture");
            break;
        }
        sent += 1;
        fps.tick();

        if last_log.elapsed().as_secs() >= 1 {
            let stats = frames.stats();
            info!(
                "Capture: {:.1} fps, delivered={} lost={} skipped={}",
                fps.fps(),
                stats.frames_delivered,
                stats.frames_lost,
                stats.periods_skipped
            );
            last_log = Instant::now();
        }

        if limit > 0 && sent >= limit {
            info!("Captured {} frame(s), done", sent);
            break;
        }
    }
    Ok(sent)
}

// ── FPS counter ───────────────────────────────────────────────────────────────

struct FpsCounter {
    count:        u32,
    window_start: Instant,
    last_fps:     f32,
}

impl FpsCounter {
    fn new() -> Self {
        Self { count: 0, window_start: Instant::now(), last_fps: 0.0 }
    }

    fn tick(&mut self) {
        self.count += 1;
    }

    /// FPS over the window since the last call; resets the window.
    fn fps(&mut self) -> f32 {
        let elapsed = self.window_start.elapsed().as_secs_f32();
        if elapsed >= 0.5 {
            self.last_fps = self.count as f32 / elapsed;
            self.count = 0;
            self.window_start = Instant::now();
        }
        self.last_fps
    }
}
