//! Producer thread: readiness wait → event dispatch → paced update request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};
use vscreen_core::{DisplayMode, DpmsMode};

use crate::device::{DeviceContext, DisplaySubsystem, EventHandler};
use crate::error::{CaptureError, WaitError};
use crate::pacer::FramePacer;
use crate::pool::BufferPool;
use crate::sync::Shared;

/// Lost-frame and skipped-period totals are warned about on the first
/// occurrence and then once per this many.
const WARN_EVERY: u64 = 100;

pub(crate) struct Dispatcher<D: DisplaySubsystem> {
    device: D,
    shared: Arc<Shared>,
    pool: BufferPool,
    pacer: FramePacer,
    max_wait: Duration,
}

impl<D: DisplaySubsystem> Dispatcher<D> {
    pub fn new(device: D, shared: Arc<Shared>, period: Duration, max_wait: Duration) -> Self {
        let pool = BufferPool::new(Arc::clone(&shared));
        Self {
            device,
            shared,
            pool,
            pacer: FramePacer::new(period, Instant::now()),
            max_wait,
        }
    }

    /// Run until the stop flag is raised. Teardown happens in `Drop`, so it
    /// also runs if a handler panics.
    pub fn run(mut self) {
        info!(
            "Producer started ({} buffers, period {:?})",
            self.pool.len(),
            self.pacer.period()
        );

        while !self.shared.is_stopping() {
            self.step();
        }
    }

    fn step(&mut self) {
        let timeout = self.pacer.timeout(Instant::now()).min(self.max_wait);
        match self.device.wait_ready(timeout) {
            Ok(true) => self.dispatch(),
            Ok(false) => {}
            Err(WaitError::Interrupted) => {
                debug!("Readiness wait interrupted, retrying");
                return;
            }
            Err(WaitError::Io(e)) => {
                error!("Display subsystem wait failed: {}", e);
                std::process::abort();
            }
        }

        if self.pacer.is_due(Instant::now()) {
            self.request_update();
            let skipped = self.pacer.advance(Instant::now());
            if skipped > 0 {
                let total = self.shared.record_skipped(skipped);
                if warn_due(total - skipped, total) {
                    warn!("Producer behind: skipped {} period(s), {} total", skipped, total);
                } else {
                    debug!("Producer behind, skipped {} period(s)", skipped);
                }
            }
        }
    }

    fn dispatch(&mut self) {
        trace!("Events ready to process");
        let mut handlers = Handlers { shared: &self.shared, pool: &mut self.pool };
        self.device.dispatch_events(&mut handlers);
    }

    fn request_update(&mut self) {
        let Some(slot) = self.shared.begin_update() else {
            return;
        };
        if self.device.request_update(slot) {
            trace!("Update slot={} completed synchronously", slot);
            frame_complete(&self.shared, self.device.context(), slot);
        } else {
            trace!("Update slot={} pending", slot);
        }
    }
}

impl<D: DisplaySubsystem> Drop for Dispatcher<D> {
    fn drop(&mut self) {
        self.shared.stop();
        self.pool.release_all(self.device.context());
        self.device.disconnect();
        let stats = self.shared.stats();
        info!(
            "Producer stopped: completed={} delivered={} lost={}",
            stats.frames_completed, stats.frames_delivered, stats.frames_lost
        );
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// Callback table handed to the display subsystem for one dispatch.
struct Handlers<'a> {
    shared: &'a Shared,
    pool: &'a mut BufferPool,
}

impl EventHandler for Handlers<'_> {
    fn on_mode_changed(&mut self, ctx: &mut dyn DeviceContext, mode: DisplayMode) {
        mode_changed(self.shared, self.pool, ctx, mode);
    }

    fn on_update_ready(&mut self, ctx: &mut dyn DeviceContext, slot: usize) {
        frame_complete(self.shared, ctx, slot);
    }

    fn on_dpms(&mut self, mode: DpmsMode) {
        info!("DPMS mode: {:?}", mode);
        self.shared.record_dpms(Some(mode));
    }

    fn on_crtc_state(&mut self, state: i32) {
        debug!("CRTC state: {}", state);
    }
}

/// Reallocate only when the frame's total size changes; always remember the
/// latest mode for frame metadata.
fn mode_changed(shared: &Shared, pool: &mut BufferPool, ctx: &mut dyn DeviceContext, mode: DisplayMode) {
    info!("Mode changed: {}", mode);
    let previous = shared.mode().unwrap_or_default();
    if previous.needs_realloc(&mode) {
        if let Err(CaptureError::Stopped) = pool.reconcile(ctx, &mode) {
            debug!("Reallocation abandoned, shutting down");
            return;
        }
    } else {
        debug!("Frame size unchanged, keeping buffers");
    }
    shared.set_mode(mode);
}

fn frame_complete(shared: &Shared, ctx: &mut dyn DeviceContext, slot: usize) {
    let start = Instant::now();
    let rects = ctx.grab_pixels();
    debug!(
        "grab_pixels slot={} took {}us, {} rect(s)",
        slot,
        start.elapsed().as_micros(),
        rects.len()
    );
    for r in &rects {
        trace!("  {} ({} px)", r, r.area());
    }
    shared.record_dirty_rects(rects.len());

    if shared.complete(slot) {
        let lost = shared.stats().frames_lost;
        if warn_due(lost - 1, lost) {
            warn!("Consumer falling behind: {} frame(s) lost", lost);
        }
    }
}

/// True when a counter moving from `before` to `after` starts at zero or
/// crosses a multiple of [`WARN_EVERY`].
fn warn_due(before: u64, after: u64) -> bool {
    after > before && (before == 0 || before / WARN_EVERY != after / WARN_EVERY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warns_on_first_and_every_hundredth() {
        let warned: Vec<u64> = (1..=350).filter(|n| warn_due(n - 1, *n)).collect();
        assert_eq!(warned, [1, 100, 200, 300]);
    }

    #[test]
    fn multi_period_jump_across_boundary_warns() {
        assert!(warn_due(0, 3));
        assert!(warn_due(98, 101));
        assert!(!warn_due(101, 150));
        assert!(warn_due(150, 260));
        assert!(!warn_due(5, 5));
    }
}
