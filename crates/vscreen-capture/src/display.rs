//! Public handle: connect a virtual display, pull frames, stop.

use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{info, warn};
use vscreen_core::{CaptureConfig, DisplayMode, PixelFormat};

use crate::device::DisplaySubsystem;
use crate::dispatcher::Dispatcher;
use crate::error::CaptureError;
use crate::sync::{CaptureStats, Shared, Ticket, Wait};

// ── VirtualDisplay ────────────────────────────────────────────────────────────

/// A connected synthetic monitor with its producer thread.
///
/// Dropping the handle stops capture the same way [`VirtualDisplay::stop`] does.
pub struct VirtualDisplay {
    shared: Arc<Shared>,
    producer: Option<JoinHandle<()>>,
}

impl VirtualDisplay {
    /// Advertise the configured descriptor on `device`, connect it and start
    /// the producer thread. Returns the display handle and the frame receiver.
    pub fn open<D>(mut device: D, config: &CaptureConfig) -> Result<(Self, FrameReceiver), CaptureError>
    where
        D: DisplaySubsystem + 'static,
    {
        config.validate()?;
        let edid = config.build_edid()?;
        device.connect(edid.as_bytes(), config.max_pixels())?;
        info!(
            "Virtual display connected: vendor={} modes={} max={}x{} @{}fps",
            config.vendor,
            edid.mode_count(),
            config.max_width,
            config.max_height,
            config.target_fps
        );

        let shared = Arc::new(Shared::new(config.buffer_count));
        let dispatcher = Dispatcher::new(device, Arc::clone(&shared), config.frame_interval(), config.max_wait());
        let producer = thread::Builder::new()
            .name("vscreen-producer".into())
            .spawn(move || dispatcher.run())
            .map_err(CaptureError::ProducerSpawn)?;

        let receiver = FrameReceiver { shared: Arc::clone(&shared) };
        Ok((Self { shared, producer: Some(producer) }, receiver))
    }

    pub fn stats(&self) -> CaptureStats {
        self.shared.stats()
    }

    /// Mode most recently announced by the display subsystem.
    pub fn current_mode(&self) -> Option<DisplayMode> {
        self.shared.mode()
    }

    pub fn is_running(&self) -> bool {
        !self.shared.is_stopping()
    }

    /// Stop the producer, unregister every buffer and disconnect. Blocked
    /// `get_frame` calls return [`CaptureError::Stopped`].
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.shared.stop();
        if let Some(producer) = self.producer.take() {
            if producer.join().is_err() {
                warn!("Producer thread panicked");
            }
        }
    }
}

impl Drop for VirtualDisplay {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── FrameReceiver ─────────────────────────────────────────────────────────────

/// Consumer end of the handoff.
///
/// Each returned [`Frame`] borrows the receiver, so a view can never be kept
/// across the next call.
pub struct FrameReceiver {
    shared: Arc<Shared>,
}

impl FrameReceiver {
    /// Block until a frame newer than the last one delivered is available.
    pub fn get_frame(&mut self) -> Result<Frame<'_>, CaptureError> {
        match self.shared.take(Wait::Forever)? {
            Some(ticket) => Ok(self.frame(ticket)),
            None => Err(CaptureError::Stopped),
        }
    }

    /// Like [`get_frame`](Self::get_frame) but gives up after `timeout`.
    pub fn get_frame_timeout(&mut self, timeout: Duration) -> Result<Frame<'_>, CaptureError> {
        match self.shared.take(Wait::Until(Instant::now() + timeout))? {
            Some(ticket) => Ok(self.frame(ticket)),
            None => Err(CaptureError::Timeout),
        }
    }

    /// Return a new frame if one is pending, without blocking.
    pub fn try_get_frame(&mut self) -> Result<Option<Frame<'_>>, CaptureError> {
        Ok(self.shared.take(Wait::Never)?.map(|ticket| self.frame(ticket)))
    }

    pub fn stats(&self) -> CaptureStats {
        self.shared.stats()
    }

    fn frame(&self, ticket: Ticket) -> Frame<'_> {
        Frame { ticket, shared: &self.shared, _not_send: PhantomData }
    }
}

// ── Frame ─────────────────────────────────────────────────────────────────────

/// Read-only view of one delivered buffer.
///
/// The producer never targets this slot and reallocation waits for it while
/// the view is alive.
pub struct Frame<'a> {
    ticket: Ticket,
    shared: &'a Shared,
    _not_send: PhantomData<*const ()>,
}

impl Frame<'_> {
    /// Pixel bytes, `height` rows of `stride` bytes.
    pub fn data(&self) -> &[u8] {
        // SAFETY: the slot is consumer-exposed and held until this view drops;
        // nothing writes it in that window.
        let all = unsafe { self.ticket.buffer.as_slice() };
        &all[..self.ticket.mode.byte_size().min(all.len())]
    }

    /// Iterate over pixel rows.
    pub fn rows(&self) -> impl Iterator<Item = &[u8]> {
        let stride = self.stride().max(1) as usize;
        self.data().chunks_exact(stride)
    }

    pub fn mode(&self) -> DisplayMode {
        self.ticket.mode
    }

    pub fn width(&self) -> u32 {
        self.ticket.mode.width
    }

    pub fn height(&self) -> u32 {
        self.ticket.mode.height
    }

    pub fn stride(&self) -> u32 {
        self.ticket.mode.stride()
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.ticket.mode.fourcc()
    }

    /// Ring slot this frame lives in.
    pub fn slot(&self) -> usize {
        self.ticket.slot
    }

    /// 1-based count of frames delivered so far.
    pub fn sequence(&self) -> u64 {
        self.ticket.sequence
    }
}

impl Drop for Frame<'_> {
    fn drop(&mut self) {
        self.shared.release();
    }
}

impl std::fmt::Debug for Frame<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("slot", &self.ticket.slot)
            .field("sequence", &self.ticket.sequence)
            .field("mode", &self.ticket.mode)
            .finish()
    }
}
