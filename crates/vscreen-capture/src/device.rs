//! Interface to the display subsystem.
//!
//! The engine drives any backend through [`DisplaySubsystem`]. Event delivery
//! follows the native callback model: [`DisplaySubsystem::dispatch_events`]
//! invokes an [`EventHandler`] for every pending notification and passes it a
//! [`DeviceContext`] so the handler can register buffers and grab pixels while
//! the dispatch is still in progress.

use std::ptr::NonNull;
use std::time::Duration;

use vscreen_core::{DisplayMode, DpmsMode, Rect, VScreenError};

use crate::error::WaitError;

/// A pixel buffer handed to the display subsystem under a slot id.
#[derive(Debug, Clone, Copy)]
pub struct BufferRegistration {
    pub id: usize,
    /// Start of the usable (aligned) region.
    pub base: NonNull<u8>,
    /// Usable bytes starting at `base`.
    pub len: usize,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
}

// SAFETY: `base` points into an `AlignedBuffer`, which is Send + Sync; the
// registration is only a description handed to the display subsystem.
unsafe impl Send for BufferRegistration {}

/// Operations available both inside and outside event dispatch.
pub trait DeviceContext {
    fn register_buffer(&mut self, buffer: BufferRegistration);

    fn unregister_buffer(&mut self, id: usize);

    /// Dirty rectangles of the most recent update. Informational only.
    fn grab_pixels(&mut self) -> Vec<Rect>;
}

/// Callbacks invoked from [`DisplaySubsystem::dispatch_events`].
pub trait EventHandler {
    fn on_mode_changed(&mut self, ctx: &mut dyn DeviceContext, mode: DisplayMode);

    /// The display subsystem finished writing `slot`.
    fn on_update_ready(&mut self, ctx: &mut dyn DeviceContext, slot: usize);

    fn on_dpms(&mut self, _mode: DpmsMode) {}

    fn on_crtc_state(&mut self, _state: i32) {}
}

/// A connected-or-connectable synthetic display.
///
/// Opening is the backend's constructor and closing is its `Drop`.
pub trait DisplaySubsystem: Send {
    /// Advertise the descriptor and plug the virtual monitor in.
    fn connect(&mut self, descriptor: &[u8], max_pixels: u32) -> Result<(), VScreenError>;

    fn disconnect(&mut self);

    /// Block until events are ready or `timeout` elapses. `Ok(false)` on timeout.
    fn wait_ready(&mut self, timeout: Duration) -> Result<bool, WaitError>;

    fn dispatch_events(&mut self, handler: &mut dyn EventHandler);

    /// Ask for the current screen contents in `slot`. `true` means the buffer
    /// is already written; `false` means completion arrives later through
    /// [`EventHandler::on_update_ready`].
    fn request_update(&mut self, slot: usize) -> bool;

    fn context(&mut self) -> &mut dyn DeviceContext;
}
