//! libevdi backend.
//!
//! Requires the `evdi` kernel module and `libevdi` (1.9 API). The library is
//! callback driven: `evdi_handle_events` calls back into Rust through the
//! `extern "C"` trampolines below with `user_data` pointing at a stack-local
//! `Trampoline` that lives for the duration of the dispatch.

use std::ffi::{c_int, c_uint, c_void};
use std::io;
use std::ptr;
use std::time::Duration;

use tracing::{debug, info, warn};
use vscreen_core::{DisplayMode, DpmsMode, Rect, VScreenError};

use crate::device::{BufferRegistration, DeviceContext, DisplaySubsystem, EventHandler};
use crate::error::WaitError;

/// Rectangles fetched per `evdi_grab_pixels` call.
const MAX_DIRTY_RECTS: usize = 16;

// ── FFI ───────────────────────────────────────────────────────────────────────

#[repr(C)]
struct EvdiDeviceContext {
    _private: [u8; 0],
}

type EvdiHandle = *mut EvdiDeviceContext;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct EvdiRect {
    x1: c_int,
    y1: c_int,
    x2: c_int,
    y2: c_int,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct EvdiMode {
    width: c_int,
    height: c_int,
    refresh_rate: c_int,
    bits_per_pixel: c_int,
    pixel_format: c_uint,
}

#[repr(C)]
struct EvdiBuffer {
    id: c_int,
    buffer: *mut c_void,
    width: c_int,
    height: c_int,
    stride: c_int,
    rects: *mut EvdiRect,
    rect_count: c_int,
}

/// Handlers left null are skipped by the library. Only the pointer width of
/// the cursor and DDC/CI slots matters, so they are declared untyped.
#[repr(C)]
struct EvdiEventContext {
    dpms_handler: Option<unsafe extern "C" fn(c_int, *mut c_void)>,
    mode_changed_handler: Option<unsafe extern "C" fn(EvdiMode, *mut c_void)>,
    update_ready_handler: Option<unsafe extern "C" fn(c_int, *mut c_void)>,
    crtc_state_handler: Option<unsafe extern "C" fn(c_int, *mut c_void)>,
    cursor_set_handler: *const c_void,
    cursor_move_handler: *const c_void,
    ddcci_data_handler: *const c_void,
    user_data: *mut c_void,
}

#[link(name = "evdi")]
extern "C" {
    fn evdi_open(device: c_int) -> EvdiHandle;
    fn evdi_close(handle: EvdiHandle);
    fn evdi_connect(handle: EvdiHandle, edid: *const u8, edid_length: c_uint, sku_area_limit: u32);
    fn evdi_disconnect(handle: EvdiHandle);
    fn evdi_register_buffer(handle: EvdiHandle, buffer: EvdiBuffer);
    fn evdi_unregister_buffer(handle: EvdiHandle, buffer_id: c_int);
    fn evdi_request_update(handle: EvdiHandle, buffer_id: c_int) -> bool;
    fn evdi_grab_pixels(handle: EvdiHandle, rects: *mut EvdiRect, num_rects: *mut c_int);
    fn evdi_handle_events(handle: EvdiHandle, evtctx: *mut EvdiEventContext);
    fn evdi_get_event_ready(handle: EvdiHandle) -> c_int;
}

// ── EvdiContext ───────────────────────────────────────────────────────────────

/// Buffer and pixel operations on an open handle.
pub struct EvdiContext {
    handle: EvdiHandle,
}

impl DeviceContext for EvdiContext {
    fn register_buffer(&mut self, buffer: BufferRegistration) {
        let raw = EvdiBuffer {
            id: buffer.id as c_int,
            buffer: buffer.base.as_ptr().cast(),
            width: buffer.width as c_int,
            height: buffer.height as c_int,
            stride: buffer.stride as c_int,
            rects: ptr::null_mut(),
            rect_count: 0,
        };
        // SAFETY: the handle is open; the engine keeps the memory alive until
        // the matching unregister.
        unsafe { evdi_register_buffer(self.handle, raw) };
    }

    fn unregister_buffer(&mut self, id: usize) {
        // SAFETY: the handle is open.
        unsafe { evdi_unregister_buffer(self.handle, id as c_int) };
    }

    fn grab_pixels(&mut self) -> Vec<Rect> {
        let mut rects = [EvdiRect::default(); MAX_DIRTY_RECTS];
        let mut count: c_int = 0;
        // SAFETY: `rects` has room for the MAX_DIRTY_RECTS entries libevdi writes at most.
        unsafe { evdi_grab_pixels(self.handle, rects.as_mut_ptr(), &mut count) };
        let count = (count.max(0) as usize).min(MAX_DIRTY_RECTS);
        rects[..count].iter().map(|r| Rect::new(r.x1, r.y1, r.x2, r.y2)).collect()
    }
}

// ── EvdiDevice ────────────────────────────────────────────────────────────────

/// One `/dev/dri/cardN` node created by the evdi kernel module.
pub struct EvdiDevice {
    ctx: EvdiContext,
    fd: c_int,
    connected: bool,
}

// SAFETY: the handle is only used from the thread that owns the device.
unsafe impl Send for EvdiDevice {}

impl EvdiDevice {
    pub fn open(index: i32) -> Result<Self, VScreenError> {
        // SAFETY: plain library call; a null handle is checked below.
        let handle = unsafe { evdi_open(index) };
        if handle.is_null() {
            return Err(VScreenError::DeviceUnavailable {
                reason: format!("evdi_open({index}) failed (is the evdi module loaded?)"),
            });
        }
        // SAFETY: handle is valid.
        let fd = unsafe { evdi_get_event_ready(handle) };
        info!("evdi device {} opened (event fd {})", index, fd);
        Ok(Self { ctx: EvdiContext { handle }, fd, connected: false })
    }
}

impl DisplaySubsystem for EvdiDevice {
    fn connect(&mut self, descriptor: &[u8], max_pixels: u32) -> Result<(), VScreenError> {
        // SAFETY: the descriptor slice outlives the call; libevdi copies it.
        unsafe {
            evdi_connect(self.ctx.handle, descriptor.as_ptr(), descriptor.len() as c_uint, max_pixels)
        };
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.connected {
            // SAFETY: handle is valid.
            unsafe { evdi_disconnect(self.ctx.handle) };
            self.connected = false;
        }
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<bool, WaitError> {
        poll_readable(self.fd, timeout)
    }

    fn dispatch_events(&mut self, handler: &mut dyn EventHandler) {
        let handle = self.ctx.handle;
        let mut trampoline = Trampoline { handler, ctx: &mut self.ctx };
        let mut events = EvdiEventContext {
            dpms_handler: Some(on_dpms),
            mode_changed_handler: Some(on_mode_changed),
            update_ready_handler: Some(on_update_ready),
            crtc_state_handler: Some(on_crtc_state),
            cursor_set_handler: ptr::null(),
            cursor_move_handler: ptr::null(),
            ddcci_data_handler: ptr::null(),
            user_data: (&mut trampoline as *mut Trampoline<'_>).cast(),
        };
        // SAFETY: `trampoline` outlives the call and callbacks run synchronously on this thread.
        unsafe { evdi_handle_events(handle, &mut events) };
    }

    fn request_update(&mut self, slot: usize) -> bool {
        // SAFETY: handle is valid; the slot was registered by the pool.
        unsafe { evdi_request_update(self.ctx.handle, slot as c_int) }
    }

    fn context(&mut self) -> &mut dyn DeviceContext {
        &mut self.ctx
    }
}

impl Drop for EvdiDevice {
    fn drop(&mut self) {
        self.disconnect();
        // SAFETY: handle is valid and closed exactly once.
        unsafe { evdi_close(self.ctx.handle) };
        debug!("evdi device closed");
    }
}

/// Wait until `fd` is readable. A hung-up or invalid fd is an error: it would
/// otherwise report "not ready" immediately on every call.
fn poll_readable(fd: c_int, timeout: Duration) -> Result<bool, WaitError> {
    let millis = timeout.as_micros().div_ceil(1000).min(c_int::MAX as u128) as c_int;
    let mut pfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
    // SAFETY: one valid pollfd.
    let n = unsafe { libc::poll(&mut pfd, 1, millis) };
    if n < 0 {
        return Err(io::Error::last_os_error().into());
    }
    if n == 0 {
        return Ok(false);
    }
    if pfd.revents & libc::POLLIN != 0 {
        return Ok(true);
    }
    if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        return Err(WaitError::Io(io::Error::new(
            io::ErrorKind::BrokenPipe,
            format!("event fd {fd} unusable (revents={:#x})", pfd.revents),
        )));
    }
    Ok(false)
}

// ── Callbacks ─────────────────────────────────────────────────────────────────

struct Trampoline<'a> {
    handler: &'a mut dyn EventHandler,
    ctx: &'a mut EvdiContext,
}

/// # Safety
/// `user_data` must be the `Trampoline` installed by `dispatch_events`.
unsafe fn trampoline<'a>(user_data: *mut c_void) -> &'a mut Trampoline<'a> {
    unsafe { &mut *user_data.cast::<Trampoline<'a>>() }
}

unsafe extern "C" fn on_mode_changed(mode: EvdiMode, user_data: *mut c_void) {
    let t = unsafe { trampoline(user_data) };
    let mode = DisplayMode::new(
        mode.width.max(0) as u32,
        mode.height.max(0) as u32,
        mode.refresh_rate.max(0) as u32,
        mode.bits_per_pixel.max(0) as u32,
        mode.pixel_format,
    );
    t.handler.on_mode_changed(t.ctx, mode);
}

unsafe extern "C" fn on_update_ready(buffer: c_int, user_data: *mut c_void) {
    let t = unsafe { trampoline(user_data) };
    if buffer < 0 {
        warn!("evdi reported update for invalid buffer {}", buffer);
        return;
    }
    t.handler.on_update_ready(t.ctx, buffer as usize);
}

unsafe extern "C" fn on_dpms(mode: c_int, user_data: *mut c_void) {
    let t = unsafe { trampoline(user_data) };
    match DpmsMode::from_raw(mode) {
        Some(mode) => t.handler.on_dpms(mode),
        None => debug!("Unknown DPMS mode {}", mode),
    }
}

unsafe extern "C" fn on_crtc_state(state: c_int, user_data: *mut c_void) {
    let t = unsafe { trampoline(user_data) };
    t.handler.on_crtc_state(state);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (c_int, c_int) {
        let mut fds = [0 as c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn readable_fd_is_ready() {
        let (rx, tx) = pipe();
        assert_eq!(unsafe { libc::write(tx, b"x".as_ptr().cast(), 1) }, 1);
        assert!(poll_readable(rx, Duration::from_millis(50)).unwrap());
        unsafe {
            libc::close(rx);
            libc::close(tx);
        }
    }

    #[test]
    fn idle_fd_times_out() {
        let (rx, tx) = pipe();
        assert!(!poll_readable(rx, Duration::from_millis(5)).unwrap());
        unsafe {
            libc::close(rx);
            libc::close(tx);
        }
    }

    #[test]
    fn hung_up_fd_is_fatal() {
        let (rx, tx) = pipe();
        unsafe { libc::close(tx) };
        let start = std::time::Instant::now();
        let err = poll_readable(rx, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, WaitError::Io(ref e) if e.kind() == io::ErrorKind::BrokenPipe));
        assert!(start.elapsed() < Duration::from_secs(1));
        unsafe { libc::close(rx) };
    }
}
