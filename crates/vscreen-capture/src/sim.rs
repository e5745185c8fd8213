//! In-process display subsystem.
//!
//! Used when no kernel driver is available and by the test suite. Mode
//! changes, DPMS transitions and signal interruptions are injected through a
//! [`SimulatorControl`]; every update fills the target buffer with one byte
//! value that changes per frame, so a torn frame is easy to detect.

use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};
use vscreen_core::edid::standard_timing;
use vscreen_core::{DisplayMode, DpmsMode, PixelFormat, Rect, VScreenError};

use crate::device::{BufferRegistration, DeviceContext, DisplaySubsystem, EventHandler};
use crate::error::WaitError;

/// How the simulator reports finished updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Completion {
    /// `request_update` writes the buffer and returns `true`.
    #[default]
    Synchronous,
    /// The buffer is written immediately but completion is delivered as an
    /// update-ready event on the next dispatch.
    Asynchronous,
}

#[derive(Debug)]
enum Command {
    SetMode(DisplayMode),
    Dpms(DpmsMode),
    Interrupt,
}

#[derive(Debug)]
enum Event {
    ModeChanged(DisplayMode),
    UpdateReady(usize),
    Dpms(DpmsMode),
}

/// Everything the simulator has been asked to do.
#[derive(Debug, Default)]
struct SimLog {
    ops: Vec<String>,
    descriptor: Option<Vec<u8>>,
    connected: bool,
    update_requests: u64,
    registered: BTreeMap<usize, usize>,
}

type SharedLog = Arc<Mutex<SimLog>>;

fn lock(log: &SharedLog) -> std::sync::MutexGuard<'_, SimLog> {
    log.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Buffer table ──────────────────────────────────────────────────────────────

struct SimTable {
    buffers: BTreeMap<usize, BufferRegistration>,
    last_rects: Vec<Rect>,
    log: SharedLog,
}

impl DeviceContext for SimTable {
    fn register_buffer(&mut self, buffer: BufferRegistration) {
        let mut log = lock(&self.log);
        log.ops.push(format!("register {}", buffer.id));
        log.registered.insert(buffer.id, buffer.len);
        self.buffers.insert(buffer.id, buffer);
    }

    fn unregister_buffer(&mut self, id: usize) {
        let mut log = lock(&self.log);
        log.ops.push(format!("unregister {id}"));
        log.registered.remove(&id);
        self.buffers.remove(&id);
    }

    fn grab_pixels(&mut self) -> Vec<Rect> {
        std::mem::take(&mut self.last_rects)
    }
}

// ── SimulatedDevice ───────────────────────────────────────────────────────────

pub struct SimulatedDevice {
    commands: Receiver<Command>,
    pending: VecDeque<Event>,
    table: SimTable,
    completion: Completion,
    mode: Option<DisplayMode>,
    frame: u64,
}

impl SimulatedDevice {
    pub fn new(completion: Completion) -> (Self, SimulatorControl) {
        let (tx, commands) = mpsc::channel();
        let log = SharedLog::default();
        let device = Self {
            commands,
            pending: VecDeque::new(),
            table: SimTable { buffers: BTreeMap::new(), last_rects: Vec::new(), log: Arc::clone(&log) },
            completion,
            mode: None,
            frame: 0,
        };
        (device, SimulatorControl { tx, log })
    }

    fn apply(&mut self, command: Command) -> Result<(), WaitError> {
        match command {
            Command::SetMode(mode) => self.pending.push_back(Event::ModeChanged(mode)),
            Command::Dpms(mode) => self.pending.push_back(Event::Dpms(mode)),
            Command::Interrupt => return Err(WaitError::Interrupted),
        }
        Ok(())
    }

    /// Fill the slot with this frame's byte value.
    fn render(&mut self, slot: usize) {
        self.frame += 1;
        let Some(reg) = self.table.buffers.get(&slot) else {
            warn!("Sim: update requested for unregistered slot {}", slot);
            return;
        };
        let value = (self.frame % 255) as u8 + 1;
        // SAFETY: the buffer stays alive while registered, and the engine only
        // requests updates for slots the consumer is not reading.
        unsafe { std::ptr::write_bytes(reg.base.as_ptr(), value, reg.len) };
        self.table.last_rects = vec![Rect::new(0, 0, reg.width as i32, reg.height as i32)];
    }
}

impl DisplaySubsystem for SimulatedDevice {
    fn connect(&mut self, descriptor: &[u8], max_pixels: u32) -> Result<(), VScreenError> {
        let timing = standard_timing(descriptor, 0).ok_or_else(|| VScreenError::ConnectFailed {
            reason: "descriptor advertises no standard timing".into(),
        })?;
        let mode = DisplayMode::new(timing.xres, timing.height(), timing.refresh_hz, 32, PixelFormat::XRGB8888.0);
        if (mode.width as u64 * mode.height as u64) > max_pixels as u64 {
            return Err(VScreenError::ConnectFailed {
                reason: format!("preferred mode {} exceeds {} pixels", mode, max_pixels),
            });
        }

        {
            let mut log = lock(&self.table.log);
            log.ops.push("connect".into());
            log.descriptor = Some(descriptor.to_vec());
            log.connected = true;
        }
        info!("Sim: connected, preferred mode {}", mode);
        self.pending.push_back(Event::ModeChanged(mode));
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut log = lock(&self.table.log);
        log.ops.push("disconnect".into());
        log.connected = false;
        debug!("Sim: disconnected after {} frames", self.frame);
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<bool, WaitError> {
        while let Ok(command) = self.commands.try_recv() {
            self.apply(command)?;
        }
        if !self.pending.is_empty() {
            return Ok(true);
        }
        match self.commands.recv_timeout(timeout) {
            Ok(command) => {
                self.apply(command)?;
                Ok(!self.pending.is_empty())
            }
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => {
                std::thread::sleep(timeout);
                Ok(false)
            }
        }
    }

    fn dispatch_events(&mut self, handler: &mut dyn EventHandler) {
        while let Some(event) = self.pending.pop_front() {
            match event {
                Event::ModeChanged(mode) => {
                    self.mode = Some(mode);
                    handler.on_mode_changed(&mut self.table, mode);
                }
                Event::UpdateReady(slot) => handler.on_update_ready(&mut self.table, slot),
                Event::Dpms(mode) => handler.on_dpms(mode),
            }
        }
    }

    fn request_update(&mut self, slot: usize) -> bool {
        lock(&self.table.log).update_requests += 1;
        if self.mode.is_none() {
            return false;
        }
        self.render(slot);
        match self.completion {
            Completion::Synchronous => true,
            Completion::Asynchronous => {
                self.pending.push_back(Event::UpdateReady(slot));
                false
            }
        }
    }

    fn context(&mut self) -> &mut dyn DeviceContext {
        &mut self.table
    }
}

// ── SimulatorControl ──────────────────────────────────────────────────────────

/// Handle for injecting events into a running [`SimulatedDevice`] and
/// inspecting what the engine asked of it.
#[derive(Clone)]
pub struct SimulatorControl {
    tx: Sender<Command>,
    log: SharedLog,
}

impl SimulatorControl {
    /// Announce a new mode, as if the compositor reconfigured the output.
    pub fn set_mode(&self, mode: DisplayMode) {
        let _ = self.tx.send(Command::SetMode(mode));
    }

    pub fn set_dpms(&self, mode: DpmsMode) {
        let _ = self.tx.send(Command::Dpms(mode));
    }

    /// Make the next readiness wait fail as if a signal arrived.
    pub fn interrupt(&self) {
        let _ = self.tx.send(Command::Interrupt);
    }

    /// Log of connect/register/unregister/disconnect calls in order.
    pub fn ops(&self) -> Vec<String> {
        lock(&self.log).ops.clone()
    }

    /// Currently registered slot ids.
    pub fn registered(&self) -> Vec<usize> {
        lock(&self.log).registered.keys().copied().collect()
    }

    /// Descriptor bytes passed at connect.
    pub fn descriptor(&self) -> Option<Vec<u8>> {
        lock(&self.log).descriptor.clone()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.log).connected
    }

    pub fn update_requests(&self) -> u64 {
        lock(&self.log).update_requests
    }
}

impl std::fmt::Debug for SimulatorControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatorControl").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::VirtualDisplay;
    use crate::error::CaptureError;
    use std::thread;
    use std::time::Instant;
    use vscreen_core::edid::block_sum;
    use vscreen_core::{AspectRatio, CaptureConfig, ModeConfig, VScreenError};

    fn config() -> CaptureConfig {
        CaptureConfig {
            modes: vec![ModeConfig { width: 320, aspect: AspectRatio::R4_3, refresh: 60 }],
            max_width: 1280,
            max_height: 1024,
            target_fps: 200,
            max_wait_ms: 10,
            ..CaptureConfig::default()
        }
    }

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn xr24(w: u32, h: u32) -> DisplayMode {
        DisplayMode::new(w, h, 60, 32, PixelFormat::XRGB8888.0)
    }

    #[test]
    fn connect_advertises_descriptor_and_registers_ring() {
        let (device, control) = SimulatedDevice::new(Completion::Synchronous);
        let (display, mut frames) = VirtualDisplay::open(device, &config()).unwrap();

        let descriptor = control.descriptor().unwrap();
        assert_eq!(descriptor.len(), 128);
        assert_eq!(block_sum(&descriptor), 0);

        let frame = frames.get_frame().unwrap();
        assert_eq!((frame.width(), frame.height()), (320, 240));
        assert_eq!(frame.stride(), 320 * 4);
        assert_eq!(frame.pixel_format(), PixelFormat::XRGB8888);
        assert_eq!(frame.data().len(), 320 * 240 * 4);
        drop(frame);

        assert_eq!(control.registered(), [0, 1]);
        assert_eq!(&control.ops()[..3], ["connect", "register 0", "register 1"]);
        display.stop();
    }

    #[test]
    fn frames_are_never_torn() {
        let (device, _control) = SimulatedDevice::new(Completion::Synchronous);
        let (display, mut frames) = VirtualDisplay::open(device, &config()).unwrap();

        let mut last_sequence = 0;
        for _ in 0..40 {
            let frame = frames.get_frame().unwrap();
            let first = frame.data()[0];
            assert_ne!(first, 0);
            assert!(frame.data().iter().all(|b| *b == first), "torn frame in slot {}", frame.slot());
            assert!(frame.sequence() > last_sequence);
            last_sequence = frame.sequence();
        }
        display.stop();
    }

    #[test]
    fn slow_consumer_loses_frames() {
        let (device, _control) = SimulatedDevice::new(Completion::Synchronous);
        let (display, mut frames) = VirtualDisplay::open(device, &config()).unwrap();

        frames.get_frame().unwrap();
        thread::sleep(Duration::from_millis(100));
        frames.get_frame().unwrap();

        let stats = display.stats();
        assert_eq!(stats.frames_delivered, 2);
        assert!(stats.frames_lost > 0);
        assert!(stats.frames_completed >= stats.frames_delivered + stats.frames_lost);
        display.stop();
    }

    #[test]
    fn same_size_mode_change_keeps_buffers() {
        let (device, control) = SimulatedDevice::new(Completion::Synchronous);
        let (display, mut frames) = VirtualDisplay::open(device, &config()).unwrap();
        frames.get_frame().unwrap();
        let ops_before = control.ops();

        let rotated = xr24(240, 320);
        control.set_mode(rotated);
        wait_until("rotated mode", || display.current_mode() == Some(rotated));

        assert_eq!(control.ops(), ops_before);
        let frame = frames.get_frame_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!((frame.width(), frame.height()), (240, 320));
        drop(frame);
        display.stop();
    }

    #[test]
    fn resize_reallocates_every_slot() {
        let (device, control) = SimulatedDevice::new(Completion::Synchronous);
        let mut cfg = config();
        cfg.buffer_count = 3;
        let (display, mut frames) = VirtualDisplay::open(device, &cfg).unwrap();
        frames.get_frame().unwrap();

        let larger = xr24(640, 480);
        control.set_mode(larger);
        wait_until("resize", || display.current_mode() == Some(larger));

        let ops = control.ops();
        let tail = &ops[ops.len() - 6..];
        assert_eq!(
            tail,
            ["unregister 0", "register 0", "unregister 1", "register 1", "unregister 2", "register 2"]
        );

        // Frames completed before the switch were retracted.
        let frame = frames.get_frame().unwrap();
        assert_eq!(frame.width(), 640);
        assert_eq!(frame.data().len(), 640 * 480 * 4);
        assert_eq!(frame.rows().count(), 480);
        drop(frame);
        display.stop();
    }

    #[test]
    fn resize_waits_for_frame_in_use() {
        let (device, control) = SimulatedDevice::new(Completion::Synchronous);
        let (display, mut frames) = VirtualDisplay::open(device, &config()).unwrap();

        let frame = frames.get_frame().unwrap();
        let held = frame.slot();
        let value = frame.data()[0];

        control.set_mode(xr24(640, 480));
        thread::sleep(Duration::from_millis(50));
        // The held view is untouched and its slot is still registered.
        assert!(frame.data().iter().all(|b| *b == value));
        assert!(control.registered().contains(&held));
        drop(frame);

        wait_until("resize", || display.current_mode().map(|m| m.width) == Some(640));
        display.stop();
    }

    #[test]
    fn asynchronous_completion_delivers_frames() {
        let (device, control) = SimulatedDevice::new(Completion::Asynchronous);
        let (display, mut frames) = VirtualDisplay::open(device, &config()).unwrap();
        for _ in 0..5 {
            let frame = frames.get_frame().unwrap();
            let first = frame.data()[0];
            assert!(frame.data().iter().all(|b| *b == first));
        }
        assert!(control.update_requests() >= 5);
        display.stop();
    }

    #[test]
    fn update_requests_follow_target_rate() {
        for completion in [Completion::Synchronous, Completion::Asynchronous] {
            let (device, control) = SimulatedDevice::new(completion);
            let mut cfg = config();
            cfg.target_fps = 50;
            let (display, mut frames) = VirtualDisplay::open(device, &cfg).unwrap();
            frames.get_frame().unwrap();

            let start = Instant::now();
            let before = control.update_requests();
            thread::sleep(Duration::from_secs(1));
            let requests = control.update_requests() - before;
            let expected = start.elapsed().as_secs_f64() * cfg.target_fps as f64;

            assert!(
                (requests as f64 - expected).abs() <= 1.0,
                "{completion:?}: {requests} requests, expected {expected:.1}"
            );
            display.stop();
        }
    }

    #[test]
    fn interrupted_wait_is_retried() {
        let (device, control) = SimulatedDevice::new(Completion::Synchronous);
        let (display, mut frames) = VirtualDisplay::open(device, &config()).unwrap();
        frames.get_frame().unwrap();
        for _ in 0..3 {
            control.interrupt();
        }
        let before = frames.stats().frames_delivered;
        frames.get_frame_timeout(Duration::from_secs(1)).unwrap();
        assert!(frames.stats().frames_delivered > before);
        assert!(display.is_running());
        display.stop();
    }

    #[test]
    fn dpms_state_is_recorded() {
        let (device, control) = SimulatedDevice::new(Completion::Synchronous);
        let (display, _frames) = VirtualDisplay::open(device, &config()).unwrap();
        control.set_dpms(DpmsMode::Off);
        wait_until("dpms", || display.stats().dpms == Some(DpmsMode::Off));
        display.stop();
    }

    #[test]
    fn stop_wakes_consumer_and_tears_down() {
        let (device, control) = SimulatedDevice::new(Completion::Asynchronous);
        let mut cfg = config();
        cfg.target_fps = 1;
        let (display, mut frames) = VirtualDisplay::open(device, &cfg).unwrap();
        frames.get_frame().unwrap();

        let consumer = thread::spawn(move || loop {
            if let Err(e) = frames.get_frame() {
                return e;
            }
        });
        thread::sleep(Duration::from_millis(30));
        display.stop();

        assert!(matches!(consumer.join().unwrap(), CaptureError::Stopped));
        assert!(control.registered().is_empty());
        assert!(!control.is_connected());
        assert_eq!(control.ops().last().map(String::as_str), Some("disconnect"));
    }

    #[test]
    fn dropping_display_stops_capture() {
        let (device, control) = SimulatedDevice::new(Completion::Synchronous);
        let (display, mut frames) = VirtualDisplay::open(device, &config()).unwrap();
        drop(display);
        assert!(matches!(frames.get_frame(), Err(CaptureError::Stopped)));
        assert!(matches!(frames.try_get_frame(), Err(CaptureError::Stopped)));
        assert!(!control.is_connected());
    }

    #[test]
    fn invalid_config_is_rejected_before_connect() {
        let (device, control) = SimulatedDevice::new(Completion::Synchronous);
        let mut cfg = config();
        cfg.buffer_count = 5;
        let err = VirtualDisplay::open(device, &cfg).err().unwrap();
        assert!(matches!(err, CaptureError::Setup(VScreenError::ConfigurationInvalid { .. })));
        assert!(control.ops().is_empty());
    }

    #[test]
    fn oversized_preferred_mode_fails_connect() {
        let (device, _control) = SimulatedDevice::new(Completion::Synchronous);
        let mut cfg = config();
        cfg.max_width = 100;
        cfg.max_height = 100;
        let err = VirtualDisplay::open(device, &cfg).err().unwrap();
        assert!(matches!(err, CaptureError::Setup(VScreenError::ConnectFailed { .. })));
    }

    #[test]
    fn stats_serialize() {
        let (device, _control) = SimulatedDevice::new(Completion::Synchronous);
        let (display, mut frames) = VirtualDisplay::open(device, &config()).unwrap();
        frames.get_frame().unwrap();
        let json = serde_json::to_value(display.stats()).unwrap();
        assert!(json["frames_completed"].as_u64().unwrap() >= 1);
        assert_eq!(json["mode"]["width"], 320);
        display.stop();
    }
}
