//! vscreen-capture: frame capture from a virtual monitor.
//!
//! # Backends
//!
//! | Backend | Requirement | Feature |
//! |---------|-------------|---------|
//! | evdi | `evdi` kernel module + libevdi | `evdi` (Linux only) |
//! | Simulator | none | always built |
//!
//! # Usage
//!
//! ```rust,no_run
//! use vscreen_capture::{Completion, SimulatedDevice, VirtualDisplay};
//! use vscreen_core::CaptureConfig;
//!
//! # fn example() -> Result<(), vscreen_capture::CaptureError> {
//! let (device, _control) = SimulatedDevice::new(Completion::Synchronous);
//! let (display, mut frames) = VirtualDisplay::open(device, &CaptureConfig::default())?;
//! for _ in 0..10 {
//!     let frame = frames.get_frame()?;
//!     // frame.data(): height rows of stride bytes, valid until the next call
//!     println!("{}x{} seq={}", frame.width(), frame.height(), frame.sequence());
//! }
//! display.stop();
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//!  producer thread                              consumer
//!  ───────────────                              ────────
//!  wait_ready(min(pacer, max_wait))
//!    │ ready
//!    ▼
//!  dispatch_events ──► mode changed ──► BufferPool::reconcile
//!    │                 update ready ──┐
//!    ▼                                │
//!  pacer due? ──► request_update(slot)│
//!                   │ sync            ▼
//!                   └──────────► complete(slot) ──► producer_index
//!                                                        │ Condvar
//!                                                        ▼
//!                                               get_frame() ─► Frame
//! ```

mod aligned;
mod device;
mod dispatcher;
mod display;
mod error;
mod pacer;
mod pool;
mod sim;
mod sync;

pub use aligned::{AlignedBuffer, BUFFER_ALIGNMENT};
pub use device::{BufferRegistration, DeviceContext, DisplaySubsystem, EventHandler};
pub use display::{Frame, FrameReceiver, VirtualDisplay};
pub use error::{CaptureError, WaitError};
pub use pacer::FramePacer;
pub use sim::{Completion, SimulatedDevice, SimulatorControl};
pub use sync::CaptureStats;

// ── Platform split ─────────────────────────────────────────────────────────────

#[cfg(all(feature = "evdi", target_os = "linux"))]
mod evdi;
#[cfg(all(feature = "evdi", target_os = "linux"))]
pub use evdi::{EvdiContext, EvdiDevice};
