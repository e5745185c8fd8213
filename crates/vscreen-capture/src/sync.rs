//! Producer/consumer handoff.
//!
//! One mutex guards the two buffer indices, the slot table, the current mode
//! and every counter. Buffer *contents* are not guarded: a slot is written
//! only while it is not the consumer-exposed slot and read only while it is.
//!
//! ```text
//! producer                         consumer
//! begin_update() ─► in_flight=s
//! device writes s
//! complete(s)   ─► producer=s ──► take(): consumer=producer, holding=true
//!                                  ... reads slot ...
//!                                  release(): holding=false
//! ```

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::Serialize;
use vscreen_core::{DisplayMode, DpmsMode};

use crate::aligned::AlignedBuffer;
use crate::error::CaptureError;

// ── Stats ─────────────────────────────────────────────────────────────────────

/// Snapshot of the capture counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CaptureStats {
    /// Updates finished by the display subsystem.
    pub frames_completed: u64,
    /// Frames handed to the consumer.
    pub frames_delivered: u64,
    /// Completed frames overwritten before the consumer saw them.
    pub frames_lost: u64,
    pub updates_requested: u64,
    /// Pacing periods dropped because the producer fell behind.
    pub periods_skipped: u64,
    /// Dirty rectangles reported for the last completed update.
    pub last_dirty_rects: usize,
    pub dpms: Option<DpmsMode>,
    pub mode: Option<DisplayMode>,
}

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) struct SyncState {
    /// Most recently completed slot.
    pub producer_index: usize,
    /// Most recently delivered slot.
    pub consumer_index: usize,
    /// The consumer still has a live view of `consumer_index`.
    pub consumer_holding: bool,
    /// Slot the display subsystem is currently writing.
    pub in_flight: Option<usize>,
    pub slots: Vec<Option<Arc<AlignedBuffer>>>,
    pub stopping: bool,
    pub stats: CaptureStats,
}

impl SyncState {
    fn pending(&self) -> bool {
        self.producer_index != self.consumer_index
            && self.in_flight != Some(self.producer_index)
            && self.slots[self.producer_index].is_some()
    }

    /// Drop any completed-but-unconsumed frame (its buffer is about to go away).
    pub fn retract_pending(&mut self) {
        self.producer_index = self.consumer_index;
        self.in_flight = None;
    }

    pub fn initialized(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }
}

/// Everything a consumer needs to read one delivered slot.
#[derive(Debug)]
pub(crate) struct Ticket {
    pub slot: usize,
    pub buffer: Arc<AlignedBuffer>,
    pub mode: DisplayMode,
    pub sequence: u64,
}

/// How long [`Shared::take`] may block.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Wait {
    Forever,
    Until(Instant),
    Never,
}

// ── Shared ────────────────────────────────────────────────────────────────────

/// State shared by the buffer pool, the dispatcher and the consumer.
#[derive(Debug)]
pub(crate) struct Shared {
    state: Mutex<SyncState>,
    cond: Condvar,
}

impl Shared {
    pub fn new(buffer_count: usize) -> Self {
        Self {
            state: Mutex::new(SyncState {
                producer_index: 0,
                consumer_index: 0,
                consumer_holding: false,
                in_flight: None,
                slots: vec![None; buffer_count],
                stopping: false,
                stats: CaptureStats::default(),
            }),
            cond: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn wait<'a>(&self, guard: MutexGuard<'a, SyncState>) -> MutexGuard<'a, SyncState> {
        self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    pub fn notify(&self) {
        self.cond.notify_all();
    }

    pub fn is_stopping(&self) -> bool {
        self.lock().stopping
    }

    /// Raise the stop flag and wake every waiter.
    pub fn stop(&self) {
        self.lock().stopping = true;
        self.notify();
    }

    pub fn stats(&self) -> CaptureStats {
        self.lock().stats.clone()
    }

    pub fn mode(&self) -> Option<DisplayMode> {
        self.lock().stats.mode
    }

    pub fn set_mode(&self, mode: DisplayMode) {
        self.lock().stats.mode = Some(mode);
    }

    pub fn record_dpms(&self, dpms: Option<DpmsMode>) {
        self.lock().stats.dpms = dpms;
    }

    /// Add skipped pacing periods; returns the new total.
    pub fn record_skipped(&self, periods: u64) -> u64 {
        let mut st = self.lock();
        st.stats.periods_skipped += periods;
        st.stats.periods_skipped
    }

    pub fn record_dirty_rects(&self, count: usize) {
        self.lock().stats.last_dirty_rects = count;
    }

    /// Pick the slot for the next update and mark it in flight.
    ///
    /// Walks the ring starting after the last completed slot and skips the
    /// consumer-exposed one. Returns `None` while the pool is not allocated,
    /// an update is already outstanding, or shutdown has begun.
    pub fn begin_update(&self) -> Option<usize> {
        let mut st = self.lock();
        if st.stopping || st.in_flight.is_some() || !st.initialized() {
            return None;
        }
        let n = st.slots.len();
        let slot = (1..=n)
            .map(|k| (st.producer_index + k) % n)
            .find(|s| *s != st.consumer_index)?;
        st.in_flight = Some(slot);
        st.stats.updates_requested += 1;
        Some(slot)
    }

    /// Publish a finished slot. Returns `true` when a pending frame was lost.
    ///
    /// Completions for a slot that is not in flight (stale after a mode
    /// change) are ignored.
    pub fn complete(&self, slot: usize) -> bool {
        let mut st = self.lock();
        if st.in_flight != Some(slot) {
            return false;
        }
        st.in_flight = None;
        let lost = st.producer_index != st.consumer_index;
        if lost {
            st.stats.frames_lost += 1;
        }
        st.producer_index = slot;
        st.stats.frames_completed += 1;
        drop(st);
        self.notify();
        lost
    }

    /// Consumer side: wait for a slot different from the last delivered one.
    ///
    /// Entering `take` ends the consumer's hold on its previous view.
    pub fn take(&self, wait: Wait) -> Result<Option<Ticket>, CaptureError> {
        let mut st = self.lock();
        if st.consumer_holding {
            st.consumer_holding = false;
            self.notify();
        }
        loop {
            if st.stopping {
                return Err(CaptureError::Stopped);
            }
            if st.pending() {
                break;
            }
            st = match wait {
                Wait::Never => return Ok(None),
                Wait::Forever => self.wait(st),
                Wait::Until(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(CaptureError::Timeout);
                    }
                    self.cond
                        .wait_timeout(st, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }

        st.consumer_index = st.producer_index;
        st.consumer_holding = true;
        st.stats.frames_delivered += 1;
        let slot = st.consumer_index;
        let ticket = match (&st.slots[slot], st.stats.mode) {
            (Some(buffer), Some(mode)) => Ticket {
                slot,
                buffer: Arc::clone(buffer),
                mode,
                sequence: st.stats.frames_delivered,
            },
            // pending() guarantees the slot; a mode always precedes allocation.
            _ => return Err(CaptureError::Stopped),
        };
        drop(st);
        self.notify();
        Ok(Some(ticket))
    }

    /// Consumer dropped its view.
    pub fn release(&self) {
        let mut st = self.lock();
        if st.consumer_holding {
            st.consumer_holding = false;
            drop(st);
            self.notify();
        }
    }

    /// Block until `slot` is not held by the consumer. Fails once stopping.
    pub fn wait_slot_free(&self, slot: usize) -> Result<MutexGuard<'_, SyncState>, CaptureError> {
        let mut st = self.lock();
        loop {
            if st.stopping {
                return Err(CaptureError::Stopped);
            }
            if !(st.consumer_holding && st.consumer_index == slot) {
                return Ok(st);
            }
            st = self.wait(st);
        }
    }
}
