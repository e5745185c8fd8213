//! Fixed ring of pixel buffers registered with the display subsystem.

use std::sync::Arc;

use tracing::{debug, info};
use vscreen_core::DisplayMode;

use crate::aligned::{AlignedBuffer, BUFFER_ALIGNMENT};
use crate::device::{BufferRegistration, DeviceContext};
use crate::error::CaptureError;
use crate::sync::Shared;

/// Owns the slot table stored in [`Shared`]; the only code that allocates,
/// registers or frees slot buffers.
#[derive(Debug)]
pub(crate) struct BufferPool {
    shared: Arc<Shared>,
    alignment: usize,
}

impl BufferPool {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self { shared, alignment: BUFFER_ALIGNMENT }
    }

    pub fn len(&self) -> usize {
        self.shared.lock().slots.len()
    }

    /// Replace every slot with a buffer sized for `mode`.
    ///
    /// Slots are processed in order; a slot the consumer is still reading is
    /// waited on before it is unregistered. A zero-sized mode leaves the ring
    /// empty. The only error is [`CaptureError::Stopped`], when shutdown interrupts a wait.
    pub fn reconcile(&mut self, ctx: &mut dyn DeviceContext, mode: &DisplayMode) -> Result<(), CaptureError> {
        let len = mode.byte_size();
        info!(
            "Reallocating {} buffers: {} ({} bytes each)",
            self.len(),
            mode,
            len
        );

        // Whatever was completed refers to the old geometry.
        self.shared.lock().retract_pending();

        for slot in 0..self.len() {
            let old = {
                let mut st = self.shared.wait_slot_free(slot)?;
                st.slots[slot].take()
            };
            if old.is_some() {
                ctx.unregister_buffer(slot);
            }
            drop(old);

            if len == 0 {
                continue;
            }

            let buffer = AlignedBuffer::new(len, self.alignment);
            ctx.register_buffer(BufferRegistration {
                id: slot,
                base: buffer.base(),
                len,
                width: mode.width,
                height: mode.height,
                stride: mode.stride(),
            });
            debug!("Slot[{}] registered (offset={} len={})", slot, buffer.offset(), len);
            self.shared.lock().slots[slot] = Some(Arc::new(buffer));
        }
        Ok(())
    }

    /// Unregister and free every slot. Used at shutdown, so it never waits.
    pub fn release_all(&mut self, ctx: &mut dyn DeviceContext) {
        let taken: Vec<_> = {
            let mut st = self.shared.lock();
            st.retract_pending();
            st.slots.iter_mut().map(Option::take).collect()
        };
        for (slot, buffer) in taken.into_iter().enumerate() {
            if buffer.is_some() {
                ctx.unregister_buffer(slot);
                debug!("Slot[{}] unregistered", slot);
            }
        }
    }

    #[cfg(test)]
    pub fn is_initialized(&self) -> bool {
        self.shared.lock().initialized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Wait;
    use std::collections::BTreeMap;
    use std::thread;
    use std::time::Duration;
    use vscreen_core::{PixelFormat, Rect};

    #[derive(Default)]
    struct Table {
        registered: BTreeMap<usize, BufferRegistration>,
        ops: Vec<String>,
    }

    impl DeviceContext for Table {
        fn register_buffer(&mut self, buffer: BufferRegistration) {
            self.ops.push(format!("register {}", buffer.id));
            self.registered.insert(buffer.id, buffer);
        }

        fn unregister_buffer(&mut self, id: usize) {
            self.ops.push(format!("unregister {id}"));
            self.registered.remove(&id);
        }

        fn grab_pixels(&mut self) -> Vec<Rect> {
            Vec::new()
        }
    }

    fn mode(w: u32, h: u32) -> DisplayMode {
        DisplayMode::new(w, h, 60, 32, PixelFormat::XRGB8888.0)
    }

    fn check_invariants(shared: &Shared, table: &Table, mode: &DisplayMode) {
        let st = shared.lock();
        for (i, slot) in st.slots.iter().enumerate() {
            let buf = slot.as_ref().expect("slot allocated");
            assert!(buf.len() >= mode.byte_size());
            assert_eq!(buf.base().as_ptr() as usize % BUFFER_ALIGNMENT, 0);
            let reg = table.registered.get(&i).expect("slot registered");
            assert_eq!(reg.id, i);
            assert_eq!(reg.base, buf.base());
            assert_eq!(reg.stride, mode.stride());
        }
    }

    #[test]
    fn reconcile_allocates_and_registers_every_slot() {
        let shared = Arc::new(Shared::new(3));
        let mut pool = BufferPool::new(Arc::clone(&shared));
        let mut table = Table::default();

        for m in [mode(640, 480), mode(1920, 1080), mode(800, 600)] {
            pool.reconcile(&mut table, &m).unwrap();
            check_invariants(&shared, &table, &m);
        }
        assert!(pool.is_initialized());
        assert_eq!(
            &table.ops[..6],
            &["register 0", "register 1", "register 2", "unregister 0", "register 0", "unregister 1"]
        );
    }

    #[test]
    fn zero_sized_mode_empties_ring() {
        let shared = Arc::new(Shared::new(2));
        let mut pool = BufferPool::new(Arc::clone(&shared));
        let mut table = Table::default();
        pool.reconcile(&mut table, &mode(64, 64)).unwrap();
        pool.reconcile(&mut table, &mode(0, 0)).unwrap();
        assert!(table.registered.is_empty());
        assert!(!pool.is_initialized());
        assert_eq!(shared.begin_update(), None);
    }

    #[test]
    fn release_all_unregisters_everything() {
        let shared = Arc::new(Shared::new(2));
        let mut pool = BufferPool::new(Arc::clone(&shared));
        let mut table = Table::default();
        pool.reconcile(&mut table, &mode(64, 64)).unwrap();
        pool.release_all(&mut table);
        assert!(table.registered.is_empty());
        assert_eq!(table.ops.iter().filter(|op| op.starts_with("unregister")).count(), 2);
    }

    #[test]
    fn reconcile_waits_for_held_slot() {
        let shared = Arc::new(Shared::new(2));
        let mut pool = BufferPool::new(Arc::clone(&shared));
        let mut table = Table::default();
        let m = mode(32, 32);
        pool.reconcile(&mut table, &m).unwrap();
        shared.set_mode(m);

        let slot = shared.begin_update().unwrap();
        shared.complete(slot);
        let ticket = shared.take(Wait::Never).unwrap().unwrap();
        assert_eq!(ticket.slot, 1);

        let worker = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let mut pool = BufferPool::new(shared);
                let mut table = Table::default();
                pool.reconcile(&mut table, &mode(64, 64)).map(|_| table.ops)
            })
        };
        thread::sleep(Duration::from_millis(30));
        // Slot 0 was replaced, slot 1 is still held by the consumer.
        assert!(!worker.is_finished());
        assert!(shared.lock().slots[1].is_some());

        shared.release();
        let ops = worker.join().unwrap().unwrap();
        assert_eq!(ops, ["unregister 0", "register 0", "unregister 1", "register 1"]);
        // The consumer's old view is still backed by its own allocation.
        assert_eq!(ticket.buffer.len(), m.byte_size());
    }

    #[test]
    fn stop_interrupts_reconcile_wait() {
        let shared = Arc::new(Shared::new(2));
        let mut pool = BufferPool::new(Arc::clone(&shared));
        let mut table = Table::default();
        let m = mode(16, 16);
        pool.reconcile(&mut table, &m).unwrap();
        shared.set_mode(m);
        let slot = shared.begin_update().unwrap();
        shared.complete(slot);
        shared.take(Wait::Never).unwrap().unwrap();

        let worker = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let mut pool = BufferPool::new(shared);
                pool.reconcile(&mut Table::default(), &mode(32, 32))
            })
        };
        thread::sleep(Duration::from_millis(20));
        shared.stop();
        assert!(matches!(worker.join().unwrap(), Err(CaptureError::Stopped)));
    }
}
