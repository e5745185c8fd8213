//! Heap buffers whose usable region starts on a fixed boundary.

use std::ptr::NonNull;

/// Alignment the display subsystem expects for registered buffers.
pub const BUFFER_ALIGNMENT: usize = 128;

/// Owned byte storage padded so that `offset()` lands on `alignment`.
///
/// The memory is only reached through raw pointers; the engine's handoff
/// protocol decides who may read or write it at any time.
pub struct AlignedBuffer {
    storage: NonNull<[u8]>,
    offset: usize,
    len: usize,
}

// SAFETY: the buffer owns its allocation; concurrent access is coordinated
// by the slot handoff (written only while not consumer-exposed).
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate `len` zeroed usable bytes aligned to `alignment` (a power of two).
    pub fn new(len: usize, alignment: usize) -> Self {
        debug_assert!(alignment.is_power_of_two());
        let boxed: Box<[u8]> = vec![0u8; len + alignment].into_boxed_slice();
        let raw = Box::into_raw(boxed);
        let addr = raw as *mut u8 as usize;
        let offset = (alignment - addr % alignment) % alignment;
        // SAFETY: Box::into_raw never returns null.
        let storage = unsafe { NonNull::new_unchecked(raw) };
        Self { storage, offset, len }
    }

    /// Bytes between the allocation start and the usable region.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Usable length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Start of the usable region.
    pub fn base(&self) -> NonNull<u8> {
        // SAFETY: offset < alignment <= padding, so the pointer stays in bounds.
        unsafe { NonNull::new_unchecked((self.storage.as_ptr() as *mut u8).add(self.offset)) }
    }

    /// View of the usable region.
    ///
    /// # Safety
    /// Nobody may write the buffer while the returned slice is alive.
    pub unsafe fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base().as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: storage came from Box::into_raw in `new` and is dropped once.
        drop(unsafe { Box::from_raw(self.storage.as_ptr()) });
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("base", &self.base())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}
