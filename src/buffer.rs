//! Transfer buffers shared with the USB stack

use core::{
    cell::UnsafeCell,
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};

/// Size of the receive and transmit buffers.
pub const BUFFER_SIZE: usize = 2048;

/// Statically-allocated memory for one transfer direction.
///
/// The USB stack reads and writes this memory directly, so it's aligned for
/// DMA. If your part needs the memory in a particular (non-cacheable) region,
/// place the `static` with a `#[link_section]`.
///
/// ```
/// use cdc_acm_device::{TransferMemory, BUFFER_SIZE};
///
/// static RX: TransferMemory<BUFFER_SIZE> = TransferMemory::new();
/// let buffer = RX.take().unwrap();
/// assert_eq!(buffer.len(), BUFFER_SIZE);
/// assert!(RX.take().is_none());
/// ```
#[repr(C, align(32))]
pub struct TransferMemory<const SIZE: usize> {
    memory: UnsafeCell<[u8; SIZE]>,
    taken: AtomicBool,
}

// Safety: the memory is only reachable through the single `Buffer`
// handed out by `take()`.
unsafe impl<const SIZE: usize> Sync for TransferMemory<SIZE> {}

impl<const SIZE: usize> TransferMemory<SIZE> {
    /// Allocate zeroed transfer memory.
    pub const fn new() -> Self {
        Self {
            memory: UnsafeCell::new([0; SIZE]),
            taken: AtomicBool::new(false),
        }
    }

    /// Acquire the buffer that covers this memory.
    ///
    /// Returns `None` if the memory was already taken.
    pub fn take(&'static self) -> Option<Buffer> {
        if self.taken.swap(true, Ordering::SeqCst) {
            return None;
        }
        // Safety: pointer to static memory, which we now exclusively own.
        let ptr = unsafe { NonNull::new_unchecked(self.memory.get().cast::<u8>()) };
        Some(Buffer { ptr, len: SIZE })
    }

    /// Return a buffer taken from this memory, so it can be taken again.
    pub(crate) fn release(&'static self, buffer: Buffer) {
        let Buffer { ptr, .. } = buffer;
        debug_assert_eq!(ptr.as_ptr(), self.memory.get().cast::<u8>());
        self.taken.store(false, Ordering::SeqCst);
    }
}

impl<const SIZE: usize> Default for TransferMemory<SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive handle to transfer memory.
///
/// The core lends the buffer's address to the USB stack for the duration
/// of a transfer. All reads and writes are volatile, since the stack (or
/// its DMA engine) touches the memory behind our back.
pub struct Buffer {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: `Buffer` is the sole owner of its memory.
unsafe impl Send for Buffer {}

impl Buffer {
    /// Returns the buffer capacity.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the buffer has no capacity.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The address handed to the stack for a transfer.
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Copy the first `dst.len()` bytes of the buffer into `dst`.
    ///
    /// Returns the number of bytes copied, which is constrained by the buffer
    /// capacity.
    pub fn volatile_read(&self, dst: &mut [u8]) -> usize {
        self.volatile_read_at(0, dst)
    }

    /// Copy the buffer bytes starting at `offset` into `dst`.
    ///
    /// Returns the number of bytes copied, which is constrained by the bytes
    /// remaining after `offset`.
    pub fn volatile_read_at(&self, offset: usize, dst: &mut [u8]) -> usize {
        let size = dst.len().min(self.len.saturating_sub(offset));
        if size == 0 {
            return 0;
        }
        // Safety: offset is in bounds, checked above.
        let start = unsafe { self.ptr.as_ptr().add(offset) };
        dst.iter_mut().take(size).fold(start, |src, dst| unsafe {
            *dst = src.read_volatile();
            src.add(1)
        });
        size
    }

    /// Copy `src` into the start of the buffer.
    ///
    /// Returns the number of bytes written, which is constrained by the buffer
    /// capacity.
    pub fn volatile_write(&mut self, src: &[u8]) -> usize {
        let size = src.len().min(self.len);
        src.iter()
            .take(size)
            .fold(self.ptr.as_ptr(), |dst, src| unsafe {
                dst.write_volatile(*src);
                dst.add(1)
            });
        size
    }

    /// Fill the buffer with the power-on test payload
    ///
    /// The ASCII digits `1234567890`, then `a` until the end.
    pub fn fill_test_pattern(&mut self) {
        const DIGITS: &[u8] = b"1234567890";
        let written = self.volatile_write(DIGITS);
        for offset in written..self.len {
            // Safety: offset is in bounds.
            unsafe { self.ptr.as_ptr().add(offset).write_volatile(b'a') };
        }
    }
}

#[cfg(test)]
mod test {
    use super::{TransferMemory, BUFFER_SIZE};

    extern crate std;
    use std::boxed::Box;

    fn leak<const SIZE: usize>() -> &'static TransferMemory<SIZE> {
        Box::leak(Box::new(TransferMemory::new()))
    }

    #[test]
    fn take_once() {
        let memory = leak::<32>();
        assert!(memory.take().is_some());
        for _ in 0..10 {
            assert!(memory.take().is_none());
        }
    }

    #[test]
    fn release_allows_take() {
        let memory = leak::<32>();
        let buffer = memory.take().unwrap();
        memory.release(buffer);
        assert!(memory.take().is_some());
        assert!(memory.take().is_none());
    }

    #[test]
    fn alignment() {
        let memory = leak::<BUFFER_SIZE>();
        let buffer = memory.take().unwrap();
        assert_eq!(buffer.as_ptr().as_ptr() as usize % 32, 0);
        assert_eq!(buffer.len(), BUFFER_SIZE);
    }

    #[test]
    fn read_write_constrained_by_capacity() {
        let mut buffer = leak::<8>().take().unwrap();
        assert_eq!(buffer.volatile_write(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]), 8);

        let mut dst = [0; 4];
        assert_eq!(buffer.volatile_read(&mut dst), 4);
        assert_eq!(dst, [1, 2, 3, 4]);

        let mut dst = [0; 12];
        assert_eq!(buffer.volatile_read(&mut dst), 8);
        assert_eq!(&dst[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn read_at_offset() {
        let mut buffer = leak::<8>().take().unwrap();
        buffer.volatile_write(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let mut dst = [0; 4];
        assert_eq!(buffer.volatile_read_at(6, &mut dst), 2);
        assert_eq!(&dst[..2], &[7, 8]);
        assert_eq!(buffer.volatile_read_at(8, &mut dst), 0);
        assert_eq!(buffer.volatile_read_at(100, &mut dst), 0);
    }

    #[test]
    fn test_pattern() {
        let mut buffer = leak::<BUFFER_SIZE>().take().unwrap();
        buffer.fill_test_pattern();

        let mut contents = [0; BUFFER_SIZE];
        buffer.volatile_read(&mut contents);
        assert_eq!(&contents[..10], b"1234567890");
        assert!(contents[10..].iter().all(|&b| b == b'a'));
    }
}
