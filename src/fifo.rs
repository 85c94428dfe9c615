//! Receive FIFO
//!
//! OUT data is copied out of the receive buffer into this FIFO before the
//! next read is armed. There's no backpressure toward the host; when the
//! application doesn't drain the FIFO fast enough, the newest bytes are
//! dropped and counted.

pub struct Fifo<const N: usize> {
    storage: [u8; N],
    /// Index of the oldest byte.
    head: usize,
    len: usize,
    dropped: usize,
}

impl<const N: usize> Fifo<N> {
    pub const fn new() -> Self {
        Self {
            storage: [0; N],
            head: 0,
            len: 0,
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Total number of bytes dropped because the FIFO was full.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Append as much of `data` as fits, returning the number of bytes stored.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let accepted = data.len().min(N - self.len);
        for &byte in &data[..accepted] {
            let tail = (self.head + self.len) % N;
            self.storage[tail] = byte;
            self.len += 1;
        }
        self.dropped = self.dropped.saturating_add(data.len() - accepted);
        accepted
    }

    /// Move the oldest bytes into `dst`, returning the number of bytes moved.
    pub fn pop(&mut self, dst: &mut [u8]) -> usize {
        let count = dst.len().min(self.len);
        for slot in &mut dst[..count] {
            *slot = self.storage[self.head];
            self.head = (self.head + 1) % N;
        }
        self.len -= count;
        count
    }
}
