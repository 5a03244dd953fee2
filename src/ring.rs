use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Single-producer/single-reader byte FIFO.
///
/// One thread writes, one thread reads, neither takes a lock. The write
/// index is published with `Release` and observed with `Acquire`, so a
/// reader that sees an advanced write index also sees every byte of that
/// write. One slot is kept free to distinguish full from empty, which
/// gives `write_space() + read_space() <= capacity() - 1`.
///
/// Concurrent writes or concurrent reads are not supported.
pub struct RingBuffer {
    buf: UnsafeCell<Box<[u8]>>,
    mask: usize,
    write_idx: AtomicUsize,
    read_idx: AtomicUsize,
}

unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Capacity is rounded up to the next power of two.
    pub fn new(capacity: usize) -> Self {
        let cap = capacity.max(2).next_power_of_two();
        Self {
            buf: UnsafeCell::new(vec![0u8; cap].into_boxed_slice()),
            mask: cap - 1,
            write_idx: AtomicUsize::new(0),
            read_idx: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Bytes available for reading. Never overestimates.
    pub fn read_space(&self) -> usize {
        let w = self.write_idx.load(Ordering::Acquire);
        let r = self.read_idx.load(Ordering::Relaxed);
        w.wrapping_sub(r)
    }

    /// Bytes available for writing. Never overestimates.
    pub fn write_space(&self) -> usize {
        let w = self.write_idx.load(Ordering::Relaxed);
        let r = self.read_idx.load(Ordering::Acquire);
        self.mask - w.wrapping_sub(r)
    }

    /// Writes all of `data` or nothing. Returns false when the free space
    /// is insufficient; no partial write occurs.
    pub fn write(&self, data: &[u8]) -> bool {
        if data.len() > self.write_space() {
            return false;
        }
        let w = self.write_idx.load(Ordering::Relaxed);
        self.copy_in(w, data);
        self.write_idx
            .store(w.wrapping_add(data.len()), Ordering::Release);
        true
    }

    /// Reads exactly `out.len()` bytes and advances the read index, or
    /// returns false leaving the buffer untouched.
    pub fn read(&self, out: &mut [u8]) -> bool {
        if !self.peek(out) {
            return false;
        }
        let r = self.read_idx.load(Ordering::Relaxed);
        self.read_idx
            .store(r.wrapping_add(out.len()), Ordering::Release);
        true
    }

    /// Reads exactly `out.len()` bytes without advancing the read index.
    pub fn peek(&self, out: &mut [u8]) -> bool {
        if out.len() > self.read_space() {
            return false;
        }
        let r = self.read_idx.load(Ordering::Relaxed);
        self.copy_out(r, out);
        true
    }

    fn copy_in(&self, idx: usize, data: &[u8]) {
        // SAFETY: only the producer writes the region [idx, idx + len),
        // which read_space guarantees the reader does not touch yet.
        let buf = unsafe { &mut *self.buf.get() };
        let pos = idx & self.mask;
        let first = data.len().min(buf.len() - pos);
        buf[pos..pos + first].copy_from_slice(&data[..first]);
        if first < data.len() {
            buf[..data.len() - first].copy_from_slice(&data[first..]);
        }
    }

    fn copy_out(&self, idx: usize, out: &mut [u8]) {
        // SAFETY: only the reader observes the region [idx, idx + len),
        // published by the producer's Release store.
        let buf = unsafe { &*self.buf.get() };
        let pos = idx & self.mask;
        let first = out.len().min(buf.len() - pos);
        out[..first].copy_from_slice(&buf[pos..pos + first]);
        if first < out.len() {
            out[first..].copy_from_slice(&buf[..out.len() - first]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let rb = RingBuffer::new(64);
        assert!(rb.write(b"hello"));
        assert!(rb.write(b" world"));
        let mut out = [0u8; 11];
        assert!(rb.read(&mut out));
        assert_eq!(&out, b"hello world");
    }

    #[test]
    fn rejects_oversized_write_atomically() {
        let rb = RingBuffer::new(8);
        assert!(rb.write(b"1234567"));
        assert!(!rb.write(b"x"));
        assert_eq!(rb.read_space(), 7);
        let mut out = [0u8; 7];
        assert!(rb.read(&mut out));
        assert_eq!(&out, b"1234567");
    }

    #[test]
    fn peek_does_not_advance() {
        let rb = RingBuffer::new(16);
        assert!(rb.write(b"abcd"));
        let mut out = [0u8; 4];
        assert!(rb.peek(&mut out));
        assert_eq!(&out, b"abcd");
        assert_eq!(rb.read_space(), 4);
        assert!(rb.read(&mut out));
        assert_eq!(rb.read_space(), 0);
        assert!(!rb.read(&mut out));
    }

    #[test]
    fn wraps_around() {
        let rb = RingBuffer::new(8);
        let mut out = [0u8; 5];
        for round in 0..10u8 {
            let data = [round; 5];
            assert!(rb.write(&data));
            assert!(rb.read(&mut out));
            assert_eq!(out, data);
        }
    }

    #[test]
    fn space_invariant() {
        let rb = RingBuffer::new(32);
        assert!(rb.write_space() + rb.read_space() <= rb.capacity() - 1);
        assert!(rb.write(&[0u8; 20]));
        assert!(rb.write_space() + rb.read_space() <= rb.capacity() - 1);
        let mut out = [0u8; 10];
        assert!(rb.read(&mut out));
        assert!(rb.write_space() + rb.read_space() <= rb.capacity() - 1);
    }
}
