//! Fixed-capacity SPSC byte ring between a stream's producer and the render thread.
//!
//! Each half only advances its own cursor, so the two halves may be used
//! from different threads without a shared lock. Writing more than
//! [`RingProducer::write_size`] or reading more than
//! [`RingConsumer::read_size`] is a caller bug and trips a debug assertion.

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

/// Write half.
pub struct RingProducer {
    inner: HeapProd<u8>,
}

/// Read half.
pub struct RingConsumer {
    inner: HeapCons<u8>,
}

/// Create a ring holding `capacity` bytes (at least one).
pub fn ring_buffer(capacity: usize) -> (RingProducer, RingConsumer) {
    let (inner_p, inner_c) = HeapRb::<u8>::new(capacity.max(1)).split();
    (RingProducer { inner: inner_p }, RingConsumer { inner: inner_c })
}

impl RingProducer {
    /// Free bytes.
    pub fn write_size(&self) -> usize {
        self.inner.vacant_len()
    }

    /// Occupied bytes.
    pub fn read_size(&self) -> usize {
        self.inner.occupied_len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity().get()
    }

    /// Append `data`. Requires `data.len() <= write_size()`.
    pub fn write(&mut self, data: &[u8]) {
        debug_assert!(
            data.len() <= self.write_size(),
            "ring overrun: writing {} bytes with {} free",
            data.len(),
            self.write_size()
        );
        let written = self.inner.push_slice(data);
        debug_assert_eq!(written, data.len());
    }
}

impl RingConsumer {
    /// Occupied bytes.
    pub fn read_size(&self) -> usize {
        self.inner.occupied_len()
    }

    /// Free bytes.
    pub fn write_size(&self) -> usize {
        self.inner.vacant_len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity().get()
    }

    /// Fill `dest` from the ring. Requires `dest.len() <= read_size()`.
    pub fn read(&mut self, dest: &mut [u8]) {
        debug_assert!(
            dest.len() <= self.read_size(),
            "ring underrun: reading {} bytes with {} available",
            dest.len(),
            self.read_size()
        );
        let read = self.inner.pop_slice(dest);
        debug_assert_eq!(read, dest.len());
    }

    /// Discard up to `count` bytes; returns how many were dropped.
    pub fn skip(&mut self, count: usize) -> usize {
        self.inner.skip(count.min(self.read_size()))
    }

    /// Discard everything buffered.
    pub fn clear(&mut self) -> usize {
        self.inner.clear()
    }
}
