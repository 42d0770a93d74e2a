use std::sync::{Mutex, MutexGuard, PoisonError};

struct Inner {
    storage: Box<[u8]>,
    /// Next write offset. Only the producer moves it.
    head: usize,
    /// Next read offset. Only the removing consumer moves it.
    tail: usize,
    /// Valid unread bytes, `0 <= count <= capacity`.
    count: usize,
}

/// Fixed-capacity byte FIFO shared by the ingest, playback and analysis tasks.
/// The lock covers only index arithmetic and a copy of at most two segments.
pub struct RingBuffer {
    capacity: usize,
    mask: usize,
    inner: Mutex<Inner>,
}

impl RingBuffer {
    /// Panics if `capacity` is not a non-zero power of two; configuration
    /// validation rejects such values before the buffer is built.
    pub fn new(capacity: usize) -> RingBuffer {
        assert!(
            capacity.is_power_of_two(),
            "ring buffer capacity must be a power of two, got {capacity}"
        );
        RingBuffer {
            capacity,
            mask: capacity - 1,
            inner: Mutex::new(Inner {
                storage: vec![0u8; capacity].into_boxed_slice(),
                head: 0,
                tail: 0,
                count: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking holder can only have been mid-copy; indices are
        // updated after the copy, so the state is still consistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available_to_read(&self) -> usize {
        self.lock().count
    }

    pub fn available_to_write(&self) -> usize {
        self.capacity - self.lock().count
    }

    /// Length of the unread run starting at the read offset that does not
    /// cross the end of storage.
    pub fn contiguous_readable(&self) -> usize {
        let inner = self.lock();
        inner.count.min(self.capacity - inner.tail)
    }

    /// Copies as much of `bytes` as fits into free space. Never blocks;
    /// returns 0 when the buffer is full.
    pub fn write(&self, bytes: &[u8]) -> usize {
        let mut inner = self.lock();
        let n = bytes.len().min(self.capacity - inner.count);
        if n == 0 {
            return 0;
        }

        let head = inner.head;
        let first = n.min(self.capacity - head);
        inner.storage[head..head + first].copy_from_slice(&bytes[..first]);
        inner.storage[..n - first].copy_from_slice(&bytes[first..n]);

        inner.head = (head + n) & self.mask;
        inner.count += n;
        n
    }

    /// Removes up to `out.len()` bytes into `out`, oldest first. Playback
    /// peeks and consumes instead, since the bus may take only part of a run.
    #[cfg(test)]
    pub fn read(&self, out: &mut [u8]) -> usize {
        let mut inner = self.lock();
        let n = copy_out(&inner, self.capacity, 0, out);
        inner.tail = (inner.tail + n) & self.mask;
        inner.count -= n;
        n
    }

    /// Copies up to `out.len()` bytes starting `offset` bytes past the oldest
    /// unread byte, without removing anything.
    pub fn peek(&self, offset: usize, out: &mut [u8]) -> usize {
        let inner = self.lock();
        copy_out(&inner, self.capacity, offset, out)
    }

    /// Drops up to `n` of the oldest bytes, returning how many were dropped.
    pub fn consume(&self, n: usize) -> usize {
        let mut inner = self.lock();
        let n = n.min(inner.count);
        inner.tail = (inner.tail + n) & self.mask;
        inner.count -= n;
        n
    }
}

fn copy_out(inner: &Inner, capacity: usize, offset: usize, out: &mut [u8]) -> usize {
    let n = out.len().min(inner.count.saturating_sub(offset));
    if n == 0 {
        return 0;
    }

    let start = (inner.tail + offset) % capacity;
    let first = n.min(capacity - start);
    out[..first].copy_from_slice(&inner.storage[start..start + first]);
    out[first..n].copy_from_slice(&inner.storage[..n - first]);
    n
}
