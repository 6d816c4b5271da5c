//! Bounded FIFO of audio samples used as the playback jitter queue.
//!
//! Samples are pushed by the call side as remote frames arrive and pulled by
//! the output device callback.  When the device falls behind and the queue
//! fills up, the **oldest** samples are overwritten so latency never grows
//! past the configured capacity.
//!
//! ```rust
//! use voice_call::audio::RingBuffer;
//!
//! let mut queue = RingBuffer::new(4);
//! let dropped = queue.push_slice(&[1.0, 2.0, 3.0, 4.0, 5.0]);
//! assert_eq!(dropped, 1);
//!
//! let mut out = [0.0_f32; 2];
//! assert_eq!(queue.pop_into(&mut out), 2);
//! assert_eq!(out, [2.0, 3.0]);
//! assert_eq!(queue.len(), 2);
//! ```

// ---------------------------------------------------------------------------
// RingBuffer
// ---------------------------------------------------------------------------

/// A fixed-capacity circular FIFO.
///
/// ## Overflow behaviour
///
/// When [`push_slice`](Self::push_slice) would exceed `capacity`, the oldest
/// samples are overwritten and the number lost is returned.  The buffer never
/// allocates beyond its initial capacity.
pub struct RingBuffer<T> {
    buf: Vec<T>,
    capacity: usize,
    /// Index of the *next* write position (wraps around `capacity`).
    write_pos: usize,
    len: usize,
}

impl<T: Copy + Default> RingBuffer<T> {
    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "RingBuffer capacity must be > 0");
        Self {
            buf: vec![T::default(); capacity],
            capacity,
            write_pos: 0,
            len: 0,
        }
    }

    /// Append `data`, returning how many of the oldest samples were
    /// overwritten to make room.
    pub fn push_slice(&mut self, data: &[T]) -> usize {
        let mut overwritten = 0;
        for &item in data {
            self.buf[self.write_pos] = item;
            self.write_pos = (self.write_pos + 1) % self.capacity;
            if self.len < self.capacity {
                self.len += 1;
            } else {
                overwritten += 1;
            }
        }
        overwritten
    }

    /// Move up to `out.len()` of the oldest samples into `out`.
    ///
    /// Returns the number of samples written; the rest of `out` is untouched.
    pub fn pop_into(&mut self, out: &mut [T]) -> usize {
        let count = out.len().min(self.len);
        let read_pos = self.read_pos();
        for (i, slot) in out.iter_mut().take(count).enumerate() {
            *slot = self.buf[(read_pos + i) % self.capacity];
        }
        self.len -= count;
        count
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn read_pos(&self) -> usize {
        (self.write_pos + self.capacity - self.len) % self.capacity
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
