//! Fixed-capacity read buffers and the pool that recycles them.
//!
//! Every connection owns exactly one [`ReadBuffer`] for its lifetime. The
//! buffer is reset before each read, so a delivery never carries bytes from
//! an earlier one.

/// A fixed-capacity buffer filled by one read at a time.
#[derive(Debug)]
pub struct ReadBuffer {
    data: Box<[u8]>,
    filled: usize,
}

impl ReadBuffer {
    /// Create a zeroed buffer of `capacity` bytes.
    ///
    /// # Panics
    /// Panics if `capacity` is zero (debug builds only).
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0, "read buffer capacity must be positive");
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            filled: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Forget previously read bytes.
    pub fn reset(&mut self) {
        self.filled = 0;
    }

    /// The region still available for reading into.
    pub fn unfilled_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.filled..]
    }

    /// Mark `n` more bytes of the unfilled region as read.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.filled + n <= self.data.len(), "advance past capacity");
        self.filled = (self.filled + n).min(self.data.len());
    }

    /// Bytes read since the last reset.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    #[cfg(test)]
    pub fn is_full(&self) -> bool {
        self.filled == self.data.len()
    }
}

/// Recycles read buffers between connections.
///
/// Buffers are pre-allocated and reused to avoid allocation overhead on the
/// accept path. When the free list runs dry a fresh buffer is allocated; at
/// most `max_idle` buffers are kept around once released.
pub struct BufferPool {
    /// Stack of idle buffers (LIFO for cache locality).
    free_list: Vec<ReadBuffer>,
    /// Size of each buffer.
    buffer_size: usize,
    max_idle: usize,
}

impl BufferPool {
    /// Create a pool with `count` pre-allocated buffers of `size` bytes.
    pub fn new(count: usize, size: usize) -> Self {
        let free_list = (0..count).map(|_| ReadBuffer::new(size)).collect();
        Self {
            free_list,
            buffer_size: size,
            max_idle: count,
        }
    }

    /// Take a buffer from the pool, allocating if none is idle.
    pub fn alloc(&mut self) -> ReadBuffer {
        match self.free_list.pop() {
            Some(mut buf) => {
                buf.reset();
                buf
            }
            None => ReadBuffer::new(self.buffer_size),
        }
    }

    /// Return a buffer to the pool.
    pub fn release(&mut self, buf: ReadBuffer) {
        if self.free_list.len() < self.max_idle && buf.capacity() == self.buffer_size {
            self.free_list.push(buf);
        }
    }

    #[cfg(test)]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Get the number of idle buffers.
    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.free_list.len()
    }
}
