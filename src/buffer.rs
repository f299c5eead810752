//! Fixed-capacity receive buffer for the real-time stream

/// Capacity of the receive buffer.
///
/// Large enough for the biggest packet any UR port emits (1295 bytes seen on
/// 30001), but below twice the smallest real-time packet (764 bytes), so the
/// buffer can never hold two complete packets at once.
pub const RAW_BUFFER_CAPACITY: usize = 1500;

/// Byte buffer with a fill cursor. Bytes are appended at the cursor by the
/// transport and removed from the front by the decoder.
pub struct RawBuffer {
    data: Box<[u8; RAW_BUFFER_CAPACITY]>,
    len: usize,
}

impl RawBuffer {
    pub fn new() -> Self {
        Self {
            data: Box::new([0u8; RAW_BUFFER_CAPACITY]),
            len: 0,
        }
    }

    /// Buffered bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        RAW_BUFFER_CAPACITY
    }

    /// Unfilled tail, for a reader to write into
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    /// Mark `count` bytes of the spare tail as filled
    pub fn advance(&mut self, count: usize) {
        self.len = (self.len + count).min(RAW_BUFFER_CAPACITY);
    }

    /// Append as much of `bytes` as fits, returning how many were taken
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> usize {
        let count = bytes.len().min(RAW_BUFFER_CAPACITY - self.len);
        self.data[self.len..self.len + count].copy_from_slice(&bytes[..count]);
        self.len += count;
        count
    }

    /// Drop the first `count` bytes, shifting the remainder to the front
    pub fn consume(&mut self, count: usize) {
        let count = count.min(self.len);
        self.data.copy_within(count..self.len, 0);
        self.len -= count;
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl Default for RawBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RawBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawBuffer")
            .field("len", &self.len)
            .field("capacity", &RAW_BUFFER_CAPACITY)
            .finish()
    }
}
