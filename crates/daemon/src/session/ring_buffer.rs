//! Fixed-capacity scrollback buffer.
//!
//! Holds the most recent `capacity` characters of a session's output. Older
//! characters are evicted from the front as new output arrives. The retained
//! text is always available as one contiguous `&str`, which is what gets
//! replayed to a client when it reattaches.

/// Character-counted ring buffer over process output.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    /// Backing storage. Bytes before `start` are evicted and awaiting compaction.
    buf: String,
    /// Byte offset of the oldest retained character.
    start: usize,
    /// Number of retained characters.
    len: usize,
    /// Maximum number of retained characters.
    capacity: usize,
    /// Characters appended over the buffer's lifetime.
    total_written: u64,
}

impl RingBuffer {
    /// Creates an empty buffer that retains at most `capacity` characters.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: String::new(),
            start: 0,
            len: 0,
            capacity,
            total_written: 0,
        }
    }

    /// Appends a chunk, evicting the oldest characters beyond capacity.
    pub fn append(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }

        let incoming = chunk.chars().count();
        self.total_written += incoming as u64;

        if incoming >= self.capacity {
            // The chunk alone fills the buffer; nothing older survives.
            let tail = &chunk[byte_offset_of(chunk, incoming - self.capacity)..];
            self.buf.clear();
            self.buf.push_str(tail);
            self.start = 0;
            self.len = self.capacity;
            return;
        }

        self.buf.push_str(chunk);
        self.len += incoming;

        if self.len > self.capacity {
            let excess = self.len - self.capacity;
            self.start += byte_offset_of(&self.buf[self.start..], excess);
            self.len = self.capacity;
        }

        if self.start > 0 && self.start >= self.buf.len() / 2 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
    }

    /// Returns the retained output, oldest first.
    pub fn contents(&self) -> &str {
        &self.buf[self.start..]
    }

    /// Number of retained characters.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true when nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of retained characters.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Characters appended since creation, including evicted ones.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }
}

/// Byte offset of the `n`th character of `s` (or `s.len()` past the end).
fn byte_offset_of(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map_or(s.len(), |(i, _)| i)
}
