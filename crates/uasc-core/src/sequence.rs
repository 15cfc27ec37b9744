//! Per-channel sequence numbers.
//!
//! Every chunk sent on a secure channel carries a sequence number one
//! greater than the previous chunk's. The counter survives token renewal;
//! only closing the channel resets it.

/// Largest sequence number a sender may use (`u32::MAX - 1024`).
///
/// After it the counter must restart below 1024; we restart at 1.
pub const MAX_SEQUENCE_NUMBER: u32 = u32::MAX - 1024;

/// First value used on a fresh channel and after wrap-around.
pub const FIRST_SEQUENCE_NUMBER: u32 = 1;

/// Receivers accept any value below this right after the wrap.
pub const WRAP_LIMIT: u32 = 1024;

#[derive(Debug, Clone)]
pub struct SequenceNumberGenerator {
    counter: u32,
}

impl SequenceNumberGenerator {
    pub fn new() -> Self {
        Self::starting_at(FIRST_SEQUENCE_NUMBER)
    }

    pub fn starting_at(value: u32) -> Self {
        Self { counter: value }
    }

    /// Return the current value and advance.
    pub fn next(&mut self) -> u32 {
        let current = self.counter;
        self.counter = if current >= MAX_SEQUENCE_NUMBER {
            FIRST_SEQUENCE_NUMBER
        } else {
            current + 1
        };
        current
    }

    /// The value the next call to [`next`](Self::next) will return.
    pub fn peek(&self) -> u32 {
        self.counter
    }

    pub fn future(&self) -> u32 {
        self.peek()
    }
}

impl Default for SequenceNumberGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether `actual` is an acceptable successor of `previous`.
///
/// `None` means nothing was received yet, so anything goes.
pub fn is_successor(previous: Option<u32>, actual: u32) -> bool {
    match previous {
        None => true,
        Some(prev) if prev >= MAX_SEQUENCE_NUMBER => actual < WRAP_LIMIT,
        Some(prev) => actual == prev + 1,
    }
}
