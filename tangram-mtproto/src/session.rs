//! Per-session counters: message identifiers and sequence numbers.
//!
//! Both generators are plain state machines; the sender wraps each in its
//! own mutex so that callers never contend on more than they need.

use std::time::{SystemTime, UNIX_EPOCH};

/// Generates the 64-bit message identifiers attached to every outbound
/// message.
///
/// The upper 32 bits track server time in seconds; the lower 32 bits are a
/// counter shifted left by two, so every id is divisible by 4. Ids are
/// strictly monotonic: if the clock stands still or runs backwards, the
/// previous id plus 4 is handed out instead.
#[derive(Debug, Default)]
pub struct MsgIdGen {
    last: i64,
    time_offset: i32,
}

impl MsgIdGen {
    /// A generator with no clock correction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the clock skew against the server, learned during key exchange.
    pub fn set_time_offset(&mut self, offset: i32) {
        self.time_offset = offset;
    }

    /// The current clock skew.
    pub fn time_offset(&self) -> i32 {
        self.time_offset
    }

    /// Produce the next message identifier.
    pub fn next(&mut self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let secs = (now.as_secs() as i64 + self.time_offset as i64) as u64;
        let counter = (now.subsec_nanos() as u64) << 2;
        let mut id = ((secs << 32) | (counter & 0xffff_fffc)) as i64;
        if id <= self.last {
            id = self.last + 4;
        }
        self.last = id;
        id
    }
}

/// Generates per-session sequence numbers.
///
/// Returns the current value, then advances it by 2 for content messages
/// and by 1 for service messages; the parity of a message's number encodes
/// whether it requires acknowledgement.
#[derive(Debug, Default)]
pub struct SeqNoGen {
    seq_no: i32,
}

impl SeqNoGen {
    /// A generator starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the next sequence number.
    pub fn next(&mut self, is_content: bool) -> i32 {
        let current = self.seq_no;
        self.seq_no += if is_content { 2 } else { 1 };
        current
    }
}
