//! Time-travel buffer: bounded history of recent inbound messages.
//!
//! The connection task records every decoded frame here; replaying a past
//! message re-runs it through the normal dispatch path, so listeners
//! observe it exactly like a live message.

use crate::envelope::RawMessage;
use std::collections::VecDeque;

/// Bounded ring of recent messages with oldest-eviction.
pub(crate) struct TimeTravelBuffer {
    capacity: usize,
    messages: VecDeque<RawMessage>,
}

impl TimeTravelBuffer {
    /// A buffer with capacity 0 records nothing.
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            messages: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Append a message, evicting from the head to stay within capacity.
    pub(crate) fn record(&mut self, message: RawMessage) {
        if self.capacity == 0 {
            return;
        }
        self.messages.push_back(message);
        while self.messages.len() > self.capacity {
            self.messages.pop_front();
        }
    }

    /// The message `steps_back` steps before the newest, clamped to the
    /// retained range. `None` only when the buffer is empty.
    pub(crate) fn replay(&self, steps_back: usize) -> Option<&RawMessage> {
        if self.messages.is_empty() {
            return None;
        }
        let newest = self.messages.len() - 1;
        let index = newest.saturating_sub(steps_back);
        self.messages.get(index)
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FramedCodec;
    use crate::envelope::EnvelopeCodec;

    fn message(topic: &str) -> RawMessage {
        let codec = FramedCodec;
        let frame = codec.encode_message(topic, "Test", &[]);
        let meta = codec.decode_meta(&frame).unwrap();
        RawMessage::new(frame, meta)
    }

    #[test]
    fn test_capacity_bound_keeps_last_n_in_order() {
        let n = 4;
        let mut buffer = TimeTravelBuffer::new(n);
        for i in 0..n + 5 {
            buffer.record(message(&format!("t/{}", i)));
        }
        assert_eq!(buffer.len(), n);

        // Oldest retained is t/5, newest t/8.
        assert_eq!(buffer.replay(0).unwrap().topic(), "t/8");
        assert_eq!(buffer.replay(n - 1).unwrap().topic(), "t/5");
    }

    #[test]
    fn test_replay_clamps_to_oldest_retained() {
        let mut buffer = TimeTravelBuffer::new(3);
        for i in 0..3 {
            buffer.record(message(&format!("t/{}", i)));
        }
        assert_eq!(buffer.replay(100).unwrap().topic(), "t/0");
    }

    #[test]
    fn test_replay_on_empty_buffer_is_none() {
        let buffer = TimeTravelBuffer::new(8);
        assert!(buffer.replay(0).is_none());
    }

    #[test]
    fn test_zero_capacity_records_nothing() {
        let mut buffer = TimeTravelBuffer::new(0);
        buffer.record(message("t/0"));
        assert_eq!(buffer.len(), 0);
        assert!(buffer.replay(0).is_none());
    }
}
