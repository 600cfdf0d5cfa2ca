use bytes::Bytes;
use std::collections::VecDeque;

/// The outbound side of a session: regions waiting to be written and the
/// batch currently being written.
///
/// All transitions happen under the session's queue lock, and none of them
/// perform I/O, so the lock is only ever held for a few pointer moves.
///
/// ```text
///   push ──> queue ──take_batch──> pending ──complete──> (bytes sent)
///                                     │
///                       in_flight = true until take_batch finds
///                       the queue empty
/// ```
#[derive(Debug, Default)]
pub struct SendQueue {
    queue: VecDeque<Bytes>,
    pending: Vec<Bytes>,
    in_flight: bool,
}

impl SendQueue {
    /// Appends a region. Returns true when no write was in flight, meaning the
    /// caller must wake the writer.
    pub fn push(&mut self, region: Bytes) -> bool {
        self.queue.push_back(region);
        if self.in_flight {
            false
        } else {
            self.in_flight = true;
            true
        }
    }

    /// Moves everything queued into the pending batch and returns it for a
    /// single gathered write. Returns `None` and clears the in-flight flag
    /// once there is nothing left to write.
    pub fn take_batch(&mut self) -> Option<Vec<Bytes>> {
        debug_assert!(self.pending.is_empty(), "batch taken before completion");
        if self.queue.is_empty() {
            self.in_flight = false;
            return None;
        }
        self.pending.extend(self.queue.drain(..));
        Some(self.pending.clone())
    }

    /// Records that the pending batch was fully written, returning its size
    /// in bytes.
    pub fn complete(&mut self) -> usize {
        let sent = self.pending.iter().map(Bytes::len).sum();
        self.pending.clear();
        sent
    }

    /// Drops everything, written or not. Used on teardown.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.pending.clear();
        self.in_flight = false;
    }

    #[cfg(test)]
    pub fn queued_bytes(&self) -> usize {
        self.queue.iter().map(Bytes::len).sum()
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_sends_made_before_the_write() {
        let mut queue = SendQueue::default();
        assert!(queue.push(Bytes::from_static(b"aaaaa")));
        assert!(!queue.push(Bytes::from_static(b"bbbbb")));
        assert!(!queue.push(Bytes::from_static(b"ccccc")));
        assert_eq!(queue.queued_bytes(), 15);

        let batch = queue.take_batch().unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.concat(), b"aaaaabbbbbccccc");
        assert_eq!(queue.pending_len(), 3);

        assert_eq!(queue.complete(), 15);
        assert_eq!(queue.pending_len(), 0);
        assert!(queue.is_in_flight());

        assert!(queue.take_batch().is_none());
        assert!(!queue.is_in_flight());
    }

    #[test]
    fn sends_during_a_write_form_the_next_batch() {
        let mut queue = SendQueue::default();
        assert!(queue.push(Bytes::from_static(b"1")));
        let first = queue.take_batch().unwrap();
        assert_eq!(first, vec![Bytes::from_static(b"1")]);

        // the writer is busy, so these must not wake it again
        assert!(!queue.push(Bytes::from_static(b"2")));
        assert!(!queue.push(Bytes::from_static(b"3")));
        assert_eq!(queue.complete(), 1);

        let second = queue.take_batch().unwrap();
        assert_eq!(second.concat(), b"23");
        assert_eq!(queue.complete(), 2);
        assert!(queue.take_batch().is_none());

        // idle again, so the next push wakes the writer
        assert!(queue.push(Bytes::from_static(b"4")));
    }

    #[test]
    fn clear_resets_everything() {
        let mut queue = SendQueue::default();
        queue.push(Bytes::from_static(b"x"));
        queue.take_batch();
        queue.push(Bytes::from_static(b"y"));
        queue.clear();
        assert_eq!(queue.queued_bytes(), 0);
        assert_eq!(queue.pending_len(), 0);
        assert!(!queue.is_in_flight());
    }
}
