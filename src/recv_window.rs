//! The sliding receive buffer used to reassemble packets out of a TCP byte
//! stream.
//!
//! A read from the socket may hold a fragment of a packet, several whole
//! packets, or a packet followed by the start of the next one. The window
//! keeps everything that has been received but not yet consumed in one
//! contiguous slice so the parser never has to deal with the split points.
//!
//! ```text
//!   0          read_pos         write_pos            capacity
//!   |  consumed  |  readable()    |  writable()         |
//!   +------------+----------------+---------------------+
//! ```

use thiserror::Error as ThisError;

/// A fixed-capacity byte buffer with independent read and write cursors.
///
/// Invariant: `read_pos <= write_pos <= capacity`. Both cursors only move
/// forward until [`compact`](RecvWindow::compact) slides the unread bytes back
/// to the front.
#[derive(Debug, Clone)]
pub struct RecvWindow {
    buffer: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
}

impl RecvWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// The number of received bytes not yet consumed.
    pub fn data_size(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// The number of bytes that can still be written before compacting.
    pub fn free_size(&self) -> usize {
        self.buffer.len() - self.write_pos
    }

    /// The received, unconsumed bytes.
    pub fn readable(&self) -> &[u8] {
        &self.buffer[self.read_pos..self.write_pos]
    }

    /// The free tail, to be filled by a socket read.
    pub fn writable(&mut self) -> &mut [u8] {
        &mut self.buffer[self.write_pos..]
    }

    /// Marks `n` bytes of the writable tail as received.
    pub fn commit_write(&mut self, n: usize) -> Result<(), WindowError> {
        if n > self.free_size() {
            return Err(WindowError::Overflow {
                requested: n,
                free: self.free_size(),
            });
        }
        self.write_pos += n;
        Ok(())
    }

    /// Marks `n` bytes of the readable region as consumed.
    pub fn commit_read(&mut self, n: usize) -> Result<(), WindowError> {
        if n > self.data_size() {
            return Err(WindowError::Underflow {
                requested: n,
                available: self.data_size(),
            });
        }
        self.read_pos += n;
        Ok(())
    }

    /// Moves the unread bytes to the front of the buffer so the writable tail
    /// is as large as possible. Free when nothing is buffered.
    pub fn compact(&mut self) {
        let data_size = self.data_size();
        if data_size > 0 && self.read_pos > 0 {
            self.buffer.copy_within(self.read_pos..self.write_pos, 0);
        }
        self.read_pos = 0;
        self.write_pos = data_size;
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum WindowError {
    #[error("Tried to commit {requested} received bytes with only {free} free")]
    Overflow { requested: usize, free: usize },
    #[error("Tried to consume {requested} bytes with only {available} buffered")]
    Underflow { requested: usize, available: usize },
}
