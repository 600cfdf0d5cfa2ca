//! Pooled send buffers.
//!
//! Allocating a fresh buffer for every outbound packet puts allocator pressure
//! proportional to the packet rate. Instead, a [`SendArena`] is one large
//! allocation that is handed out a slice at a time: the caller reserves as
//! much as the packet could need, serializes into it, and commits only the
//! bytes actually written. Each commit yields a [`SendRegion`] that shares the
//! arena's allocation, so the arena is freed once the last region referring to
//! it has been written and dropped.
//!
//! A [`SendAllocator`] owns the arena currently being filled for one worker
//! context. When the arena cannot fit a reservation the allocator retires it
//! and binds a fresh one, so running out of space is never visible to the
//! caller. Give every task or worker that serializes packets its own
//! allocator; nothing here is shared.

use crate::config::ArenaConfig;
use bytes::{Bytes, BytesMut};
use std::ops::Deref;
use thiserror::Error as ThisError;
use tracing::debug;

/// A fixed-capacity byte arena sliced into committed regions.
#[derive(Debug)]
pub struct SendArena {
    id: u64,
    capacity: usize,
    /// Bytes committed so far. Only ever grows.
    used: usize,
    /// The uncommitted tail of the allocation. Its length is the size of the
    /// open reservation.
    tail: BytesMut,
    reserved: Option<usize>,
}

impl SendArena {
    pub fn new(id: u64, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            used: 0,
            tail: BytesMut::with_capacity(capacity),
            reserved: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used_size(&self) -> usize {
        self.used
    }

    pub fn free_size(&self) -> usize {
        self.capacity - self.used
    }

    /// Opens a writable region of exactly `n` bytes at the end of the used
    /// space without advancing it. A second reservation replaces the first.
    pub fn reserve(&mut self, n: usize) -> Result<&mut [u8], ArenaError> {
        if n > self.free_size() {
            return Err(ArenaError::Exhausted {
                requested: n,
                free: self.free_size(),
            });
        }
        self.tail.clear();
        // never reallocates: the tail still has `free_size` bytes of capacity
        self.tail.resize(n, 0);
        self.reserved = Some(n);
        Ok(&mut self.tail[..])
    }

    /// Closes the open reservation, keeping its first `used` bytes.
    pub fn commit(&mut self, used: usize) -> Result<SendRegion, ArenaError> {
        let reserved = self.reserved.ok_or(ArenaError::NoReservation)?;
        if used > reserved {
            return Err(ArenaError::CommitExceedsReservation { used, reserved });
        }
        self.reserved = None;
        self.tail.truncate(used);
        let region = SendRegion {
            arena: self.id,
            offset: self.used,
            bytes: self.tail.split().freeze(),
        };
        self.used += used;
        Ok(region)
    }
}

/// Hands out send regions from the arena bound to the calling context,
/// replacing the arena whenever it runs out of room.
#[derive(Debug)]
pub struct SendAllocator {
    capacity: usize,
    current: Option<SendArena>,
    next_arena: u64,
}

impl SendAllocator {
    pub fn new(config: &ArenaConfig) -> Self {
        Self::with_capacity(config.capacity)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            current: None,
            next_arena: 0,
        }
    }

    /// The arena currently bound, if any reservation has been made yet.
    pub fn arena(&self) -> Option<&SendArena> {
        self.current.as_ref()
    }

    /// Reserves `n` bytes, binding a fresh arena if the current one is
    /// missing or too full.
    pub fn open(&mut self, n: usize) -> Result<&mut [u8], ArenaError> {
        if n > self.capacity {
            return Err(ArenaError::TooLarge {
                requested: n,
                capacity: self.capacity,
            });
        }
        let arena = match self.current.take() {
            Some(arena) if arena.free_size() >= n => self.current.insert(arena),
            retired => {
                if let Some(retired) = retired {
                    debug!(
                        arena = retired.id(),
                        used = retired.used_size(),
                        requested = n,
                        "Retiring send arena"
                    );
                }
                let fresh = SendArena::new(self.next_arena, self.capacity);
                self.next_arena += 1;
                self.current.insert(fresh)
            }
        };
        arena.reserve(n)
    }

    /// Commits `used` bytes of the last [`open`](SendAllocator::open).
    pub fn close(&mut self, used: usize) -> Result<SendRegion, ArenaError> {
        self.current
            .as_mut()
            .ok_or(ArenaError::NoReservation)?
            .commit(used)
    }
}

impl Default for SendAllocator {
    fn default() -> Self {
        Self::new(&ArenaConfig::default())
    }
}

/// A committed, read-only slice of a [`SendArena`], ready to hand to
/// [`Session::send`](crate::Session::send).
///
/// Identified by the arena it came from and its offset within it. Holding a
/// region keeps the whole arena allocation alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRegion {
    arena: u64,
    offset: usize,
    bytes: Bytes,
}

impl SendRegion {
    pub fn arena_id(&self) -> u64 {
        self.arena
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

impl Deref for SendRegion {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl AsRef<[u8]> for SendRegion {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<SendRegion> for Bytes {
    fn from(region: SendRegion) -> Self {
        region.bytes
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum ArenaError {
    #[error("Reservation of {requested} bytes does not fit in the {free} free bytes")]
    Exhausted { requested: usize, free: usize },
    #[error("Reservation of {requested} bytes exceeds the arena capacity of {capacity}")]
    TooLarge { requested: usize, capacity: usize },
    #[error("Commit without an open reservation")]
    NoReservation,
    #[error("Committed {used} bytes of a {reserved} byte reservation")]
    CommitExceedsReservation { used: usize, reserved: usize },
}
