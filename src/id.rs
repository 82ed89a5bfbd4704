// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity id allocation and transaction correlation.
//!
//! Ids are small integers handed out by [`Pool`] and used to index the
//! correlation [`Map`]. Both are arenas sized once at construction; neither
//! allocates after that.

use crate::msg::{BufDesc, Callback};
use crate::{Error, Result};

/// Dispatcher-assigned correlation key between one accepted request and its
/// single completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct TransactionId(u16);

impl TransactionId {
    /// Wraps a raw id, as decoded from a firmware response.
    pub const fn from_raw(id: u16) -> Self {
        Self(id)
    }

    /// The raw id, for embedding into outgoing call arguments.
    pub const fn raw(self) -> u16 {
        self.0
    }
}

/// O(1) allocator for unique ids in `0..capacity`.
///
/// Free ids sit in a ring-buffer free list; a parallel bit-per-id mask tracks
/// which ids are currently out, so a stray double free is rejected instead of
/// corrupting the ring. Emptiness is decided by an explicit free count, never
/// by cursor equality (head == tail holds for both a full and a drained
/// ring).
#[derive(Debug)]
pub(crate) struct Pool {
    ring: Box<[u16]>,
    head: usize,
    tail: usize,
    free: usize,
    used: Box<[u64]>,
}

impl Pool {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity > usize::from(u16::MAX) {
            return Err(Error::InvalidArgument);
        }
        Ok(Self {
            ring: (0..capacity as u16).collect(),
            head: 0,
            tail: 0,
            free: capacity,
            used: vec![0; capacity.div_ceil(64)].into_boxed_slice(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.ring.len()
    }

    /// Number of ids currently allocated.
    pub fn in_use(&self) -> usize {
        self.capacity() - self.free
    }

    pub fn alloc(&mut self) -> Result<u16> {
        if self.free == 0 {
            return Err(Error::Exhausted);
        }
        let id = self.ring[self.head];
        self.head = (self.head + 1) % self.capacity();
        self.free -= 1;
        self.used[usize::from(id) / 64] |= 1u64 << (id % 64);
        Ok(id)
    }

    pub fn free(&mut self, id: u16) -> Result<()> {
        if usize::from(id) >= self.capacity() {
            return Err(Error::NotFound);
        }
        let word = &mut self.used[usize::from(id) / 64];
        let bit = 1u64 << (id % 64);
        if *word & bit == 0 {
            return Err(Error::AlreadyInProgress);
        }
        *word &= !bit;
        self.ring[self.tail] = id;
        self.tail = (self.tail + 1) % self.capacity();
        self.free += 1;
        Ok(())
    }

    #[cfg(test)]
    pub fn is_allocated(&self, id: u16) -> bool {
        self.used[usize::from(id) / 64] & (1u64 << (id % 64)) != 0
    }
}

/// Correlation record for one in-flight transaction.
pub(crate) struct Entry {
    /// Client registry slot the transaction belongs to.
    pub owner: u16,
    /// Fires once when the transaction completes, unless cancelled first.
    pub callback: Callback,
    /// The caller's response buffer, echoed through the completion.
    pub resp: BufDesc,
    /// The caller's opaque word, echoed through the completion.
    pub user_data: u64,
    /// Set by a processed cancel request; suppresses the callback.
    pub cancelled: bool,
}

/// Transaction-id-indexed table of correlation records.
///
/// Plain array indexing, no hashing. A lookup of a completed id yields
/// `None`, which is how late or duplicate firmware responses are dropped on
/// the floor.
pub(crate) struct Map {
    entries: Box<[Option<Entry>]>,
}

impl Map {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity > usize::from(u16::MAX) {
            return Err(Error::InvalidArgument);
        }
        Ok(Self {
            entries: (0..capacity).map(|_| None).collect(),
        })
    }

    pub fn insert(&mut self, id: u16, entry: Entry) -> Result<()> {
        let slot = self
            .entries
            .get_mut(usize::from(id))
            .ok_or(Error::NotFound)?;
        if slot.is_some() {
            return Err(Error::AlreadyInProgress);
        }
        *slot = Some(entry);
        Ok(())
    }

    pub fn remove(&mut self, id: u16) -> Option<Entry> {
        self.entries.get_mut(usize::from(id))?.take()
    }

    pub fn get_mut(&mut self, id: u16) -> Option<&mut Entry> {
        self.entries.get_mut(usize::from(id))?.as_mut()
    }
}
