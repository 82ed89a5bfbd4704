// SPDX-License-Identifier: Apache-2.0

//! Client registry and per-client channel state machine.
//!
//! Clients live in a fixed arena of slots. Registration hands back an opaque
//! [`Token`]; every later per-client call is keyed by it. A token is the slot
//! index combined with a strictly-increasing generation, so a stale token
//! from an unregistered client can never be mistaken for the slot's next
//! occupant.

use crate::id;
use crate::{Error, Result};

use std::any::Any;
use std::sync::Arc;

use tracing::debug;

/// Opaque capability returned by [`register`](crate::Dispatcher::register).
///
/// Required by all subsequent per-client calls. Unguessable in the sense
/// that generations are never reused within one registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Token(u64);

const SLOT_BITS: u32 = 16;

impl Token {
    fn new(generation: u64, slot: u16) -> Self {
        Self((generation << SLOT_BITS) | u64::from(slot))
    }

    fn slot(self) -> u16 {
        (self.0 & u64::from(u16::MAX)) as u16
    }

    fn generation(self) -> u64 {
        self.0 >> SLOT_BITS
    }
}

/// Client channel state.
///
/// `Abort` is a draining state, not a teardown: the channel marker is already
/// released, but the slot stays unavailable until its last in-flight
/// transaction completes and the worker moves it back to `Idle`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    Invalid,
    Idle,
    Open,
    Abort,
}

pub(crate) struct Slot {
    pub generation: u64,
    pub state: State,
    /// Outstanding transactions issued through this slot.
    pub active: usize,
    data: Option<Arc<dyn Any + Send + Sync>>,
}

impl Slot {
    const fn vacant() -> Self {
        Self {
            generation: 0,
            state: State::Invalid,
            active: 0,
            data: None,
        }
    }
}

/// Fixed arena of client slots plus the pool that hands out slot indices.
pub(crate) struct Registry {
    slots: Box<[Slot]>,
    pool: id::Pool,
    next_generation: u64,
}

impl Registry {
    pub fn new(max_clients: usize) -> Result<Self> {
        Ok(Self {
            slots: (0..max_clients).map(|_| Slot::vacant()).collect(),
            pool: id::Pool::new(max_clients)?,
            next_generation: 1,
        })
    }

    /// Claims a slot and mints a fresh token for it.
    pub fn register(&mut self, data: Option<Arc<dyn Any + Send + Sync>>) -> Result<Token> {
        let index = self.pool.alloc()?;
        let generation = self.next_generation;
        self.next_generation += 1;

        let slot = &mut self.slots[usize::from(index)];
        debug_assert_eq!(slot.state, State::Invalid);
        *slot = Slot {
            generation,
            state: State::Idle,
            active: 0,
            data,
        };
        debug!(slot = index, "client registered");
        Ok(Token::new(generation, index))
    }

    /// Releases the slot behind `token`.
    ///
    /// A draining (`Abort`) slot is busy until its in-flight count reaches
    /// zero; an open slot must be closed first.
    pub fn unregister(&mut self, token: Token) -> Result<()> {
        let index = self.lookup(token)?;
        let slot = &mut self.slots[usize::from(index)];
        match slot.state {
            State::Open => Err(Error::WrongState),
            State::Abort => Err(Error::Busy),
            State::Idle => {
                debug_assert_eq!(slot.active, 0);
                *slot = Slot::vacant();
                self.pool.free(index)?;
                debug!(slot = index, "client unregistered");
                Ok(())
            }
            State::Invalid => Err(Error::InvalidArgument),
        }
    }

    /// Resolves a token to its slot index, rejecting stale generations.
    pub fn lookup(&self, token: Token) -> Result<u16> {
        let index = token.slot();
        let slot = self
            .slots
            .get(usize::from(index))
            .ok_or(Error::InvalidArgument)?;
        if slot.state == State::Invalid || slot.generation != token.generation() {
            return Err(Error::InvalidArgument);
        }
        Ok(index)
    }

    pub fn slot(&self, index: u16) -> &Slot {
        &self.slots[usize::from(index)]
    }

    pub fn slot_mut(&mut self, index: u16) -> &mut Slot {
        &mut self.slots[usize::from(index)]
    }

    /// Number of currently registered clients.
    pub fn len(&self) -> usize {
        self.pool.in_use()
    }

    pub fn client_data(&self, token: Token) -> Result<Option<Arc<dyn Any + Send + Sync>>> {
        let index = self.lookup(token)?;
        Ok(self.slots[usize::from(index)].data.clone())
    }
}
