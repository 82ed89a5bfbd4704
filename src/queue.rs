// SPDX-License-Identifier: Apache-2.0

//! Bounded FIFO of requests awaiting dispatch.

use crate::msg::Request;
use crate::{Error, Result};

use std::collections::VecDeque;

/// Pending requests, tagged with their already-allocated transaction ids.
///
/// Producers are the caller threads inside `send`; the single consumer is the
/// dispatch worker. A full queue is a caller-visible backpressure signal, not
/// a silent drop.
pub(crate) struct Queue {
    items: VecDeque<(u16, Request)>,
    depth: usize,
}

impl Queue {
    pub fn new(depth: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(depth),
            depth,
        }
    }

    pub fn push(&mut self, id: u16, request: Request) -> Result<()> {
        if self.items.len() == self.depth {
            return Err(Error::Busy);
        }
        self.items.push_back((id, request));
        Ok(())
    }

    pub fn pop(&mut self) -> Option<(u16, Request)> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
