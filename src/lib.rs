// SPDX-License-Identifier: Apache-2.0

//! Secure monitor call dispatch for the firmware boundary
//!
//! `postern` multiplexes many client-issued requests onto the single privileged
//! call channel into higher-privilege firmware (e.g. ARM SMC/HVC). A
//! [postern](https://en.wikipedia.org/wiki/Postern) is the small fortified side
//! gate of a castle through which privileged messengers pass one at a time.
//!
//! # Mechanism of action
//!
//! Clients [`register`](Dispatcher::register) with the dispatcher and receive
//! an opaque [`Token`](client::Token). A token holder may
//! [`open`](Dispatcher::open) the channel (a singleton firmware resource, so at
//! most one client holds it open at any instant) and then
//! [`send`](Dispatcher::send) requests into it. Each accepted request is
//! assigned a [`TransactionId`](id::TransactionId), queued, and eventually
//! carried into firmware by a single worker thread, the only place
//! [`Platform::invoke`](platform::Platform::invoke) is ever called. The
//! worker correlates firmware responses back to their transactions and fires
//! each request's completion callback exactly once, on the worker thread.
//!
//! The privileged call itself is out of scope: everything firmware-shaped and
//! vendor-shaped (argument layout, function id validation, transaction id
//! embedding, asynchronous response polling) is delegated to a
//! [`Platform`](platform::Platform) implementation injected at construction.
//!
//! A channel left open but idle is reclaimed by a watchdog, so a crashed or
//! forgetful client cannot lock out the firmware interface forever. Closing a
//! channel with transactions still in flight parks the client in a draining
//! state: the channel is released immediately for the next client, while the
//! in-flight work is still allowed to complete and report back.

#![deny(clippy::all)]
#![deny(missing_docs)]

pub mod client;
pub mod dispatch;
pub mod id;
pub mod msg;
pub mod platform;

pub(crate) mod queue;

pub use dispatch::{Counters, Dispatcher, Wait};

use core::fmt;
use std::time::Duration;

/// Error type used within this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// A malformed argument: a bad token, an out-of-range size or a request
    /// whose function id the platform refused.
    InvalidArgument,
    /// The channel is held by another client, or the request queue is full.
    Busy,
    /// The operation is not valid for the client's current state.
    WrongState,
    /// No free transaction or client ids remain.
    Exhausted,
    /// The transaction id is not known to the dispatcher.
    NotFound,
    /// The id is already in the requested state (double alloc or double free).
    AlreadyInProgress,
    /// The platform declines the capability.
    Unsupported,
    /// The wait expired before the operation could complete.
    Timeout,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InvalidArgument => "invalid argument",
            Self::Busy => "resource busy",
            Self::WrongState => "operation not valid in current state",
            Self::Exhausted => "no free ids",
            Self::NotFound => "unknown transaction id",
            Self::AlreadyInProgress => "id already in requested state",
            Self::Unsupported => "not supported by the platform",
            Self::Timeout => "wait expired",
        })
    }
}

impl std::error::Error for Error {}

/// Result type returned by functionality exposed by this crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Dispatcher sizing and timing, fixed at construction.
///
/// The pools sized here are arenas: they are allocated once by
/// [`Dispatcher::new`] and never resized.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Maximum number of registered clients.
    pub max_clients: usize,
    /// Maximum number of transactions in flight, across all clients.
    pub max_transactions: usize,
    /// Depth of the pending request queue. A full queue rejects
    /// [`send`](Dispatcher::send) with [`Error::Busy`].
    pub queue_depth: usize,
    /// How long an open channel may sit with no transaction in flight before
    /// the watchdog force-closes it.
    pub watchdog_timeout: Duration,
    /// Pause between firmware poll attempts while asynchronous transactions
    /// are outstanding and the request queue is empty.
    pub poll_interval: Duration,
    /// How long an asynchronous transaction may remain unanswered before it
    /// is completed with [`msg::Response::TIMED_OUT`].
    pub async_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_clients: 16,
            max_transactions: 16,
            queue_depth: 32,
            watchdog_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(1),
            async_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_clients == 0 || self.max_clients > usize::from(u16::MAX) {
            return Err(Error::InvalidArgument);
        }
        if self.max_transactions == 0 || self.max_transactions > usize::from(u16::MAX) {
            return Err(Error::InvalidArgument);
        }
        if self.queue_depth == 0 {
            return Err(Error::InvalidArgument);
        }
        if self.watchdog_timeout.is_zero()
            || self.poll_interval.is_zero()
            || self.async_timeout.is_zero()
        {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}
