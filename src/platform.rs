// SPDX-License-Identifier: Apache-2.0

//! Platform-specific functionality.
//!
//! Everything the dispatcher cannot know (the privileged call itself, the
//! firmware's function id space, where a transaction id lives inside the
//! outgoing argument words, how asynchronous responses are polled and
//! decoded) is delegated to a [`Platform`] implementation injected at
//! [`Dispatcher::new`](crate::Dispatcher::new). The dispatcher core is
//! thereby testable without firmware behind it.

use crate::id::TransactionId;
use crate::msg::{Kind, Request, NUM_ARGS, NUM_RESULTS};
use crate::Result;

/// Outcome of one firmware poll attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Polled {
    /// A completed transaction was decoded from the poll response.
    Ready {
        /// The transaction the firmware answered.
        id: TransactionId,
        /// Decoded result words for that transaction.
        results: [u64; NUM_RESULTS],
    },
    /// Nothing ready; control returns to the dispatch loop so queued
    /// synchronous work is never starved behind polling.
    Idle,
}

/// The platform invocation hooks behind the dispatcher.
///
/// `invoke` is only ever called from the single dispatch worker thread, but
/// the validation and encoding hooks run on caller threads during
/// [`send`](crate::Dispatcher::send), so implementations must be `Sync`;
/// interior mutability is the implementation's own business.
pub trait Platform: Send + Sync + 'static {
    /// Performs the privileged call. Synchronous and opaque; no latency
    /// guarantee is assumed.
    fn invoke(&self, function_id: u64, args: &[u64; NUM_ARGS]) -> [u64; NUM_RESULTS];

    /// Whether `function_id` is acceptable for a request of kind `kind`.
    fn is_function_id_valid(&self, kind: Kind, function_id: u64) -> bool;

    /// Places the dispatcher-assigned transaction id wherever the firmware
    /// protocol expects it inside the outgoing request.
    fn embed_transaction_id(&self, request: &mut Request, id: TransactionId);

    /// Releases any per-request dynamic buffers the caller attached.
    ///
    /// Called instead of the completion callback when a response is
    /// discarded: the transaction was cancelled, or the dispatcher is
    /// shutting down.
    fn free_async_buffers(&self, request: &Request);

    /// Builds the privileged call that polls firmware for asynchronous
    /// responses, as `(function_id, args)`.
    ///
    /// Returning [`Error::Unsupported`](crate::Error::Unsupported) declares
    /// that this firmware cannot be polled; the dispatcher then rejects
    /// [`Kind::Async`] requests up front.
    fn build_poll_request(&self) -> Result<(u64, [u64; NUM_ARGS])>;

    /// Decodes the raw result of a poll call.
    fn decode_poll_response(&self, raw: &[u64; NUM_RESULTS]) -> Result<Polled>;

    /// Extracts the firmware-level error code from raw call results; `0` is
    /// success.
    fn extract_error_code(&self, raw: &[u64; NUM_RESULTS]) -> u64;
}
