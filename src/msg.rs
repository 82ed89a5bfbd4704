// SPDX-License-Identifier: Apache-2.0

//! Request and response envelopes carried across the privileged boundary.

use crate::id::TransactionId;
use crate::Error;

/// Number of generic argument words carried by a [`Request`], in addition to
/// the function id.
pub const NUM_ARGS: usize = 7;

/// Number of result words returned by one privileged call.
pub const NUM_RESULTS: usize = 4;

/// Completion callback paired with one accepted [`Request`].
///
/// Invoked exactly once, on the dispatch worker thread, unless the
/// transaction was cancelled first (then the response is discarded and the
/// caller's buffers are released through
/// [`Platform::free_async_buffers`](crate::platform::Platform::free_async_buffers)).
pub type Callback = Box<dyn FnOnce(Response) + Send + 'static>;

/// Request command kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum Kind {
    /// The firmware answers within the privileged call itself.
    Sync = 0x00,
    /// The firmware accepts the request and answers later through polling.
    Async = 0x01,
    /// Mark another transaction cancelled. The target's callback is
    /// suppressed and its response discarded; the privileged call for the
    /// target is not aborted.
    Cancel = 0x02,
}

impl TryFrom<u64> for Kind {
    type Error = Error;

    #[inline]
    fn try_from(kind: u64) -> Result<Self, Self::Error> {
        match kind {
            kind if kind == Kind::Sync as u64 => Ok(Kind::Sync),
            kind if kind == Kind::Async as u64 => Ok(Kind::Async),
            kind if kind == Kind::Cancel as u64 => Ok(Kind::Cancel),
            _ => Err(Error::InvalidArgument),
        }
    }
}

/// Caller-owned response buffer descriptor.
///
/// A single 64-bit address plus length. The dispatcher never dereferences it:
/// the descriptor travels with the transaction and is echoed back through the
/// [`Response`], so the platform and the caller agree on where response data
/// lands. Ownership stays with the caller for the lifetime of exactly one
/// transaction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct BufDesc {
    /// Destination address.
    pub addr: u64,
    /// Capacity in bytes.
    pub len: u64,
}

/// One request submitted to [`Dispatcher::send`](crate::Dispatcher::send).
///
/// The transaction id is assigned by the dispatcher, never by the caller, and
/// placed into the outgoing argument words by
/// [`Platform::embed_transaction_id`](crate::platform::Platform::embed_transaction_id).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct Request {
    /// Command kind.
    pub kind: Kind,
    /// Firmware function id, validated by the platform before acceptance.
    pub function_id: u64,
    /// Generic argument words, handed to the privileged call verbatim.
    pub args: [u64; NUM_ARGS],
    /// Caller-owned response buffer.
    pub resp: BufDesc,
    /// Opaque caller word, echoed in the [`Response`].
    pub user_data: u64,
}

impl Request {
    /// Creates a request of the given kind with zeroed arguments.
    pub fn new(kind: Kind, function_id: u64) -> Self {
        Self {
            kind,
            function_id,
            args: [0; NUM_ARGS],
            resp: BufDesc::default(),
            user_data: 0,
        }
    }

    /// Creates a cancel request for `target`.
    ///
    /// The target transaction id is carried in `args[0]`. The cancel request
    /// has its own transaction id and its own completion; cancelling a
    /// transaction that already completed reports success, since the work is
    /// already done.
    pub fn cancel(function_id: u64, target: TransactionId) -> Self {
        let mut req = Self::new(Kind::Cancel, function_id);
        req.args[0] = u64::from(target.raw());
        req
    }
}

/// One completed transaction, delivered to the request's [`Callback`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct Response {
    /// Firmware error code as decoded by
    /// [`Platform::extract_error_code`](crate::platform::Platform::extract_error_code);
    /// `0` is success. [`Response::TIMED_OUT`] is reserved by the dispatcher.
    pub error: u64,
    /// The transaction this response completes.
    pub id: TransactionId,
    /// Result words of the privileged call.
    pub results: [u64; NUM_RESULTS],
    /// The caller's response buffer descriptor, echoed.
    pub resp: BufDesc,
    /// The caller's opaque word, echoed.
    pub user_data: u64,
}

impl Response {
    /// Error code reserved for an asynchronous transaction whose firmware
    /// response was never observed within
    /// [`Config::async_timeout`](crate::Config::async_timeout). Terminal; the
    /// dispatcher does not retry.
    pub const TIMED_OUT: u64 = u64::MAX;
}
