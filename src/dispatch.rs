// SPDX-License-Identifier: Apache-2.0

//! Request dispatch onto the privileged call channel.
//!
//! One worker thread drains the request queue and polls outstanding
//! asynchronous jobs until both are empty, then parks. It is the only place
//! [`Platform::invoke`] is called and the only thread completion callbacks
//! run on. Timer duty (the idle-channel watchdog) is folded into the
//! worker's park deadline rather than a timer context, so expiry handling
//! never has to mutate dispatcher state from interrupt-like code.
//!
//! Lock order, outermost first: queue, transactions, registry, channel.
//! The only nestings taken are registry before channel and queue before
//! channel; callbacks and [`Platform::invoke`] run with no lock held.

use crate::client::{Registry, State, Token};
use crate::id::{self, TransactionId};
use crate::msg::{Callback, Kind, Request, Response, NUM_RESULTS};
use crate::platform::{Platform, Polled};
use crate::queue::Queue;
use crate::{Config, Error, Result};

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

/// How long [`Dispatcher::open`] may wait for the channel to come free.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Fail with [`Error::Busy`] if the channel is held.
    None,
    /// Wait up to the given duration, then fail with [`Error::Timeout`].
    For(Duration),
    /// Wait until the channel is released.
    Forever,
}

/// Snapshot of dispatcher counters, for diagnostics.
#[derive(Clone, Copy, Debug)]
pub struct Counters {
    /// Registered clients.
    pub clients: usize,
    /// Whether some client currently holds the channel open.
    pub channel_open: bool,
    /// Requests waiting in the queue.
    pub queued: usize,
    /// Transactions in flight (queued or awaiting firmware).
    pub in_flight: usize,
    /// Transactions completed since construction, cancellations included.
    pub completed: u64,
    /// Idle channels reclaimed by the watchdog since construction.
    pub watchdog_closes: u64,
}

/// The single active-channel marker plus the watchdog deadline guarding it.
struct Channel {
    holder: Option<u16>,
    /// Armed whenever the channel is open with nothing in flight.
    watchdog: Option<Instant>,
}

/// Transaction id pool and correlation map, guarded by one lock since every
/// path that touches one touches the other.
struct Transactions {
    pool: id::Pool,
    map: id::Map,
}

/// An asynchronous job accepted by firmware, awaiting its polled response.
struct PendingJob {
    id: u16,
    request: Request,
    expires: Instant,
}

struct Shared<P: Platform> {
    cfg: Config,
    platform: P,
    registry: Mutex<Registry>,
    chan: Mutex<Channel>,
    chan_cv: Condvar,
    trans: Mutex<Transactions>,
    queue: Mutex<Queue>,
    work_cv: Condvar,
    shutdown: AtomicBool,
    completed: AtomicU64,
    watchdog_closes: AtomicU64,
}

/// Secure-monitor-call request dispatcher.
///
/// Construction spawns the dispatch worker; dropping the dispatcher shuts the
/// worker down after draining pending work as cancelled, preserving the
/// exactly-one-completion-per-transaction contract.
pub struct Dispatcher<P: Platform> {
    shared: Arc<Shared<P>>,
    worker: Option<JoinHandle<()>>,
}

impl<P: Platform> Dispatcher<P> {
    /// Builds the dispatcher around `platform` and spawns its worker thread.
    pub fn new(cfg: Config, platform: P) -> Result<Self> {
        cfg.validate()?;
        let shared = Arc::new(Shared {
            cfg,
            platform,
            registry: Mutex::new(Registry::new(cfg.max_clients)?),
            chan: Mutex::new(Channel {
                holder: None,
                watchdog: None,
            }),
            chan_cv: Condvar::new(),
            trans: Mutex::new(Transactions {
                pool: id::Pool::new(cfg.max_transactions)?,
                map: id::Map::new(cfg.max_transactions)?,
            }),
            queue: Mutex::new(Queue::new(cfg.queue_depth)),
            work_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            completed: AtomicU64::new(0),
            watchdog_closes: AtomicU64::new(0),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("postern-dispatch".into())
                .spawn(move || worker_main(shared))
                .map_err(|_| Error::Exhausted)?
        };

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Registers a client, returning the token all later calls require.
    ///
    /// `data` is an opaque per-client value held for the registration's
    /// lifetime and readable back through [`client_data`](Self::client_data).
    pub fn register(&self, data: Option<Arc<dyn Any + Send + Sync>>) -> Result<Token> {
        self.shared.registry.lock().unwrap().register(data)
    }

    /// Releases the registration behind `token`.
    ///
    /// Fails with [`Error::Busy`] while transactions are still draining and
    /// with [`Error::WrongState`] while the channel is open.
    pub fn unregister(&self, token: Token) -> Result<()> {
        self.shared.registry.lock().unwrap().unregister(token)
    }

    /// The per-client value stored at registration.
    pub fn client_data(&self, token: Token) -> Result<Option<Arc<dyn Any + Send + Sync>>> {
        self.shared.registry.lock().unwrap().client_data(token)
    }

    /// Opens the channel for `token`.
    ///
    /// The channel is a singleton: while another client holds it, the call
    /// waits according to `wait`. Opening arms the idle watchdog.
    pub fn open(&self, token: Token, wait: Wait) -> Result<()> {
        let deadline = match wait {
            Wait::For(timeout) => Some(Instant::now() + timeout),
            _ => None,
        };

        loop {
            let mut registry = self.shared.registry.lock().unwrap();
            let index = registry.lookup(token)?;
            if registry.slot(index).state != State::Idle {
                return Err(Error::WrongState);
            }

            let mut chan = self.shared.chan.lock().unwrap();
            if chan.holder.is_none() {
                chan.holder = Some(index);
                chan.watchdog = Some(Instant::now() + self.shared.cfg.watchdog_timeout);
                drop(chan);
                registry.slot_mut(index).state = State::Open;
                drop(registry);
                debug!(slot = index, "channel opened");
                // The parked worker re-reads its deadline from the watchdog.
                self.shared.wake_worker();
                return Ok(());
            }
            drop(registry);

            let chan = match wait {
                Wait::None => return Err(Error::Busy),
                Wait::Forever => self.shared.chan_cv.wait(chan).unwrap(),
                Wait::For(_) => {
                    let now = Instant::now();
                    match deadline {
                        Some(deadline) if now < deadline => {
                            let (guard, _) = self
                                .shared
                                .chan_cv
                                .wait_timeout(chan, deadline - now)
                                .unwrap();
                            guard
                        }
                        _ => return Err(Error::Timeout),
                    }
                }
            };
            // Reacquire in lock order on the next pass.
            drop(chan);
        }
    }

    /// Closes the channel held by `token`.
    ///
    /// With transactions still in flight the slot moves to the draining
    /// abort state instead of idle; either way the channel marker is
    /// released immediately, so the next [`open`](Self::open) need not wait
    /// for the drain.
    pub fn close(&self, token: Token) -> Result<()> {
        let mut registry = self.shared.registry.lock().unwrap();
        let index = registry.lookup(token)?;
        let slot = registry.slot_mut(index);
        if slot.state != State::Open {
            return Err(Error::WrongState);
        }
        let draining = slot.active > 0;
        slot.state = if draining { State::Abort } else { State::Idle };

        let mut chan = self.shared.chan.lock().unwrap();
        if chan.holder == Some(index) {
            chan.holder = None;
            chan.watchdog = None;
            self.shared.chan_cv.notify_all();
        }
        drop(chan);
        drop(registry);
        debug!(slot = index, draining, "channel closed");
        Ok(())
    }

    /// Submits a request on the open channel, pairing it with `callback`.
    ///
    /// On success the returned transaction id will see exactly one
    /// completion: the callback fires once on the worker thread (possibly
    /// with a response carrying a firmware error code), unless the
    /// transaction is cancelled first, in which case the response is
    /// discarded and the caller's buffers are released through the platform.
    ///
    /// Never blocks beyond internal mutex holds; a full queue fails with
    /// [`Error::Busy`] instead of waiting.
    pub fn send(
        &self,
        token: Token,
        mut request: Request,
        callback: impl FnOnce(Response) + Send + 'static,
    ) -> Result<TransactionId> {
        if request.kind == Kind::Async && self.shared.platform.build_poll_request().is_err() {
            return Err(Error::Unsupported);
        }
        if !self
            .shared
            .platform
            .is_function_id_valid(request.kind, request.function_id)
        {
            return Err(Error::InvalidArgument);
        }

        // Account the transaction against the slot up front; a nonzero
        // active count is also what keeps the watchdog disarmed.
        let index = {
            let mut registry = self.shared.registry.lock().unwrap();
            let index = registry.lookup(token)?;
            let slot = registry.slot_mut(index);
            if slot.state != State::Open {
                return Err(Error::WrongState);
            }
            slot.active += 1;
            self.shared.chan.lock().unwrap().watchdog = None;
            index
        };

        let id = match self
            .shared
            .start_transaction(index, &mut request, Box::new(callback))
        {
            Ok(id) => id,
            Err(e) => {
                self.shared.retire_owner(index);
                return Err(e);
            }
        };

        self.shared.wake_worker();
        trace!(id = id.raw(), slot = index, kind = ?request.kind, "request queued");
        Ok(id)
    }

    /// Snapshot of the dispatcher's counters.
    pub fn counters(&self) -> Counters {
        let queued = self.shared.queue.lock().unwrap().len();
        let in_flight = self.shared.trans.lock().unwrap().pool.in_use();
        let clients = self.shared.registry.lock().unwrap().len();
        let channel_open = self.shared.chan.lock().unwrap().holder.is_some();
        Counters {
            clients,
            channel_open,
            queued,
            in_flight,
            completed: self.shared.completed.load(Ordering::Relaxed),
            watchdog_closes: self.shared.watchdog_closes.load(Ordering::Relaxed),
        }
    }
}

impl<P: Platform> Drop for Dispatcher<P> {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake_worker();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl<P: Platform> Shared<P> {
    fn wake_worker(&self) {
        let _queue = self.queue.lock().unwrap();
        self.work_cv.notify_one();
    }

    /// Allocates an id, embeds it, files the correlation entry and enqueues
    /// the request. Partial failures unwind in reverse order.
    fn start_transaction(
        &self,
        owner: u16,
        request: &mut Request,
        callback: Callback,
    ) -> Result<TransactionId> {
        let raw = self.trans.lock().unwrap().pool.alloc()?;
        self.platform
            .embed_transaction_id(request, TransactionId::from_raw(raw));

        let entry = id::Entry {
            owner,
            callback,
            resp: request.resp,
            user_data: request.user_data,
            cancelled: false,
        };
        {
            let mut trans = self.trans.lock().unwrap();
            if let Err(e) = trans.map.insert(raw, entry) {
                let _ = trans.pool.free(raw);
                return Err(e);
            }
        }

        if let Err(e) = self.queue.lock().unwrap().push(raw, *request) {
            let mut trans = self.trans.lock().unwrap();
            trans.map.remove(raw);
            let _ = trans.pool.free(raw);
            return Err(e);
        }
        Ok(TransactionId::from_raw(raw))
    }

    /// Drops one unit of in-flight work from a slot and runs the state
    /// machine side effects: an abort drain that reaches zero goes back to
    /// idle, an open channel that reaches zero re-arms the watchdog.
    fn retire_owner(&self, index: u16) {
        let mut rearmed = false;
        {
            let mut registry = self.registry.lock().unwrap();
            let slot = registry.slot_mut(index);
            slot.active -= 1;
            let state = slot.state;
            let idle_again = slot.active == 0;
            if idle_again && state == State::Abort {
                slot.state = State::Idle;
                debug!(slot = index, "abort drain complete");
            }
            if idle_again && state == State::Open {
                let mut chan = self.chan.lock().unwrap();
                if chan.holder == Some(index) {
                    chan.watchdog = Some(Instant::now() + self.cfg.watchdog_timeout);
                    rearmed = true;
                }
            }
        }
        if rearmed {
            self.wake_worker();
        }
    }

    /// Force-closes the channel if the idle watchdog has expired, exactly as
    /// if the holder had called close.
    fn check_watchdog(&self) {
        let mut registry = self.registry.lock().unwrap();
        let mut chan = self.chan.lock().unwrap();
        match chan.watchdog {
            Some(deadline) if Instant::now() >= deadline => {}
            _ => return,
        }
        chan.watchdog = None;
        if let Some(index) = chan.holder.take() {
            let slot = registry.slot_mut(index);
            if slot.state == State::Open && slot.active == 0 {
                slot.state = State::Idle;
                self.watchdog_closes.fetch_add(1, Ordering::Relaxed);
                warn!(slot = index, "watchdog reclaimed idle channel");
            }
            self.chan_cv.notify_all();
        }
    }

    /// Dispatches one popped request: cancel short-circuit, cancel-command
    /// handling, privileged call, then synchronous completion or async
    /// handoff.
    fn process(&self, pending: &mut Vec<PendingJob>, id: u16, request: Request) {
        let cancelled = match self.trans.lock().unwrap().map.get_mut(id) {
            Some(entry) => entry.cancelled,
            None => {
                trace!(id, "queued transaction vanished");
                return;
            }
        };
        if cancelled {
            // Cancelled while still queued: skip the privileged call, but
            // run the completion path so counts stay consistent.
            self.complete(id, 0, [0; NUM_RESULTS], &request);
            return;
        }

        match request.kind {
            Kind::Cancel => {
                let target = request.args[0];
                let mut marked = false;
                if let Ok(target) = u16::try_from(target) {
                    let mut trans = self.trans.lock().unwrap();
                    if let Some(entry) = trans.map.get_mut(target) {
                        entry.cancelled = true;
                        marked = true;
                    }
                }
                if marked {
                    trace!(id, target, "transaction marked cancelled");
                } else {
                    // Already completed; the cancel still reports success
                    // since the work is done either way.
                    trace!(id, target, "cancel target already complete");
                }
                self.complete(id, 0, [0; NUM_RESULTS], &request);
            }
            Kind::Sync | Kind::Async => {
                let results = self.platform.invoke(request.function_id, &request.args);
                let error = self.platform.extract_error_code(&results);
                if request.kind == Kind::Sync || error != 0 {
                    self.complete(id, error, results, &request);
                } else {
                    trace!(id, "accepted for asynchronous completion");
                    pending.push(PendingJob {
                        id,
                        request,
                        expires: Instant::now() + self.cfg.async_timeout,
                    });
                }
            }
        }
    }

    /// The single completion path. Removes the correlation entry, frees the
    /// id, retires the owner slot, then with no lock held fires the
    /// callback, or releases the caller's buffers if the transaction was
    /// cancelled.
    ///
    /// Registry bookkeeping runs before the callback, so a callback
    /// observer may immediately act on the slot's new state.
    fn complete(&self, id: u16, error: u64, results: [u64; NUM_RESULTS], request: &Request) {
        let entry = {
            let mut trans = self.trans.lock().unwrap();
            match trans.map.remove(id) {
                Some(entry) => {
                    let _ = trans.pool.free(id);
                    entry
                }
                None => {
                    trace!(id, "late completion dropped");
                    return;
                }
            }
        };
        self.retire_owner(entry.owner);
        self.completed.fetch_add(1, Ordering::Relaxed);

        if entry.cancelled {
            trace!(id, "cancelled; response discarded");
            self.platform.free_async_buffers(request);
        } else {
            (entry.callback)(Response {
                error,
                id: TransactionId::from_raw(id),
                results,
                resp: entry.resp,
                user_data: entry.user_data,
            });
        }
    }

    /// One firmware poll attempt. Returns whether a transaction completed.
    fn poll_pending(&self, pending: &mut Vec<PendingJob>) -> bool {
        let (function_id, args) = match self.platform.build_poll_request() {
            Ok(call) => call,
            Err(e) => {
                // Async sends are rejected up front when polling is
                // unsupported, so this only fires if support was revoked
                // with jobs in flight. Terminal for those jobs.
                warn!(error = %e, "firmware poll unavailable");
                for job in pending.drain(..) {
                    self.complete(job.id, Response::TIMED_OUT, [0; NUM_RESULTS], &job.request);
                }
                return false;
            }
        };

        let raw = self.platform.invoke(function_id, &args);
        match self.platform.decode_poll_response(&raw) {
            Ok(Polled::Ready { id, results }) => {
                match pending.iter().position(|job| job.id == id.raw()) {
                    Some(pos) => {
                        let job = pending.remove(pos);
                        let error = self.platform.extract_error_code(&results);
                        self.complete(job.id, error, results, &job.request);
                        true
                    }
                    None => {
                        // Stale or duplicate firmware response.
                        trace!(id = id.raw(), "poll response for unknown transaction dropped");
                        false
                    }
                }
            }
            Ok(Polled::Idle) => false,
            Err(e) => {
                warn!(error = %e, "poll response decode failed");
                false
            }
        }
    }

    /// Completes every pending job whose firmware response never arrived
    /// within the configured bound.
    fn expire_pending(&self, pending: &mut Vec<PendingJob>) {
        let now = Instant::now();
        let mut i = 0;
        while i < pending.len() {
            if now >= pending[i].expires {
                let job = pending.remove(i);
                warn!(id = job.id, "asynchronous transaction timed out");
                self.complete(job.id, Response::TIMED_OUT, [0; NUM_RESULTS], &job.request);
            } else {
                i += 1;
            }
        }
    }

    /// Parks the worker until there is work or a deadline: the watchdog, the
    /// next poll attempt, or the earliest async expiry, whichever is first.
    fn park(&self, pending: &[PendingJob]) {
        let queue = self.queue.lock().unwrap();
        if !queue.is_empty() || self.shutdown.load(Ordering::Acquire) {
            return;
        }

        let mut deadline = self.chan.lock().unwrap().watchdog;
        if !pending.is_empty() {
            let mut next = Instant::now() + self.cfg.poll_interval;
            if let Some(expiry) = pending.iter().map(|job| job.expires).min() {
                next = next.min(expiry);
            }
            deadline = Some(deadline.map_or(next, |d| d.min(next)));
        }

        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now < deadline {
                    let _ = self.work_cv.wait_timeout(queue, deadline - now).unwrap();
                }
            }
            None => {
                let _unused = self.work_cv.wait(queue).unwrap();
            }
        }
    }

    /// Shutdown drain: every queued or pending transaction is marked
    /// cancelled and run through the completion path, so callers' buffers
    /// are released and nothing completes twice or never.
    fn drain(&self, pending: &mut Vec<PendingJob>) {
        loop {
            let item = self.queue.lock().unwrap().pop();
            let Some((id, request)) = item else { break };
            if let Some(entry) = self.trans.lock().unwrap().map.get_mut(id) {
                entry.cancelled = true;
            }
            self.process(pending, id, request);
        }
        for job in std::mem::take(pending) {
            if let Some(entry) = self.trans.lock().unwrap().map.get_mut(job.id) {
                entry.cancelled = true;
            }
            self.complete(job.id, 0, [0; NUM_RESULTS], &job.request);
        }
        debug!("dispatch queue drained for shutdown");
    }
}

fn worker_main<P: Platform>(shared: Arc<Shared<P>>) {
    trace!("dispatch worker running");
    let mut pending: Vec<PendingJob> = Vec::new();
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            shared.drain(&mut pending);
            break;
        }
        shared.check_watchdog();

        let item = shared.queue.lock().unwrap().pop();
        let had_item = item.is_some();
        if let Some((id, request)) = item {
            shared.process(&mut pending, id, request);
        }

        let mut polled = false;
        if !pending.is_empty() {
            polled = shared.poll_pending(&mut pending);
            shared.expire_pending(&mut pending);
        }

        if !had_item && !polled {
            shared.park(&pending);
        }
    }
    trace!("dispatch worker stopped");
}
