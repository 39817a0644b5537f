//! The purpose-built promise type.
//!
//! A [`Promise`] is a cloneable handle to an eventually-available result: it
//! settles exactly once, to either a value (fulfilled) or a [`Fault`]
//! (rejected). The producer half is a [`Deferred`], split off at creation
//! like a oneshot channel.
//!
//! Reactions are never run inline by the settler: every delivery is posted
//! to the host scheduler and runs on a later turn, FIFO per promise. Two
//! registration paths exist, and the difference is load-bearing:
//!
//! - [`Promise::subscribe`] is the *unwrapped* path: the callback runs
//!   directly on a scheduler turn, with no pool dispatch and no snapshot.
//!   The await bridge uses it internally to avoid recursive pool
//!   allocation; it is public as a low-level escape hatch.
//! - [`Promise::then`] / [`catch`](Promise::catch) /
//!   [`then_catch`](Promise::then_catch) are the *wrapped* path: each
//!   handler executes on a pooled fiber carrying a
//!   [`Snapshot`](crate::context::Snapshot) captured at **registration**
//!   time — whichever fiber called the registration method — not whichever
//!   happens to be active when the promise eventually settles. An absent
//!   handler passes the value or fault through untouched.

use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context as TaskContext, Poll, Waker};
use std::time::Duration;

use parking_lot::Mutex;

use crate::context::Snapshot;
use crate::error::Fault;
use crate::fiber;
use crate::runtime::RuntimeInner;
use crate::scheduler::SchedulerHandle;

/// The settled outcome of a promise.
pub type Outcome<T> = Result<T, Fault>;

type ReactionFn<T> = Box<dyn FnOnce(Outcome<T>) + Send + 'static>;

enum State<T> {
    Pending {
        reactions: Vec<ReactionFn<T>>,
        wakers: Vec<Waker>,
    },
    Fulfilled(T),
    Rejected(Fault),
}

pub(crate) struct Shared<T> {
    state: Mutex<State<T>>,
    scheduler: SchedulerHandle,
    runtime: Weak<RuntimeInner>,
}

/// A handle to an eventually-available result or failure.
///
/// Cloning shares the same settlement cell. `Promise` also implements
/// [`Future`], so it composes with async code; on a fiber, use
/// [`fiber::await_promise`] instead.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use fiber_promise::Runtime;
///
/// let rt = Runtime::new();
/// let (promise, deferred) = rt.deferred::<i32>();
/// deferred.fulfill(7);
/// assert_eq!(
///     promise.block_until_settled(Duration::from_secs(5)),
///     Some(Ok(7)),
/// );
/// ```
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.shared.state.lock() {
            State::Pending { reactions, .. } => format!("pending({} reactions)", reactions.len()),
            State::Fulfilled(_) => "fulfilled".to_string(),
            State::Rejected(fault) => format!("rejected({fault})"),
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    pub(crate) fn pending_parts(
        scheduler: SchedulerHandle,
        runtime: Weak<RuntimeInner>,
    ) -> (Promise<T>, Deferred<T>) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::Pending {
                reactions: Vec::new(),
                wakers: Vec::new(),
            }),
            scheduler,
            runtime,
        });
        (
            Promise {
                shared: Arc::clone(&shared),
            },
            Deferred {
                shared,
                settled: false,
            },
        )
    }

    pub(crate) fn settled_parts(
        scheduler: SchedulerHandle,
        runtime: Weak<RuntimeInner>,
        outcome: Outcome<T>,
    ) -> Promise<T> {
        let state = match outcome {
            Ok(value) => State::Fulfilled(value),
            Err(fault) => State::Rejected(fault),
        };
        Promise {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                scheduler,
                runtime,
            }),
        }
    }

    pub(crate) fn settle_shared(shared: &Arc<Shared<T>>, outcome: Outcome<T>) {
        let (reactions, wakers) = {
            let mut state = shared.state.lock();
            match &*state {
                State::Pending { .. } => {}
                _ => {
                    tracing::debug!("duplicate settlement ignored");
                    return;
                }
            }
            let next = match &outcome {
                Ok(value) => State::Fulfilled(value.clone()),
                Err(fault) => State::Rejected(fault.clone()),
            };
            match mem::replace(&mut *state, next) {
                State::Pending { reactions, wakers } => (reactions, wakers),
                _ => unreachable!("checked pending above"),
            }
        };

        for reaction in reactions {
            let outcome = outcome.clone();
            shared
                .scheduler
                .post(Box::new(move || reaction(outcome)));
        }
        for waker in wakers {
            waker.wake();
        }
    }

    /// Returns the settled outcome, or `None` while pending.
    pub fn settled(&self) -> Option<Outcome<T>> {
        match &*self.shared.state.lock() {
            State::Pending { .. } => None,
            State::Fulfilled(value) => Some(Ok(value.clone())),
            State::Rejected(fault) => Some(Err(fault.clone())),
        }
    }

    /// Registers a reaction on the **unwrapped** path.
    ///
    /// The callback fires exactly once, on a scheduler turn, with the
    /// settled outcome — a Rust `Result` stands in for the traditional
    /// fulfillment/rejection handler pair, so exactly one arm runs. No
    /// pooled fiber is allocated and no snapshot is captured; handlers that
    /// need fiber facilities belong on [`then`](Self::then).
    ///
    /// Registering after settlement still delivers on a later turn, never
    /// inline.
    pub fn subscribe<F>(&self, reaction: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        let already = {
            let mut state = self.shared.state.lock();
            match &mut *state {
                State::Pending { reactions, .. } => {
                    reactions.push(Box::new(reaction));
                    None
                }
                State::Fulfilled(value) => Some((Ok(value.clone()), Box::new(reaction) as ReactionFn<T>)),
                State::Rejected(fault) => {
                    Some((Err(fault.clone()), Box::new(reaction) as ReactionFn<T>))
                }
            }
        };
        if let Some((outcome, reaction)) = already {
            self.shared
                .scheduler
                .post(Box::new(move || reaction(outcome)));
        }
    }

    /// Registers a fulfillment handler on the **wrapped** path.
    ///
    /// Captures a snapshot of the fiber calling `then` and, on fulfillment,
    /// runs `on_fulfilled` on a pooled fiber carrying that snapshot. A
    /// rejection passes through to the returned promise untouched (the
    /// absent-handler rule).
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use fiber_promise::{Fault, Runtime};
    ///
    /// let rt = Runtime::new();
    /// let doubled = rt.resolved(21).then(|n| Ok::<_, Fault>(n * 2));
    /// assert_eq!(
    ///     doubled.block_until_settled(Duration::from_secs(5)),
    ///     Some(Ok(42)),
    /// );
    /// ```
    pub fn then<U, F>(&self, on_fulfilled: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U, Fault> + Send + 'static,
    {
        let snapshot = Snapshot::capture();
        let runtime = self.shared.runtime.clone();
        let (next, deferred) =
            Promise::pending_parts(self.shared.scheduler.clone(), runtime.clone());
        self.subscribe(move |outcome| match outcome {
            Ok(value) => dispatch_handler(&runtime, snapshot, deferred, move || on_fulfilled(value)),
            Err(fault) => deferred.reject(fault),
        });
        next
    }

    /// Registers a rejection handler on the **wrapped** path.
    ///
    /// On rejection, runs `on_rejected` on a pooled fiber with the
    /// registration-time snapshot; it may recover by returning `Ok`. A
    /// fulfillment passes through untouched.
    pub fn catch<R>(&self, on_rejected: R) -> Promise<T>
    where
        R: FnOnce(Fault) -> Result<T, Fault> + Send + 'static,
    {
        let snapshot = Snapshot::capture();
        let runtime = self.shared.runtime.clone();
        let (next, deferred) =
            Promise::pending_parts(self.shared.scheduler.clone(), runtime.clone());
        self.subscribe(move |outcome| match outcome {
            Ok(value) => deferred.fulfill(value),
            Err(fault) => dispatch_handler(&runtime, snapshot, deferred, move || on_rejected(fault)),
        });
        next
    }

    /// Registers both handlers at once, sharing one registration-time
    /// snapshot. Exactly one of them runs, on a pooled fiber.
    pub fn then_catch<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U, Fault> + Send + 'static,
        R: FnOnce(Fault) -> Result<U, Fault> + Send + 'static,
    {
        let snapshot = Snapshot::capture();
        let runtime = self.shared.runtime.clone();
        let (next, deferred) =
            Promise::pending_parts(self.shared.scheduler.clone(), runtime.clone());
        self.subscribe(move |outcome| match outcome {
            Ok(value) => dispatch_handler(&runtime, snapshot, deferred, move || on_fulfilled(value)),
            Err(fault) => dispatch_handler(&runtime, snapshot, deferred, move || on_rejected(fault)),
        });
        next
    }

    /// Blocks the calling **plain thread** until settlement or timeout.
    ///
    /// This is the embedding/test entry point for code that is not running
    /// on a fiber and not inside an async task. Returns `None` on timeout.
    ///
    /// # Panics
    ///
    /// Panics when called on a fiber: blocking a fiber here would hold the
    /// execution lane across the wait and deadlock the pool. On a fiber,
    /// use [`fiber::await_promise`].
    pub fn block_until_settled(&self, timeout: Duration) -> Option<Outcome<T>> {
        assert!(
            !fiber::in_fiber(),
            "block_until_settled called on a fiber; use fiber::await_promise"
        );
        let (tx, rx) = std::sync::mpsc::sync_channel::<Outcome<T>>(1);
        self.subscribe(move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.recv_timeout(timeout).ok()
    }
}

/// Wrapped-path delivery: run one handler on a pooled fiber carrying the
/// registration-time snapshot, settling `deferred` with its outcome.
fn dispatch_handler<U, H>(
    runtime: &Weak<RuntimeInner>,
    snapshot: Snapshot,
    deferred: Deferred<U>,
    handler: H,
) where
    U: Clone + Send + 'static,
    H: FnOnce() -> Result<U, Fault> + Send + 'static,
{
    match runtime.upgrade() {
        Some(rt) => rt.dispatch_job(snapshot, handler, deferred),
        None => deferred.reject(Fault::configuration(
            "fiber runtime dropped before reaction dispatch",
        )),
    }
}

impl<T: Clone + Send + 'static> Future for Promise<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.state.lock();
        match &mut *state {
            State::Fulfilled(value) => Poll::Ready(Ok(value.clone())),
            State::Rejected(fault) => Poll::Ready(Err(fault.clone())),
            State::Pending { wakers, .. } => {
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

/// The producer half of a promise.
///
/// Settlement is once-only: later attempts are ignored (and logged at debug
/// level). Dropping an unsettled `Deferred` rejects the promise with a
/// canceled [`Fault`], so a fiber parked on it is resumed instead of leaked.
pub struct Deferred<T: 'static> {
    shared: Arc<Shared<T>>,
    settled: bool,
}

impl<T: Clone + Send + 'static> Deferred<T> {
    /// Fulfills the promise with `value`.
    pub fn fulfill(mut self, value: T) {
        self.settled = true;
        Promise::settle_shared(&self.shared, Ok(value));
    }

    /// Rejects the promise with `fault`.
    pub fn reject(mut self, fault: impl Into<Fault>) {
        self.settled = true;
        Promise::settle_shared(&self.shared, Err(fault.into()));
    }

    /// Settles with a ready outcome.
    pub fn settle(mut self, outcome: Outcome<T>) {
        self.settled = true;
        Promise::settle_shared(&self.shared, outcome);
    }
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("settled", &self.settled)
            .finish_non_exhaustive()
    }
}

impl<T: 'static> Drop for Deferred<T> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let is_pending = matches!(&*self.shared.state.lock(), State::Pending { .. });
        if is_pending {
            tracing::debug!("deferred dropped unsettled; rejecting as canceled");
        }
        // settle_shared needs T: Clone + Send, which Drop cannot require;
        // rejection never clones T, so route through a fault-only settle.
        settle_fault_only(&self.shared, Fault::canceled("promise producer dropped unsettled"));
    }
}

/// Rejection path that places no bounds on `T`, for use from `Drop`.
fn settle_fault_only<T: 'static>(shared: &Arc<Shared<T>>, fault: Fault) {
    let (reactions, wakers) = {
        let mut state = shared.state.lock();
        match &*state {
            State::Pending { .. } => {}
            _ => return,
        }
        match mem::replace(&mut *state, State::Rejected(fault.clone())) {
            State::Pending { reactions, wakers } => (reactions, wakers),
            _ => unreachable!("checked pending above"),
        }
    };
    for reaction in reactions {
        let fault = fault.clone();
        shared
            .scheduler
            .post(Box::new(move || reaction(Err(fault))));
    }
    for waker in wakers {
        waker.wake();
    }
}
