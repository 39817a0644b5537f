//! The await bridge and the per-worker fiber scope.
//!
//! A fiber scope is installed by the pool around every task body: it holds
//! the fiber's local variables, its worker identity, and a weak handle to
//! the runtime. The scope is what makes "the currently active fiber" an
//! explicit, inspectable thing rather than ambient global state — each
//! worker is a dedicated thread, so thread-local storage *is* this
//! runtime's task-local storage, cleared between tasks by the scope guard.
//!
//! [`await_promise`] is the heart of the crate: it parks the calling fiber
//! until a promise settles, then resumes it with the value or re-raises the
//! rejection reason at the suspension point. Suspension happens only here,
//! never implicitly.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Arc, Weak};

use crate::context::{ContextValue, Snapshot};
use crate::error::{Error, Fault};
use crate::promise::{Outcome, Promise};
use crate::runtime::RuntimeInner;
use crate::scheduler::SchedulerHandle;

pub(crate) struct FiberScope {
    runtime: Weak<RuntimeInner>,
    worker: usize,
    locals: BTreeMap<String, ContextValue>,
}

impl FiberScope {
    pub(crate) fn locals(&self) -> &BTreeMap<String, ContextValue> {
        &self.locals
    }

    pub(crate) fn locals_mut(&mut self) -> &mut BTreeMap<String, ContextValue> {
        &mut self.locals
    }
}

thread_local! {
    static SCOPE: RefCell<Option<FiberScope>> = const { RefCell::new(None) };
}

/// Installs a fiber scope for the duration of one task body; clearing on
/// drop is what guarantees no later task observes a prior task's locals.
pub(crate) struct ScopeGuard {
    _private: (),
}

impl ScopeGuard {
    pub(crate) fn enter(runtime: Weak<RuntimeInner>, worker: usize, snapshot: Snapshot) -> Self {
        SCOPE.with(|scope| {
            *scope.borrow_mut() = Some(FiberScope {
                runtime,
                worker,
                locals: snapshot.into_entries(),
            });
        });
        Self { _private: () }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        SCOPE.with(|scope| {
            *scope.borrow_mut() = None;
        });
    }
}

/// Runs `f` against the active fiber scope, if any.
///
/// The borrow is released before `f`'s result is returned; callers must
/// never park inside `f`.
pub(crate) fn with_scope<R>(f: impl FnOnce(&mut FiberScope) -> R) -> Option<R> {
    SCOPE.with(|scope| scope.borrow_mut().as_mut().map(f))
}

/// Whether the calling code is executing on a fiber.
pub fn in_fiber() -> bool {
    SCOPE.with(|scope| scope.borrow().is_some())
}

/// The worker id of the active fiber, if any. Stable across suspensions of
/// the same task; useful for diagnostics and reuse assertions.
pub fn current_worker() -> Option<usize> {
    with_scope(|scope| scope.worker)
}

/// Resolves the active fiber's runtime, with the bridge's fail-fast rules:
/// no fiber → [`Error::Context`], runtime gone → [`Error::Configuration`].
pub(crate) fn current_runtime() -> Result<Arc<RuntimeInner>, Error> {
    let weak = with_scope(|scope| scope.runtime.clone()).ok_or(Error::Context)?;
    weak.upgrade().ok_or(Error::Configuration)
}

/// Suspends the calling fiber until `promise` settles, then resumes it with
/// the fulfillment value or re-raises the rejection reason here.
///
/// Requires an active fiber and a live runtime; otherwise fails immediately
/// — not via the promise — with [`Error::Context`] or
/// [`Error::Configuration`]. The two reaction handlers are registered on
/// the unwrapped [`Promise::subscribe`] path (no pool allocation for this
/// internal use); immediately afterwards the fiber yields its lane and
/// parks. It resumes at most once, when settlement delivers.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use fiber_promise::{fiber, Error, Runtime};
///
/// let rt = Runtime::new();
/// let (promise, deferred) = rt.deferred::<i32>();
///
/// let doubled = rt.dispatch(move || {
///     let n = fiber::await_promise(&promise)?;
///     Ok::<_, Error>(n * 2)
/// });
///
/// deferred.fulfill(21);
/// assert_eq!(
///     doubled.block_until_settled(Duration::from_secs(5)),
///     Some(Ok(42)),
/// );
/// ```
pub fn await_promise<T: Clone + Send + 'static>(promise: &Promise<T>) -> Result<T, Error> {
    let rt = current_runtime()?;
    let worker = current_worker().unwrap_or_default();

    // Rendezvous for the single resume message. Capacity 1: the sender
    // never blocks, and a second send would be a double-resume defect
    // caught by the escalation path.
    let (tx, rx) = std::sync::mpsc::sync_channel::<Outcome<T>>(1);
    let scheduler = rt.scheduler().clone();
    let runtime = Arc::downgrade(&rt);
    promise.subscribe(move |outcome| {
        resume_or_escalate(&tx, outcome, &scheduler, &runtime);
    });

    tracing::trace!(worker, "fiber suspended awaiting promise");
    rt.lane().release();
    let resumed = rx.recv();
    rt.lane().acquire();
    tracing::trace!(worker, "fiber resumed");

    match resumed {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(fault)) => Err(Error::Rejected(fault)),
        // The reaction was dropped without delivering: the scheduler shut
        // down between registration and settlement.
        Err(_) => Err(Error::Configuration),
    }
}

/// Awaits a plain value by resolving it first, like the static
/// `await(value)` form: the fiber still suspends for one scheduler turn
/// before the value comes back.
pub fn await_value<T: Clone + Send + 'static>(value: T) -> Result<T, Error> {
    let rt = current_runtime()?;
    let promise = Promise::settled_parts(rt.scheduler().clone(), Arc::downgrade(&rt), Ok(value));
    await_promise(&promise)
}

/// Awaits every promise, returning the values in input order, or re-raising
/// the first-delivered rejection reason regardless of settlement order.
///
/// Delegates combination to the all-settle combinator
/// ([`Runtime::all`](crate::runtime::Runtime::all)); this is
/// `await_promise` over its result.
pub fn await_all<T: Clone + Send + 'static>(promises: Vec<Promise<T>>) -> Result<Vec<T>, Error> {
    let rt = current_runtime()?;
    let combined = RuntimeInner::all(&rt, promises);
    await_promise(&combined)
}

/// Guarded resume: deliver `outcome` to the parked fiber, and if the fiber
/// can no longer be resumed, reschedule the failure onto the next scheduler
/// turn so it surfaces through the unhandled-fault hook instead of being
/// absorbed by whichever dispatcher triggered the resume.
pub(crate) fn resume_or_escalate<T: Send + 'static>(
    tx: &SyncSender<Outcome<T>>,
    outcome: Outcome<T>,
    scheduler: &SchedulerHandle,
    runtime: &Weak<RuntimeInner>,
) {
    let failure = match tx.try_send(outcome) {
        Ok(()) => return,
        Err(TrySendError::Disconnected(_)) => {
            Fault::resumption("parked fiber is no longer resumable")
        }
        Err(TrySendError::Full(_)) => {
            Fault::resumption("parked fiber was already resumed; duplicate resume dropped")
        }
    };

    let runtime = runtime.clone();
    scheduler.next_tick(Box::new(move || match runtime.upgrade() {
        Some(rt) => rt.report_unhandled(failure),
        None => tracing::error!(reason = %failure, "resumption failure after runtime shutdown"),
    }));
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::sync_channel;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::FaultKind;
    use crate::runtime::Runtime;

    #[test]
    fn await_outside_fiber_is_a_context_error() {
        let rt = Runtime::new();
        let (promise, _deferred) = rt.deferred::<i32>();
        assert!(matches!(await_promise(&promise), Err(Error::Context)));
        assert!(matches!(await_value(1), Err(Error::Context)));
        assert!(matches!(await_all::<i32>(vec![]), Err(Error::Context)));
    }

    #[test]
    fn no_scope_means_no_fiber() {
        assert!(!in_fiber());
        assert_eq!(current_worker(), None);
    }

    #[test]
    fn successful_resume_does_not_escalate() {
        let rt = Runtime::new();
        let (fired_tx, fired_rx) = sync_channel(1);
        rt.set_unhandled_fault_hook(move |fault| {
            let _ = fired_tx.send(fault);
        });

        let (tx, rx) = sync_channel::<Outcome<i32>>(1);
        resume_or_escalate(
            &tx,
            Ok(5),
            rt.scheduler_handle(),
            &rt.downgrade_inner(),
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok(Ok(5)));
        assert!(fired_rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn unresumable_fiber_escalates_to_the_hook_on_a_later_turn() {
        let rt = Runtime::new();
        let (fired_tx, fired_rx) = sync_channel(1);
        rt.set_unhandled_fault_hook(move |fault| {
            let _ = fired_tx.send(fault);
        });

        let (tx, rx) = sync_channel::<Outcome<i32>>(1);
        drop(rx); // the parked fiber is gone
        resume_or_escalate(
            &tx,
            Ok(5),
            rt.scheduler_handle(),
            &rt.downgrade_inner(),
        );

        let fault = fired_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(fault.kind(), FaultKind::Resumption);
    }

    #[test]
    fn double_resume_escalates_instead_of_blocking() {
        let rt = Runtime::new();
        let (fired_tx, fired_rx) = sync_channel(1);
        rt.set_unhandled_fault_hook(move |fault| {
            let _ = fired_tx.send(fault);
        });

        let (tx, _rx) = sync_channel::<Outcome<i32>>(1);
        resume_or_escalate(&tx, Ok(1), rt.scheduler_handle(), &rt.downgrade_inner());
        resume_or_escalate(&tx, Ok(2), rt.scheduler_handle(), &rt.downgrade_inner());

        let fault = fired_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(fault.kind(), FaultKind::Resumption);
        assert!(fault.message().contains("already resumed"));
    }
}
