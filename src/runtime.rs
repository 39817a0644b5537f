//! The runtime facade: scheduler + pool + lane + configuration.
//!
//! A [`Runtime`] owns the host scheduler thread, the fiber pool, the
//! execution lane, and the unhandled-fault hook. Handles are cheap clones;
//! workers and promises hold only weak references, so dropping the last
//! `Runtime` handle shuts the pool down (idle workers exit, `await` starts
//! failing fast with a configuration error) while already-created promises
//! keep settling.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::context::Snapshot;
use crate::error::{Error, Fault};
use crate::fiber;
use crate::pool::{Completion, Lane, Pool, PoolConfig, PoolMetrics, Task};
use crate::promise::{Deferred, Promise};
use crate::scheduler::{self, SchedulerHandle};

type FaultHook = Arc<dyn Fn(Fault) + Send + Sync + 'static>;

/// Decides whether an asyncified function may run in place on the fiber
/// that invoked it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReusePolicy {
    /// When invoked on an active fiber, run the body synchronously there
    /// and skip pool allocation. A failure in this path raises
    /// synchronously — the intentional asymmetry of the adapter.
    ReuseCurrentFiber,
    /// Always dispatch onto a pooled fiber; never raises synchronously.
    AlwaysDispatch,
}

pub(crate) struct RuntimeInner {
    scheduler: SchedulerHandle,
    pool: Pool,
    lane: Lane,
    unhandled: RwLock<FaultHook>,
}

impl RuntimeInner {
    pub(crate) fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    pub(crate) fn lane(&self) -> &Lane {
        &self.lane
    }

    pub(crate) fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Routes a fault that no caller can observe through the configured
    /// hook. Runs on a scheduler turn.
    pub(crate) fn report_unhandled(&self, fault: Fault) {
        let hook = Arc::clone(&*self.unhandled.read());
        hook(fault);
    }

    /// Runs `f` on a pooled fiber under `snapshot`, settling `deferred`
    /// with its outcome. Panics become rejections; the worker returns to
    /// the free list before the settlement is performed.
    pub(crate) fn dispatch_job<T, E, F>(&self, snapshot: Snapshot, f: F, deferred: Deferred<T>)
    where
        T: Clone + Send + 'static,
        E: Into<Fault>,
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        let job = Box::new(move || -> Completion {
            let outcome = match catch_unwind(AssertUnwindSafe(f)) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(err.into()),
                Err(payload) => Err(Fault::from_panic(payload)),
            };
            Box::new(move || deferred.settle(outcome)) as Completion
        });
        self.pool.dispatch(Task { job, snapshot });
    }

    /// Order-preserving all-settle combinator: fulfills with every value in
    /// input order, or rejects with the first-delivered rejection reason.
    pub(crate) fn all<T: Clone + Send + 'static>(
        self: &Arc<Self>,
        promises: Vec<Promise<T>>,
    ) -> Promise<Vec<T>> {
        let (combined, deferred) =
            Promise::pending_parts(self.scheduler.clone(), Arc::downgrade(self));
        let total = promises.len();
        if total == 0 {
            deferred.fulfill(Vec::new());
            return combined;
        }

        struct Gather<T: 'static> {
            slots: Vec<Option<T>>,
            remaining: usize,
            deferred: Option<Deferred<Vec<T>>>,
        }

        let gather = Arc::new(Mutex::new(Gather {
            slots: (0..total).map(|_| None).collect(),
            remaining: total,
            deferred: Some(deferred),
        }));

        for (index, promise) in promises.iter().enumerate() {
            let gather = Arc::clone(&gather);
            promise.subscribe(move |outcome| {
                let mut state = gather.lock();
                if state.deferred.is_none() {
                    return; // already rejected; later deliveries are moot
                }
                match outcome {
                    Ok(value) => {
                        state.slots[index] = Some(value);
                        state.remaining -= 1;
                        if state.remaining == 0 {
                            let deferred = state.deferred.take();
                            let values: Option<Vec<T>> =
                                state.slots.iter_mut().map(Option::take).collect();
                            drop(state);
                            if let (Some(deferred), Some(values)) = (deferred, values) {
                                deferred.fulfill(values);
                            }
                        }
                    }
                    Err(fault) => {
                        let deferred = state.deferred.take();
                        drop(state);
                        if let Some(deferred) = deferred {
                            deferred.reject(fault);
                        }
                    }
                }
            });
        }

        combined
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        tracing::debug!("fiber runtime shutting down");
        self.pool.shutdown();
    }
}

/// Builder for [`Runtime`], in the crate's usual `with_*`-free builder
/// shape: every knob has a sensible default.
///
/// # Examples
///
/// ```
/// use fiber_promise::Runtime;
///
/// let rt = Runtime::builder()
///     .thread_name_prefix("billing")
///     .worker_stack_size(512 * 1024)
///     .build()
///     .unwrap();
/// assert_eq!(rt.pool_metrics().spawned, 0);
/// ```
pub struct RuntimeBuilder {
    stack_size: Option<usize>,
    thread_name_prefix: String,
    hook: Option<FaultHook>,
}

impl RuntimeBuilder {
    fn new() -> Self {
        Self {
            stack_size: None,
            thread_name_prefix: "fiber".to_string(),
            hook: None,
        }
    }

    /// Stack size for worker threads, in bytes. Defaults to the platform
    /// default.
    #[must_use]
    pub fn worker_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Prefix for the scheduler and worker thread names. Defaults to
    /// `"fiber"`.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Hook invoked (on a scheduler turn) for faults no caller can observe,
    /// such as resumption failures. Defaults to a `tracing::error!` event.
    #[must_use]
    pub fn on_unhandled_fault(mut self, hook: impl Fn(Fault) + Send + Sync + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// Starts the scheduler thread and returns the runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Startup`] when the scheduler thread or its driver
    /// cannot be created.
    pub fn build(self) -> Result<Runtime, Error> {
        let scheduler = scheduler::spawn(format!("{}-scheduler", self.thread_name_prefix))?;
        let hook: FaultHook = self.hook.unwrap_or_else(|| {
            Arc::new(|fault: Fault| {
                tracing::error!(reason = %fault, "unhandled fiber fault");
            })
        });
        let stack_size = self.stack_size;
        let thread_name_prefix = self.thread_name_prefix;

        let inner = Arc::new_cyclic(|weak: &Weak<RuntimeInner>| RuntimeInner {
            scheduler,
            pool: Pool::new(
                weak.clone(),
                PoolConfig {
                    stack_size,
                    thread_name_prefix,
                },
            ),
            lane: Lane::new(),
            unhandled: RwLock::new(hook),
        });

        Ok(Runtime { inner })
    }
}

/// Handle to a fiber runtime.
///
/// Cloning is cheap and shares the scheduler, pool, and lane. See the
/// crate-level documentation for the execution model.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use fiber_promise::{Error, Runtime};
///
/// let rt = Runtime::new();
/// let sum = rt.dispatch(|| Ok::<_, Error>(2 + 2));
/// assert_eq!(
///     sum.block_until_settled(Duration::from_secs(5)),
///     Some(Ok(4)),
/// );
/// ```
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Builds a runtime with default settings.
    ///
    /// # Panics
    ///
    /// Panics when the scheduler thread cannot be started; use
    /// [`Runtime::builder`] and [`RuntimeBuilder::build`] to handle that
    /// error explicitly.
    pub fn new() -> Self {
        Runtime::builder()
            .build()
            .expect("failed to start fiber runtime")
    }

    /// Returns a builder with default settings.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Creates a pending promise and its producer half.
    pub fn deferred<T: Clone + Send + 'static>(&self) -> (Promise<T>, Deferred<T>) {
        Promise::pending_parts(self.inner.scheduler.clone(), Arc::downgrade(&self.inner))
    }

    /// Creates an already-fulfilled promise.
    pub fn resolved<T: Clone + Send + 'static>(&self, value: T) -> Promise<T> {
        Promise::settled_parts(
            self.inner.scheduler.clone(),
            Arc::downgrade(&self.inner),
            Ok(value),
        )
    }

    /// Creates an already-rejected promise.
    pub fn rejected<T: Clone + Send + 'static>(&self, fault: impl Into<Fault>) -> Promise<T> {
        Promise::settled_parts(
            self.inner.scheduler.clone(),
            Arc::downgrade(&self.inner),
            Err(fault.into()),
        )
    }

    /// The order-preserving all-settle combinator.
    ///
    /// Fulfills with `[V1..Vn]` in input order once every input fulfills,
    /// or rejects with the first-delivered rejection reason, regardless of
    /// settlement order. An empty input fulfills with an empty vector.
    pub fn all<T: Clone + Send + 'static>(&self, promises: Vec<Promise<T>>) -> Promise<Vec<T>> {
        RuntimeInner::all(&self.inner, promises)
    }

    /// Runs `f` on a pooled fiber and returns a promise for its outcome.
    ///
    /// The continuation snapshot is captured *now* — from whichever fiber
    /// is active at dispatch time, empty when none — and installed as the
    /// executing fiber's ambient state. The caller's turn is decoupled from
    /// the body's: this returns immediately, and the promise fulfills with
    /// the callback's `Ok` value or rejects with its `Err` fault (panics
    /// included, as panic faults).
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use fiber_promise::{context, Error, Runtime};
    ///
    /// let rt = Runtime::new();
    /// let greeting = rt.dispatch(|| {
    ///     context::set("who", "world")?;
    ///     Ok::<_, Error>(format!("hello, {}", context::get_str("who").unwrap_or_default()))
    /// });
    /// assert_eq!(
    ///     greeting.block_until_settled(Duration::from_secs(5)),
    ///     Some(Ok("hello, world".to_string())),
    /// );
    /// ```
    pub fn dispatch<T, E, F>(&self, f: F) -> Promise<T>
    where
        T: Clone + Send + 'static,
        E: Into<Fault>,
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        let (promise, deferred) = self.deferred();
        let snapshot = Snapshot::capture();
        self.inner.dispatch_job(snapshot, f, deferred);
        promise
    }

    /// Like [`dispatch`](Self::dispatch), but with an explicit snapshot —
    /// for seeding ambient state when dispatching from a plain thread.
    pub fn dispatch_with_snapshot<T, E, F>(&self, snapshot: Snapshot, f: F) -> Promise<T>
    where
        T: Clone + Send + 'static,
        E: Into<Fault>,
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        let (promise, deferred) = self.deferred();
        self.inner.dispatch_job(snapshot, f, deferred);
        promise
    }

    /// Converts `f` into a function returning a promise for its result.
    ///
    /// With [`ReusePolicy::ReuseCurrentFiber`] and an active fiber, the
    /// body runs synchronously in place and the call returns an
    /// already-fulfilled promise — or raises the failure synchronously as
    /// `Err(fault)` (and lets panics propagate). In every other case the
    /// body is dispatched onto a pooled fiber with a snapshot captured at
    /// the moment of the call, and the call returns `Ok` with a pending
    /// promise: it never raises synchronously.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use fiber_promise::{Error, ReusePolicy, Runtime};
    ///
    /// let rt = Runtime::new();
    /// let answer = rt.asyncify(|| Ok::<_, Error>(42), ReusePolicy::AlwaysDispatch);
    ///
    /// // No fiber is active here, so this cannot raise synchronously.
    /// let promise = answer().unwrap();
    /// assert_eq!(
    ///     promise.block_until_settled(Duration::from_secs(5)),
    ///     Some(Ok(42)),
    /// );
    /// ```
    pub fn asyncify<T, E, F>(
        &self,
        f: F,
        policy: ReusePolicy,
    ) -> impl Fn() -> Result<Promise<T>, Fault> + Send + Sync + 'static
    where
        T: Clone + Send + 'static,
        E: Into<Fault>,
        F: Fn() -> Result<T, E> + Clone + Send + Sync + 'static,
    {
        let rt = self.clone();
        move || {
            if policy == ReusePolicy::ReuseCurrentFiber && fiber::in_fiber() {
                match f() {
                    Ok(value) => Ok(rt.resolved(value)),
                    Err(err) => Err(err.into()),
                }
            } else {
                Ok(rt.dispatch(f.clone()))
            }
        }
    }

    /// Replaces the unhandled-fault hook.
    pub fn set_unhandled_fault_hook(&self, hook: impl Fn(Fault) + Send + Sync + 'static) {
        *self.inner.unhandled.write() = Arc::new(hook);
    }

    /// Point-in-time pool counters.
    pub fn pool_metrics(&self) -> PoolMetrics {
        self.inner.pool.metrics()
    }

    pub(crate) fn scheduler_handle(&self) -> &SchedulerHandle {
        self.inner.scheduler()
    }

    pub(crate) fn downgrade_inner(&self) -> Weak<RuntimeInner> {
        Arc::downgrade(&self.inner)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let metrics = self.pool_metrics();
        f.debug_struct("Runtime")
            .field("workers_spawned", &metrics.spawned)
            .field("workers_idle", &metrics.idle)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::FaultKind;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn dispatch_rejects_on_error_and_panic() {
        let rt = Runtime::new();

        let failed = rt.dispatch(|| Err::<i32, _>(Fault::new("boom")));
        assert_eq!(
            failed.block_until_settled(WAIT),
            Some(Err(Fault::new("boom"))),
        );

        let panicked = rt.dispatch(|| -> Result<i32, Fault> { panic!("tripped") });
        let fault = panicked.block_until_settled(WAIT).unwrap().unwrap_err();
        assert_eq!(fault.kind(), FaultKind::Panic);
        assert_eq!(fault.message(), "tripped");
    }

    #[test]
    fn all_preserves_input_order() {
        let rt = Runtime::new();
        let (p1, d1) = rt.deferred::<i32>();
        let (p2, d2) = rt.deferred::<i32>();
        let combined = rt.all(vec![p1, p2]);

        // Settle out of order; values still come back in input order.
        d2.fulfill(2);
        d1.fulfill(1);
        assert_eq!(combined.block_until_settled(WAIT), Some(Ok(vec![1, 2])));
    }

    #[test]
    fn all_rejects_with_first_delivered_reason() {
        let rt = Runtime::new();
        let (p1, _d1) = rt.deferred::<i32>();
        let (p2, d2) = rt.deferred::<i32>();
        let combined = rt.all(vec![p1, p2]);

        d2.reject(Fault::new("boom"));
        assert_eq!(
            combined.block_until_settled(WAIT),
            Some(Err(Fault::new("boom"))),
        );
    }

    #[test]
    fn all_of_nothing_fulfills_empty() {
        let rt = Runtime::new();
        let combined = rt.all::<i32>(Vec::new());
        assert_eq!(combined.block_until_settled(WAIT), Some(Ok(Vec::new())));
    }

    #[test]
    fn dispatch_with_snapshot_seeds_ambient_state() {
        let rt = Runtime::new();
        let snapshot = Snapshot::empty().with("tenant", "acme");
        let seen = rt.dispatch_with_snapshot(snapshot, || {
            Ok::<_, Error>(crate::context::get_str("tenant"))
        });
        assert_eq!(
            seen.block_until_settled(WAIT),
            Some(Ok(Some("acme".to_string()))),
        );
    }
}
