//! The fiber pool: reusable workers and the execution lane.
//!
//! Each worker wraps one pausable execution context — a dedicated thread
//! parked on its own job channel. Workers cycle
//! Idle → Running → (Suspended ↔ Running)* → Idle, returning to the free
//! list after every outcome, so a worker that just ran a failing task is
//! immediately reusable. A worker never holds two tasks: dispatch hands a
//! task to exactly one worker, and the worker rejoins the free list only
//! after its task is finished and its ambient state is cleared.
//!
//! # The lane
//!
//! Fibers are cooperative, not parallel: a runtime-wide lane gate (a binary
//! semaphore) admits one Running fiber at a time. A worker acquires the
//! lane before its task body and releases it afterwards; the await bridge
//! releases it across every suspension. Many fibers interleave, but no two
//! ever execute simultaneously against shared state, which is why
//! fiber-local data needs no locking of its own.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Weak;
use std::thread;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc;

use crate::context::Snapshot;
use crate::fiber::ScopeGuard;
use crate::runtime::RuntimeInner;

/// Deferred settlement work a task hands back to its worker.
///
/// The worker runs it *after* rejoining the free list, so by the time a
/// task's promise observably settles, the worker is already reusable.
pub(crate) type Completion = Box<dyn FnOnce() + Send + 'static>;

/// A pending unit of execution: the erased task body plus the continuation
/// snapshot captured at dispatch time. Exclusively owned by the worker that
/// executes it; dropped (settling its promise as canceled) if it can never
/// run.
pub(crate) struct Task {
    pub(crate) job: Box<dyn FnOnce() -> Completion + Send + 'static>,
    pub(crate) snapshot: Snapshot,
}

/// Point-in-time pool counters.
///
/// `spawned` counts workers ever created; `idle` counts workers currently
/// in the free list. Useful for reuse assertions and capacity monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolMetrics {
    /// Total workers spawned over the pool's lifetime.
    pub spawned: usize,
    /// Workers currently idle and available for dispatch.
    pub idle: usize,
}

/// One-at-a-time admission gate for Running fibers.
pub(crate) struct Lane {
    held: Mutex<bool>,
    released: Condvar,
}

impl Lane {
    pub(crate) fn new() -> Self {
        Self {
            held: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    pub(crate) fn acquire(&self) {
        let mut held = self.held.lock();
        while *held {
            self.released.wait(&mut held);
        }
        *held = true;
    }

    pub(crate) fn release(&self) {
        let mut held = self.held.lock();
        debug_assert!(*held, "lane released while not held");
        *held = false;
        self.released.notify_one();
    }
}

pub(crate) struct PoolConfig {
    pub(crate) stack_size: Option<usize>,
    pub(crate) thread_name_prefix: String,
}

/// The set of idle workers plus the registry of their job channels.
///
/// Growth is on demand with no fixed upper bound; retirement policy is an
/// operational concern outside this crate. Exclusive ownership is the only
/// concurrency control needed: dispatch and free-list reinsertion happen
/// strictly between a worker's Idle and Running transitions.
pub(crate) struct Pool {
    runtime: Weak<RuntimeInner>,
    registry: DashMap<usize, mpsc::UnboundedSender<Task>>,
    idle: Mutex<Vec<usize>>,
    next_id: AtomicUsize,
    spawned: AtomicUsize,
    config: PoolConfig,
}

impl Pool {
    pub(crate) fn new(runtime: Weak<RuntimeInner>, config: PoolConfig) -> Self {
        Self {
            runtime,
            registry: DashMap::new(),
            idle: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            spawned: AtomicUsize::new(0),
            config,
        }
    }

    pub(crate) fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            spawned: self.spawned.load(Ordering::SeqCst),
            idle: self.idle.lock().len(),
        }
    }

    /// Hands `task` to an idle worker, spawning one when none is free.
    ///
    /// Never blocks and never runs the task on the caller's turn: the
    /// caller gets control back immediately and the body executes on the
    /// worker's own turn once it clears the lane. If the worker cannot be
    /// spawned or reached, the task is dropped, which settles its promise
    /// as canceled — failure stays visible, dispatch stays infallible.
    pub(crate) fn dispatch(&self, task: Task) {
        let worker_id = match self.idle.lock().pop() {
            Some(id) => {
                tracing::trace!(worker = id, "reusing idle fiber worker");
                Some(id)
            }
            None => match self.spawn_worker() {
                Ok(id) => Some(id),
                Err(err) => {
                    tracing::error!(error = %err, "failed to spawn fiber worker; dropping task");
                    None
                }
            },
        };

        let Some(id) = worker_id else {
            return; // task drops here; its deferred rejects as canceled
        };

        let sender = self.registry.get(&id).map(|entry| entry.value().clone());
        match sender {
            Some(tx) => {
                if tx.send(task).is_err() {
                    tracing::warn!(worker = id, "fiber worker terminated; dropping task");
                    self.registry.remove(&id);
                }
            }
            None => {
                tracing::warn!(worker = id, "fiber worker missing from registry; dropping task");
            }
        }
    }

    /// Returns a worker to the free list. Called by the worker itself once
    /// its task is finished and its scope is cleared.
    pub(crate) fn release(&self, worker_id: usize) {
        tracing::trace!(worker = worker_id, "fiber worker idle");
        self.idle.lock().push(worker_id);
    }

    /// Closes every job channel so workers exit once their current task is
    /// done. Idle workers exit immediately.
    pub(crate) fn shutdown(&self) {
        self.registry.clear();
        self.idle.lock().clear();
    }

    fn spawn_worker(&self) -> std::io::Result<usize> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel::<Task>();
        let runtime = self.runtime.clone();

        let mut builder =
            thread::Builder::new().name(format!("{}-worker-{id}", self.config.thread_name_prefix));
        if let Some(stack_size) = self.config.stack_size {
            builder = builder.stack_size(stack_size);
        }
        builder.spawn(move || worker_loop(id, rx, runtime))?;

        self.registry.insert(id, tx);
        self.spawned.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(worker = id, "spawned fiber worker");
        Ok(id)
    }
}

/// One worker's life: receive a task, take the lane, install the snapshot
/// as ambient state, run the body, clear the state, release the lane,
/// rejoin the free list, then perform the deferred settlement.
///
/// The worker holds only a weak runtime reference while idle, so dropping
/// the runtime closes the registry, which closes this channel, which ends
/// the loop (the Terminated state).
fn worker_loop(id: usize, mut rx: mpsc::UnboundedReceiver<Task>, runtime: Weak<RuntimeInner>) {
    while let Some(task) = rx.blocking_recv() {
        let Some(rt) = runtime.upgrade() else {
            break;
        };

        rt.lane().acquire();
        tracing::trace!(worker = id, "fiber worker running");
        let completion = {
            let _scope = ScopeGuard::enter(runtime.clone(), id, task.snapshot);
            (task.job)()
        };
        rt.lane().release();

        rt.pool().release(id);
        drop(rt);

        // Settle only after the worker is observably reusable.
        completion();
    }
    tracing::debug!(worker = id, "fiber worker terminated");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lane_admits_one_holder_at_a_time() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let lane = Arc::new(Lane::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lane = Arc::clone(&lane);
                let inside = Arc::clone(&inside);
                let overlap = Arc::clone(&overlap);
                thread::spawn(move || {
                    for _ in 0..50 {
                        lane.acquire();
                        if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                            overlap.fetch_add(1, Ordering::SeqCst);
                        }
                        inside.fetch_sub(1, Ordering::SeqCst);
                        lane.release();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(overlap.load(Ordering::SeqCst), 0);
    }
}
