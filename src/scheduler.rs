//! The host scheduler: a single-lane turn queue.
//!
//! All promise reaction delivery runs here, one job per turn, in FIFO
//! order, on one dedicated thread driving a tokio current-thread runtime.
//! Nothing in this module knows about promises or fibers; it is the "run
//! this on a later turn" primitive the rest of the crate is built on.
//!
//! The queue lives as long as any [`SchedulerHandle`] does: promises hold a
//! handle, so settlement keeps working even after the owning
//! [`Runtime`](crate::runtime::Runtime) is dropped. Once every handle is
//! gone the thread drains what was already posted and exits.

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;

use tokio::sync::mpsc;

use crate::error::Fault;

/// A unit of work for a later scheduler turn.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Cheap, cloneable handle to the turn queue.
#[derive(Clone)]
pub(crate) struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Job>,
}

impl SchedulerHandle {
    /// Runs `job` on a later turn. FIFO with respect to other `post` calls.
    ///
    /// After shutdown the job is dropped; posting never blocks or fails
    /// loudly because settlement paths must stay infallible.
    pub(crate) fn post(&self, job: Job) {
        if self.tx.send(job).is_err() {
            tracing::trace!("scheduler is gone; dropping posted job");
        }
    }

    /// Runs `job` on the next turn.
    ///
    /// Same ordering semantics as [`post`](Self::post); kept separate
    /// because its one caller is the resumption-failure escalation path and
    /// the distinction matters when reading that code.
    pub(crate) fn next_tick(&self, job: Job) {
        self.post(job);
    }
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Starts the scheduler thread and returns a handle to its queue.
///
/// A panicking job is contained and logged; it must not take the turn
/// queue down with it, since unrelated promises still depend on delivery.
pub(crate) fn spawn(thread_name: String) -> io::Result<SchedulerHandle> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
    let runtime = tokio::runtime::Builder::new_current_thread().build()?;

    thread::Builder::new().name(thread_name).spawn(move || {
        runtime.block_on(async move {
            while let Some(job) = rx.recv().await {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
                    let fault = Fault::from_panic(payload);
                    tracing::error!(reason = %fault, "scheduler turn panicked");
                }
            }
        });
        tracing::debug!("scheduler drained and stopped");
    })?;

    Ok(SchedulerHandle { tx })
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc as std_mpsc;

    use super::*;

    #[test]
    fn turns_run_in_fifo_order() {
        let handle = spawn("test-scheduler".to_string()).unwrap();
        let (tx, rx) = std_mpsc::channel();

        for i in 0..16 {
            let tx = tx.clone();
            handle.post(Box::new(move || {
                tx.send(i).unwrap();
            }));
        }

        let seen: Vec<i32> = (0..16).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(seen, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn panicking_turn_does_not_stop_the_queue() {
        let handle = spawn("test-scheduler-panic".to_string()).unwrap();
        let (tx, rx) = std_mpsc::channel();

        handle.post(Box::new(|| panic!("reaction bug")));
        handle.post(Box::new(move || {
            tx.send("still alive").unwrap();
        }));

        assert_eq!(rx.recv().unwrap(), "still alive");
    }
}
