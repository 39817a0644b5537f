//! Synchronous-style programming over promises, on a pool of reusable
//! fibers.
//!
//! This crate bridges two worlds: promise-based asynchrony (settle-once
//! handles, reactions delivered on scheduler turns) and pausable execution
//! contexts ("fibers") that can suspend mid-function and resume later. Code
//! running on a fiber calls [`fiber::await_promise`] and simply *blocks* at
//! that line — without blocking any other fiber — until the promise
//! settles, getting the value back or having the rejection re-raised in
//! place as an [`Error`].
//!
//! # Overview
//!
//! A [`Runtime`] owns three cooperating pieces:
//!
//! - a **host scheduler**: one dedicated thread draining a FIFO turn queue;
//!   every promise reaction is delivered on a turn, never inline by the
//!   code that settles the promise;
//! - a **fiber pool**: reusable workers that execute task bodies; a worker
//!   returns to the free list after every task, success or failure, so
//!   steady-state churn allocates nothing;
//! - an **execution lane**: a one-at-a-time gate making fibers cooperative
//!   rather than parallel — many interleave, none run simultaneously, and
//!   an awaiting fiber yields the lane for the whole suspension.
//!
//! Each fiber carries typed local variables ([`context`]); dispatching work
//! or registering a promise handler captures a [`Snapshot`] of them, so
//! request-like state follows the logical caller across fibers. Snapshots
//! are shallow: top-level [`ContextRecord`]s are copied, nested ones stay
//! shared.
//!
//! # Quick start
//!
//! ```
//! use std::time::Duration;
//! use fiber_promise::{fiber, Error, Runtime};
//!
//! let rt = Runtime::new();
//! let (data, producer) = rt.deferred::<String>();
//!
//! // The task body suspends at await_promise and resumes with the value.
//! let report = rt.dispatch(move || {
//!     let payload = fiber::await_promise(&data)?;
//!     Ok::<_, Error>(format!("got: {payload}"))
//! });
//!
//! producer.fulfill("hello".to_string());
//! assert_eq!(
//!     report.block_until_settled(Duration::from_secs(5)),
//!     Some(Ok("got: hello".to_string())),
//! );
//! ```
//!
//! # Module Organization
//!
//! - [`runtime`] - The [`Runtime`] facade: builder, dispatch, asyncify,
//!   promise constructors, the all-settle combinator
//! - [`promise`] - [`Promise`] / [`Deferred`]: settle-once handles with
//!   unwrapped ([`Promise::subscribe`]) and wrapped ([`Promise::then`])
//!   reaction paths
//! - [`fiber`] - The await bridge ([`fiber::await_promise`],
//!   [`fiber::await_all`], [`fiber::await_value`]) and fiber introspection
//! - [`context`] - Fiber-local variables, [`ContextValue`],
//!   [`ContextRecord`], and [`Snapshot`] capture
//! - [`pool`] - Public pool surface ([`PoolMetrics`])
//! - [`error`] - [`Fault`] (rejection reasons) and [`Error`] (call-site
//!   failures)

pub mod context;
pub mod error;
pub mod fiber;
pub mod pool;
pub mod promise;
pub mod runtime;

mod scheduler;

// Re-exports for ergonomic access
pub use context::{ContextRecord, ContextValue, Snapshot};
pub use error::{Error, Fault, FaultKind};
pub use pool::PoolMetrics;
pub use promise::{Deferred, Outcome, Promise};
pub use runtime::{ReusePolicy, Runtime, RuntimeBuilder};
