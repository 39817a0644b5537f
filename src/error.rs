//! Error types for the fiber/promise bridge.
//!
//! Two layers, matching the two ways things fail here:
//!
//! - [`Fault`] is the promise *rejection reason* — the value a rejected
//!   promise settles with and the value re-raised at an `await` call site.
//!   It is cheap to clone (`Arc`-backed) because settlement fans a reason
//!   out to every registered reaction.
//! - [`Error`] is the crate's call-site error enum: fail-fast misuse
//!   (awaiting outside a fiber, runtime gone) plus the re-raised rejection.
//!
//! A callback failure during task execution is *not* an [`Error`]: it
//! becomes an ordinary promise rejection carrying a [`Fault`], fully
//! recoverable by whoever holds the promise.

use std::fmt;
use std::sync::Arc;

/// Classifies where a [`Fault`] came from.
///
/// The classifier travels with the reason so callers can distinguish an
/// application-level rejection from infrastructure conditions without
/// parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum FaultKind {
    /// An explicit rejection (`Deferred::reject` or a handler returning one).
    Rejection,
    /// A task callback returned an error while executing on a fiber.
    Task,
    /// A task callback panicked while executing on a fiber.
    Panic,
    /// The producer half ([`Deferred`](crate::promise::Deferred)) was dropped
    /// before settling, or the task was discarded before it could run.
    Canceled,
    /// A parked fiber could not be resumed (a caller logic defect, not a
    /// data condition); surfaced through the runtime's unhandled-fault hook.
    Resumption,
    /// The fiber runtime was absent or already shut down.
    Configuration,
}

#[derive(Debug)]
struct FaultInner {
    kind: FaultKind,
    message: String,
}

/// The reason a promise rejects.
///
/// `Fault` is the failure value of this crate's promises: a rejected
/// [`Promise`](crate::promise::Promise) settles with one, and
/// [`fiber::await_promise`](crate::fiber::await_promise) re-raises it at the
/// suspension point as [`Error::Rejected`]. Cloning is an `Arc` bump.
///
/// Equality compares kind and message, which keeps assertions direct:
///
/// ```
/// use fiber_promise::Fault;
///
/// let fault = Fault::new("boom");
/// assert_eq!(fault, Fault::from("boom"));
/// assert_eq!(fault.message(), "boom");
/// ```
#[derive(Clone)]
pub struct Fault {
    inner: Arc<FaultInner>,
}

impl Fault {
    fn with_kind(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(FaultInner {
                kind,
                message: message.into(),
            }),
        }
    }

    /// Creates an explicit rejection reason.
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_kind(FaultKind::Rejection, message)
    }

    /// Wraps an error returned by a task callback.
    pub fn task(source: &dyn std::error::Error) -> Self {
        Self::with_kind(FaultKind::Task, source.to_string())
    }

    /// Wraps a panic payload caught while a task callback was executing.
    ///
    /// String payloads (the overwhelmingly common case) are preserved;
    /// anything else collapses to a fixed message.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "task panicked".to_string()
        };
        Self::with_kind(FaultKind::Panic, message)
    }

    pub(crate) fn canceled(message: impl Into<String>) -> Self {
        Self::with_kind(FaultKind::Canceled, message)
    }

    pub(crate) fn resumption(message: impl Into<String>) -> Self {
        Self::with_kind(FaultKind::Resumption, message)
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::with_kind(FaultKind::Configuration, message)
    }

    /// Returns what produced this fault.
    pub fn kind(&self) -> FaultKind {
        self.inner.kind
    }

    /// Returns the human-readable reason.
    pub fn message(&self) -> &str {
        &self.inner.message
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fault")
            .field("kind", &self.inner.kind)
            .field("message", &self.inner.message)
            .finish()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.message)
    }
}

impl std::error::Error for Fault {}

impl PartialEq for Fault {
    fn eq(&self, other: &Self) -> bool {
        self.inner.kind == other.inner.kind && self.inner.message == other.inner.message
    }
}

impl Eq for Fault {}

impl From<&str> for Fault {
    fn from(message: &str) -> Self {
        Fault::new(message)
    }
}

impl From<String> for Fault {
    fn from(message: String) -> Self {
        Fault::new(message)
    }
}

impl From<Error> for Fault {
    fn from(error: Error) -> Self {
        match error {
            Error::Rejected(fault) => fault,
            Error::Configuration => Fault::configuration(error_text::CONFIGURATION),
            Error::Context => Self::with_kind(FaultKind::Task, error_text::CONTEXT),
            Error::Startup(err) => Self::with_kind(FaultKind::Configuration, err.to_string()),
        }
    }
}

pub(crate) mod error_text {
    pub(crate) const CONFIGURATION: &str =
        "fiber runtime is unavailable: it was dropped or never installed";
    pub(crate) const CONTEXT: &str = "cannot await outside an active fiber";
}

/// Errors raised synchronously at the crate's call sites.
///
/// [`Error::Configuration`] and [`Error::Context`] are fail-fast misuse
/// errors: they are returned immediately by the await bridge, never routed
/// through a promise. [`Error::Rejected`] is the rejection reason of an
/// awaited promise, re-raised at the suspension point.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The fiber runtime is absent or already shut down.
    #[error("{}", error_text::CONFIGURATION)]
    Configuration,

    /// `await` was called outside any active fiber.
    #[error("{}", error_text::CONTEXT)]
    Context,

    /// The awaited promise rejected; the reason is re-raised here.
    #[error("promise rejected: {0}")]
    Rejected(Fault),

    /// The runtime could not start its scheduler or a worker thread.
    #[error("failed to start fiber runtime: {0}")]
    Startup(#[from] std::io::Error),
}

impl From<Fault> for Error {
    fn from(fault: Fault) -> Self {
        Error::Rejected(fault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_display_is_the_message() {
        let fault = Fault::new("boom");
        assert_eq!(fault.to_string(), "boom");
        assert_eq!(fault.kind(), FaultKind::Rejection);
    }

    #[test]
    fn fault_equality_covers_kind_and_message() {
        assert_eq!(Fault::new("x"), Fault::from("x".to_string()));
        assert_ne!(Fault::new("x"), Fault::canceled("x"));
        assert_ne!(Fault::new("x"), Fault::new("y"));
    }

    #[test]
    fn panic_payloads_keep_string_messages() {
        let fault = Fault::from_panic(Box::new("went sideways"));
        assert_eq!(fault.kind(), FaultKind::Panic);
        assert_eq!(fault.message(), "went sideways");

        let fault = Fault::from_panic(Box::new(42_u32));
        assert_eq!(fault.message(), "task panicked");
    }

    #[test]
    fn error_round_trips_to_fault() {
        let fault = Fault::new("boom");
        let err = Error::from(fault.clone());
        assert!(matches!(err, Error::Rejected(ref f) if *f == fault));
        assert_eq!(Fault::from(err), fault);

        let fault = Fault::from(Error::Context);
        assert_eq!(fault.kind(), FaultKind::Task);
    }

    #[test]
    fn misuse_errors_render_fixed_messages() {
        assert_eq!(
            Error::Context.to_string(),
            "cannot await outside an active fiber"
        );
        assert!(Error::Configuration.to_string().contains("unavailable"));
    }
}
