//! Promise surface tests: the wrapped reaction path (then/catch chains),
//! settle-once behavior under chaining, and interop with async executors.

use std::time::Duration;

use fiber_promise::{Fault, FaultKind, Runtime};

const WAIT: Duration = Duration::from_secs(5);

// ─── Wrapped Reaction Path ──────────────────────────────────────────────────

mod wrapped_path {
    use super::*;

    #[test]
    fn then_transforms_fulfillments() {
        let rt = Runtime::new();
        let chained = rt
            .resolved(3)
            .then(|n| Ok::<_, Fault>(n * 10))
            .then(|n| Ok::<_, Fault>(n + 1));
        assert_eq!(chained.block_until_settled(WAIT), Some(Ok(31)));
    }

    #[test]
    fn rejections_pass_through_then_untouched() {
        let rt = Runtime::new();
        let chained = rt
            .rejected::<i32>(Fault::new("boom"))
            .then(|n| Ok::<_, Fault>(n * 10));
        assert_eq!(
            chained.block_until_settled(WAIT),
            Some(Err(Fault::new("boom"))),
        );
    }

    #[test]
    fn catch_recovers_and_fulfillments_pass_it_by() {
        let rt = Runtime::new();

        let recovered = rt
            .rejected::<i32>(Fault::new("boom"))
            .catch(|fault| Ok(fault.message().len() as i32));
        assert_eq!(recovered.block_until_settled(WAIT), Some(Ok(4)));

        let untouched = rt.resolved(5).catch(|_| Ok(0));
        assert_eq!(untouched.block_until_settled(WAIT), Some(Ok(5)));
    }

    #[test]
    fn a_failing_handler_rejects_the_next_promise() {
        let rt = Runtime::new();
        let chained = rt
            .resolved(1)
            .then(|_| Err::<String, _>(Fault::new("handler failed")))
            .catch(|fault| Ok::<_, Fault>(format!("saw: {fault}")));
        assert_eq!(
            chained.block_until_settled(WAIT),
            Some(Ok("saw: handler failed".to_string())),
        );
    }

    #[test]
    fn a_panicking_handler_becomes_a_panic_fault() {
        let rt = Runtime::new();
        let chained = rt
            .resolved(1)
            .then(|_| -> Result<i32, Fault> { panic!("handler bug") });
        let fault = chained.block_until_settled(WAIT).unwrap().unwrap_err();
        assert_eq!(fault.kind(), FaultKind::Panic);
        assert_eq!(fault.message(), "handler bug");
    }

    #[test]
    fn then_catch_runs_exactly_one_arm() {
        let rt = Runtime::new();

        let on_ok = rt.resolved(2).then_catch(
            |n| Ok::<_, Fault>(format!("value {n}")),
            |fault| Ok(format!("fault {fault}")),
        );
        assert_eq!(
            on_ok.block_until_settled(WAIT),
            Some(Ok("value 2".to_string())),
        );

        let on_err = rt.rejected::<i32>(Fault::new("nope")).then_catch(
            |n| Ok::<_, Fault>(format!("value {n}")),
            |fault| Ok(format!("fault {fault}")),
        );
        assert_eq!(
            on_err.block_until_settled(WAIT),
            Some(Ok("fault nope".to_string())),
        );
    }
}

// ─── Lifecycle ──────────────────────────────────────────────────────────────

mod lifecycle {
    use super::*;

    #[test]
    fn dropping_the_producer_cancels_downstream_chains() {
        let rt = Runtime::new();
        let (promise, deferred) = rt.deferred::<i32>();

        let recovered = promise.catch(|fault| {
            Ok::<_, Fault>(if fault.kind() == FaultKind::Canceled { -1 } else { -2 })
        });

        drop(deferred);
        assert_eq!(recovered.block_until_settled(WAIT), Some(Ok(-1)));
    }

    #[test]
    fn block_until_settled_times_out_on_pending() {
        let rt = Runtime::new();
        let (promise, _deferred) = rt.deferred::<i32>();
        assert_eq!(
            promise.block_until_settled(Duration::from_millis(50)),
            None,
        );
    }

    #[test]
    fn clones_share_the_settlement() {
        let rt = Runtime::new();
        let (promise, deferred) = rt.deferred::<i32>();
        let twin = promise.clone();

        deferred.fulfill(8);
        assert_eq!(promise.block_until_settled(WAIT), Some(Ok(8)));
        assert_eq!(twin.settled(), Some(Ok(8)));
    }

    #[test]
    fn promises_outlive_their_runtime_for_settlement() {
        let rt = Runtime::new();
        let (promise, deferred) = rt.deferred::<i32>();
        drop(rt);

        // The scheduler lives as long as promise handles do; plain
        // settlement and the unwrapped path still work.
        deferred.fulfill(5);
        assert_eq!(promise.block_until_settled(WAIT), Some(Ok(5)));
    }

    #[test]
    fn wrapped_handlers_need_a_live_runtime() {
        let rt = Runtime::new();
        let promise = rt.resolved(5);
        drop(rt);

        let chained = promise.then(|n| Ok::<_, Fault>(n + 1));
        let fault = chained.block_until_settled(WAIT).unwrap().unwrap_err();
        assert_eq!(fault.kind(), FaultKind::Configuration);
    }
}

// ─── Async Interop ──────────────────────────────────────────────────────────

mod async_interop {
    use super::*;

    #[test]
    fn a_promise_is_a_future() {
        let rt = Runtime::new();
        let (promise, deferred) = rt.deferred::<i32>();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            deferred.fulfill(13);
        });

        let outcome = futures::executor::block_on(promise);
        assert_eq!(outcome, Ok(13));
        let joined = handle.join();
        assert!(joined.is_ok());
    }

    #[test]
    fn a_settled_promise_resolves_immediately_as_a_future() {
        let rt = Runtime::new();
        let rejected = rt.rejected::<i32>(Fault::new("no"));
        assert_eq!(
            futures::executor::block_on(rejected),
            Err(Fault::new("no")),
        );
    }
}
