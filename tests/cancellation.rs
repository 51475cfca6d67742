//! Cooperative cancellation: `terminate_coroutine` must drive the target to
//! `Done` within finite turns.

use std::time::Duration;

use asyncoro::net::TcpListener;

/// `try_init` rather than `init`: multiple tests in this binary would
/// otherwise panic on the second call.
fn init_logging() {
    let _ = env_logger::try_init();
}

#[test]
fn terminate_unblocks_a_coroutine_parked_in_accept() {
    init_logging();
    let listener = TcpListener::bind(&"127.0.0.1:0".parse().unwrap()).expect("bind failed");

    // Never connects to this listener: `accept()` would otherwise suspend
    // forever.
    let handle = asyncoro::spawn(move || {
        let _ = listener.accept();
        "should never get here"
    });

    // Give the coroutine a turn to actually reach the suspended accept
    // before terminating it.
    asyncoro::spawn(|| asyncoro::sleep(Duration::from_millis(20))).value();

    handle.terminate();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handle.value()));
    assert!(result.is_err(), "terminated coroutine must not produce a normal value");
}

#[test]
fn lock_and_condition_state_do_not_outlive_a_terminated_owner() {
    init_logging();
    use asyncoro::Lock;
    use std::sync::Arc;

    let lock = Arc::new(Lock::new());
    let lock2 = lock.clone();

    let handle = asyncoro::spawn(move || {
        lock2.acquire();
        asyncoro::sleep(Duration::from_secs(3600)).ok(); // parked "forever"
    });

    asyncoro::spawn(|| asyncoro::sleep(Duration::from_millis(20))).value();
    assert!(lock.is_locked());

    handle.terminate();
    let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handle.value()));

    // `Lock` makes no promise to auto-release on cancellation: resources are
    // not implicitly reclaimed when their owner disappears. This documents
    // that contract rather than asserting a false guarantee.
    assert!(lock.is_locked());
}
