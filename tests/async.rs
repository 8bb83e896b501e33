#[path = "util.rs"]
mod util;

use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use coalesce::{Registry, WaitErrorKind};

use self::util::{divide, init_logger, MathError, SETTLE};

#[tokio::test(flavor = "multi_thread")]
async fn followers_await_the_value() {
    init_logger();

    let registry = Arc::new(Registry::<&str, u32, ()>::new());
    let leader = registry.acquire("x").into_leader().expect("first acquire leads");

    let followers: Vec<_> = (0..4)
        .map(|_| {
            let call = registry.acquire("x").call();
            tokio::spawn(async move { call.wait_async().await })
        })
        .collect();

    tokio::time::sleep(SETTLE).await;
    leader.publish_value(42);

    for follower in followers {
        assert_eq!(follower.await.expect("task completes"), Ok(42));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn run_async_coalesces() {
    init_logger();

    let registry = Arc::new(Registry::<&str, i64, MathError>::new());
    let computed = Arc::new(AtomicUsize::new(0));
    let (release, gate) = tokio::sync::oneshot::channel::<()>();

    let leader = {
        let registry = Arc::clone(&registry);
        let computed = Arc::clone(&computed);
        tokio::spawn(async move {
            registry
                .run_async("div", async move {
                    computed.fetch_add(1, Ordering::SeqCst);
                    gate.await.expect("sender alive");
                    divide(1, 0)
                })
                .await
        })
    };

    // Wait until the leader is in flight before joining.
    while !registry.contains(&"div") {
        tokio::task::yield_now().await;
    }

    let followers: Vec<_> = (0..2)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let computed = Arc::clone(&computed);
            tokio::spawn(async move {
                registry
                    .run_async("div", async move {
                        computed.fetch_add(1, Ordering::SeqCst);
                        Ok(0)
                    })
                    .await
            })
        })
        .collect();

    while registry.waiters(&"div") != Some(3) {
        tokio::task::yield_now().await;
    }
    release.send(()).expect("receiver alive");

    let expected = WaitErrorKind::Failed(MathError::DivideByZero);
    let leader = leader.await.expect("task completes").unwrap_err();
    assert_eq!(leader.kind(), &expected);
    for follower in followers {
        let err = follower.await.expect("task completes").unwrap_err();
        assert_eq!(err.kind(), &expected);
    }

    assert_eq!(computed.load(Ordering::SeqCst), 1);
    assert!(registry.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn dropped_leader_future_abandons() {
    init_logger();

    let registry = Arc::new(Registry::<&str, u32, ()>::new());
    let leader = registry.acquire("x").into_leader().expect("first acquire leads");
    let follower = leader.call();

    let running = tokio::spawn(leader.run_async(std::future::pending()));
    tokio::time::sleep(SETTLE).await;
    running.abort();

    let err = (&follower).await.unwrap_err();
    assert!(err.is_abandoned());
    assert!(registry.is_empty());
}

#[test]
fn wait_future_is_woken_once_published() {
    init_logger();

    let woken = Arc::new(AtomicUsize::new(0));
    let waker = {
        let woken = Arc::clone(&woken);
        waker_fn::waker_fn(move || {
            woken.fetch_add(1, Ordering::SeqCst);
        })
    };
    let mut cx = Context::from_waker(&waker);

    let registry = Registry::<&str, u32, ()>::new();
    let leader = registry.acquire("x").into_leader().expect("first acquire leads");
    let follower = registry.acquire("x").call();

    let mut wait = pin!(follower.wait_async());
    assert!(wait.as_mut().poll(&mut cx).is_pending());
    // Polling again with the same waker must not park it twice.
    assert!(wait.as_mut().poll(&mut cx).is_pending());
    assert_eq!(woken.load(Ordering::SeqCst), 0);

    leader.publish_value(11);
    assert_eq!(woken.load(Ordering::SeqCst), 1);
    assert_eq!(wait.as_mut().poll(&mut cx), Poll::Ready(Ok(11)));
}

#[test]
fn cancel_wakes_pending_future() {
    init_logger();

    let woken = Arc::new(AtomicUsize::new(0));
    let waker = {
        let woken = Arc::clone(&woken);
        waker_fn::waker_fn(move || {
            woken.fetch_add(1, Ordering::SeqCst);
        })
    };
    let mut cx = Context::from_waker(&waker);

    let registry = Registry::<&str, u32, ()>::new();
    let _leader = registry.acquire("x");
    let follower = registry.acquire("x").call();

    let mut wait = pin!(follower.wait_async());
    assert!(wait.as_mut().poll(&mut cx).is_pending());

    follower.canceller().cancel();
    assert_eq!(woken.load(Ordering::SeqCst), 1);

    match wait.as_mut().poll(&mut cx) {
        Poll::Ready(Err(err)) => assert!(err.is_cancelled()),
        _ => panic!("a cancelled wait is ready with an error"),
    }
}

#[test]
fn dropped_wait_detaches() {
    init_logger();

    let waker = waker_fn::waker_fn(|| panic!("a dropped wait is never woken"));
    let mut cx = Context::from_waker(&waker);

    let registry = Registry::<&str, u32, ()>::new();
    let leader = registry.acquire("x").into_leader().expect("first acquire leads");
    let follower = registry.acquire("x").call();

    {
        let mut wait = pin!(follower.wait_async());
        assert!(wait.as_mut().poll(&mut cx).is_pending());
    }

    leader.publish_value(2);
    assert_eq!(follower.try_get(), Some(Ok(2)));
}
