mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use redis_mpx::{Callback, ConnectionError, Multiplexer, PromiseOutcome};

/// Counts invocations and discards the value.
fn counting_callback<T: Send + 'static>() -> (Arc<AtomicU32>, Callback<T>) {
    let count = Arc::new(AtomicU32::new(0));
    let counted = Arc::clone(&count);
    let cb = Callback::sync(move |_value: T| {
        counted.fetch_add(1, Ordering::SeqCst);
    });
    (count, cb)
}

fn counter_callback() -> (Arc<AtomicU32>, Callback<(Bytes, Bytes)>) {
    counting_callback::<(Bytes, Bytes)>()
}

fn last_payload_callback() -> (Arc<std::sync::Mutex<Option<Bytes>>>, Callback<(Bytes, Bytes)>) {
    let slot = Arc::new(std::sync::Mutex::new(None));
    let write = Arc::clone(&slot);
    let cb = Callback::sync(move |(_channel, payload): (Bytes, Bytes)| {
        *write.lock().unwrap() = Some(payload);
    });
    (slot, cb)
}

// S1: basic fan-out across two ChannelSubscriptions, then selective close.
#[tokio::test]
async fn basic_fan_out_and_selective_close() {
    common::setup_tracing();
    let prefix = common::test_prefix();
    let channel = format!("{prefix}x");
    let mux = Multiplexer::new(common::test_factory());

    let (count_a, on_message_a) = counter_callback();
    let sub_a = mux
        .new_channel_subscription(on_message_a, Callback::None, Callback::None)
        .await;
    let (count_b, on_message_b) = counter_callback();
    let sub_b = mux
        .new_channel_subscription(on_message_b, Callback::None, Callback::None)
        .await;

    sub_a.add(channel.clone());
    sub_b.add(channel.clone());

    // Give SUBSCRIBE acks time to land before publishing.
    tokio::time::sleep(Duration::from_millis(200)).await;

    common::publish(&channel, b"hi").await;

    let both_got_it = common::wait_until(
        || async { count_a.load(Ordering::SeqCst) == 1 && count_b.load(Ordering::SeqCst) == 1 },
        Duration::from_secs(2),
    )
    .await;
    assert!(both_got_it, "both subscriptions should receive the message");

    sub_a.close();
    tokio::time::sleep(Duration::from_millis(100)).await;

    common::publish(&channel, b"hi2").await;
    let only_b_got_it = common::wait_until(
        || async { count_b.load(Ordering::SeqCst) == 2 },
        Duration::from_secs(2),
    )
    .await;
    assert!(only_b_got_it);
    assert_eq!(count_a.load(Ordering::SeqCst), 1, "closed subscription must not receive further messages");

    sub_b.close();
    mux.close().await;
}

// S2: pattern subscription delivers only matching channels, with the real
// channel name (not the pattern) passed to on_message.
#[tokio::test]
async fn pattern_subscription_matches_glob() {
    common::setup_tracing();
    let prefix = common::test_prefix();
    let mux = Multiplexer::new(common::test_factory());

    let (last, on_message) = last_payload_callback();
    let pattern_sub = mux
        .new_pattern_subscription(format!("{prefix}a.*"), on_message, Callback::None, Callback::None)
        .await;

    tokio::time::sleep(Duration::from_millis(200)).await;

    common::publish(&format!("{prefix}a.1"), b"p").await;
    let matched = common::wait_until(
        || async { last.lock().unwrap().as_deref() == Some(&b"p"[..]) },
        Duration::from_secs(2),
    )
    .await;
    assert!(matched);

    common::publish(&format!("{prefix}b.1"), b"should-not-arrive").await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(last.lock().unwrap().as_deref(), Some(&b"p"[..]), "non-matching channel must not be delivered");

    pattern_sub.close();
    mux.close().await;
}

// S3 / S4: promise success and promise timeout.
#[tokio::test]
async fn promise_resolves_with_published_payload() {
    common::setup_tracing();
    let prefix = common::test_prefix();
    let mux = Multiplexer::new(common::test_factory());

    let promises = mux.new_promise_subscription(prefix.clone()).await;
    promises.wait_for_activation().await.expect("subscription must become active");

    let promise = promises.new_promise("world", Duration::from_secs(10)).await.expect("subscription is active");
    common::publish(&format!("{prefix}world"), b"42").await;

    let outcome = promise.await;
    assert_eq!(outcome, PromiseOutcome::Resolved(Bytes::from_static(b"42")));

    promises.close();
    mux.close().await;
}

#[tokio::test]
async fn promise_times_out_without_a_publish() {
    common::setup_tracing();
    let prefix = common::test_prefix();
    let mux = Multiplexer::new(common::test_factory());

    let promises = mux.new_promise_subscription(prefix.clone()).await;
    promises.wait_for_activation().await.expect("subscription must become active");

    let promise = promises.new_promise("nobody", Duration::from_millis(100)).await.expect("subscription is active");

    let started = std::time::Instant::now();
    let outcome = promise.await;
    assert_eq!(outcome, PromiseOutcome::TimedOut);
    assert!(started.elapsed() >= Duration::from_millis(90));

    promises.close();
    mux.close().await;
}

// Multiple waiters on an identical suffix all resolve on one broadcast.
#[tokio::test]
async fn promises_sharing_a_suffix_all_resolve_together() {
    common::setup_tracing();
    let prefix = common::test_prefix();
    let mux = Multiplexer::new(common::test_factory());

    let promises = mux.new_promise_subscription(prefix.clone()).await;
    promises.wait_for_activation().await.expect("subscription must become active");

    let p1 = promises.new_promise("shared", Duration::from_secs(5)).await.unwrap();
    let p2 = promises.new_promise("shared", Duration::from_secs(5)).await.unwrap();

    common::publish(&format!("{prefix}shared"), b"fan-out").await;

    let (o1, o2) = tokio::join!(p1, p2);
    assert_eq!(o1, PromiseOutcome::Resolved(Bytes::from_static(b"fan-out")));
    assert_eq!(o2, PromiseOutcome::Resolved(Bytes::from_static(b"fan-out")));

    promises.close();
    mux.close().await;
}

// Closing a PromiseSubscription cancels every pending promise.
#[tokio::test]
async fn closing_promise_subscription_cancels_pending_promises() {
    common::setup_tracing();
    let prefix = common::test_prefix();
    let mux = Multiplexer::new(common::test_factory());

    let promises = mux.new_promise_subscription(prefix.clone()).await;
    promises.wait_for_activation().await.expect("subscription must become active");

    let promise = promises.new_promise("never", Duration::from_secs(30)).await.unwrap();
    promises.close();

    let outcome = promise.await;
    assert_eq!(outcome, PromiseOutcome::Cancelled);

    mux.close().await;
}

// S6: reconnect with backoff re-declares previously held interest.
#[tokio::test]
async fn reconnect_resubscribes_held_channels() {
    common::setup_tracing();
    let prefix = common::test_prefix();
    let channel = format!("{prefix}x");
    let mux = Multiplexer::new(common::flaky_factory(3));

    let (count, on_message) = counter_callback();
    let sub = mux.new_channel_subscription(on_message, Callback::None, Callback::None).await;
    sub.add(channel.clone());

    // The flaky factory fails 3 times before succeeding; give the backoff
    // loop room to exhaust those attempts and land the real connection.
    tokio::time::sleep(Duration::from_secs(2)).await;

    common::publish(&channel, b"after-reconnect").await;
    let delivered = common::wait_until(|| async { count.load(Ordering::SeqCst) == 1 }, Duration::from_secs(3)).await;
    assert!(delivered, "subscription should be re-declared against the new connection");

    sub.close();
    mux.close().await;
}

// S5: a disconnect of an already-active PromiseSubscription cancels its
// pending promise; once the Listener reconnects and reactivates, new_promise
// succeeds again.
#[tokio::test]
async fn promise_cancelled_by_disconnect_then_succeeds_after_reactivation() {
    common::setup_tracing();
    let prefix = common::test_prefix();
    let mux = Multiplexer::new(common::test_factory());

    let promises = mux.new_promise_subscription(prefix.clone()).await;
    tokio::time::timeout(Duration::from_secs(5), promises.wait_for_activation())
        .await
        .expect("activation timed out")
        .expect("subscription must become active");

    let promise = promises.new_promise("w", Duration::from_secs(10)).await.expect("subscription is active");

    common::kill_pubsub_clients().await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), promise).await.expect("promise never settled");
    assert_eq!(outcome, PromiseOutcome::Cancelled);

    tokio::time::timeout(Duration::from_secs(10), promises.wait_for_activation())
        .await
        .expect("reactivation timed out")
        .expect("subscription must reactivate after reconnect");

    let promise = promises.new_promise("w", Duration::from_secs(10)).await.expect("subscription is active again");
    common::publish(&format!("{prefix}w"), b"again").await;
    let outcome = tokio::time::timeout(Duration::from_secs(5), promise).await.expect("promise never settled");
    assert_eq!(outcome, PromiseOutcome::Resolved(Bytes::from_static(b"again")));

    promises.close();
    mux.close().await;
}

// Testable property 3: adding the same channel twice to one
// ChannelSubscription produces exactly one activation callback.
#[tokio::test]
async fn duplicate_add_produces_exactly_one_activation() {
    common::setup_tracing();
    let prefix = common::test_prefix();
    let channel = format!("{prefix}x");
    let mux = Multiplexer::new(common::test_factory());

    let (activation_count, on_activation) = counting_callback::<Bytes>();
    let sub = mux.new_channel_subscription(Callback::None, Callback::None, on_activation).await;

    sub.add(channel.clone());
    sub.add(channel.clone());

    let activated_once =
        common::wait_until(|| async { activation_count.load(Ordering::SeqCst) >= 1 }, Duration::from_secs(2)).await;
    assert!(activated_once, "channel should become active");

    // Give a duplicate ack every chance to arrive before asserting the final count.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(activation_count.load(Ordering::SeqCst), 1, "adding an already-held channel must not re-activate");

    sub.close();
    mux.close().await;
}

// Testable property 4: a forced disconnect delivers exactly one
// on_disconnect, and reconnect re-declares the held channel with exactly
// one fresh on_activation.
#[tokio::test]
async fn forced_disconnect_delivers_exactly_one_disconnect_and_reactivation() {
    common::setup_tracing();
    let prefix = common::test_prefix();
    let channel = format!("{prefix}x");
    let mux = Multiplexer::new(common::test_factory());

    let (activation_count, on_activation) = counting_callback::<Bytes>();
    let (disconnect_count, on_disconnect) = counting_callback::<ConnectionError>();

    let sub = mux.new_channel_subscription(Callback::None, on_disconnect, on_activation).await;
    sub.add(channel.clone());

    let activated_once =
        common::wait_until(|| async { activation_count.load(Ordering::SeqCst) == 1 }, Duration::from_secs(2)).await;
    assert!(activated_once, "initial SUBSCRIBE ack should fire on_activation once");

    common::kill_pubsub_clients().await;

    let disconnected_once =
        common::wait_until(|| async { disconnect_count.load(Ordering::SeqCst) == 1 }, Duration::from_secs(2)).await;
    assert!(disconnected_once, "forced disconnect should fire on_disconnect exactly once");

    let reactivated =
        common::wait_until(|| async { activation_count.load(Ordering::SeqCst) == 2 }, Duration::from_secs(5)).await;
    assert!(reactivated, "reconnect should re-declare the channel and fire on_activation exactly once more");

    // Give any spurious extra callback every chance to arrive before the final assertion.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(disconnect_count.load(Ordering::SeqCst), 1, "exactly one on_disconnect for the whole episode");
    assert_eq!(activation_count.load(Ordering::SeqCst), 2, "exactly one activation per generation (initial + reconnect)");

    sub.close();
    mux.close().await;
}
