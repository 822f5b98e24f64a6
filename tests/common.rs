#![allow(dead_code)]

use std::sync::OnceLock;
use std::time::Duration;

use redis_mpx::{Config, ConnectionFactory};
use uuid::Uuid;

static INIT: OnceLock<()> = OnceLock::new();

pub fn setup_tracing() {
    INIT.get_or_init(|| {
        let filter =
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into());
        tracing_subscriber::fmt().with_env_filter(filter).try_init().ok();
    });
}

pub fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string())
}

pub fn test_factory() -> ConnectionFactory {
    Config::new(redis_url()).connection_factory().expect("REDIS_URL must be a valid connection string")
}

/// A fresh, per-test channel/pattern prefix so concurrently run tests never
/// observe each other's traffic on the same Redis server.
pub fn test_prefix() -> String {
    format!("mpx-test:{}:", Uuid::new_v4())
}

/// A [`ConnectionFactory`] that returns a client pointed at an address with
/// no listener for the first `fail_first_n` calls, then the real server —
/// there is no way to tell a live Redis to refuse a connection on demand, so
/// this is how reconnect-with-backoff (S6) is exercised without one.
pub fn flaky_factory(fail_first_n: usize) -> ConnectionFactory {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    let attempts = Arc::new(AtomicUsize::new(0));
    let real_url = redis_url();
    std::sync::Arc::new(move || {
        let n = attempts.fetch_add(1, Ordering::SeqCst);
        let url = if n < fail_first_n { "redis://127.0.0.1:1/".to_string() } else { real_url.clone() };
        redis::Client::open(url).expect("valid redis url")
    })
}

/// Forcibly drops every client currently subscribed to a Redis Pub/Sub
/// channel or pattern — there is no API to ask a live server to fail one
/// connection on demand, so this is how an already-established, already-active
/// subscription's disconnect path gets exercised.
pub async fn kill_pubsub_clients() {
    let client = redis::Client::open(redis_url()).expect("valid REDIS_URL");
    let mut conn = client.get_multiplexed_async_connection().await.expect("Redis must be running");
    let _: redis::RedisResult<redis::Value> =
        redis::cmd("CLIENT").arg("KILL").arg("TYPE").arg("pubsub").query_async(&mut conn).await;
}

pub async fn publish(channel: &str, payload: &[u8]) {
    let client = redis::Client::open(redis_url()).expect("valid REDIS_URL");
    let mut conn = client.get_multiplexed_async_connection().await.expect("Redis must be running");
    let _: () = redis::cmd("PUBLISH")
        .arg(channel)
        .arg(payload)
        .query_async(&mut conn)
        .await
        .expect("PUBLISH failed");
}

pub async fn wait_until<F, Fut>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
