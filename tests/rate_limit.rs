mod common;

use bucketgate::{
    ContentionRetry, Decision, FailurePolicy, InMemoryStore, LimiterError, ManualClock,
    MemorySink, RateLimiter, TrackingSleeper,
};
use common::{config, init_tracing, CasOnlyStore, Rival};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

fn memory_limiter(clock: &ManualClock, capacity: u64, rate: f64) -> RateLimiter<InMemoryStore> {
    let store = InMemoryStore::new(clock.clone());
    let config = config(capacity, rate, FailurePolicy::FailOpen);
    RateLimiter::new(store, config).with_clock(clock.clone())
}

#[tokio::test]
async fn one_token_per_second_walkthrough() {
    let clock = ManualClock::new(0);
    let limiter = memory_limiter(&clock, 1, 1.0);

    assert!(limiter.try_consume("c1").await.unwrap().is_allowed());
    assert!(!limiter.try_consume("c1").await.unwrap().is_allowed());

    clock.set(500);
    assert!(!limiter.try_consume("c1").await.unwrap().is_allowed());

    clock.set(1_000);
    assert!(limiter.try_consume("c1").await.unwrap().is_allowed());
    assert_eq!(limiter.available_tokens("c1").await.unwrap(), 0);
}

#[tokio::test]
async fn late_call_keeps_progress_past_the_refilled_token() {
    let clock = ManualClock::new(0);
    let limiter = memory_limiter(&clock, 1, 1.0);
    assert!(limiter.try_consume("c1").await.unwrap().is_allowed());

    // 1.5 tokens earned, capacity 1: half a token of progress carries over.
    clock.set(1_500);
    assert!(limiter.try_consume("c1").await.unwrap().is_allowed());
    clock.set(1_999);
    assert!(!limiter.try_consume("c1").await.unwrap().is_allowed());
    clock.set(2_000);
    assert!(limiter.try_consume("c1").await.unwrap().is_allowed());
}

#[tokio::test]
async fn clients_have_independent_buckets() {
    let clock = ManualClock::new(0);
    let limiter = memory_limiter(&clock, 1, 1.0);

    assert!(limiter.try_consume("a").await.unwrap().is_allowed());
    assert!(limiter.try_consume("b").await.unwrap().is_allowed());
    assert!(!limiter.try_consume("a").await.unwrap().is_allowed());
}

#[tokio::test]
async fn available_tokens_grow_monotonically_until_capacity() {
    let clock = ManualClock::new(0);
    let limiter = memory_limiter(&clock, 5, 3.0);
    for _ in 0..5 {
        limiter.try_consume("m").await.unwrap();
    }

    let mut previous = 0;
    for step in 0..40 {
        clock.set(step * 70);
        let tokens = limiter.available_tokens("m").await.unwrap();
        assert!(tokens >= previous, "dropped at step {step}");
        assert!(tokens <= 5);
        previous = tokens;
    }
    assert_eq!(previous, 5);
}

#[tokio::test]
async fn long_idle_period_caps_at_capacity() {
    let clock = ManualClock::new(0);
    let limiter = memory_limiter(&clock, 4, 1_000.0);
    limiter.try_consume("idle").await.unwrap();
    clock.set(u64::MAX / 4);
    assert_eq!(limiter.available_tokens("idle").await.unwrap(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_never_double_spend() {
    let clock = ManualClock::new(0);
    let limiter = Arc::new(memory_limiter(&clock, 7, 1.0));

    let handles = (0..50).map(|_| {
        let limiter = limiter.clone();
        tokio::spawn(async move { limiter.try_consume("shared").await })
    });
    let admitted = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .filter(Decision::is_allowed)
        .count();
    assert_eq!(admitted, 7);
    assert_eq!(limiter.available_tokens("shared").await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn compare_and_swap_backend_never_double_spends() {
    init_tracing();
    let clock = ManualClock::new(0);
    let retry = ContentionRetry::new(1_000)
        .unwrap()
        .with_delays(Duration::from_micros(10), Duration::from_micros(200));
    let store = CasOnlyStore::new(clock.clone(), retry);
    let sink = MemorySink::new();
    let limiter = Arc::new(
        RateLimiter::new(store, config(5, 1.0, FailurePolicy::FailClosed))
            .with_clock(clock)
            .with_sink(sink.clone()),
    );

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.try_consume("cas").await })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            Decision::Allowed { .. } => admitted += 1,
            Decision::Denied { .. } => {}
        }
    }
    assert_eq!(admitted, 5);
    assert_eq!(sink.of_kind("admitted").len(), 5);
    assert_eq!(sink.of_kind("rejected").len(), 15);
}

#[tokio::test]
async fn replay_after_lost_swap_reads_the_clock_again() {
    init_tracing();
    let clock = ManualClock::new(1_000);
    let retry = ContentionRetry::new(3)
        .unwrap()
        .without_jitter()
        .with_sleeper(TrackingSleeper::new());
    let rival = Rival {
        tokens: 2,
        ahead_ms: 50,
    };
    let store = CasOnlyStore::new(clock.clone(), retry).with_rival(rival);
    let sink = MemorySink::new();
    let limiter = RateLimiter::new(store, config(5, 1.0, FailurePolicy::FailClosed))
        .with_clock(clock)
        .with_sink(sink.clone());

    let decision = limiter.try_consume("c").await.unwrap();

    assert_eq!(decision, Decision::Allowed { remaining: 1 });
    assert_eq!(limiter.store().conflicts(), 1);
    assert!(sink.of_kind("clock_regression").is_empty());
    let key = limiter.key("c");
    let last_refill = limiter.store().inner().get_raw(key.last_refill_key());
    assert_eq!(last_refill.as_deref(), Some("1050"));
}

#[tokio::test]
async fn contention_budget_exhaustion_is_an_error() {
    let clock = ManualClock::new(0);
    let retry = ContentionRetry::new(1).unwrap();
    let store = CasOnlyStore::new(clock.clone(), retry);
    let config = config(5, 1.0, FailurePolicy::FailOpen);
    let limiter = RateLimiter::new(store, config).with_clock(clock);

    // A writer that touches the bucket whenever the swap yields.
    let key = limiter.key("hot");
    limiter.store().inner().put_raw(key.tokens_key(), "3");
    limiter.store().inner().put_raw(key.last_refill_key(), "0");
    let racer = {
        let inner = limiter.store().inner().clone();
        let key = key.clone();
        tokio::spawn(async move {
            for n in 0..1_000u64 {
                inner.put_raw(key.last_refill_key(), &n.to_string());
                tokio::task::yield_now().await;
            }
        })
    };

    let mut saw_contention = false;
    for _ in 0..200 {
        match limiter.try_consume("hot").await {
            Err(LimiterError::Contention { attempts }) => {
                assert_eq!(attempts, 1);
                saw_contention = true;
                break;
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => {}
        }
    }
    racer.abort();
    assert!(saw_contention);
}
