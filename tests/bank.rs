use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use captchabank_rs::{
    BankConfig, BankEvent, CaptchaProvider, CaptchaTask, LifecycleEvent, TokenBank, VERSION,
};
use tokio_util::sync::CancellationToken;

/// Hands out `tok-1`, `tok-2`, ... one per solve.
#[derive(Default)]
struct SequenceProvider {
    calls: AtomicUsize,
}

#[async_trait]
impl CaptchaProvider for SequenceProvider {
    fn name(&self) -> &'static str {
        "sequence"
    }

    async fn solve(&self, _task: &CaptchaTask, cancel: &CancellationToken) -> Option<String> {
        if cancel.is_cancelled() {
            return None;
        }
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Some(format!("tok-{n}"))
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn fast_config() -> BankConfig {
    BankConfig {
        harvest_interval: Duration::from_millis(25),
        sweep_interval: Duration::from_millis(25),
        empty_poll_backoff: Duration::from_millis(5),
        ..BankConfig::default()
    }
}

#[tokio::test]
async fn harvest_serves_tokens_in_order_until_stopped() {
    assert!(!VERSION.is_empty());

    let provider = Arc::new(SequenceProvider::default());
    let lifecycle = Arc::new(Mutex::new(Vec::new()));
    let sink = lifecycle.clone();

    let bank = TokenBank::builder()
        .with_config(fast_config())
        .with_provider(provider.clone())
        .with_event_handler(Arc::new(move |event: &BankEvent| {
            if let BankEvent::Lifecycle(change) = event {
                sink.lock().unwrap().push(*change);
            }
        }))
        .build();

    let harvester = bank.clone();
    let harvest = tokio::spawn(async move { harvester.harvest(2, 3).await });

    eventually(|| bank.snapshot().queued == 3).await;
    assert_eq!(bank.counters().api(), 3);

    bank.pause();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let calls_while_paused = provider.calls.load(Ordering::SeqCst);

    let first = bank.get_token().await.expect("a harvested token");
    assert!(first.starts_with("tok-"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(provider.calls.load(Ordering::SeqCst), calls_while_paused);
    assert_eq!(bank.counters().api(), 2);

    bank.create_token("manual-1");
    eventually(|| bank.snapshot().queued == 3).await;
    assert!(bank.get_token().await.is_some());
    assert!(bank.get_token().await.is_some());
    assert_eq!(bank.get_token().await.as_deref(), Some("manual-1"));
    assert!(bank.counters().is_empty());

    bank.resume();
    eventually(|| bank.counters().api() > 0).await;

    bank.stop();
    bank.stop();
    tokio::time::timeout(Duration::from_secs(1), harvest)
        .await
        .expect("harvest returns after stop")
        .unwrap()
        .unwrap();
    assert!(bank.is_stopped());

    eventually(|| {
        lifecycle
            .lock()
            .unwrap()
            .iter()
            .any(|change| matches!(change, LifecycleEvent::Stopped { .. }))
    })
    .await;
    let stops = lifecycle
        .lock()
        .unwrap()
        .iter()
        .filter(|change| matches!(change, LifecycleEvent::Stopped { .. }))
        .count();
    assert_eq!(stops, 1);
}

#[tokio::test]
async fn metrics_track_provider_solves() {
    let bank = TokenBank::builder()
        .with_provider(Arc::new(SequenceProvider::default()))
        .build();

    let token = bank.get_token_with_api(&CancellationToken::new()).await;
    assert_eq!(token.as_deref(), Some("tok-1"));

    let metrics = bank.metrics().expect("metrics enabled by default").clone();
    eventually(|| metrics.snapshot().global.solve_attempts == 1).await;
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.providers[0].provider, "sequence");
    assert_eq!(snapshot.providers[0].successes, 1);
}
