//! Event system for the token bank.
//!
//! Provides hooks for metrics, logging, and custom reactions around harvest
//! activity. The size notification carries the wire payload consumers expect:
//! `{"name":"captchabank-tokens","payload":{"api":N,"manual":M}}`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::metrics::{MetricsCollector, TokenFlow};
use super::queue::TokenOrigin;

/// Event name carried by size notifications.
pub const SIZE_EVENT_NAME: &str = "captchabank-tokens";

/// Current outstanding token counts, emitted whenever a counter changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SizeEvent {
    pub api: usize,
    pub manual: usize,
    #[serde(skip)]
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct SizeEnvelope<'a> {
    name: &'static str,
    payload: &'a SizeEvent,
}

impl SizeEvent {
    pub fn new(api: usize, manual: usize) -> Self {
        Self {
            api,
            manual,
            timestamp: Utc::now(),
        }
    }

    /// Named notification as published to listeners.
    pub fn payload(&self) -> serde_json::Value {
        serde_json::json!({
            "name": SIZE_EVENT_NAME,
            "payload": { "api": self.api, "manual": self.manual },
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&SizeEnvelope {
            name: SIZE_EVENT_NAME,
            payload: self,
        })
    }
}

/// Outcome of one provider solve attempt.
#[derive(Debug, Clone)]
pub struct SolveEvent {
    pub provider: String,
    pub success: bool,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TokenEvent {
    pub origin: TokenOrigin,
    pub flow: TokenFlow,
    pub count: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    HarvestStarted { workers: usize, max_outstanding: usize },
    Paused,
    Resumed,
    Stopped { cancelled: usize },
}

#[derive(Debug, Clone)]
pub enum BankEvent {
    Size(SizeEvent),
    Solve(SolveEvent),
    Token(TokenEvent),
    Lifecycle(LifecycleEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &BankEvent);
}

impl<F> EventHandler for F
where
    F: Fn(&BankEvent) + Send + Sync,
{
    fn handle(&self, event: &BankEvent) {
        self(event)
    }
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn dispatch(&self, event: BankEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &BankEvent) {
        match event {
            BankEvent::Size(size) => {
                log::debug!("{SIZE_EVENT_NAME}: api={} manual={}", size.api, size.manual);
            }
            BankEvent::Solve(solve) => {
                if solve.success {
                    log::info!(
                        "{} solved captcha in {:.2}s",
                        solve.provider,
                        solve.latency.as_secs_f64()
                    );
                } else {
                    log::warn!(
                        "{} failed to solve captcha after {:.2}s",
                        solve.provider,
                        solve.latency.as_secs_f64()
                    );
                }
            }
            BankEvent::Token(token) => {
                log::debug!("{} token {:?} x{}", token.origin, token.flow, token.count);
            }
            BankEvent::Lifecycle(LifecycleEvent::HarvestStarted {
                workers,
                max_outstanding,
            }) => {
                log::info!("harvest started: {workers} workers, up to {max_outstanding} tokens");
            }
            BankEvent::Lifecycle(LifecycleEvent::Paused) => log::info!("harvest paused"),
            BankEvent::Lifecycle(LifecycleEvent::Resumed) => log::info!("harvest resumed"),
            BankEvent::Lifecycle(LifecycleEvent::Stopped { cancelled }) => {
                log::info!("harvest stopped, cancelled {cancelled} pending requests");
            }
        }
    }
}

/// Metrics handler that feeds the metrics collector.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &BankEvent) {
        match event {
            BankEvent::Solve(solve) => {
                self.metrics
                    .record_solve(&solve.provider, solve.success, solve.latency);
            }
            BankEvent::Token(token) => {
                self.metrics.record_token(token.flow, token.count as u64);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler(std::sync::Mutex<usize>);

    impl EventHandler for CountingHandler {
        fn handle(&self, _event: &BankEvent) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn dispatches_to_handlers() {
        let mut dispatcher = EventDispatcher::new();
        let counter = Arc::new(CountingHandler(std::sync::Mutex::new(0)));
        dispatcher.register_handler(counter.clone());
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher.dispatch(BankEvent::Size(SizeEvent::new(1, 0)));
        dispatcher.dispatch(BankEvent::Lifecycle(LifecycleEvent::Paused));
        assert_eq!(*counter.0.lock().unwrap(), 2);
    }

    #[test]
    fn size_payload_matches_wire_format() {
        let event = SizeEvent::new(3, 1);
        assert_eq!(
            event.payload(),
            serde_json::json!({"name": "captchabank-tokens", "payload": {"api": 3, "manual": 1}})
        );
        assert_eq!(
            event.to_json().unwrap(),
            r#"{"name":"captchabank-tokens","payload":{"api":3,"manual":1}}"#
        );
    }

    #[test]
    fn metrics_handler_records_solves() {
        let metrics = MetricsCollector::new();
        let handler = MetricsHandler::new(metrics.clone());
        handler.handle(&BankEvent::Solve(SolveEvent {
            provider: "anticaptcha".into(),
            success: true,
            latency: Duration::from_secs(4),
            timestamp: Utc::now(),
        }));
        handler.handle(&BankEvent::Token(TokenEvent {
            origin: TokenOrigin::Api,
            flow: TokenFlow::Evicted,
            count: 2,
            timestamp: Utc::now(),
        }));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.global.solve_successes, 1);
        assert_eq!(snapshot.global.tokens_evicted, 2);
        assert_eq!(snapshot.providers[0].provider, "anticaptcha");
    }

    #[test]
    fn closures_are_handlers() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut dispatcher = EventDispatcher::new();
        dispatcher.register_handler(Arc::new(move |event: &BankEvent| {
            if let BankEvent::Size(size) = event {
                sink.lock().unwrap().push(size.api);
            }
        }));
        dispatcher.dispatch(BankEvent::Size(SizeEvent::new(4, 0)));
        assert_eq!(*seen.lock().unwrap(), vec![4]);
    }
}
