//! High level token bank orchestration.
//!
//! Wires together the provider adapters, the token queue, and the event
//! dispatcher to keep a pool of fresh solved captchas ready for the challenge
//! flow. A bank is a cheap cloneable handle; all clones drive the same
//! harvest.
//!
//! Background tasks started by [`TokenBank::harvest`]:
//! - the dispatcher tick, which launches harvesting workers unless paused;
//! - the consumer loop, sole writer of the queue, which drains the api and
//!   manual inlets and runs the periodic sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::seq::SliceRandom;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::challenges::core::HttpTransport;
use crate::config::{BankConfig, Settings};
use crate::external_deps::captcha::{CaptchaProvider, CaptchaTask, providers_from_settings};
use crate::modules::events::{
    BankEvent, EventDispatcher, EventHandler, LifecycleEvent, LoggingHandler, MetricsHandler,
    SizeEvent, SolveEvent, TokenEvent,
};
use crate::modules::metrics::{MetricsCollector, TokenFlow};
use crate::modules::queue::{Token, TokenCounters, TokenOrigin, TokenQueue};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Result alias used across the orchestration layer.
pub type BankResult<T> = Result<T, BankError>;

/// Lifecycle misuse surfaced by [`TokenBank::harvest`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BankError {
    #[error("token bank is already harvesting")]
    AlreadyHarvesting,
    #[error("token bank has been stopped")]
    Stopped,
}

/// Point-in-time view of the bank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BankSnapshot {
    pub api: usize,
    pub manual: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub providers: usize,
    pub max_outstanding: usize,
    pub paused: bool,
    pub harvesting: bool,
    pub stopped: bool,
}

/// Fluent builder for [`TokenBank`].
pub struct TokenBankBuilder {
    config: BankConfig,
    task: CaptchaTask,
    providers: Vec<Arc<dyn CaptchaProvider>>,
    handlers: Vec<Arc<dyn EventHandler>>,
    max_outstanding: usize,
    enable_metrics: bool,
}

impl TokenBankBuilder {
    pub fn new() -> Self {
        Self {
            config: BankConfig::default(),
            task: CaptchaTask::datadome(),
            providers: Vec::new(),
            handlers: Vec::new(),
            max_outstanding: 5,
            enable_metrics: true,
        }
    }

    pub fn with_config(mut self, config: BankConfig) -> Self {
        self.config = config;
        self
    }

    /// Timing, sizing and providers as described by `settings`.
    pub fn with_settings(mut self, settings: &Settings, transport: Arc<dyn HttpTransport>) -> Self {
        self.config = settings.bank_config();
        self.max_outstanding = settings.harvest.max_outstanding;
        self.providers = providers_from_settings(
            &settings.captcha,
            settings.harvest_proxy_group(),
            transport,
        );
        self
    }

    pub fn with_task(mut self, task: CaptchaTask) -> Self {
        self.task = task;
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn CaptchaProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Capacity used by direct [`TokenBank::create_token_with_api`] calls
    /// until `harvest` sets its own.
    pub fn with_max_outstanding(mut self, max: usize) -> Self {
        self.max_outstanding = max;
        self
    }

    pub fn disable_metrics(mut self) -> Self {
        self.enable_metrics = false;
        self
    }

    pub fn build(self) -> TokenBank {
        let metrics = self.enable_metrics.then(MetricsCollector::new);

        let mut events = EventDispatcher::new();
        events.register_handler(Arc::new(LoggingHandler));
        if let Some(ref collector) = metrics {
            events.register_handler(Arc::new(MetricsHandler::new(collector.clone())));
        }
        for handler in self.handlers {
            events.register_handler(handler);
        }

        let (api_tx, api_rx) = mpsc::unbounded_channel();
        let (manual_tx, manual_rx) = mpsc::unbounded_channel();
        let (paused, _) = watch::channel(false);

        TokenBank {
            inner: Arc::new(BankInner {
                config: self.config,
                task: self.task,
                queue: TokenQueue::new(),
                counters: TokenCounters::default(),
                max_outstanding: AtomicUsize::new(self.max_outstanding),
                providers: RwLock::new(self.providers),
                cancellations: Mutex::new(HashMap::new()),
                next_request: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                shutdown: CancellationToken::new(),
                stopped: AtomicBool::new(false),
                harvesting: AtomicBool::new(false),
                paused,
                api_tx,
                manual_tx,
                inlets: Mutex::new(Some(Inlets {
                    api: api_rx,
                    manual: manual_rx,
                })),
                events: Arc::new(events),
                metrics,
            }),
        }
    }
}

impl Default for TokenBankBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct Inlets {
    api: mpsc::UnboundedReceiver<Token>,
    manual: mpsc::UnboundedReceiver<Token>,
}

/// State shared by every handle and background task.
struct BankInner {
    config: BankConfig,
    task: CaptchaTask,
    queue: TokenQueue,
    counters: TokenCounters,
    max_outstanding: AtomicUsize,
    providers: RwLock<Vec<Arc<dyn CaptchaProvider>>>,
    cancellations: Mutex<HashMap<u64, CancellationToken>>,
    next_request: AtomicU64,
    in_flight: AtomicUsize,
    shutdown: CancellationToken,
    stopped: AtomicBool,
    harvesting: AtomicBool,
    paused: watch::Sender<bool>,
    api_tx: mpsc::UnboundedSender<Token>,
    manual_tx: mpsc::UnboundedSender<Token>,
    inlets: Mutex<Option<Inlets>>,
    events: Arc<EventDispatcher>,
    metrics: Option<MetricsCollector>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Deregisters a harvesting request when it finishes, however it finishes.
struct RequestGuard<'a> {
    inner: &'a BankInner,
    id: u64,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        lock(&self.inner.cancellations).remove(&self.id);
        self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Pool of pre-solved captcha tokens refilled in the background.
#[derive(Clone)]
pub struct TokenBank {
    inner: Arc<BankInner>,
}

impl TokenBank {
    /// Construct a bank with default timing and no providers.
    pub fn new() -> Self {
        TokenBankBuilder::new().build()
    }

    /// Obtain a builder to customise the bank instance.
    pub fn builder() -> TokenBankBuilder {
        TokenBankBuilder::new()
    }

    pub fn config(&self) -> &BankConfig {
        &self.inner.config
    }

    pub fn task(&self) -> &CaptchaTask {
        &self.inner.task
    }

    pub fn counters(&self) -> &TokenCounters {
        &self.inner.counters
    }

    pub fn metrics(&self) -> Option<&MetricsCollector> {
        self.inner.metrics.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.inner.harvesting.load(Ordering::Acquire) && !self.is_stopped()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.paused.borrow()
    }

    pub fn snapshot(&self) -> BankSnapshot {
        BankSnapshot {
            api: self.inner.counters.api(),
            manual: self.inner.counters.manual(),
            queued: self.inner.queue.len(),
            in_flight: self.inner.in_flight.load(Ordering::Acquire),
            providers: self.provider_count(),
            max_outstanding: self.inner.max_outstanding.load(Ordering::Acquire),
            paused: self.is_paused(),
            harvesting: self.inner.harvesting.load(Ordering::Acquire),
            stopped: self.is_stopped(),
        }
    }

    /// Run the background refill until [`stop`](Self::stop) is called.
    ///
    /// Every harvest tick launches `workers` independent attempts unless the
    /// bank is paused. A bank harvests at most once in its lifetime.
    pub async fn harvest(&self, workers: usize, max_outstanding: usize) -> BankResult<()> {
        if self.is_stopped() {
            return Err(BankError::Stopped);
        }
        if self.inner.harvesting.swap(true, Ordering::AcqRel) {
            return Err(BankError::AlreadyHarvesting);
        }
        let inlets = lock(&self.inner.inlets)
            .take()
            .ok_or(BankError::AlreadyHarvesting)?;
        self.inner
            .max_outstanding
            .store(max_outstanding, Ordering::Release);

        let consumer = tokio::spawn(self.clone().process_tokens(inlets));
        self.publish(BankEvent::Lifecycle(LifecycleEvent::HarvestStarted {
            workers,
            max_outstanding,
        }));

        let shutdown = self.inner.shutdown.clone();
        let mut paused = self.inner.paused.subscribe();
        let period = self.inner.config.harvest_interval.max(MIN_INTERVAL);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let is_paused = *paused.borrow_and_update();
            if is_paused {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = paused.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = paused.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => self.dispatch_workers(workers),
            }
        }

        if let Err(err) = consumer.await {
            log::warn!("token consumer loop ended abnormally: {err}");
        }
        Ok(())
    }

    fn dispatch_workers(&self, workers: usize) {
        log::debug!("dispatching {workers} harvesting workers");
        for _ in 0..workers {
            let bank = self.clone();
            tokio::spawn(async move {
                bank.create_token_with_api().await;
            });
        }
    }

    /// One harvesting attempt. Returns whether a token was accepted.
    ///
    /// Skipped when the api counter is at capacity or no provider is
    /// registered. The solve runs under a cancellation handle recorded
    /// until the attempt ends, so [`stop`](Self::stop) can abort it.
    pub async fn create_token_with_api(&self) -> bool {
        let max = self.inner.max_outstanding.load(Ordering::Acquire);
        if self.inner.counters.api() >= max || self.is_stopped() {
            return false;
        }
        let Some(provider) = self.pick_provider() else {
            log::debug!("no captcha providers registered, skipping harvest");
            return false;
        };

        let (guard, cancel) = self.register_request();
        let started = Instant::now();
        let value = provider.solve(&self.inner.task, &cancel).await;
        drop(guard);
        self.record_solve(provider.name(), value.is_some(), started);

        let Some(value) = value else {
            return false;
        };
        if !self.inner.counters.try_reserve_api(max) {
            log::debug!("{}: discarding token, bank is full", provider.name());
            return false;
        }
        self.notify_size();

        if self.inner.api_tx.send(Token::new(value, TokenOrigin::Api)).is_err() {
            self.inner.counters.decrement(TokenOrigin::Api);
            self.notify_size();
            return false;
        }
        true
    }

    /// Inject a token obtained outside the provider layer.
    pub fn create_token(&self, value: impl Into<String>) {
        self.inner.counters.increment(TokenOrigin::Manual);
        self.notify_size();
        let token = Token::new(value, TokenOrigin::Manual);
        if self.inner.manual_tx.send(token).is_err() {
            log::warn!("token bank stopped, dropping manual token");
            self.inner.counters.decrement(TokenOrigin::Manual);
            self.notify_size();
        }
    }

    /// Take the oldest fresh token, discarding stale ones on the way.
    ///
    /// Returns `None` right away when both counters are zero. Every pop that
    /// yields nothing usable is followed by a short backoff; empty pops are
    /// bounded by `max_empty_polls`.
    pub async fn get_token(&self) -> Option<String> {
        let ttl = self.inner.config.token_ttl;
        let mut empty_polls = 0;

        loop {
            if self.inner.counters.is_empty() {
                return None;
            }
            match self.inner.queue.pop() {
                Some(token) if token.is_fresh(ttl) => {
                    self.consume(&token, TokenFlow::Consumed);
                    return Some(token.into_value());
                }
                Some(token) => {
                    log::debug!("discarding stale {} token", token.origin());
                    self.consume(&token, TokenFlow::Evicted);
                    tokio::time::sleep(self.inner.config.empty_poll_backoff).await;
                }
                None => {
                    empty_polls += 1;
                    if empty_polls > self.inner.config.max_empty_polls {
                        return None;
                    }
                    tokio::time::sleep(self.inner.config.empty_poll_backoff).await;
                }
            }
        }
    }

    /// Solve synchronously with a random provider, bypassing the queue.
    pub async fn get_token_with_api(&self, cancel: &CancellationToken) -> Option<String> {
        let provider = self.pick_provider()?;
        let started = Instant::now();
        let value = provider.solve(&self.inner.task, cancel).await;
        self.record_solve(provider.name(), value.is_some(), started);
        value
    }

    pub fn pause(&self) {
        if !self.inner.paused.send_replace(true) {
            self.publish(BankEvent::Lifecycle(LifecycleEvent::Paused));
        }
    }

    pub fn resume(&self) {
        if self.inner.paused.send_replace(false) {
            self.publish(BankEvent::Lifecycle(LifecycleEvent::Resumed));
        }
    }

    /// Stop harvesting and cancel every in-flight request. Terminal and
    /// idempotent; does not wait for workers to unwind.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();
        let cancelled = self.cancel_outstanding();
        self.publish(BankEvent::Lifecycle(LifecycleEvent::Stopped { cancelled }));
    }

    fn cancel_outstanding(&self) -> usize {
        let handles: Vec<_> = lock(&self.inner.cancellations)
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in &handles {
            handle.cancel();
        }
        handles.len()
    }

    pub fn add_provider(&self, provider: Arc<dyn CaptchaProvider>) {
        self.write_providers().push(provider);
    }

    pub fn clear_providers(&self) {
        self.write_providers().clear();
    }

    pub fn replace_providers(&self, providers: Vec<Arc<dyn CaptchaProvider>>) {
        *self.write_providers() = providers;
    }

    /// Rebuild the provider registry from `settings`. Returns how many
    /// providers are now registered.
    pub fn reload_providers(
        &self,
        settings: &Settings,
        transport: Arc<dyn HttpTransport>,
    ) -> usize {
        let providers = providers_from_settings(
            &settings.captcha,
            settings.harvest_proxy_group(),
            transport,
        );
        let count = providers.len();
        self.replace_providers(providers);
        log::info!("captcha providers reloaded: {count} active");
        count
    }

    pub fn provider_count(&self) -> usize {
        self.inner
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Evict expired tokens. Returns how many were removed.
    ///
    /// Observers are notified once per pass over a non-empty queue.
    pub fn sweep(&self) -> usize {
        let pass = self.inner.queue.evict_expired(self.inner.config.token_ttl);
        if pass.visited == 0 {
            return 0;
        }
        for origin in [TokenOrigin::Api, TokenOrigin::Manual] {
            let count = pass
                .expired
                .iter()
                .filter(|token| token.origin() == origin)
                .count();
            for _ in 0..count {
                self.inner.counters.decrement(origin);
            }
            if count > 0 {
                self.publish_token(origin, TokenFlow::Evicted, count);
            }
        }
        if !pass.expired.is_empty() {
            log::debug!("sweep evicted {} stale tokens", pass.expired.len());
        }
        self.notify_size();
        pass.expired.len()
    }

    /// Sole writer of the queue: accepts tokens from both inlets and runs
    /// the sweep until shutdown.
    async fn process_tokens(self, mut inlets: Inlets) {
        let period = self.inner.config.sweep_interval.max(MIN_INTERVAL);
        let mut sweep = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown = self.inner.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(token) = inlets.api.recv() => self.accept(token),
                Some(token) = inlets.manual.recv() => self.accept(token),
                _ = sweep.tick() => {
                    self.sweep();
                }
            }
        }

        self.cancel_outstanding();
        log::debug!("token consumer loop exited");
    }

    fn accept(&self, token: Token) {
        let origin = token.origin();
        if !token.is_fresh(self.inner.config.token_ttl) {
            log::debug!("dropping {origin} token that expired before acceptance");
            self.inner.counters.decrement(origin);
            self.publish_token(origin, TokenFlow::Evicted, 1);
            self.notify_size();
            return;
        }
        self.inner.queue.push(token);
        self.publish_token(origin, TokenFlow::Accepted, 1);
    }

    fn consume(&self, token: &Token, flow: TokenFlow) {
        self.inner.counters.decrement(token.origin());
        self.publish_token(token.origin(), flow, 1);
        self.notify_size();
    }

    fn pick_provider(&self) -> Option<Arc<dyn CaptchaProvider>> {
        let providers = self
            .inner
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        providers.choose(&mut rand::thread_rng()).cloned()
    }

    fn write_providers(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<dyn CaptchaProvider>>> {
        self.inner
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn register_request(&self) -> (RequestGuard<'_>, CancellationToken) {
        let id = self.inner.next_request.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.shutdown.child_token();
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        lock(&self.inner.cancellations).insert(id, cancel.clone());
        (
            RequestGuard {
                inner: &self.inner,
                id,
            },
            cancel,
        )
    }

    fn record_solve(&self, provider: &str, success: bool, started: Instant) {
        self.publish(BankEvent::Solve(SolveEvent {
            provider: provider.to_string(),
            success,
            latency: started.elapsed(),
            timestamp: Utc::now(),
        }));
    }

    fn publish_token(&self, origin: TokenOrigin, flow: TokenFlow, count: usize) {
        self.publish(BankEvent::Token(TokenEvent {
            origin,
            flow,
            count,
            timestamp: Utc::now(),
        }));
    }

    fn notify_size(&self) {
        let counters = &self.inner.counters;
        self.publish(BankEvent::Size(SizeEvent::new(counters.api(), counters.manual())));
    }

    /// Hand `event` to the handlers without blocking the caller when a
    /// runtime is available.
    fn publish(&self, event: BankEvent) {
        let events = self.inner.events.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { events.dispatch(event) });
            }
            Err(_) => events.dispatch(event),
        }
    }
}

impl Default for TokenBank {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TokenBank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBank")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
