//! Tokens and the TTL-aware FIFO store that holds them.
//!
//! Freshness is evaluated lazily against the configured lifetime; nothing in
//! this module evicts on its own. The bank's sweep and its consumer read are
//! the only places stale entries are discarded.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifetime of a solved token.
pub const TOKEN_TTL: Duration = Duration::from_secs(119);

/// Where a token came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenOrigin {
    Api,
    Manual,
}

impl fmt::Display for TokenOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenOrigin::Api => f.write_str("api"),
            TokenOrigin::Manual => f.write_str("manual"),
        }
    }
}

/// A solved challenge value. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    value: String,
    created_at: DateTime<Utc>,
    origin: TokenOrigin,
}

impl Token {
    pub fn new(value: impl Into<String>, origin: TokenOrigin) -> Self {
        Self::with_created_at(value, origin, Utc::now())
    }

    pub fn with_created_at(
        value: impl Into<String>,
        origin: TokenOrigin,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            value: value.into(),
            created_at,
            origin,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn into_value(self) -> String {
        self.value
    }

    pub fn origin(&self) -> TokenOrigin {
        self.origin
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at).to_std().unwrap_or_default()
    }

    /// `true` while the token is younger than `ttl`.
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age() < ttl
    }
}

/// FIFO of tokens safe for concurrent use.
#[derive(Debug, Default)]
pub struct TokenQueue {
    inner: Mutex<VecDeque<Token>>,
}

impl TokenQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, token: Token) {
        self.lock().push_back(token);
    }

    pub fn pop(&self) -> Option<Token> {
        self.lock().pop_front()
    }

    pub fn peek_front(&self) -> Option<Token> {
        self.lock().front().cloned()
    }

    /// Remove the first element equal to `token`. Returns whether one was found.
    pub fn remove(&self, token: &Token) -> bool {
        let mut guard = self.lock();
        match guard.iter().position(|candidate| candidate == token) {
            Some(idx) => guard.remove(idx).is_some(),
            None => false,
        }
    }

    /// One sweep pass: visit as many elements as the queue held when the
    /// pass started, re-appending fresh ones and removing the expired ones.
    pub fn evict_expired(&self, ttl: Duration) -> SweepPass {
        let mut guard = self.lock();
        let visited = guard.len();
        let mut expired = Vec::new();
        for _ in 0..visited {
            let Some(token) = guard.pop_front() else {
                break;
            };
            if token.is_fresh(ttl) {
                guard.push_back(token);
            } else {
                expired.push(token);
            }
        }
        SweepPass { visited, expired }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Token>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Outcome of [`TokenQueue::evict_expired`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepPass {
    /// Queue length when the pass started.
    pub visited: usize,
    pub expired: Vec<Token>,
}

/// Outstanding tokens per origin, kept apart from the queue for cheap
/// availability checks.
#[derive(Debug, Default)]
pub struct TokenCounters {
    api: AtomicUsize,
    manual: AtomicUsize,
}

impl TokenCounters {
    pub fn api(&self) -> usize {
        self.api.load(Ordering::Acquire)
    }

    pub fn manual(&self) -> usize {
        self.manual.load(Ordering::Acquire)
    }

    pub fn get(&self, origin: TokenOrigin) -> usize {
        self.slot(origin).load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.api() == 0 && self.manual() == 0
    }

    pub fn increment(&self, origin: TokenOrigin) {
        self.slot(origin).fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement without going below zero.
    pub fn decrement(&self, origin: TokenOrigin) {
        let _ = self
            .slot(origin)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(1))
            });
    }

    /// Increment the api counter only if it stays within `max`.
    pub fn try_reserve_api(&self, max: usize) -> bool {
        self.api
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < max).then_some(count + 1)
            })
            .is_ok()
    }

    fn slot(&self, origin: TokenOrigin) -> &AtomicUsize {
        match origin {
            TokenOrigin::Api => &self.api,
            TokenOrigin::Manual => &self.manual,
        }
    }
}
