//! Proxy descriptors and round-robin rotation for provider adapters.
//!
//! A provider constructed against a named proxy group walks the group in
//! order, advancing to the next proxy whenever a solve attempt fails. A
//! single solve never cycles more than once through the group.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::external_deps::captcha::CaptchaError;

/// Egress proxy forwarded to solving services that support proxied tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyDescriptor {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl ProxyDescriptor {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: String::new(),
            password: String::new(),
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }
}

impl fmt::Display for ProxyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Named, ordered list of proxies as found in the settings file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyGroup {
    pub id: String,
    #[serde(default)]
    pub proxies: Vec<ProxyDescriptor>,
}

/// Ordered proxy list plus the index of the proxy currently in use.
#[derive(Debug, Default)]
pub struct ProxyRotation {
    proxies: Vec<ProxyDescriptor>,
    index: AtomicUsize,
}

impl ProxyRotation {
    pub fn new(proxies: Vec<ProxyDescriptor>) -> Self {
        Self {
            proxies,
            index: AtomicUsize::new(0),
        }
    }

    pub fn from_group(group: Option<&ProxyGroup>) -> Self {
        Self::new(group.map(|g| g.proxies.clone()).unwrap_or_default())
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn index(&self) -> usize {
        self.index.load(Ordering::Acquire)
    }

    pub fn current(&self) -> Option<&ProxyDescriptor> {
        self.proxies.get(self.index())
    }

    /// Advance to the next proxy, wrapping to the first one.
    pub fn rotate(&self) {
        let len = self.proxies.len();
        if len == 0 {
            return;
        }
        let _ = self
            .index
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |idx| Some((idx + 1) % len));
    }

    /// Run `attempt` with the current proxy, rotating after each failure.
    ///
    /// Without proxies the attempt runs exactly once. With proxies it runs at
    /// most once per proxy and then reports [`CaptchaError::ExhaustedRetries`].
    /// Cancellation stops the rotation immediately.
    pub async fn attempt_each<F, Fut, T>(&self, mut attempt: F) -> Result<T, CaptchaError>
    where
        F: FnMut(Option<ProxyDescriptor>) -> Fut,
        Fut: Future<Output = Result<T, CaptchaError>>,
    {
        if self.proxies.is_empty() {
            return attempt(None).await;
        }

        for _ in 0..self.proxies.len() {
            let proxy = self.current().cloned();
            let label = proxy.as_ref().map(ToString::to_string).unwrap_or_default();
            match attempt(proxy).await {
                Ok(value) => return Ok(value),
                Err(CaptchaError::Cancelled) => return Err(CaptchaError::Cancelled),
                Err(err) => {
                    log::warn!("solve via proxy {label} failed: {err}; rotating");
                    self.rotate();
                }
            }
        }

        Err(CaptchaError::ExhaustedRetries(self.proxies.len()))
    }
}
