//! Captcha provider integrations.
//!
//! These adapters provide a unified interface for the paid solving services
//! the bank harvests from (AntiCaptcha, CapMonster, and 2Captcha). Each one
//! runs the same submit-then-poll exchange against its vendor API and absorbs
//! every failure into an empty result so the bank can retry uniformly.

mod anticaptcha;
mod capmonster;
mod task_api;
mod twocaptcha;

pub use anticaptcha::AntiCaptchaProvider;
pub use capmonster::CapMonsterProvider;
pub use twocaptcha::TwoCaptchaProvider;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use http::Method;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::challenges::core::{HttpTransport, TransportError, TransportResponse};
use crate::config::CaptchaSettings;
use crate::modules::proxy::ProxyGroup;

/// Page hosting the reCAPTCHA that DataDome serves on its geo captcha host.
pub const DATADOME_CAPTCHA_URL: &str = "https://geo.captcha-delivery.com";
/// reCAPTCHA site key used by the DataDome captcha page.
pub const DATADOME_SITE_KEY: &str = "6LccSjEUAAAAANCPhaM2c-WiRxCZ5CzsjR_vd8uX";

/// Polling policy for one provider.
#[derive(Debug, Clone)]
pub struct CaptchaConfig {
    /// Wait before the first poll.
    pub initial_delay: Duration,
    pub poll_interval: Duration,
    /// Wall-clock limit on the polling phase.
    pub timeout: Option<Duration>,
    pub max_polls: u32,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            poll_interval: Duration::from_secs(2),
            timeout: Some(Duration::from_secs(120)),
            max_polls: u32::MAX,
        }
    }
}

/// The challenge a provider is asked to solve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaTask {
    pub site_key: String,
    pub page_url: String,
}

impl CaptchaTask {
    pub fn new(site_key: impl Into<String>, page_url: impl Into<String>) -> Self {
        Self {
            site_key: site_key.into(),
            page_url: page_url.into(),
        }
    }

    /// The reCAPTCHA embedded in DataDome's captcha page.
    pub fn datadome() -> Self {
        Self::new(DATADOME_SITE_KEY, DATADOME_CAPTCHA_URL)
    }
}

impl Default for CaptchaTask {
    fn default() -> Self {
        Self::datadome()
    }
}

/// Result of one vendor exchange before failures are absorbed.
pub type CaptchaResult = Result<String, CaptchaError>;

/// Shared interface implemented by captcha vendors.
///
/// `solve` never reports why it failed: transport errors, malformed
/// responses, exhausted budgets and cancellation all come back as `None`.
#[async_trait]
pub trait CaptchaProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn solve(&self, task: &CaptchaTask, cancel: &CancellationToken) -> Option<String>;
}

/// Errors surfaced by the vendor clients.
#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("captcha provider misconfigured: {0}")]
    Configuration(String),
    #[error("captcha provider request failed: {0}")]
    Transport(#[from] TransportError),
    #[error("unexpected captcha provider response: {0}")]
    Protocol(String),
    #[error("captcha provider rejected the request ({code}): {description}")]
    Api { code: String, description: String },
    #[error("captcha solving timed out after {0:?}")]
    Timeout(Duration),
    #[error("retry budget exhausted after {0} attempts")]
    ExhaustedRetries(usize),
    #[error("captcha solving cancelled")]
    Cancelled,
}

/// Build one provider per configured API key, in the order 2Captcha,
/// AntiCaptcha, CapMonster.
pub fn providers_from_settings(
    settings: &CaptchaSettings,
    proxy_group: Option<&ProxyGroup>,
    transport: Arc<dyn HttpTransport>,
) -> Vec<Arc<dyn CaptchaProvider>> {
    let mut providers: Vec<Arc<dyn CaptchaProvider>> = Vec::new();

    if let Some(key) = non_empty(&settings.two_captcha) {
        providers.push(Arc::new(TwoCaptchaProvider::new(key, transport.clone())));
    }
    if let Some(key) = non_empty(&settings.anti_captcha) {
        providers.push(Arc::new(
            AntiCaptchaProvider::new(key, transport.clone()).with_proxy_group(proxy_group),
        ));
    }
    if let Some(key) = non_empty(&settings.cap_monster) {
        providers.push(Arc::new(
            CapMonsterProvider::new(key, transport).with_proxy_group(proxy_group),
        ));
    }

    providers
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|key| !key.is_empty())
}

/// Collapse a vendor result into the empty-on-failure contract.
pub(crate) fn absorb(provider: &str, result: CaptchaResult) -> Option<String> {
    match result {
        Ok(token) if !token.is_empty() => Some(token),
        Ok(_) => {
            log::warn!("{provider}: empty solution");
            None
        }
        Err(CaptchaError::Cancelled) => {
            log::debug!("{provider}: solve cancelled");
            None
        }
        Err(err) => {
            log::warn!("{provider}: {err}");
            None
        }
    }
}

pub(crate) async fn sleep_or_cancel(
    cancel: &CancellationToken,
    delay: Duration,
) -> Result<(), CaptchaError> {
    if cancel.is_cancelled() {
        return Err(CaptchaError::Cancelled);
    }
    if delay.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(CaptchaError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

pub(crate) async fn until_cancelled<F, T>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, CaptchaError>
where
    F: Future<Output = Result<T, CaptchaError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CaptchaError::Cancelled),
        result = fut => result,
    }
}

pub(crate) async fn post_json<T: Serialize + ?Sized>(
    transport: &dyn HttpTransport,
    url: &Url,
    body: &T,
) -> Result<TransportResponse, CaptchaError> {
    let payload = serde_json::to_vec(body).map_err(|err| CaptchaError::Protocol(err.to_string()))?;
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(transport
        .send_with_body(&Method::POST, url, &headers, Some(&payload))
        .await?)
}

pub(crate) fn endpoint(base: &Url, path: &str) -> Result<Url, CaptchaError> {
    base.join(path)
        .map_err(|err| CaptchaError::Configuration(format!("invalid endpoint {path}: {err}")))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use http::{HeaderMap, Method};
    use url::Url;

    use crate::challenges::core::{HttpTransport, TransportError, TransportResponse};

    /// A request captured by [`StubTransport`].
    #[derive(Debug, Clone)]
    pub struct RecordedRequest {
        pub method: Method,
        pub url: Url,
        pub headers: HeaderMap,
        pub form: Vec<(String, String)>,
        pub body: Option<Vec<u8>>,
    }

    impl RecordedRequest {
        pub fn json(&self) -> serde_json::Value {
            serde_json::from_slice(self.body.as_deref().unwrap_or_default()).unwrap()
        }

        pub fn form_value(&self, key: &str) -> Option<&str> {
            self.form
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value.as_str())
        }
    }

    /// Replays queued bodies in order and records every request.
    #[derive(Default)]
    pub struct StubTransport {
        responses: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
        pub requests: Mutex<Vec<RecordedRequest>>,
    }

    impl StubTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_body(&self, body: &str) {
            self.push(Ok(TransportResponse::new(
                200,
                Url::parse("https://stub.local/").unwrap(),
                body.to_string(),
            )));
        }

        pub fn push(&self, response: Result<TransportResponse, TransportError>) {
            self.responses.lock().unwrap().push_back(response);
        }

        pub fn recorded(&self) -> Vec<RecordedRequest> {
            self.requests.lock().unwrap().clone()
        }

        fn next(&self) -> Result<TransportResponse, TransportError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Transport("no stub response".into())))
        }
    }

    #[async_trait]
    impl HttpTransport for StubTransport {
        async fn send_form(
            &self,
            method: &Method,
            url: &Url,
            headers: &HeaderMap,
            form_fields: &[(String, String)],
        ) -> Result<TransportResponse, TransportError> {
            self.requests.lock().unwrap().push(RecordedRequest {
                method: method.clone(),
                url: url.clone(),
                headers: headers.clone(),
                form: form_fields.to_vec(),
                body: None,
            });
            self.next()
        }

        async fn send_with_body(
            &self,
            method: &Method,
            url: &Url,
            headers: &HeaderMap,
            body: Option<&[u8]>,
        ) -> Result<TransportResponse, TransportError> {
            self.requests.lock().unwrap().push(RecordedRequest {
                method: method.clone(),
                url: url.clone(),
                headers: headers.clone(),
                form: Vec::new(),
                body: body.map(<[u8]>::to_vec),
            });
            self.next()
        }
    }
}
