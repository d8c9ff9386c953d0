use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::task_api::{self, TaskPayload};
use super::{
    CaptchaConfig, CaptchaError, CaptchaProvider, CaptchaResult, CaptchaTask, absorb,
    sleep_or_cancel, until_cancelled,
};
use crate::challenges::core::HttpTransport;
use crate::modules::proxy::{ProxyDescriptor, ProxyGroup, ProxyRotation};

const ANTICAPTCHA_BASE_URL: &str = "https://api.anti-captcha.com/";

/// Adapter for the AntiCaptcha service (ticket plus long poll).
///
/// Tasks are always submitted proxyless. The proxy group is still walked on
/// failure, but its entries are never transmitted to the service.
pub struct AntiCaptchaProvider {
    api_key: String,
    base_url: Url,
    config: CaptchaConfig,
    proxies: ProxyRotation,
    transport: Arc<dyn HttpTransport>,
}

impl AntiCaptchaProvider {
    pub fn new(api_key: impl Into<String>, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: Url::parse(ANTICAPTCHA_BASE_URL).expect("valid anticaptcha url"),
            config: Self::default_config(),
            proxies: ProxyRotation::default(),
            transport,
        }
    }

    /// First poll after 3s, then every 2s, giving up after 30s.
    pub fn default_config() -> CaptchaConfig {
        CaptchaConfig {
            initial_delay: Duration::from_secs(3),
            poll_interval: Duration::from_secs(2),
            timeout: Some(Duration::from_secs(30)),
            max_polls: u32::MAX,
        }
    }

    pub fn with_config(mut self, config: CaptchaConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn with_proxy_group(mut self, group: Option<&ProxyGroup>) -> Self {
        self.proxies = ProxyRotation::from_group(group);
        self
    }

    pub fn proxies(&self) -> &ProxyRotation {
        &self.proxies
    }

    /// Submit the task and poll until the solution is ready or the timeout fires.
    pub async fn send_recaptcha(
        &self,
        task: &CaptchaTask,
        proxy: Option<&ProxyDescriptor>,
        cancel: &CancellationToken,
    ) -> CaptchaResult {
        if let Some(proxy) = proxy {
            log::debug!("anticaptcha: proxy {proxy} not forwarded, submitting proxyless task");
        }

        let task_id = until_cancelled(
            cancel,
            task_api::create_task(
                self.transport.as_ref(),
                &self.base_url,
                &self.api_key,
                TaskPayload::proxyless(task),
            ),
        )
        .await?;
        log::debug!("anticaptcha: created task {task_id}");

        let poll = async {
            sleep_or_cancel(cancel, self.config.initial_delay).await?;
            loop {
                let response = until_cancelled(
                    cancel,
                    task_api::task_result(
                        self.transport.as_ref(),
                        &self.base_url,
                        &self.api_key,
                        task_id,
                    ),
                )
                .await?;
                if response.is_ready() {
                    return response.into_token();
                }
                sleep_or_cancel(cancel, self.config.poll_interval).await?;
            }
        };

        match self.config.timeout {
            Some(limit) => tokio::time::timeout(limit, poll)
                .await
                .map_err(|_| CaptchaError::Timeout(limit))?,
            None => poll.await,
        }
    }
}

#[async_trait]
impl CaptchaProvider for AntiCaptchaProvider {
    fn name(&self) -> &'static str {
        "anticaptcha"
    }

    async fn solve(&self, task: &CaptchaTask, cancel: &CancellationToken) -> Option<String> {
        let result = self
            .proxies
            .attempt_each(|proxy| async move {
                self.send_recaptcha(task, proxy.as_ref(), cancel).await
            })
            .await;
        absorb(self.name(), result)
    }
}
