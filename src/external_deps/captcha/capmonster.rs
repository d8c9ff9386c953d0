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

const CAPMONSTER_BASE_URL: &str = "https://api.capmonster.cloud/";

/// Adapter for the CapMonster cloud service (bounded retries).
///
/// When a proxy is assigned the task is submitted as a proxied task with the
/// full address and credentials.
pub struct CapMonsterProvider {
    client_key: String,
    base_url: Url,
    config: CaptchaConfig,
    proxies: ProxyRotation,
    transport: Arc<dyn HttpTransport>,
}

impl CapMonsterProvider {
    pub fn new(client_key: impl Into<String>, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            client_key: client_key.into(),
            base_url: Url::parse(CAPMONSTER_BASE_URL).expect("valid capmonster url"),
            config: Self::default_config(),
            proxies: ProxyRotation::default(),
            transport,
        }
    }

    /// Poll immediately, then every 3s while processing, at most 7 polls.
    pub fn default_config() -> CaptchaConfig {
        CaptchaConfig {
            initial_delay: Duration::ZERO,
            poll_interval: Duration::from_secs(3),
            timeout: None,
            max_polls: 7,
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

    pub fn with_proxies(mut self, proxies: Vec<ProxyDescriptor>) -> Self {
        self.proxies = ProxyRotation::new(proxies);
        self
    }

    pub fn proxies(&self) -> &ProxyRotation {
        &self.proxies
    }

    pub async fn create_token(
        &self,
        task: &CaptchaTask,
        proxy: Option<&ProxyDescriptor>,
        cancel: &CancellationToken,
    ) -> CaptchaResult {
        let payload = match proxy {
            Some(proxy) => TaskPayload::with_proxy(task, proxy),
            None => TaskPayload::proxyless(task),
        };
        let task_id = until_cancelled(
            cancel,
            task_api::create_task(
                self.transport.as_ref(),
                &self.base_url,
                &self.client_key,
                payload,
            ),
        )
        .await?;
        log::debug!("capmonster: created task {task_id}");

        sleep_or_cancel(cancel, self.config.initial_delay).await?;
        for _ in 0..self.config.max_polls {
            let response = until_cancelled(
                cancel,
                task_api::task_result(
                    self.transport.as_ref(),
                    &self.base_url,
                    &self.client_key,
                    task_id,
                ),
            )
            .await?;
            if response.is_processing() {
                sleep_or_cancel(cancel, self.config.poll_interval).await?;
                continue;
            }
            return response.into_token();
        }

        Err(CaptchaError::ExhaustedRetries(self.config.max_polls as usize))
    }
}

#[async_trait]
impl CaptchaProvider for CapMonsterProvider {
    fn name(&self) -> &'static str {
        "capmonster"
    }

    async fn solve(&self, task: &CaptchaTask, cancel: &CancellationToken) -> Option<String> {
        let result = self
            .proxies
            .attempt_each(|proxy| async move {
                self.create_token(task, proxy.as_ref(), cancel).await
            })
            .await;
        absorb(self.name(), result)
    }
}
