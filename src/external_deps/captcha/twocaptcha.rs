use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::Method;
use http::header::HeaderMap;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{
    CaptchaConfig, CaptchaError, CaptchaProvider, CaptchaResult, CaptchaTask, absorb,
    sleep_or_cancel, until_cancelled,
};
use crate::challenges::core::HttpTransport;

const SUBMIT_URL: &str = "https://2captcha.com/in.php";
const RESULT_URL: &str = "https://2captcha.com/res.php";
const SUBMIT_ATTEMPTS: u32 = 3;
const NOT_READY: &str = "CAPCHA_NOT_READY";

/// Adapter for the 2Captcha key/value form API.
pub struct TwoCaptchaProvider {
    api_key: String,
    submit_url: Url,
    result_url: Url,
    config: CaptchaConfig,
    transport: Arc<dyn HttpTransport>,
}

impl TwoCaptchaProvider {
    pub fn new(api_key: impl Into<String>, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            api_key: api_key.into(),
            submit_url: Url::parse(SUBMIT_URL).expect("valid 2captcha submit url"),
            result_url: Url::parse(RESULT_URL).expect("valid 2captcha result url"),
            config: Self::default_config(),
            transport,
        }
    }

    /// 3s before every result request, at most 20 of them.
    pub fn default_config() -> CaptchaConfig {
        CaptchaConfig {
            initial_delay: Duration::ZERO,
            poll_interval: Duration::from_secs(3),
            timeout: None,
            max_polls: 20,
        }
    }

    pub fn with_config(mut self, config: CaptchaConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_endpoints(mut self, submit_url: Url, result_url: Url) -> Self {
        self.submit_url = submit_url;
        self.result_url = result_url;
        self
    }

    pub async fn solve_recaptcha_v2(
        &self,
        task: &CaptchaTask,
        cancel: &CancellationToken,
    ) -> CaptchaResult {
        let mut params = vec![
            ("googlekey".to_string(), task.site_key.clone()),
            ("pageurl".to_string(), task.page_url.clone()),
            ("method".to_string(), "userrecaptcha".to_string()),
        ];

        let captcha_id = self
            .api_request(&self.submit_url, &params, Duration::ZERO, SUBMIT_ATTEMPTS, cancel)
            .await?;
        log::debug!("twocaptcha: submitted captcha {captcha_id}");

        params.push(("id".to_string(), captcha_id));
        params.push(("action".to_string(), "get".to_string()));
        self.api_request(
            &self.result_url,
            &params,
            self.config.poll_interval,
            self.config.max_polls,
            cancel,
        )
        .await
    }

    /// Post `params` until the service answers `OK|value`, waiting `delay`
    /// before each request and retrying only while it reports not ready.
    async fn api_request(
        &self,
        url: &Url,
        params: &[(String, String)],
        delay: Duration,
        retries: u32,
        cancel: &CancellationToken,
    ) -> CaptchaResult {
        let mut form = Vec::with_capacity(params.len() + 1);
        form.push(("key".to_string(), self.api_key.clone()));
        form.extend_from_slice(params);

        for _ in 0..retries {
            sleep_or_cancel(cancel, delay).await?;
            let response = until_cancelled(cancel, async {
                self.transport
                    .send_form(&Method::POST, url, &HeaderMap::new(), &form)
                    .await
                    .map_err(CaptchaError::from)
            })
            .await?;

            let body = response.text();
            let body = body.trim();
            log::debug!("twocaptcha: {body}");
            if body.contains(NOT_READY) {
                continue;
            }
            return match body.strip_prefix("OK|") {
                Some(value) if !value.is_empty() => Ok(value.to_string()),
                _ => Err(CaptchaError::Protocol(format!(
                    "invalid response from 2captcha: {body}"
                ))),
            };
        }

        Err(CaptchaError::ExhaustedRetries(retries as usize))
    }
}

#[async_trait]
impl CaptchaProvider for TwoCaptchaProvider {
    fn name(&self) -> &'static str {
        "twocaptcha"
    }

    async fn solve(&self, task: &CaptchaTask, cancel: &CancellationToken) -> Option<String> {
        absorb(self.name(), self.solve_recaptcha_v2(task, cancel).await)
    }
}
