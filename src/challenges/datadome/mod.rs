//! DataDome captcha challenge flow.
//!
//! Consumes tokens from the bank to pass a DataDome block: parse the
//! challenge parameters out of the blocked page, fetch the geo captcha page,
//! submit a solved reCAPTCHA, and hand back the session cookie.

mod analysis;

use std::sync::Arc;

use http::header::{HeaderMap, HeaderValue, USER_AGENT};
use http::Method;
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::TokenBank;
use crate::challenges::core::{
    HttpTransport, TransportError, TransportResponse, insert_cookie_header, merge_cookies,
};
use crate::external_deps::captcha::DATADOME_CAPTCHA_URL;

pub use analysis::{ChallengeParams, parse_challenge};

/// Marker present on captcha pages that need an interactive solve.
const RECAPTCHA_MARKER: &str = "g-recaptcha-response";

#[derive(Debug, Error)]
pub enum DatadomeError {
    #[error("no datadome challenge found")]
    NoChallenge,
    #[error("challenge field {0} missing")]
    MissingField(&'static str),
    #[error("malformed challenge payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid challenge url: {0}")]
    InvalidUrl(String),
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("captcha page does not require a solve")]
    NotInteractive,
    #[error("no captcha token available")]
    NoToken,
    #[error("verification response carried no cookie")]
    MissingCookie,
}

/// Result of one challenge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatadomeOutcome {
    /// Session cookie value returned by the check endpoint.
    Cookie(String),
    /// No usable challenge on this page; retry through another proxy.
    RotateProxy,
    Failed,
}

impl DatadomeOutcome {
    pub fn cookie(&self) -> Option<&str> {
        match self {
            DatadomeOutcome::Cookie(value) => Some(value),
            _ => None,
        }
    }
}

/// Everything the caller knows about the blocked request.
#[derive(Debug, Clone, Default)]
pub struct DatadomeRequest {
    /// Body of the blocked response.
    pub body: String,
    /// Current value of the `datadome` cookie.
    pub datadome_cid: String,
    pub user_agent: String,
    pub parent_url: String,
    pub site_url: String,
    pub cookies: Vec<(String, String)>,
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    #[serde(default)]
    cookie: Option<String>,
}

/// Drives DataDome challenges with tokens from a [`TokenBank`].
pub struct DatadomeSolver {
    bank: TokenBank,
    transport: Arc<dyn HttpTransport>,
    host: String,
}

impl DatadomeSolver {
    pub fn new(bank: TokenBank, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            bank,
            transport,
            host: DATADOME_CAPTCHA_URL.to_string(),
        }
    }

    /// Override the captcha host, e.g. for a regional endpoint.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn bank(&self) -> &TokenBank {
        &self.bank
    }

    /// Run the full challenge. Every failure is logged and folded into the
    /// returned outcome.
    pub async fn solve(
        &self,
        request: &DatadomeRequest,
        cancel: &CancellationToken,
    ) -> DatadomeOutcome {
        match self.try_solve(request, cancel).await {
            Ok(cookie) => DatadomeOutcome::Cookie(cookie),
            Err(DatadomeError::NoChallenge) => DatadomeOutcome::RotateProxy,
            Err(err) => {
                log::warn!("datadome: {err}");
                DatadomeOutcome::Failed
            }
        }
    }

    pub async fn try_solve(
        &self,
        request: &DatadomeRequest,
        cancel: &CancellationToken,
    ) -> Result<String, DatadomeError> {
        let params = parse_challenge(&request.body)?;
        let challenge_url =
            params.challenge_url(&self.host, &request.datadome_cid, &request.site_url);
        log::debug!("datadome: fetching challenge {challenge_url}");

        let mut cookies = request.cookies.clone();
        let page = self
            .get(&challenge_url, &request.user_agent, &cookies)
            .await?;
        if !page.text().contains(RECAPTCHA_MARKER) {
            return Err(DatadomeError::NotInteractive);
        }
        merge_cookies(&mut cookies, page.cookies());

        let token = self.obtain_token(cancel).await?;
        let check_url = params.check_url(
            &self.host,
            &request.datadome_cid,
            &token,
            &request.user_agent,
            &request.site_url,
            &request.parent_url,
        );

        let verification = self.get(&check_url, &request.user_agent, &cookies).await?;
        let response: CheckResponse = verification.json()?;
        response
            .cookie
            .filter(|cookie| !cookie.is_empty())
            .ok_or(DatadomeError::MissingCookie)
    }

    /// Queue first, synchronous solve second.
    async fn obtain_token(&self, cancel: &CancellationToken) -> Result<String, DatadomeError> {
        if let Some(token) = self.bank.get_token().await {
            return Ok(token);
        }
        log::debug!("datadome: bank empty, solving directly");
        self.bank
            .get_token_with_api(cancel)
            .await
            .ok_or(DatadomeError::NoToken)
    }

    async fn get(
        &self,
        url: &str,
        user_agent: &str,
        cookies: &[(String, String)],
    ) -> Result<TransportResponse, DatadomeError> {
        let url = Url::parse(url).map_err(|err| DatadomeError::InvalidUrl(err.to_string()))?;
        let mut headers = HeaderMap::new();
        if !user_agent.is_empty() {
            let value = HeaderValue::from_str(user_agent)
                .map_err(|_| TransportError::InvalidHeader("user-agent".into()))?;
            headers.insert(USER_AGENT, value);
        }
        insert_cookie_header(&mut headers, cookies)?;
        Ok(self
            .transport
            .send_with_body(&Method::GET, &url, &headers, None)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external_deps::captcha::test_support::StubTransport;
    use crate::external_deps::captcha::{CaptchaProvider, CaptchaTask};
    use crate::modules::queue::TokenOrigin;
    use async_trait::async_trait;
    use http::header::{COOKIE, SET_COOKIE};

    const BLOCKED_PAGE: &str = "<script>var dd={'cid':'AHrlqAAAAAMA1','hsh':'A55FBF','t':'fe','s':17434}</script>";
    const CAPTCHA_PAGE: &str = r#"<textarea id="g-recaptcha-response"></textarea>"#;

    struct FixedProvider;

    #[async_trait]
    impl CaptchaProvider for FixedProvider {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn solve(&self, _task: &CaptchaTask, _cancel: &CancellationToken) -> Option<String> {
            Some("api-token".into())
        }
    }

    fn request() -> DatadomeRequest {
        DatadomeRequest {
            body: BLOCKED_PAGE.into(),
            datadome_cid: "dd-cookie".into(),
            user_agent: "Mozilla/5.0 (X11)".into(),
            parent_url: "https://shop.example/item".into(),
            site_url: "https://shop.example/".into(),
            cookies: vec![("session".into(), "abc".into())],
        }
    }

    fn captcha_page() -> TransportResponse {
        let mut headers = HeaderMap::new();
        headers.insert(SET_COOKIE, HeaderValue::from_static("datadome=fresh; Path=/"));
        TransportResponse::new(
            200,
            Url::parse(DATADOME_CAPTCHA_URL).unwrap(),
            CAPTCHA_PAGE,
        )
        .with_headers(headers)
    }

    #[tokio::test]
    async fn solves_with_banked_token() {
        let transport = Arc::new(StubTransport::new());
        transport.push(Ok(captcha_page()));
        transport.push_body(r#"{"status":200,"cookie":"datadome=solved; Max-Age=31536000"}"#);

        let bank = TokenBank::new();
        let solver = DatadomeSolver::new(bank, transport.clone());
        let harvest = {
            let bank = solver.bank().clone();
            tokio::spawn(async move { bank.harvest(1, 1).await })
        };
        solver.bank().create_token("banked-token");

        let outcome = solver.solve(&request(), &CancellationToken::new()).await;
        assert_eq!(outcome.cookie(), Some("datadome=solved; Max-Age=31536000"));

        let requests = transport.recorded();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].url.as_str().starts_with(
            "https://geo.captcha-delivery.com/captcha/?initialCid=AHrlqAAAAAMA1&hash=A55FBF&cid=dd-cookie&t=fe"
        ));
        assert_eq!(requests[0].headers[COOKIE], "session=abc");
        assert!(requests[1].url.as_str().contains("g-recaptcha-response=banked-token"));
        assert!(requests[1].url.as_str().contains("ua=Mozilla/5.0%20(X11)"));
        assert_eq!(requests[1].headers[COOKIE], "session=abc; datadome=fresh");
        assert_eq!(solver.bank().counters().get(TokenOrigin::Manual), 0);

        solver.bank().stop();
        harvest.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn falls_back_to_direct_solve() {
        let transport = Arc::new(StubTransport::new());
        transport.push(Ok(captcha_page()));
        transport.push_body(r#"{"cookie":"datadome=direct"}"#);

        let bank = TokenBank::builder().with_provider(Arc::new(FixedProvider)).build();
        let solver = DatadomeSolver::new(bank, transport.clone());
        let outcome = solver.solve(&request(), &CancellationToken::new()).await;
        assert_eq!(outcome, DatadomeOutcome::Cookie("datadome=direct".into()));
        assert!(transport.recorded()[1].url.as_str().contains("g-recaptcha-response=api-token"));
    }

    #[tokio::test]
    async fn bypass_tag_requests_proxy_rotation() {
        let transport = Arc::new(StubTransport::new());
        let solver = DatadomeSolver::new(TokenBank::new(), transport.clone());
        let mut blocked = request();
        blocked.body = blocked.body.replace("'t':'fe'", "'t':'bv'");
        let outcome = solver.solve(&blocked, &CancellationToken::new()).await;
        assert_eq!(outcome, DatadomeOutcome::RotateProxy);
        assert!(transport.recorded().is_empty());
    }

    #[tokio::test]
    async fn non_interactive_page_fails() {
        let transport = Arc::new(StubTransport::new());
        transport.push_body("<html>nothing to solve</html>");
        let solver = DatadomeSolver::new(TokenBank::new(), transport.clone());
        let result = solver.try_solve(&request(), &CancellationToken::new()).await;
        assert!(matches!(result, Err(DatadomeError::NotInteractive)));
        assert_eq!(transport.recorded().len(), 1);
    }

    #[tokio::test]
    async fn no_token_anywhere_fails() {
        let transport = Arc::new(StubTransport::new());
        transport.push(Ok(captcha_page()));
        let solver = DatadomeSolver::new(TokenBank::new(), transport.clone());
        let outcome = solver.solve(&request(), &CancellationToken::new()).await;
        assert_eq!(outcome, DatadomeOutcome::Failed);
        assert_eq!(transport.recorded().len(), 1);
    }

    #[tokio::test]
    async fn missing_cookie_field_fails() {
        let transport = Arc::new(StubTransport::new());
        transport.push(Ok(captcha_page()));
        transport.push_body(r#"{"status":403}"#);
        let bank = TokenBank::builder().with_provider(Arc::new(FixedProvider)).build();
        let solver = DatadomeSolver::new(bank, transport);
        let result = solver.try_solve(&request(), &CancellationToken::new()).await;
        assert!(matches!(result, Err(DatadomeError::MissingCookie)));
    }
}
