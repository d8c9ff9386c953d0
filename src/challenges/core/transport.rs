//! Transport abstraction shared by provider adapters and the challenge flow.
//!
//! Everything that talks to the network goes through [`HttpTransport`] so the
//! retry and polling policies layered above it can be exercised against stub
//! transports. Implementations are responsible for executing one request and
//! nothing more: no retries, no backoff.

use std::borrow::Cow;

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use http::header::{HeaderMap, HeaderValue, COOKIE, SET_COOKIE};
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

/// Contract for the "perform HTTP request, get response" capability.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send an `application/x-www-form-urlencoded` body built from `form_fields`.
    async fn send_form(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        form_fields: &[(String, String)],
    ) -> Result<TransportResponse, TransportError>;

    async fn send_with_body(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: Option<&[u8]>,
    ) -> Result<TransportResponse, TransportError>;
}

/// Minimal response representation returned by the transport abstraction.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub url: Url,
}

impl TransportResponse {
    pub fn new(status: u16, url: Url, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            url,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_slice(&self.body).map_err(TransportError::Decode)
    }

    /// Name/value pairs of every `Set-Cookie` header, attributes stripped.
    pub fn cookies(&self) -> Vec<(String, String)> {
        self.headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(parse_set_cookie)
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http transport error: {0}")]
    Transport(String),
    #[error("invalid header '{0}'")]
    InvalidHeader(String),
    #[error("response decoding failed: {0}")]
    Decode(#[source] serde_json::Error),
}

fn parse_set_cookie(raw: &str) -> Option<(String, String)> {
    let pair = raw.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

/// Merge `updates` into `cookies`, replacing values of cookies with the same name.
pub fn merge_cookies(cookies: &mut Vec<(String, String)>, updates: Vec<(String, String)>) {
    for (name, value) in updates {
        match cookies.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = value,
            None => cookies.push((name, value)),
        }
    }
}

/// Render cookies as a single `Cookie` header value and insert it into `headers`.
pub fn insert_cookie_header(
    headers: &mut HeaderMap,
    cookies: &[(String, String)],
) -> Result<(), TransportError> {
    if cookies.is_empty() {
        return Ok(());
    }
    let joined = cookies
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ");
    let value =
        HeaderValue::from_str(&joined).map_err(|_| TransportError::InvalidHeader("cookie".into()))?;
    headers.insert(COOKIE, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with_cookies(values: &[&str]) -> TransportResponse {
        let mut headers = HeaderMap::new();
        for value in values {
            headers.append(SET_COOKIE, HeaderValue::from_str(value).unwrap());
        }
        TransportResponse::new(200, Url::parse("https://example.com").unwrap(), "")
            .with_headers(headers)
    }

    #[test]
    fn extracts_all_set_cookie_pairs() {
        let response = response_with_cookies(&[
            "datadome=abc123; Max-Age=3600; Path=/",
            "session=xyz; HttpOnly",
        ]);
        assert_eq!(
            response.cookies(),
            vec![
                ("datadome".to_string(), "abc123".to_string()),
                ("session".to_string(), "xyz".to_string()),
            ]
        );
    }

    #[test]
    fn merge_replaces_existing_cookie_values() {
        let mut cookies = vec![
            ("datadome".to_string(), "old".to_string()),
            ("other".to_string(), "1".to_string()),
        ];
        merge_cookies(&mut cookies, vec![("datadome".into(), "new".into())]);
        assert_eq!(cookies[0].1, "new");
        assert_eq!(cookies.len(), 2);

        let mut headers = HeaderMap::new();
        insert_cookie_header(&mut headers, &cookies).unwrap();
        assert_eq!(headers.get(COOKIE).unwrap(), "datadome=new; other=1");
    }

    #[test]
    fn json_decoding_failure_is_reported() {
        let response = TransportResponse::new(
            200,
            Url::parse("https://example.com").unwrap(),
            "not json",
        );
        let result = response.json::<serde_json::Value>();
        assert!(matches!(result, Err(TransportError::Decode(_))));
    }
}
