//! Reqwest-based implementation of the `HttpTransport` trait.
//!
//! reqwest re-exports the `http` crate's method and header types, so requests
//! and responses cross the seam without conversion.

use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, Method};
use reqwest::Client;
use url::Url;

use super::{HttpTransport, TransportError, TransportResponse};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Reqwest-backed transport.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Creates a client without a cookie store; callers pass cookies explicitly.
    pub fn new() -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|err| TransportError::Transport(err.to_string()))?;

        Ok(Self { client })
    }

    /// Wrap an existing reqwest client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send_form(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        form_fields: &[(String, String)],
    ) -> Result<TransportResponse, TransportError> {
        log::debug!("-> {} {}", method, url);
        let response = self
            .client
            .request(method.clone(), url.as_str())
            .headers(headers.clone())
            .form(form_fields)
            .send()
            .await
            .map_err(|err| TransportError::Transport(err.to_string()))?;

        to_transport_response(response).await
    }

    async fn send_with_body(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: Option<&[u8]>,
    ) -> Result<TransportResponse, TransportError> {
        let mut builder = self
            .client
            .request(method.clone(), url.as_str())
            .headers(headers.clone());

        if let Some(data) = body {
            builder = builder.body(data.to_vec());
        }

        log::debug!("-> {} {}", method, url);
        let response = builder
            .send()
            .await
            .map_err(|err| TransportError::Transport(err.to_string()))?;

        to_transport_response(response).await
    }
}

async fn to_transport_response(
    response: reqwest::Response,
) -> Result<TransportResponse, TransportError> {
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let url = response.url().clone();
    let body = response
        .bytes()
        .await
        .map_err(|err| TransportError::Transport(err.to_string()))?;

    log::debug!("<- {} {}", status, url);
    Ok(TransportResponse {
        status,
        headers,
        body,
        url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_configured_client() {
        let client = Client::builder().build().unwrap();
        let transport = ReqwestTransport::from_client(client);
        assert!(format!("{transport:?}").contains("ReqwestTransport"));
        assert!(ReqwestTransport::new().is_ok());
    }
}
