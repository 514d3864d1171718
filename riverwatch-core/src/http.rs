//! # HTTP Client (C3)
//!
//! A generic, retrying HTTP request primitive. Adapted from
//! `lib_common::retrieve::ky_http::ApiClient`: same base-URL-join,
//! `reqwest_middleware` exponential-backoff retry, and a typed outcome
//! split — here widened to the three-way distinction spec §4.2/§7 need
//! between a transport failure, a non-2xx response, and a schema
//! (deserialization) failure, so adapters built on top can fail soft.

use reqwest::{Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// The outcome of a single HTTP call, already deserialized if possible.
#[derive(Debug)]
pub enum HttpOutcome<T> {
    /// 2xx status, body parsed as `T`.
    Ok(T),
    /// Non-2xx status; the raw body is kept for diagnostics.
    Status { status: u16, body: String },
    /// 2xx status but the body didn't match `T`.
    SchemaMismatch { status: u16, detail: String },
}

/// A transport-level failure: DNS, TCP, TLS, or timeout.
#[derive(Debug, thiserror::Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

/// A resilient HTTP client reused across polls to benefit from connection
/// pooling, exactly as `CnnPollingPlugin` reuses a single `reqwest::Client`.
pub struct HttpClient {
    inner: ClientWithMiddleware,
}

impl HttpClient {
    /// Build a client with a bounded request timeout and up to 2 retries
    /// on transient failures (connection-level only; poll cadence is the
    /// caller's concern, not this client's).
    pub fn new(timeout: Duration) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(2);
        let raw = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("riverwatch/0.1")
            .build()
            .expect("reqwest client configuration is always valid");
        let inner = ClientBuilder::new(raw)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        Self { inner }
    }

    /// Issue a GET request against `url` and decode the body as `T`.
    pub async fn get_json<T>(&self, url: Url) -> Result<HttpOutcome<T>, TransportError>
    where
        T: DeserializeOwned,
    {
        self.request_json(Method::GET, url, None).await
    }

    /// Issue a POST with a JSON body; used for fire-and-forget community
    /// sample publishing. The response body is discarded on success.
    pub async fn post_json<B>(&self, url: Url, body: &B) -> Result<HttpOutcome<()>, TransportError>
    where
        B: serde::Serialize,
    {
        let payload = serde_json::to_string(body)
            .map_err(|e| TransportError(format!("failed to encode request body: {e}")))?;
        self.request_raw(Method::POST, url, Some(payload)).await
    }

    async fn request_json<T>(
        &self,
        method: Method,
        url: Url,
        body: Option<String>,
    ) -> Result<HttpOutcome<T>, TransportError>
    where
        T: DeserializeOwned,
    {
        let mut req = self.inner.request(method, url);
        if let Some(b) = body {
            req = req.header(reqwest::header::CONTENT_TYPE, "application/json").body(b);
        }

        let response = req
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Ok(HttpOutcome::Status {
                status: status.as_u16(),
                body,
            });
        }

        let raw = response
            .text()
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        match serde_json::from_str::<T>(&raw) {
            Ok(data) => Ok(HttpOutcome::Ok(data)),
            Err(e) => Ok(HttpOutcome::SchemaMismatch {
                status: status.as_u16(),
                detail: e.to_string(),
            }),
        }
    }

    async fn request_raw(
        &self,
        method: Method,
        url: Url,
        body: Option<String>,
    ) -> Result<HttpOutcome<()>, TransportError> {
        let mut req = self.inner.request(method, url);
        if let Some(b) = body {
            req = req.header(reqwest::header::CONTENT_TYPE, "application/json").body(b);
        }
        let response = req
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(HttpOutcome::Ok(()))
        } else {
            let body = response.text().await.unwrap_or_default();
            Ok(HttpOutcome::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}
