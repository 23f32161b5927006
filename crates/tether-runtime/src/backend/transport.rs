//! HTTP transport seam.
//!
//! The orchestrator and the cloud session only speak [`HttpTransport`], so
//! tests swap in scripted transports. [`ReqwestTransport`] is the real one.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value as JsonValue;
use std::fmt;
use std::time::Duration;
use tether_core::{Classify, ErrorClass};
use thiserror::Error;

/// Errors below the HTTP status level.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Malformed response: {0}")]
    Decode(String),
}

impl Classify for TransportError {
    fn class(&self) -> ErrorClass {
        match self {
            TransportError::Timeout(_) | TransportError::Connect(_) => ErrorClass::Transient,
            TransportError::Decode(_) => ErrorClass::Configuration,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// Outbound request.
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<JsonValue>,
    pub bearer: Option<SecretString>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            body: None,
            bearer: None,
            timeout: None,
        }
    }

    pub fn post(url: impl Into<String>, body: JsonValue) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            body: Some(body),
            bearer: None,
            timeout: None,
        }
    }

    pub fn with_bearer(mut self, token: &SecretString) -> Self {
        self.bearer = Some(SecretString::from(token.expose_secret().to_string()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Clone for HttpRequest {
    fn clone(&self) -> Self {
        Self {
            method: self.method,
            url: self.url.clone(),
            body: self.body.clone(),
            bearer: self
                .bearer
                .as_ref()
                .map(|token| SecretString::from(token.expose_secret().to_string())),
            timeout: self.timeout,
        }
    }
}

impl fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("bearer", &self.bearer.as_ref().map(|_| "[REDACTED]"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Status and decoded body. Non-JSON bodies arrive as a JSON string,
/// empty bodies as `null`.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: JsonValue,
}

impl HttpResponse {
    pub fn new(status: u16, body: JsonValue) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 401 and 403 both mean the credential was not accepted.
    pub fn is_unauthorized(&self) -> bool {
        self.status == 401 || self.status == 403
    }

    /// Best-effort error text from the body.
    pub fn error_message(&self) -> String {
        match &self.body {
            JsonValue::String(text) => text.clone(),
            JsonValue::Object(map) => map
                .get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .or_else(|| map.get("message"))
                .and_then(JsonValue::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| self.body.to_string()),
            JsonValue::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Outbound HTTP abstraction.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send one request. HTTP error statuses are returned as responses,
    /// only transport failures are errors.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;

    /// Name for logs.
    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(feature = "http")]
pub use reqwest_transport::ReqwestTransport;

#[cfg(feature = "http")]
mod reqwest_transport {
    use super::*;

    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    /// [`HttpTransport`] over a shared `reqwest::Client`.
    #[derive(Debug, Clone)]
    pub struct ReqwestTransport {
        client: reqwest::Client,
    }

    impl ReqwestTransport {
        pub fn new() -> Result<Self, TransportError> {
            let client = reqwest::Client::builder()
                .timeout(DEFAULT_TIMEOUT)
                .build()
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            Ok(Self { client })
        }
    }

    #[async_trait]
    impl HttpTransport for ReqwestTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            let timeout = request.timeout.unwrap_or(DEFAULT_TIMEOUT);
            let mut builder = match request.method {
                Method::Get => self.client.get(&request.url),
                Method::Post => self.client.post(&request.url),
            }
            .timeout(timeout);

            // Only expose the credential here, at the point of use
            if let Some(token) = &request.bearer {
                builder = builder.bearer_auth(token.expose_secret());
            }
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let response = builder.send().await.map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(timeout)
                } else {
                    TransportError::Connect(e.to_string())
                }
            })?;

            let status = response.status().as_u16();
            let text = response.text().await.map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(timeout)
                } else {
                    TransportError::Decode(e.to_string())
                }
            })?;

            let body = if text.trim().is_empty() {
                JsonValue::Null
            } else {
                serde_json::from_str(&text).unwrap_or(JsonValue::String(text))
            };

            Ok(HttpResponse { status, body })
        }

        fn name(&self) -> &str {
            "reqwest"
        }
    }
}
