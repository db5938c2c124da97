//! Transport seam for Docker Registry API v2 / OCI Distribution requests
//!
//! Everything the exporter sends is a GET whose body may be large, so responses expose
//! their body as a byte stream. [`HttpTransport`] is the reqwest implementation; tests
//! plug in their own [`RegistryTransport`].

use crate::error::handlers::NetworkErrorHandler;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;
use url::Url;

/// Streamed response body
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Registry transport operations
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    /// Issue a GET and return once response headers are available
    async fn get(&self, request: RegistryRequest) -> Result<RegistryResponse>;
}

/// Outbound GET request
#[derive(Debug, Clone)]
pub struct RegistryRequest {
    pub url: Url,
    pub headers: Vec<(String, String)>,
}

impl RegistryRequest {
    pub fn get(url: Url) -> Self {
        Self {
            url,
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    /// Case-insensitive header lookup
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Response with headers read and the body still pending
pub struct RegistryResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: BodyStream,
}

impl RegistryResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: BodyStream) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Response with an in-memory body
    pub fn from_bytes(status: u16, headers: Vec<(String, String)>, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        let stream = futures_util::stream::once(async move { Ok(body) });
        Self::new(status, headers, Box::pin(stream))
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn into_body(self) -> BodyStream {
        self.body
    }
}

impl fmt::Debug for RegistryResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// reqwest-backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(skip_tls: bool, timeout: Duration) -> Result<Self> {
        let builder = Client::builder()
            .user_agent(concat!("docker-image-exporter/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(timeout);

        let builder = if skip_tls {
            builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
        } else {
            builder
        };

        let client = builder
            .build()
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "HTTP client setup"))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl RegistryTransport for HttpTransport {
    async fn get(&self, request: RegistryRequest) -> Result<RegistryResponse> {
        let context = format!("GET {}", request.url);

        let mut builder = self.client.get(request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, &context))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();

        let body = response
            .bytes_stream()
            .map(move |chunk| {
                chunk.map_err(|e| NetworkErrorHandler::handle_network_error(&e, "response body"))
            })
            .boxed();

        Ok(RegistryResponse::new(status, headers, body))
    }
}
