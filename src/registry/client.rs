//! Registry client
//!
//! Pairs a [`RegistryTransport`] with the shared [`TransportGate`]. Every request made
//! through [`RegistryClient::send`] holds a gate slot until its body has been consumed,
//! at which point the slot is handed back.

use crate::error::{RegistryError, Result};
use crate::image::digest::DigestHasher;
use crate::logging::Logger;
use crate::registry::gate::{GatePermit, TransportGate};
use crate::registry::transport::{
    BodyStream, RegistryRequest, RegistryResponse, RegistryTransport,
};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use url::Url;

pub struct RegistryClientBuilder {
    address: String,
    transport: Arc<dyn RegistryTransport>,
    max_concurrent: usize,
    output: Logger,
}

impl RegistryClientBuilder {
    pub fn new(address: String, transport: Arc<dyn RegistryTransport>) -> Self {
        Self {
            address,
            transport,
            max_concurrent: 4,
            output: Logger::default(),
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_logger(mut self, output: Logger) -> Self {
        self.output = output;
        self
    }

    pub fn build(self) -> Result<RegistryClient> {
        let base_url = Url::parse(self.address.trim_end_matches('/')).map_err(|e| {
            RegistryError::Validation(format!("Invalid registry address '{}': {}", self.address, e))
        })?;

        Ok(RegistryClient {
            base_url,
            transport: self.transport,
            gate: TransportGate::new(self.max_concurrent)?,
            output: self.output,
        })
    }
}

#[derive(Clone)]
pub struct RegistryClient {
    base_url: Url,
    transport: Arc<dyn RegistryTransport>,
    gate: TransportGate,
    output: Logger,
}

impl RegistryClient {
    pub fn builder(
        address: impl Into<String>,
        transport: Arc<dyn RegistryTransport>,
    ) -> RegistryClientBuilder {
        RegistryClientBuilder::new(address.into(), transport)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn gate(&self) -> &TransportGate {
        &self.gate
    }

    /// Absolute URL for an API path such as `/v2/`
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| {
                RegistryError::Validation(format!("Invalid registry path '{}': {}", path, e))
            })
    }

    /// Send a request once a gate slot is free
    pub async fn send(&self, request: RegistryRequest) -> Result<GatedResponse> {
        let permit = self.gate.acquire().await?;
        self.output.detail(&format!("GET {}", request.url));
        let response = self.transport.get(request).await?;
        self.output.detail(&format!("  -> {}", response.status()));
        Ok(GatedResponse::new(response, permit))
    }
}

/// Response that still occupies a gate slot
///
/// Consuming the body through any of the decode methods releases the slot as soon as the
/// last byte is read. Dropping the response releases it as well.
pub struct GatedResponse {
    status: u16,
    response: RegistryResponse,
    permit: GatePermit,
}

impl GatedResponse {
    fn new(response: RegistryResponse, permit: GatePermit) -> Self {
        Self {
            status: response.status(),
            response,
            permit,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.response.is_success()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.response.header(name)
    }

    fn into_parts(self) -> (BodyStream, GatePermit) {
        (self.response.into_body(), self.permit)
    }

    /// Read the whole body into memory
    pub async fn bytes(self) -> Result<Bytes> {
        let (mut body, permit) = self.into_parts();
        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        permit.release();
        Ok(buffer.freeze())
    }

    /// Body as text for error reporting; read failures yield what was received
    pub async fn text(self) -> String {
        let (mut body, permit) = self.into_parts();
        let mut buffer = BytesMut::new();
        while let Some(Ok(chunk)) = body.next().await {
            buffer.extend_from_slice(&chunk);
        }
        permit.release();
        String::from_utf8_lossy(&buffer).into_owned()
    }

    /// Decode the body as a caller-chosen JSON shape
    pub async fn json<T: DeserializeOwned>(self) -> Result<T> {
        let data = self.bytes().await?;
        serde_json::from_slice(&data)
            .map_err(|e| RegistryError::Parse(format!("Invalid JSON response body: {}", e)))
    }

    /// Stream the body into `writer`, feeding every chunk through `hasher`
    ///
    /// Returns the number of bytes written.
    pub async fn write_to<W>(self, writer: &mut W, hasher: &mut DigestHasher) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let (mut body, permit) = self.into_parts();
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        permit.release();
        writer.flush().await?;
        Ok(written)
    }
}
