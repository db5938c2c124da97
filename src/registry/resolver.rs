//! Manifest resolution
//!
//! Fetches the manifest for a tag or digest, and when the registry returns a manifest
//! list or OCI index, picks the entry for the target platform and fetches that.

use crate::error::handlers::HttpErrorHandler;
use crate::error::{RegistryError, Result};
use crate::image::digest::DigestUtils;
use crate::image::manifest::{
    Manifest, ManifestType, ParsedManifest, Platform, manifest_accept_header, parse_manifest,
};
use crate::logging::Logger;
use crate::registry::client::RegistryClient;
use crate::registry::token_manager::TokenManager;
use crate::registry::transport::RegistryRequest;

/// Single-platform manifest together with the digest it was fetched under
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedManifest {
    pub manifest: Manifest,
    /// Content digest of the manifest bytes
    pub digest: String,
}

pub struct ManifestResolver {
    client: RegistryClient,
    tokens: TokenManager,
    platform: Platform,
    output: Logger,
}

impl ManifestResolver {
    pub fn new(client: RegistryClient, tokens: TokenManager, output: Logger) -> Self {
        Self {
            client,
            tokens,
            platform: Platform::default(),
            output,
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Resolve `reference` (tag or digest) to a single-platform manifest
    pub async fn resolve(&self, repository: &str, reference: &str) -> Result<ResolvedManifest> {
        self.output.step(&format!("Fetching manifest for {}:{}", repository, reference));

        let (manifest_type, parsed, digest) = self.fetch(repository, reference).await?;
        let list = match parsed {
            ParsedManifest::Single(manifest) => {
                self.output.verbose(&format!("Manifest type: {}", manifest_type.media_type()));
                return Ok(ResolvedManifest { manifest, digest });
            }
            ParsedManifest::List(list) => list,
        };

        self.output.verbose(&format!(
            "{} with {} entries, selecting {}",
            manifest_type.media_type(),
            list.manifests.len(),
            self.platform
        ));

        let entry = list
            .select(&self.platform)
            .ok_or_else(|| RegistryError::NoMatchingPlatform {
                repository: repository.to_string(),
                reference: reference.to_string(),
                platform: self.platform.to_string(),
                available: list.available_platforms(),
            })?;

        let (_, parsed, digest) = self.fetch(repository, &entry.digest).await?;
        match parsed {
            ParsedManifest::Single(manifest) => Ok(ResolvedManifest { manifest, digest }),
            ParsedManifest::List(_) => Err(RegistryError::ManifestFetch {
                status: 200,
                repository: repository.to_string(),
                reference: entry.digest.clone(),
                message: "Manifest list entry points at another manifest list".to_string(),
            }),
        }
    }

    /// GET one manifest document and decode it
    ///
    /// Digest references are verified against the received bytes.
    async fn fetch(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<(ManifestType, ParsedManifest, String)> {
        let url = self
            .client
            .endpoint(&format!("/v2/{}/manifests/{}", repository, reference))?;
        let request = RegistryRequest::get(url).header("Accept", manifest_accept_header());

        let response = self.tokens.send(&self.client, request).await?;
        let status = response.status();
        if !response.is_success() {
            let text = response.text().await;
            return Err(HttpErrorHandler::handle_manifest_error(
                status, &text, repository, reference,
            ));
        }

        let content_type = response.header("content-type").map(str::to_string);
        let data = response.bytes().await?;

        let fetch_error = |message: String| RegistryError::ManifestFetch {
            status,
            repository: repository.to_string(),
            reference: reference.to_string(),
            message,
        };

        let digest = if DigestUtils::is_valid_digest(reference) {
            DigestUtils::verify_data_integrity(&data, reference)
                .map_err(|e| fetch_error(e.to_string()))?;
            reference.to_string()
        } else {
            DigestUtils::compute_docker_digest(&data)
        };

        let (manifest_type, parsed) =
            parse_manifest(&data, content_type.as_deref()).map_err(fetch_error)?;
        Ok((manifest_type, parsed, digest))
    }
}
