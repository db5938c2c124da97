//! Export orchestration
//!
//! Ties the registry components together for one image: negotiate credentials, resolve
//! the manifest, download every blob through the shared gate, then assemble the archive
//! on a blocking thread.

use crate::config::{AuthConfig, ExportConfig};
use crate::error::{RegistryError, Result};
use crate::image::archive::{ArchiveSummary, ArchiveTag, TarAssembler};
use crate::logging::Logger;
use crate::reference::ImageReference;
use crate::registry::auth::AuthNegotiator;
use crate::registry::blob::BlobFetcher;
use crate::registry::client::RegistryClient;
use crate::registry::resolver::ManifestResolver;
use crate::registry::token_manager::TokenManager;
use crate::registry::transport::{HttpTransport, RegistryTransport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// What to export and where to put it
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub reference: ImageReference,
    pub credentials: Option<AuthConfig>,
    pub output_path: PathBuf,
}

impl ExportRequest {
    pub fn new(reference: ImageReference, output_path: impl Into<PathBuf>) -> Self {
        Self {
            reference,
            credentials: None,
            output_path: output_path.into(),
        }
    }

    pub fn with_credentials(mut self, credentials: Option<AuthConfig>) -> Self {
        self.credentials = credentials;
        self
    }
}

/// Outcome of a successful export
#[derive(Debug, Clone, PartialEq)]
pub struct ExportSummary {
    pub archive: ArchiveSummary,
    /// Digest of the single-platform manifest that was exported
    pub manifest_digest: String,
    pub repo_tag: Option<String>,
    /// Sum of the downloaded blob sizes
    pub downloaded_bytes: u64,
}

pub struct ImageExporter {
    config: ExportConfig,
    transport: Arc<dyn RegistryTransport>,
    output: Logger,
}

impl ImageExporter {
    /// Exporter talking to registries over HTTP
    pub fn new(config: ExportConfig, output: Logger) -> Result<Self> {
        config.validate()?;
        let timeout = Duration::from_secs(config.timeout_secs);
        let transport = HttpTransport::new(config.skip_tls, timeout)?;
        Self::with_transport(config, Arc::new(transport), output)
    }

    /// Exporter over a caller-supplied transport
    pub fn with_transport(
        config: ExportConfig,
        transport: Arc<dyn RegistryTransport>,
        output: Logger,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            transport,
            output,
        })
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// Pull the image named by `request` into a docker-loadable archive
    pub async fn export(&self, request: &ExportRequest) -> Result<ExportSummary> {
        let reference = &request.reference;
        reference.validate()?;
        if let Some(credentials) = &request.credentials {
            credentials.validate()?;
        }

        self.output.section(&format!("Exporting {}", reference));
        self.output.verbose(&format!(
            "Platform {}, {} concurrent requests, {} attempts per blob",
            self.config.platform, self.config.max_concurrent, self.config.retry_attempts
        ));

        let client = RegistryClient::builder(reference.base_url(), Arc::clone(&self.transport))
            .with_max_concurrent(self.config.max_concurrent)
            .with_logger(self.output.clone())
            .build()?;

        self.output.step("Negotiating registry access");
        let negotiator =
            AuthNegotiator::new(client.clone(), request.credentials.clone(), self.output.clone());
        let tokens =
            TokenManager::initialize(negotiator, &reference.repository, self.output.clone())
                .await?;

        let resolver = ManifestResolver::new(client.clone(), tokens.clone(), self.output.clone())
            .with_platform(self.config.platform.clone());
        let resolved = resolver
            .resolve(&reference.repository, reference.reference())
            .await?;
        let manifest = resolved.manifest;

        let blobs = manifest.unique_blobs();
        let downloaded_bytes = blobs.iter().map(|blob| blob.size).sum();

        let scratch_root = self
            .config
            .temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let work_dir = tempfile::Builder::new()
            .prefix("image-export-")
            .tempdir_in(&scratch_root)
            .map_err(|e| {
                RegistryError::Io(format!(
                    "Failed to create work directory in {}: {}",
                    scratch_root.display(),
                    e
                ))
            })?;
        self.output.detail(&format!("Work directory: {}", work_dir.path().display()));

        let fetcher = BlobFetcher::new(
            client,
            tokens,
            self.config.retry_attempts,
            self.output.clone(),
        );
        let fetched = fetcher
            .fetch_all(&reference.repository, &blobs, work_dir.path())
            .await?;

        let tag = reference
            .tag
            .as_ref()
            .map(|tag| ArchiveTag::new(reference.repository_name(), tag.clone()));
        let repo_tag = tag.as_ref().map(ArchiveTag::repo_tag);
        let output_path = request.output_path.clone();
        let assembler = TarAssembler::new(self.output.clone());

        let archive = tokio::task::spawn_blocking(move || {
            assembler.assemble(&manifest, fetched, tag.as_ref(), &output_path)
        })
        .await
        .map_err(|e| RegistryError::ArchiveWrite(format!("Archive task failed: {}", e)))??;

        drop(work_dir);

        self.output.success(&format!(
            "Exported {} in {}",
            repo_tag.as_deref().unwrap_or(reference.reference()),
            self.output.format_duration(self.output.elapsed())
        ));

        Ok(ExportSummary {
            archive,
            manifest_digest: resolved.digest,
            repo_tag,
            downloaded_bytes,
        })
    }
}
