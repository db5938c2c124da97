//! Blob downloads
//!
//! Each blob streams straight into a temporary file while its digest is computed.
//! Content that does not hash to the expected digest is discarded and downloaded again,
//! up to the configured number of attempts. All blobs of an image are requested
//! concurrently; the transport gate decides how many actually run at once.

use crate::error::handlers::HttpErrorHandler;
use crate::error::{RegistryError, Result};
use crate::image::digest::{DigestHasher, DigestUtils};
use crate::image::manifest::BlobDescriptor;
use crate::logging::Logger;
use crate::registry::client::RegistryClient;
use crate::registry::token_manager::TokenManager;
use crate::registry::transport::RegistryRequest;
use futures::future::try_join_all;
use std::path::Path;
use std::time::Instant;
use tempfile::TempPath;

/// Verified blob content on local disk
///
/// The backing file is removed when this value is dropped.
#[derive(Debug)]
pub struct FetchedBlob {
    pub descriptor: BlobDescriptor,
    path: TempPath,
}

impl FetchedBlob {
    /// Take ownership of `path` as the verified content of `descriptor`
    pub fn new(descriptor: BlobDescriptor, path: TempPath) -> Self {
        Self { descriptor, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn digest(&self) -> &str {
        &self.descriptor.digest
    }
}

enum FetchOutcome {
    Verified(FetchedBlob),
    Corrupted { computed: String, received: u64 },
}

pub struct BlobFetcher {
    client: RegistryClient,
    tokens: TokenManager,
    retry_attempts: u32,
    output: Logger,
}

impl BlobFetcher {
    pub fn new(
        client: RegistryClient,
        tokens: TokenManager,
        retry_attempts: u32,
        output: Logger,
    ) -> Self {
        Self {
            client,
            tokens,
            retry_attempts: retry_attempts.max(1),
            output,
        }
    }

    /// Download every blob into `work_dir`
    ///
    /// Results come back in the order of `blobs`, regardless of completion order. The
    /// first failure cancels the remaining downloads and their partial files.
    pub async fn fetch_all(
        &self,
        repository: &str,
        blobs: &[BlobDescriptor],
        work_dir: &Path,
    ) -> Result<Vec<FetchedBlob>> {
        let total = blobs.len();
        let total_bytes: u64 = blobs.iter().map(|blob| blob.size).sum();
        self.output.step(&format!(
            "Downloading {} blobs ({}) with up to {} concurrent requests",
            total,
            self.output.format_size(total_bytes),
            self.client.gate().capacity()
        ));

        let started = Instant::now();
        let downloads = blobs.iter().enumerate().map(|(index, descriptor)| {
            self.fetch_with_retry(repository, descriptor, work_dir, index + 1, total)
        });
        let fetched = try_join_all(downloads).await?;

        self.output.success(&format!(
            "Downloaded {} blobs in {}",
            total,
            self.output.format_duration(started.elapsed())
        ));
        Ok(fetched)
    }

    /// Download one blob, retrying while its content fails verification
    pub async fn fetch_with_retry(
        &self,
        repository: &str,
        descriptor: &BlobDescriptor,
        work_dir: &Path,
        position: usize,
        total: usize,
    ) -> Result<FetchedBlob> {
        DigestUtils::parse(&descriptor.digest)?;
        let short = self.output.short_digest(&descriptor.digest);

        for attempt in 1..=self.retry_attempts {
            let started = Instant::now();
            match self.fetch_once(repository, descriptor, work_dir).await? {
                FetchOutcome::Verified(blob) => {
                    self.output.info(&format!(
                        "[{}/{}] {} ({}) in {}",
                        position,
                        total,
                        short,
                        self.output.format_size(descriptor.size),
                        self.output.format_duration(started.elapsed())
                    ));
                    return Ok(blob);
                }
                FetchOutcome::Corrupted { computed, received } => {
                    self.output.warning(&format!(
                        "Blob {} failed verification on attempt {}/{}: got {} ({} bytes, expected {})",
                        short, attempt, self.retry_attempts, computed, received, descriptor.size
                    ));
                }
            }
        }

        Err(RegistryError::BlobIntegrity {
            digest: descriptor.digest.clone(),
            attempts: self.retry_attempts,
        })
    }

    async fn fetch_once(
        &self,
        repository: &str,
        descriptor: &BlobDescriptor,
        work_dir: &Path,
    ) -> Result<FetchOutcome> {
        let url = self
            .client
            .endpoint(&format!("/v2/{}/blobs/{}", repository, descriptor.digest))?;
        let response = self.tokens.send(&self.client, RegistryRequest::get(url)).await?;

        if !response.is_success() {
            let status = response.status();
            let text = response.text().await;
            return Err(HttpErrorHandler::handle_blob_error(
                status,
                &text,
                &descriptor.digest,
            ));
        }

        let (file, path) = tempfile::Builder::new()
            .prefix("blob-")
            .tempfile_in(work_dir)?
            .into_parts();
        let mut file = tokio::fs::File::from_std(file);
        let mut hasher = DigestHasher::for_digest(&descriptor.digest)?;

        let received = response.write_to(&mut file, &mut hasher).await?;
        drop(file);

        let computed = hasher.finalize();
        if computed != descriptor.digest {
            return Ok(FetchOutcome::Corrupted { computed, received });
        }
        if received != descriptor.size {
            self.output.warning(&format!(
                "Blob {} matched its digest but is {} bytes, manifest declares {}",
                self.output.short_digest(&descriptor.digest),
                received,
                descriptor.size
            ));
        }

        Ok(FetchOutcome::Verified(FetchedBlob::new(
            descriptor.clone(),
            path,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::auth::{AuthNegotiator, Credential};
    use crate::registry::transport::{RegistryResponse, RegistryTransport};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct BlobRegistry {
        blobs: HashMap<String, Vec<u8>>,
        corrupt: bool,
        requests: AtomicU32,
    }

    #[async_trait]
    impl RegistryTransport for BlobRegistry {
        async fn get(&self, request: RegistryRequest) -> Result<RegistryResponse> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let digest = request.url.path().rsplit('/').next().unwrap_or_default();
            match self.blobs.get(digest) {
                Some(data) if self.corrupt => {
                    let mut data = data.clone();
                    data[0] ^= 0xff;
                    Ok(RegistryResponse::from_bytes(200, Vec::new(), data))
                }
                Some(data) => Ok(RegistryResponse::from_bytes(200, Vec::new(), data.clone())),
                None => Ok(RegistryResponse::from_bytes(404, Vec::new(), "BLOB_UNKNOWN")),
            }
        }
    }

    fn fetcher(registry: Arc<BlobRegistry>, retry_attempts: u32) -> BlobFetcher {
        let client = RegistryClient::builder("https://registry.example", registry)
            .with_max_concurrent(2)
            .build()
            .unwrap();
        let output = Logger::new_quiet();
        let negotiator = AuthNegotiator::new(client.clone(), None, output.clone());
        let tokens =
            TokenManager::new(negotiator, "team/app", Credential::Anonymous, output.clone());
        BlobFetcher::new(client, tokens, retry_attempts, output)
    }

    fn registry_with(contents: &[&str], corrupt: bool) -> (Arc<BlobRegistry>, Vec<BlobDescriptor>) {
        let mut blobs = HashMap::new();
        let mut descriptors = Vec::new();
        for data in contents.iter().map(|content| content.as_bytes()) {
            let digest = DigestUtils::compute_docker_digest(data);
            blobs.insert(digest.clone(), data.to_vec());
            descriptors.push(BlobDescriptor::new(
                "application/octet-stream",
                digest,
                data.len() as u64,
            ));
        }
        let registry = Arc::new(BlobRegistry {
            blobs,
            corrupt,
            requests: AtomicU32::new(0),
        });
        (registry, descriptors)
    }

    #[tokio::test]
    async fn test_fetch_all_preserves_order_and_content() {
        let (registry, descriptors) = registry_with(&["config", "layer one", "layer two"], false);
        let work_dir = tempfile::tempdir().unwrap();

        let fetched = fetcher(registry, 3)
            .fetch_all("team/app", &descriptors, work_dir.path())
            .await
            .unwrap();

        assert_eq!(fetched.len(), 3);
        for (blob, descriptor) in fetched.iter().zip(&descriptors) {
            assert_eq!(blob.digest(), descriptor.digest);
            let data = std::fs::read(blob.path()).unwrap();
            assert_eq!(DigestUtils::compute_docker_digest(&data), descriptor.digest);
        }
    }

    #[tokio::test]
    async fn test_corrupted_blob_exhausts_retry_attempts() {
        let (registry, descriptors) = registry_with(&["layer"], true);
        let work_dir = tempfile::tempdir().unwrap();

        let result = fetcher(registry.clone(), 3)
            .fetch_all("team/app", &descriptors, work_dir.path())
            .await;

        match result {
            Err(RegistryError::BlobIntegrity { digest, attempts }) => {
                assert_eq!(digest, descriptors[0].digest);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected BlobIntegrity, got {:?}", other),
        }
        assert_eq!(registry.requests.load(Ordering::SeqCst), 3);
        assert_eq!(std::fs::read_dir(work_dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_blob_is_not_retried() {
        let (registry, _) = registry_with(&[], false);
        let missing = BlobDescriptor::new(
            "application/octet-stream",
            DigestUtils::compute_docker_digest(b"absent"),
            6,
        );
        let work_dir = tempfile::tempdir().unwrap();

        let result = fetcher(registry.clone(), 3)
            .fetch_all("team/app", &[missing], work_dir.path())
            .await;
        assert!(matches!(
            result,
            Err(RegistryError::BlobFetch { status: 404, .. })
        ));
        assert_eq!(registry.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetched_file_removed_on_drop() {
        let (registry, descriptors) = registry_with(&["layer"], false);
        let work_dir = tempfile::tempdir().unwrap();

        let fetched = fetcher(registry, 1)
            .fetch_all("team/app", &descriptors, work_dir.path())
            .await
            .unwrap();
        let path = fetched[0].path().to_path_buf();
        assert!(path.exists());
        drop(fetched);
        assert!(!path.exists());
    }
}
