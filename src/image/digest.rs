//! Content digest utilities
//!
//! Registry blobs and manifests are addressed by `algorithm:hex` digests. This module
//! validates those strings and computes them, either in one shot or incrementally
//! through [`DigestHasher`] while a download streams to disk.

use crate::error::{RegistryError, Result};
use sha2::{Digest, Sha256, Sha512};

/// Standard SHA256 digest for empty content
pub const EMPTY_LAYER_DIGEST: &str =
    "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Hash algorithms accepted in registry digests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 64,
            DigestAlgorithm::Sha512 => 128,
        }
    }
}

/// Utilities for working with digests in registry context
pub struct DigestUtils;

impl DigestUtils {
    /// Compute SHA256 hex from byte data
    pub fn compute_sha256(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    /// Compute full digest (with sha256: prefix) from byte data
    pub fn compute_docker_digest(data: &[u8]) -> String {
        format!("sha256:{}", Self::compute_sha256(data))
    }

    /// Split `algorithm:hex` and validate both halves
    pub fn parse(digest: &str) -> Result<(DigestAlgorithm, &str)> {
        let (algorithm, hex_part) = digest.split_once(':').ok_or_else(|| {
            RegistryError::Validation(format!("Digest missing algorithm prefix: {}", digest))
        })?;

        let algorithm = match algorithm {
            "sha256" => DigestAlgorithm::Sha256,
            "sha512" => DigestAlgorithm::Sha512,
            other => {
                return Err(RegistryError::Validation(format!(
                    "Unsupported digest algorithm '{}' in {}",
                    other, digest
                )));
            }
        };

        let valid_hex = hex_part.len() == algorithm.hex_len()
            && hex_part
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if !valid_hex {
            return Err(RegistryError::Validation(format!(
                "Invalid {} hex in digest: {}",
                algorithm.name(),
                digest
            )));
        }

        Ok((algorithm, hex_part))
    }

    /// Validate full digest format (algorithm:hex)
    pub fn is_valid_digest(digest: &str) -> bool {
        Self::parse(digest).is_ok()
    }

    /// Extract the hex part of a digest
    pub fn extract_hex_part(digest: &str) -> Result<&str> {
        Self::parse(digest).map(|(_, hex_part)| hex_part)
    }

    /// Verify data matches expected digest
    pub fn verify_data_integrity(data: &[u8], expected_digest: &str) -> Result<()> {
        let mut hasher = DigestHasher::for_digest(expected_digest)?;
        hasher.update(data);
        let computed = hasher.finalize();

        if computed != expected_digest {
            return Err(RegistryError::Validation(format!(
                "Data integrity check failed: expected {}, computed {}",
                expected_digest, computed
            )));
        }

        Ok(())
    }
}

enum HasherState {
    Sha256(Sha256),
    Sha512(Sha512),
}

/// Incremental digest computation matching the algorithm of an expected digest
pub struct DigestHasher {
    state: HasherState,
    algorithm: DigestAlgorithm,
    bytes: u64,
}

impl DigestHasher {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        let state = match algorithm {
            DigestAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
            DigestAlgorithm::Sha512 => HasherState::Sha512(Sha512::new()),
        };
        Self {
            state,
            algorithm,
            bytes: 0,
        }
    }

    /// Hasher using the same algorithm as `expected`
    pub fn for_digest(expected: &str) -> Result<Self> {
        let (algorithm, _) = DigestUtils::parse(expected)?;
        Ok(Self::new(algorithm))
    }

    pub fn update(&mut self, data: &[u8]) {
        self.bytes += data.len() as u64;
        match &mut self.state {
            HasherState::Sha256(hasher) => hasher.update(data),
            HasherState::Sha512(hasher) => hasher.update(data),
        }
    }

    /// Number of bytes hashed so far
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    /// Finish and render as `algorithm:hex`
    pub fn finalize(self) -> String {
        let hex_part = match self.state {
            HasherState::Sha256(hasher) => hex::encode(hasher.finalize()),
            HasherState::Sha512(hasher) => hex::encode(hasher.finalize()),
        };
        format!("{}:{}", self.algorithm.name(), hex_part)
    }
}
