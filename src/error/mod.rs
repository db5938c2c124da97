//! Error types and handlers for registry export operations

pub mod handlers;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// Connection failures and timeouts; the caller may retry the whole export
    #[error("Network error: {0}")]
    Network(String),

    /// Malformed challenge, rejected credentials or an unusable token response
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Manifest request answered with a non-2xx status or an undecodable body
    #[error("Failed to fetch manifest for {repository}:{reference} (status {status}): {message}")]
    ManifestFetch {
        status: u16,
        repository: String,
        reference: String,
        message: String,
    },

    /// Manifest list without an entry for the requested platform
    #[error("No manifest for platform {platform} in {repository}:{reference} (available: {available})")]
    NoMatchingPlatform {
        repository: String,
        reference: String,
        platform: String,
        available: String,
    },

    /// Blob request answered with a non-2xx status
    #[error("Failed to fetch blob {digest} (status {status}): {message}")]
    BlobFetch {
        status: u16,
        digest: String,
        message: String,
    },

    /// Downloaded content never matched the expected digest
    #[error("Blob {digest} failed integrity verification after {attempts} attempt(s)")]
    BlobIntegrity { digest: String, attempts: u32 },

    /// Disk or IO failure while writing the output archive
    #[error("Archive write error: {0}")]
    ArchiveWrite(String),

    /// Invalid caller input (reference, platform, configuration)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Undecodable JSON outside of the manifest path
    #[error("Parse error: {0}")]
    Parse(String),

    /// Temporary storage failures outside archive assembly
    #[error("IO error: {0}")]
    Io(String),
}

impl RegistryError {
    /// Only transport-level failures are worth retrying from the outside
    pub fn is_retryable(&self) -> bool {
        matches!(self, RegistryError::Network(_))
    }

    /// Process exit code used by the command line front end
    pub fn exit_code(&self) -> i32 {
        match self {
            RegistryError::Validation(_) => 2,
            RegistryError::Network(_) => 3,
            RegistryError::Auth(_) => 4,
            RegistryError::ManifestFetch { .. } | RegistryError::Parse(_) => 5,
            RegistryError::NoMatchingPlatform { .. } => 6,
            RegistryError::BlobIntegrity { .. } => 7,
            RegistryError::ArchiveWrite(_) | RegistryError::Io(_) => 8,
            RegistryError::BlobFetch { .. } => 9,
        }
    }
}

impl From<std::io::Error> for RegistryError {
    fn from(err: std::io::Error) -> Self {
        RegistryError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        RegistryError::Network(err.to_string())
    }
}

impl From<url::ParseError> for RegistryError {
    fn from(err: url::ParseError) -> Self {
        RegistryError::Validation(err.to_string())
    }
}
