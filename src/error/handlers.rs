//! Standardized error construction for registry responses and transport failures

use crate::error::RegistryError;

/// Builds errors for non-success registry statuses
pub struct HttpErrorHandler;

impl HttpErrorHandler {
    /// Human readable explanation of a registry status for a given operation
    pub fn describe_status(status: u16, error_text: &str, operation: &str) -> String {
        let error_text = Self::trim_body(error_text);
        match status {
            401 => format!("Unauthorized to perform {}: {}", operation, error_text),
            403 => format!(
                "Forbidden: insufficient permissions for {}: {}",
                operation, error_text
            ),
            404 => format!("Resource not found for {}: {}", operation, error_text),
            429 => format!("Rate limited during {}: {}", operation, error_text),
            500 => format!("Registry server error during {}: {}", operation, error_text),
            502 | 503 => format!("Registry unavailable for {}: {}", operation, error_text),
            _ => format!("{} failed (status {}): {}", operation, status, error_text),
        }
    }

    /// Error for a failed manifest request
    pub fn handle_manifest_error(
        status: u16,
        error_text: &str,
        repository: &str,
        reference: &str,
    ) -> RegistryError {
        RegistryError::ManifestFetch {
            status,
            repository: repository.to_string(),
            reference: reference.to_string(),
            message: Self::describe_status(status, error_text, "manifest fetch"),
        }
    }

    /// Error for a failed token exchange
    pub fn handle_auth_error(status: u16, error_text: &str) -> RegistryError {
        let error_msg = match status {
            400 => "Invalid token request parameters".to_string(),
            401 => "Invalid credentials provided".to_string(),
            403 => "Access denied - insufficient permissions".to_string(),
            404 => "Authentication endpoint not found".to_string(),
            _ => format!(
                "Authentication failed (status {}): {}",
                status,
                Self::trim_body(error_text)
            ),
        };

        RegistryError::Auth(error_msg)
    }

    /// Error for a failed blob download
    pub fn handle_blob_error(status: u16, error_text: &str, digest: &str) -> RegistryError {
        RegistryError::BlobFetch {
            status,
            digest: digest.to_string(),
            message: Self::describe_status(status, error_text, "blob download"),
        }
    }

    // Registry error bodies can be whole HTML pages
    fn trim_body(error_text: &str) -> &str {
        let trimmed = error_text.trim();
        match trimmed.char_indices().nth(512) {
            Some((idx, _)) => &trimmed[..idx],
            None => trimmed,
        }
    }
}

/// Network error categorization and handling
pub struct NetworkErrorHandler;

impl NetworkErrorHandler {
    /// Categorize and format network errors with helpful context
    pub fn handle_network_error(error: &reqwest::Error, context: &str) -> RegistryError {
        if error.is_timeout() {
            RegistryError::Network(format!("{} timed out: {}", context, error))
        } else if error.is_connect() {
            RegistryError::Network(format!("Connection error during {}: {}", context, error))
        } else if error.to_string().contains("certificate") {
            RegistryError::Network(format!(
                "TLS certificate error during {}: {}",
                context, error
            ))
        } else {
            RegistryError::Network(format!("{} network error: {}", context, error))
        }
    }
}
