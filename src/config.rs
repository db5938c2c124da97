//! Configuration management for export runs

use crate::error::{RegistryError, Result};
use crate::image::manifest::Platform;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Registry credentials supplied by the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

impl AuthConfig {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }

    /// Build credentials from optional CLI values; both or neither must be present
    pub fn from_parts(username: Option<String>, password: Option<String>) -> Result<Option<Self>> {
        match (username, password) {
            (Some(username), Some(password)) => {
                let auth = Self::new(username, password);
                auth.validate()?;
                Ok(Some(auth))
            }
            (None, None) => Ok(None),
            (Some(_), None) => Err(RegistryError::Validation(
                "Password is required when username is provided".to_string(),
            )),
            (None, Some(_)) => Err(RegistryError::Validation(
                "Username is required when password is provided".to_string(),
            )),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.username.is_empty() {
            return Err(RegistryError::Validation(
                "Username cannot be empty".to_string(),
            ));
        }
        if self.password.is_empty() {
            return Err(RegistryError::Validation(
                "Password cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings for one export run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Capacity of the transport gate
    pub max_concurrent: usize,
    /// Download attempts per blob before an integrity failure is final
    pub retry_attempts: u32,
    pub timeout_secs: u64,
    pub skip_tls: bool,
    pub platform: Platform,
    /// Where per-run scratch directories are created (system temp dir if unset)
    pub temp_dir: Option<PathBuf>,
    pub verbose: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            retry_attempts: 3,
            timeout_secs: 300,
            skip_tls: false,
            platform: Platform::default(),
            temp_dir: None,
            verbose: false,
        }
    }
}

impl ExportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(RegistryError::Validation(
                "max_concurrent must be greater than 0".to_string(),
            ));
        }
        if self.retry_attempts == 0 {
            return Err(RegistryError::Validation(
                "retry_attempts must be greater than 0".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(RegistryError::Validation(
                "timeout must be greater than 0".to_string(),
            ));
        }
        if self.timeout_secs > 86400 {
            return Err(RegistryError::Validation(
                "timeout cannot exceed 24 hours (86400 seconds)".to_string(),
            ));
        }
        Ok(())
    }

    /// Create config from environment variables and defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from an arbitrary key lookup; unparsable values keep the default
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("IMAGE_EXPORTER_MAX_CONCURRENT").and_then(|v| v.parse().ok()) {
            config.max_concurrent = value;
        }
        if let Some(value) = lookup("IMAGE_EXPORTER_RETRY").and_then(|v| v.parse().ok()) {
            config.retry_attempts = value;
        }
        if let Some(value) = lookup("IMAGE_EXPORTER_TIMEOUT").and_then(|v| v.parse().ok()) {
            config.timeout_secs = value;
        }
        if let Some(value) = lookup("IMAGE_EXPORTER_PLATFORM").and_then(|v| v.parse().ok()) {
            config.platform = value;
        }
        if let Some(value) = lookup("IMAGE_EXPORTER_TMPDIR").filter(|v| !v.is_empty()) {
            config.temp_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("IMAGE_EXPORTER_VERBOSE") {
            config.verbose = value.to_lowercase() == "true" || value == "1";
        }

        config
    }

    /// Merge with another config, preferring non-default values
    pub fn merge(mut self, other: &ExportConfig) -> Self {
        let default = ExportConfig::default();

        if other.max_concurrent != default.max_concurrent {
            self.max_concurrent = other.max_concurrent;
        }
        if other.retry_attempts != default.retry_attempts {
            self.retry_attempts = other.retry_attempts;
        }
        if other.timeout_secs != default.timeout_secs {
            self.timeout_secs = other.timeout_secs;
        }
        if other.skip_tls != default.skip_tls {
            self.skip_tls = other.skip_tls;
        }
        if other.platform != default.platform {
            self.platform = other.platform.clone();
        }
        if other.temp_dir.is_some() {
            self.temp_dir = other.temp_dir.clone();
        }
        if other.verbose != default.verbose {
            self.verbose = other.verbose;
        }

        self
    }
}
