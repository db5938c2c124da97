//! Image reference parsing
//!
//! Turns user input such as `busybox`, `ghcr.io/org/app:1.2` or
//! `registry.local:5000/team/app@sha256:...` into the normalized
//! registry/repository/reference triple the exporter works with.

use crate::error::{RegistryError, Result};
use crate::image::digest::DigestUtils;
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_REGISTRY: &str = "registry-1.docker.io";
pub const DEFAULT_TAG: &str = "latest";

const DOCKER_HUB_ALIASES: [&str; 3] = [DEFAULT_REGISTRY, "docker.io", "index.docker.io"];

/// Fully qualified image reference; exactly one of `tag`/`digest` is set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    /// Reference pinned to a tag
    pub fn with_tag(registry: &str, repository: &str, tag: &str) -> Result<Self> {
        let reference = Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag: Some(tag.to_string()),
            digest: None,
        };
        reference.validate()?;
        Ok(reference)
    }

    /// Reference pinned to a content digest
    pub fn with_digest(registry: &str, repository: &str, digest: &str) -> Result<Self> {
        let reference = Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag: None,
            digest: Some(digest.to_string()),
        };
        reference.validate()?;
        Ok(reference)
    }

    /// Parse an image string, using `default_registry` when none is named
    pub fn parse_with_registry(image: &str, default_registry: &str) -> Result<Self> {
        let image = image.trim();
        if image.is_empty() {
            return Err(RegistryError::Validation(
                "Image reference cannot be empty".to_string(),
            ));
        }

        let (name, digest) = match image.split_once('@') {
            Some((name, digest)) => (name, Some(digest)),
            None => (image, None),
        };

        // A colon after the last slash separates the tag; earlier ones belong to a registry port
        let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name[last_slash..].rfind(':') {
            Some(pos) => (&name[..last_slash + pos], Some(&name[last_slash + pos + 1..])),
            None => (name, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest)) if Self::looks_like_registry(first) => (first, rest.to_string()),
            _ => (default_registry, name.to_string()),
        };

        let repository = if Self::is_docker_hub_host(registry) && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };
        let registry = if Self::is_docker_hub_host(registry) {
            DEFAULT_REGISTRY
        } else {
            registry
        };

        match (tag, digest) {
            (_, Some(digest)) => Self::with_digest(registry, &repository, digest),
            (Some(tag), None) => Self::with_tag(registry, &repository, tag),
            (None, None) => Self::with_tag(registry, &repository, DEFAULT_TAG),
        }
    }

    fn looks_like_registry(component: &str) -> bool {
        component.contains('.') || component.contains(':') || component == "localhost"
    }

    fn is_docker_hub_host(registry: &str) -> bool {
        DOCKER_HUB_ALIASES.contains(&registry)
    }

    pub fn validate(&self) -> Result<()> {
        if self.registry.is_empty() {
            return Err(RegistryError::Validation(
                "Registry cannot be empty".to_string(),
            ));
        }
        if self.repository.is_empty()
            || self.repository.starts_with('/')
            || self.repository.ends_with('/')
            || self.repository.contains("//")
        {
            return Err(RegistryError::Validation(format!(
                "Invalid repository name '{}'",
                self.repository
            )));
        }
        if self.repository.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(RegistryError::Validation(format!(
                "Repository name must be lowercase: {}",
                self.repository
            )));
        }

        match (&self.tag, &self.digest) {
            (Some(tag), None) => {
                let valid = !tag.is_empty()
                    && tag.len() <= 128
                    && tag
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
                if !valid {
                    return Err(RegistryError::Validation(format!("Invalid tag '{}'", tag)));
                }
                Ok(())
            }
            (None, Some(digest)) => {
                DigestUtils::parse(digest)?;
                Ok(())
            }
            _ => Err(RegistryError::Validation(
                "Exactly one of tag or digest must be set".to_string(),
            )),
        }
    }

    /// Tag or digest, whichever addresses the manifest
    pub fn reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Base URL of the registry API; https unless a scheme is given explicitly
    pub fn base_url(&self) -> String {
        if self.registry.starts_with("http://") || self.registry.starts_with("https://") {
            self.registry.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", self.registry)
        }
    }

    /// Image name as `docker load` should tag it
    pub fn repository_name(&self) -> String {
        if Self::is_docker_hub_host(&self.registry) {
            self.repository
                .strip_prefix("library/")
                .unwrap_or(&self.repository)
                .to_string()
        } else {
            let host = self
                .registry
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/');
            format!("{}/{}", host, self.repository)
        }
    }

    /// `name:tag` written into the archive, absent for digest references
    pub fn repo_tag(&self) -> Option<String> {
        self.tag
            .as_ref()
            .map(|tag| format!("{}:{}", self.repository_name(), tag))
    }

    /// Default archive file name, `<name>_<tag>.tar`
    pub fn archive_file_name(&self) -> String {
        let name = self
            .repository
            .rsplit('/')
            .next()
            .unwrap_or(&self.repository);
        let suffix = match (&self.tag, &self.digest) {
            (Some(tag), _) => tag.clone(),
            (None, Some(digest)) => DigestUtils::extract_hex_part(digest)
                .map(|hex_part| hex_part[..12].to_string())
                .unwrap_or_else(|_| "image".to_string()),
            (None, None) => DEFAULT_TAG.to_string(),
        };
        format!("{}_{}.tar", name, suffix)
    }
}

impl FromStr for ImageReference {
    type Err = RegistryError;

    fn from_str(image: &str) -> Result<Self> {
        Self::parse_with_registry(image, DEFAULT_REGISTRY)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        match (&self.tag, &self.digest) {
            (_, Some(digest)) => write!(f, "@{}", digest),
            (Some(tag), None) => write!(f, ":{}", tag),
            (None, None) => Ok(()),
        }
    }
}
