//! Manifest data model and media type handling
//!
//! A registry answers a manifest request with either a single-platform image manifest
//! or a manifest list (OCI index). The two are told apart by reading `schemaVersion`
//! and `mediaType` first; only then is the body decoded into the matching type.

use crate::error::{RegistryError, Result};
use crate::image::digest::DigestUtils;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const DOCKER_MANIFEST_V1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";

/// Accept header for manifest requests, single manifests first, lists as fallback
pub fn manifest_accept_header() -> String {
    [DOCKER_MANIFEST_V2, OCI_MANIFEST, DOCKER_MANIFEST_LIST, OCI_INDEX].join(", ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestType {
    DockerV2,
    DockerList,
    OciManifest,
    OciIndex,
}

impl ManifestType {
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        // Content-Type may carry parameters such as charset
        let media_type = media_type.split(';').next().unwrap_or_default().trim();
        match media_type {
            DOCKER_MANIFEST_V2 => Some(ManifestType::DockerV2),
            DOCKER_MANIFEST_LIST => Some(ManifestType::DockerList),
            OCI_MANIFEST => Some(ManifestType::OciManifest),
            OCI_INDEX => Some(ManifestType::OciIndex),
            _ => None,
        }
    }

    pub fn media_type(&self) -> &'static str {
        match self {
            ManifestType::DockerV2 => DOCKER_MANIFEST_V2,
            ManifestType::DockerList => DOCKER_MANIFEST_LIST,
            ManifestType::OciManifest => OCI_MANIFEST,
            ManifestType::OciIndex => OCI_INDEX,
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, ManifestType::DockerList | ManifestType::OciIndex)
    }
}

/// Content-addressed reference to a blob
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobDescriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

impl BlobDescriptor {
    pub fn new(media_type: impl Into<String>, digest: impl Into<String>, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest.into(),
            size,
        }
    }
}

/// Single-platform image manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    pub config: BlobDescriptor,
    #[serde(default)]
    pub layers: Vec<BlobDescriptor>,
}

impl Manifest {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.schema_version != 2 {
            return Err(format!(
                "Unsupported schema version {}",
                self.schema_version
            ));
        }
        if self.layers.is_empty() {
            return Err("Manifest must contain at least one layer".to_string());
        }
        for descriptor in std::iter::once(&self.config).chain(self.layers.iter()) {
            if !DigestUtils::is_valid_digest(&descriptor.digest) {
                return Err(format!("Invalid blob digest '{}'", descriptor.digest));
            }
        }
        Ok(())
    }

    /// Config blob followed by the distinct layer blobs, in manifest order
    pub fn unique_blobs(&self) -> Vec<BlobDescriptor> {
        let mut blobs: Vec<BlobDescriptor> = Vec::with_capacity(self.layers.len() + 1);
        for descriptor in std::iter::once(&self.config).chain(self.layers.iter()) {
            if !blobs.iter().any(|known| known.digest == descriptor.digest) {
                blobs.push(descriptor.clone());
            }
        }
        blobs
    }
}

/// Target operating system and CPU architecture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Default for Platform {
    fn default() -> Self {
        Self::new("linux", "amd64")
    }
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
            variant: None,
        }
    }

    /// Whether a manifest list entry's platform satisfies this target.
    /// A target without variant accepts any variant.
    pub fn matches(&self, candidate: &Platform) -> bool {
        self.os == candidate.os
            && self.architecture == candidate.architecture
            && match &self.variant {
                Some(variant) => candidate.variant.as_ref() == Some(variant),
                None => true,
            }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

impl FromStr for Platform {
    type Err = RegistryError;

    fn from_str(value: &str) -> Result<Self> {
        let parts: Vec<&str> = value.split('/').collect();
        let invalid = || {
            RegistryError::Validation(format!(
                "Invalid platform '{}', expected os/architecture[/variant]",
                value
            ))
        };
        if parts.iter().any(|part| part.is_empty()) {
            return Err(invalid());
        }
        match parts.as_slice() {
            [os, architecture] => Ok(Platform::new(*os, *architecture)),
            [os, architecture, variant] => Ok(Platform {
                variant: Some(variant.to_string()),
                ..Platform::new(*os, *architecture)
            }),
            _ => Err(invalid()),
        }
    }
}

/// One platform-specific entry of a manifest list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    #[serde(default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub platform: Option<Platform>,
}

/// Multi-platform manifest list or OCI index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestList {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    pub manifests: Vec<ManifestEntry>,
}

impl ManifestList {
    /// First entry whose platform satisfies `target`
    pub fn select(&self, target: &Platform) -> Option<&ManifestEntry> {
        self.manifests.iter().find(|entry| {
            entry
                .platform
                .as_ref()
                .is_some_and(|platform| target.matches(platform))
        })
    }

    /// Comma separated platforms for error messages
    pub fn available_platforms(&self) -> String {
        let platforms: Vec<String> = self
            .manifests
            .iter()
            .filter_map(|entry| entry.platform.as_ref().map(|p| p.to_string()))
            .collect();
        if platforms.is_empty() {
            "none".to_string()
        } else {
            platforms.join(", ")
        }
    }
}

/// Decoded manifest response
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedManifest {
    Single(Manifest),
    List(ManifestList),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestHeader {
    schema_version: u32,
    #[serde(default)]
    media_type: Option<String>,
}

/// Read the discriminating fields of a manifest body without decoding the rest.
/// The body's `mediaType` wins over the response Content-Type.
pub fn detect_manifest_type(
    data: &[u8],
    content_type: Option<&str>,
) -> std::result::Result<ManifestType, String> {
    let header: ManifestHeader = serde_json::from_slice(data)
        .map_err(|e| format!("Manifest body is not a manifest document: {}", e))?;

    if header.schema_version == 1 {
        return Err("Schema 1 manifests are not supported".to_string());
    }
    if header.schema_version != 2 {
        return Err(format!(
            "Unsupported schema version {}",
            header.schema_version
        ));
    }

    let media_type = header
        .media_type
        .as_deref()
        .filter(|media_type| !media_type.is_empty())
        .or(content_type)
        .ok_or_else(|| "Manifest declares no media type".to_string())?;

    ManifestType::from_media_type(media_type)
        .ok_or_else(|| format!("Unsupported manifest media type '{}'", media_type))
}

/// Peek the manifest type, then decode into the matching variant
pub fn parse_manifest(
    data: &[u8],
    content_type: Option<&str>,
) -> std::result::Result<(ManifestType, ParsedManifest), String> {
    let manifest_type = detect_manifest_type(data, content_type)?;

    let parsed = if manifest_type.is_list() {
        let mut list: ManifestList = serde_json::from_slice(data)
            .map_err(|e| format!("Malformed manifest list: {}", e))?;
        if list.media_type.is_empty() {
            list.media_type = manifest_type.media_type().to_string();
        }
        ParsedManifest::List(list)
    } else {
        let mut manifest: Manifest = serde_json::from_slice(data)
            .map_err(|e| format!("Malformed image manifest: {}", e))?;
        if manifest.media_type.is_empty() {
            manifest.media_type = manifest_type.media_type().to_string();
        }
        manifest.validate()?;
        ParsedManifest::Single(manifest)
    };

    Ok((manifest_type, parsed))
}
