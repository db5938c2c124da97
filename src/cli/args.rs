//! Command-line argument parsing

use crate::config::{AuthConfig, ExportConfig};
use crate::error::{RegistryError, Result};
use crate::image::manifest::Platform;
use crate::reference::{DEFAULT_REGISTRY, ImageReference};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "docker-image-exporter")]
#[command(about = "Export an image from a Docker/OCI registry into a docker-loadable tar archive")]
#[command(version)]
pub struct Args {
    /// Image to export, e.g. `busybox`, `ghcr.io/org/app:1.2` or `repo@sha256:...`
    pub image: String,

    /// Registry used when the image names none
    #[arg(long = "registry", default_value = DEFAULT_REGISTRY)]
    pub registry: String,

    /// Tag to export, overriding any tag in IMAGE
    #[arg(long = "tag")]
    pub tag: Option<String>,

    /// Registry username
    #[arg(long = "username", short = 'u', requires = "password")]
    pub username: Option<String>,

    /// Registry password
    #[arg(long = "password", short = 'p', requires = "username")]
    pub password: Option<String>,

    /// Output archive path (default: <name>_<tag>.tar)
    #[arg(long = "output", short = 'o')]
    pub output: Option<PathBuf>,

    /// Platform to select from multi-platform images
    #[arg(long = "platform", default_value = "linux/amd64")]
    pub platform: String,

    /// Maximum concurrent registry requests
    #[arg(long = "concurrency", short = 'j', default_value = "4")]
    pub concurrency: usize,

    /// Download attempts per blob when content fails verification
    #[arg(long = "retry", default_value = "3")]
    pub retry: u32,

    /// Read timeout for network operations in seconds
    #[arg(long = "timeout", default_value = "300")]
    pub timeout: u64,

    /// Skip TLS certificate verification
    #[arg(long = "skip-tls", short = 'k')]
    pub skip_tls: bool,

    /// Enable verbose output
    #[arg(long = "verbose", short = 'v', conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only print warnings and errors
    #[arg(long = "quiet", short = 'q')]
    pub quiet: bool,
}

impl Args {
    pub fn parse_args() -> Self {
        Args::parse()
    }

    /// Normalized image reference, with `--tag` applied
    pub fn image_reference(&self) -> Result<ImageReference> {
        let reference = ImageReference::parse_with_registry(&self.image, &self.registry)?;
        match &self.tag {
            Some(tag) => ImageReference::with_tag(&reference.registry, &reference.repository, tag),
            None => Ok(reference),
        }
    }

    pub fn auth_config(&self) -> Result<Option<AuthConfig>> {
        AuthConfig::from_parts(self.username.clone(), self.password.clone())
    }

    /// Settings from the command line, layered over `IMAGE_EXPORTER_*` variables
    pub fn export_config(&self, environment: ExportConfig) -> Result<ExportConfig> {
        let platform: Platform = self.platform.parse()?;
        let from_args = ExportConfig {
            max_concurrent: self.concurrency,
            retry_attempts: self.retry,
            timeout_secs: self.timeout,
            skip_tls: self.skip_tls,
            platform,
            temp_dir: None,
            verbose: self.verbose,
        };
        let config = environment.merge(&from_args);
        config.validate()?;
        Ok(config)
    }

    pub fn output_path(&self, reference: &ImageReference) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| PathBuf::from(reference.archive_file_name()))
    }

    /// Validate arguments that clap cannot check on its own
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(RegistryError::Validation(
                "Concurrency must be greater than 0".to_string(),
            ));
        }
        if self.retry == 0 {
            return Err(RegistryError::Validation(
                "Retry attempts must be greater than 0".to_string(),
            ));
        }
        if let Some(output) = &self.output {
            if output.is_dir() {
                return Err(RegistryError::Validation(format!(
                    "Output path is a directory: {}",
                    output.display()
                )));
            }
        }
        Ok(())
    }
}
