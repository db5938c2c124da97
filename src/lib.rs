//! Docker Image Exporter Library
//!
//! Pulls an image from a Docker Registry v2 / OCI registry and writes it as a tar archive
//! that `docker load` accepts, without talking to a local daemon.

pub mod cli;
pub mod config;
pub mod error;
pub mod image;
pub mod logging;
pub mod reference;
pub mod registry;

pub use config::{AuthConfig, ExportConfig};
pub use error::{RegistryError, Result};
pub use image::{ExportRequest, ExportSummary, ImageExporter};
pub use logging::Logger;
pub use reference::ImageReference;
