//! Image data model and archive production
//!
//! Manifest and digest types shared with the registry layer, the docker archive writer,
//! and the [`ImageExporter`] that drives a whole export.

pub mod archive;
pub mod digest;
pub mod exporter;
pub mod manifest;

pub use archive::{ArchiveManifestEntry, ArchiveSummary, ArchiveTag, TarAssembler};
pub use digest::DigestUtils;
pub use exporter::{ExportRequest, ExportSummary, ImageExporter};
pub use manifest::{BlobDescriptor, Manifest, ManifestList, ManifestType, Platform};
