//! Docker archive assembly
//!
//! Writes the layout `docker load` understands:
//!
//! ```text
//! <layer-id>/VERSION
//! <layer-id>/json
//! <layer-id>/layer.tar
//! <config-hex>.json
//! manifest.json
//! repositories
//! ```
//!
//! Compressed layers are expanded to plain tar while their diff id is computed. The
//! archive is staged next to the destination and renamed into place once complete.

use crate::error::{RegistryError, Result};
use crate::image::digest::{DigestAlgorithm, DigestHasher, DigestUtils};
use crate::image::manifest::Manifest;
use crate::logging::Logger;
use crate::registry::blob::FetchedBlob;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};

const LAYER_VERSION: &[u8] = b"1.0";
const EPOCH: &str = "1970-01-01T00:00:00Z";
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Name and tag recorded in `manifest.json` and `repositories`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveTag {
    pub repository: String,
    pub tag: String,
}

impl ArchiveTag {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }

    pub fn repo_tag(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

/// One image entry of `manifest.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ArchiveManifestEntry {
    pub config: String,
    pub repo_tags: Vec<String>,
    pub layers: Vec<String>,
}

/// Result of a completed assembly
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    /// Config digest, which docker uses as the image id
    pub image_id: String,
    /// Layer directory names, base layer first
    pub layer_ids: Vec<String>,
    pub bytes_written: u64,
}

pub struct TarAssembler {
    output: Logger,
}

impl TarAssembler {
    pub fn new(output: Logger) -> Self {
        Self { output }
    }

    /// Write the archive for `manifest` to `output_path`
    ///
    /// Consumes the fetched blobs; their temporary files are removed when assembly ends,
    /// whether it succeeds or not. Nothing exists at `output_path` unless the whole
    /// archive was written.
    pub fn assemble(
        &self,
        manifest: &Manifest,
        blobs: Vec<FetchedBlob>,
        tag: Option<&ArchiveTag>,
        output_path: &Path,
    ) -> Result<ArchiveSummary> {
        manifest.validate().map_err(RegistryError::Validation)?;

        let blobs: HashMap<String, FetchedBlob> = blobs
            .into_iter()
            .map(|blob| (blob.descriptor.digest.clone(), blob))
            .collect();

        let config_blob = Self::blob_for(&blobs, &manifest.config.digest)?;
        let config_bytes = std::fs::read(config_blob.path())
            .map_err(archive_error("Failed to read image config"))?;
        let config: Value = serde_json::from_slice(&config_bytes)
            .map_err(|e| RegistryError::Parse(format!("Image config is not valid JSON: {}", e)))?;
        let config = config.as_object().ok_or_else(|| {
            RegistryError::Parse("Image config is not a JSON object".to_string())
        })?;
        let diff_ids = self.expected_diff_ids(config, manifest.layers.len());
        let config_name = format!(
            "{}.json",
            DigestUtils::extract_hex_part(&manifest.config.digest)?
        );

        let directory = output_path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut staging = tempfile::Builder::new()
            .prefix(".image-export-")
            .suffix(".partial")
            .tempfile_in(directory)
            .map_err(archive_error("Failed to create staging file"))?;

        self.output.step(&format!(
            "Assembling archive with {} layers",
            manifest.layers.len()
        ));

        let layer_ids = {
            let mut builder = Builder::new(BufWriter::new(staging.as_file_mut()));

            let layer_ids = self.append_layers(&mut builder, manifest, &blobs, config, &diff_ids)?;
            append_bytes(&mut builder, &config_name, &config_bytes)?;

            let entry = ArchiveManifestEntry {
                config: config_name.clone(),
                repo_tags: tag.map(ArchiveTag::repo_tag).into_iter().collect(),
                layers: layer_ids.iter().map(|id| format!("{}/layer.tar", id)).collect(),
            };
            append_bytes(&mut builder, "manifest.json", &serde_json::to_vec(&[entry])?)?;

            let mut repositories: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
            if let (Some(tag), Some(top)) = (tag, layer_ids.last()) {
                repositories
                    .entry(tag.repository.clone())
                    .or_default()
                    .insert(tag.tag.clone(), top.clone());
            }
            append_bytes(&mut builder, "repositories", &serde_json::to_vec(&repositories)?)?;

            let mut writer = builder
                .into_inner()
                .map_err(archive_error("Failed to finish archive"))?;
            writer
                .flush()
                .map_err(archive_error("Failed to flush archive"))?;
            layer_ids
        };

        staging
            .as_file()
            .sync_all()
            .map_err(archive_error("Failed to sync archive"))?;
        let bytes_written = staging
            .as_file()
            .metadata()
            .map_err(archive_error("Failed to stat archive"))?
            .len();

        staging.persist(output_path).map_err(|e| {
            RegistryError::ArchiveWrite(format!(
                "Failed to move archive into place at {}: {}",
                output_path.display(),
                e.error
            ))
        })?;

        self.output.success(&format!(
            "Wrote {} ({})",
            output_path.display(),
            self.output.format_size(bytes_written)
        ));

        Ok(ArchiveSummary {
            path: output_path.to_path_buf(),
            image_id: manifest.config.digest.clone(),
            layer_ids,
            bytes_written,
        })
    }

    fn blob_for<'a>(
        blobs: &'a HashMap<String, FetchedBlob>,
        digest: &str,
    ) -> Result<&'a FetchedBlob> {
        blobs.get(digest).ok_or_else(|| {
            RegistryError::ArchiveWrite(format!("Blob {} was not downloaded", digest))
        })
    }

    /// `rootfs.diff_ids` from the config, when it lines up with the manifest layers
    fn expected_diff_ids(&self, config: &Map<String, Value>, layer_count: usize) -> Vec<String> {
        let diff_ids: Vec<String> = config
            .get("rootfs")
            .and_then(|rootfs| rootfs.get("diff_ids"))
            .and_then(|ids| serde_json::from_value(ids.clone()).ok())
            .unwrap_or_default();

        if diff_ids.len() == layer_count {
            diff_ids
        } else {
            if !diff_ids.is_empty() {
                self.output.warning(&format!(
                    "Config lists {} diff ids for {} layers, skipping diff id checks",
                    diff_ids.len(),
                    layer_count
                ));
            }
            Vec::new()
        }
    }

    fn append_layers<W: Write>(
        &self,
        builder: &mut Builder<W>,
        manifest: &Manifest,
        blobs: &HashMap<String, FetchedBlob>,
        config: &Map<String, Value>,
        diff_ids: &[String],
    ) -> Result<Vec<String>> {
        let mut layer_ids: Vec<String> = Vec::with_capacity(manifest.layers.len());
        let top = manifest.layers.len() - 1;

        for (index, layer) in manifest.layers.iter().enumerate() {
            let blob = Self::blob_for(blobs, &layer.digest)?;
            let parent = layer_ids.last().map(String::as_str);
            let id = layer_id(parent, &layer.digest);

            append_directory(builder, &format!("{}/", id))?;
            append_bytes(builder, &format!("{}/VERSION", id), LAYER_VERSION)?;

            let metadata = layer_metadata(&id, parent, (index == top).then_some(config));
            append_bytes(
                builder,
                &format!("{}/json", id),
                &serde_json::to_vec(&metadata)?,
            )?;

            let diff_id = self.append_layer_tar(builder, &format!("{}/layer.tar", id), blob)?;
            if let Some(expected) = diff_ids.get(index) {
                if *expected != diff_id {
                    self.output.error(&format!(
                        "Layer {} expands to {}, config expects {}",
                        layer.digest, diff_id, expected
                    ));
                    return Err(RegistryError::BlobIntegrity {
                        digest: layer.digest.clone(),
                        attempts: 1,
                    });
                }
            }

            self.output.detail(&format!(
                "Added layer {} as {}",
                self.output.short_digest(&layer.digest),
                id
            ));
            layer_ids.push(id);
        }

        Ok(layer_ids)
    }

    /// Append a layer as uncompressed tar, returning its diff id
    fn append_layer_tar<W: Write>(
        &self,
        builder: &mut Builder<W>,
        path: &str,
        blob: &FetchedBlob,
    ) -> Result<String> {
        let mut file = File::open(blob.path()).map_err(archive_error("Failed to open layer"))?;
        let mut magic = [0u8; 4];
        let read =
            read_prefix(&mut file, &mut magic).map_err(archive_error("Failed to read layer"))?;
        file.seek(SeekFrom::Start(0))
            .map_err(archive_error("Failed to rewind layer"))?;
        let magic = &magic[..read];

        if magic.starts_with(&ZSTD_MAGIC) {
            return Err(RegistryError::ArchiveWrite(format!(
                "Layer {} is zstd compressed, which docker archives cannot carry",
                blob.digest()
            )));
        }

        if is_gzip(magic) {
            // Expand into a scratch file first; tar headers need the final size up front
            let scratch_dir = blob.path().parent().unwrap_or_else(|| Path::new("."));
            let mut scratch = tempfile::tempfile_in(scratch_dir)
                .map_err(archive_error("Failed to create scratch file"))?;
            let mut reader = HashingReader::new(GzDecoder::new(BufReader::new(file)));
            let size = io::copy(&mut reader, &mut scratch).map_err(|e| {
                RegistryError::ArchiveWrite(format!(
                    "Failed to decompress layer {}: {}",
                    blob.digest(),
                    e
                ))
            })?;
            scratch
                .seek(SeekFrom::Start(0))
                .map_err(archive_error("Failed to rewind scratch file"))?;
            append_reader(builder, path, size, scratch)?;
            Ok(reader.finalize())
        } else {
            let size = file
                .metadata()
                .map_err(archive_error("Failed to stat layer"))?
                .len();
            let mut reader = HashingReader::new(BufReader::new(file));
            append_reader(builder, path, size, &mut reader)?;
            Ok(reader.finalize())
        }
    }
}

/// Legacy layer id: chained hash of the parent id and the layer digest
pub fn layer_id(parent: Option<&str>, digest: &str) -> String {
    DigestUtils::compute_sha256(format!("{}\n{}\n", parent.unwrap_or_default(), digest).as_bytes())
}

/// Contents of `<layer-id>/json`; the top layer carries the image config
fn layer_metadata(id: &str, parent: Option<&str>, config: Option<&Map<String, Value>>) -> Value {
    let mut metadata = match config {
        Some(config) => {
            let mut merged = config.clone();
            merged.remove("history");
            merged.remove("rootfs");
            merged
        }
        None => {
            let mut empty = Map::new();
            empty.insert("created".to_string(), json!(EPOCH));
            empty.insert(
                "container_config".to_string(),
                json!({
                    "Hostname": "",
                    "Domainname": "",
                    "User": "",
                    "AttachStdin": false,
                    "AttachStdout": false,
                    "AttachStderr": false,
                    "Tty": false,
                    "OpenStdin": false,
                    "StdinOnce": false,
                    "Env": null,
                    "Cmd": null,
                    "Image": "",
                    "Volumes": null,
                    "WorkingDir": "",
                    "Entrypoint": null,
                    "OnBuild": null,
                    "Labels": null
                }),
            );
            empty
        }
    };

    metadata.insert("id".to_string(), json!(id));
    match parent {
        Some(parent) => {
            metadata.insert("parent".to_string(), json!(parent));
        }
        None => {
            metadata.remove("parent");
        }
    }
    Value::Object(metadata)
}

/// Paths and sizes of every entry in a tar file
pub fn list_entries(path: &Path) -> Result<Vec<(String, u64)>> {
    let file = File::open(path)?;
    let mut archive = Archive::new(file);
    let mut entries = Vec::new();

    for entry in archive.entries()? {
        let entry = entry?;
        let name = entry.path()?.to_string_lossy().to_string();
        let size = entry.header().size()?;
        entries.push((name, size));
    }

    Ok(entries)
}

/// Check if data appears to be gzip compressed
pub fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

fn archive_error(context: &'static str) -> impl Fn(io::Error) -> RegistryError {
    move |e| RegistryError::ArchiveWrite(format!("{}: {}", context, e))
}

fn read_prefix(file: &mut File, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match file.read(&mut buffer[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

fn file_header(size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_entry_type(EntryType::Regular);
    header
}

fn append_bytes<W: Write>(builder: &mut Builder<W>, path: &str, data: &[u8]) -> Result<()> {
    append_reader(builder, path, data.len() as u64, data)
}

fn append_reader<W: Write, R: Read>(
    builder: &mut Builder<W>,
    path: &str,
    size: u64,
    reader: R,
) -> Result<()> {
    let mut header = file_header(size);
    builder.append_data(&mut header, path, reader).map_err(|e| {
        RegistryError::ArchiveWrite(format!("Failed to add {} to archive: {}", path, e))
    })
}

fn append_directory<W: Write>(builder: &mut Builder<W>, path: &str) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_size(0);
    header.set_mode(0o755);
    header.set_mtime(0);
    header.set_entry_type(EntryType::Directory);
    builder
        .append_data(&mut header, path, io::empty())
        .map_err(|e| {
            RegistryError::ArchiveWrite(format!("Failed to add {} to archive: {}", path, e))
        })
}

/// Reader that hashes everything passing through it
struct HashingReader<R> {
    inner: R,
    hasher: DigestHasher,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: DigestHasher::new(DigestAlgorithm::Sha256),
        }
    }

    fn finalize(self) -> String {
        self.hasher.finalize()
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.hasher.update(&buf[..read]);
        Ok(read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::manifest::BlobDescriptor;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    #[test]
    fn test_layer_ids_chain() {
        let digest = format!("sha256:{}", "1".repeat(64));
        let base = layer_id(None, &digest);
        assert_eq!(
            base,
            DigestUtils::compute_sha256(format!("\n{}\n", digest).as_bytes())
        );
        let child = layer_id(Some(&base), &digest);
        assert_ne!(base, child);
        assert_eq!(child.len(), 64);
    }

    #[test]
    fn test_top_layer_metadata_merges_config() {
        let config = json!({
            "architecture": "amd64",
            "config": {"Cmd": ["sh"]},
            "history": [{"created_by": "x"}],
            "rootfs": {"type": "layers", "diff_ids": []}
        });
        let config = config.as_object().unwrap();

        let top = layer_metadata("abc", Some("parent"), Some(config));
        assert_eq!(top["id"], "abc");
        assert_eq!(top["parent"], "parent");
        assert_eq!(top["architecture"], "amd64");
        assert!(top.get("history").is_none());
        assert!(top.get("rootfs").is_none());

        let base = layer_metadata("def", None, None);
        assert_eq!(base["created"], EPOCH);
        assert!(base.get("parent").is_none());
        assert!(base["container_config"].is_object());
    }

    #[test]
    fn test_hashing_reader_matches_digest() {
        let mut reader = HashingReader::new(&b"hello world"[..]);
        let mut sink = Vec::new();
        io::copy(&mut reader, &mut sink).unwrap();
        assert_eq!(
            reader.finalize(),
            DigestUtils::compute_docker_digest(b"hello world")
        );
    }

    #[test]
    fn test_is_gzip() {
        assert!(is_gzip(&[0x1f, 0x8b, 0x08]));
        assert!(!is_gzip(&[0x1f]));
        assert!(!is_gzip(b"ustar"));
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        work: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let work = dir.path().join("work");
            std::fs::create_dir(&work).unwrap();
            Self { _dir: dir, work }
        }

        fn blob(&self, media_type: &str, data: &[u8]) -> FetchedBlob {
            let digest = DigestUtils::compute_docker_digest(data);
            let mut file = tempfile::NamedTempFile::new_in(&self.work).unwrap();
            file.write_all(data).unwrap();
            FetchedBlob::new(
                BlobDescriptor::new(media_type, digest, data.len() as u64),
                file.into_temp_path(),
            )
        }

        fn output(&self) -> PathBuf {
            self._dir.path().join("image.tar")
        }
    }

    fn layer_tar(name: &str, content: &[u8]) -> Vec<u8> {
        let mut builder = Builder::new(Vec::new());
        append_bytes(&mut builder, name, content).unwrap();
        builder.into_inner().unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn read_entry(archive: &Path, name: &str) -> Vec<u8> {
        let mut archive = Archive::new(File::open(archive).unwrap());
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap().to_string_lossy() == name {
                let mut data = Vec::new();
                entry.read_to_end(&mut data).unwrap();
                return data;
            }
        }
        panic!("entry {} not found", name);
    }

    #[test]
    fn test_assemble_writes_docker_layout() {
        let fixture = Fixture::new();
        let plain = layer_tar("etc/hostname", b"box\n");
        let compressed_source = layer_tar("bin/sh", b"#!/bin/sh\n");
        let compressed = gzip(&compressed_source);

        let config = json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": {
                "type": "layers",
                "diff_ids": [
                    DigestUtils::compute_docker_digest(&plain),
                    DigestUtils::compute_docker_digest(&compressed_source)
                ]
            }
        })
        .to_string();

        let config_blob = fixture.blob("application/vnd.docker.container.image.v1+json", config.as_bytes());
        let plain_blob = fixture.blob("application/vnd.docker.image.rootfs.diff.tar", &plain);
        let gz_blob = fixture.blob("application/vnd.docker.image.rootfs.diff.tar.gzip", &compressed);

        let manifest = Manifest {
            schema_version: 2,
            media_type: crate::image::manifest::DOCKER_MANIFEST_V2.to_string(),
            config: config_blob.descriptor.clone(),
            layers: vec![plain_blob.descriptor.clone(), gz_blob.descriptor.clone()],
        };

        let tag = ArchiveTag::new("team/app", "v1");
        let output = fixture.output();
        let summary = TarAssembler::new(Logger::new_quiet())
            .assemble(&manifest, vec![config_blob, plain_blob, gz_blob], Some(&tag), &output)
            .unwrap();

        assert_eq!(summary.layer_ids.len(), 2);
        assert_eq!(summary.image_id, manifest.config.digest);
        assert_eq!(std::fs::read_dir(&fixture.work).unwrap().count(), 0);

        let names: Vec<String> = list_entries(&output).unwrap().into_iter().map(|(n, _)| n).collect();
        let config_name = format!("{}.json", DigestUtils::extract_hex_part(&manifest.config.digest).unwrap());
        assert!(names.contains(&config_name));
        assert!(names.contains(&"manifest.json".to_string()));
        assert!(names.contains(&"repositories".to_string()));
        for id in &summary.layer_ids {
            assert!(names.contains(&format!("{}/VERSION", id)));
            assert!(names.contains(&format!("{}/json", id)));
            assert!(names.contains(&format!("{}/layer.tar", id)));
        }

        let entries: Vec<ArchiveManifestEntry> =
            serde_json::from_slice(&read_entry(&output, "manifest.json")).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].config, config_name);
        assert_eq!(entries[0].repo_tags, vec!["team/app:v1".to_string()]);
        assert_eq!(
            entries[0].layers,
            summary
                .layer_ids
                .iter()
                .map(|id| format!("{}/layer.tar", id))
                .collect::<Vec<_>>()
        );

        let top = &summary.layer_ids[1];
        assert_eq!(
            read_entry(&output, &format!("{}/layer.tar", top)),
            compressed_source
        );
        assert_eq!(read_entry(&output, &config_name), config.as_bytes());

        let repositories: Value = serde_json::from_slice(&read_entry(&output, "repositories")).unwrap();
        assert_eq!(repositories["team/app"]["v1"], json!(top));
    }

    #[test]
    fn test_untagged_archive_has_empty_tags() {
        let fixture = Fixture::new();
        let layer = layer_tar("a", b"a");
        let config_blob = fixture.blob("application/vnd.oci.image.config.v1+json", b"{}");
        let layer_blob = fixture.blob("application/vnd.oci.image.layer.v1.tar", &layer);
        let manifest = Manifest {
            schema_version: 2,
            media_type: crate::image::manifest::OCI_MANIFEST.to_string(),
            config: config_blob.descriptor.clone(),
            layers: vec![layer_blob.descriptor.clone()],
        };

        let output = fixture.output();
        TarAssembler::new(Logger::new_quiet())
            .assemble(&manifest, vec![config_blob, layer_blob], None, &output)
            .unwrap();

        let entries: Vec<ArchiveManifestEntry> =
            serde_json::from_slice(&read_entry(&output, "manifest.json")).unwrap();
        assert!(entries[0].repo_tags.is_empty());
        assert_eq!(read_entry(&output, "repositories"), b"{}");
    }

    #[test]
    fn test_diff_id_mismatch_leaves_no_output() {
        let fixture = Fixture::new();
        let layer = layer_tar("a", b"a");
        let config = json!({"rootfs": {"type": "layers", "diff_ids": [format!("sha256:{}", "0".repeat(64))]}})
            .to_string();
        let config_blob = fixture.blob("application/vnd.oci.image.config.v1+json", config.as_bytes());
        let layer_blob = fixture.blob("application/vnd.oci.image.layer.v1.tar", &layer);
        let manifest = Manifest {
            schema_version: 2,
            media_type: crate::image::manifest::OCI_MANIFEST.to_string(),
            config: config_blob.descriptor.clone(),
            layers: vec![layer_blob.descriptor.clone()],
        };

        let output = fixture.output();
        let result = TarAssembler::new(Logger::new_quiet()).assemble(
            &manifest,
            vec![config_blob, layer_blob],
            None,
            &output,
        );
        assert!(matches!(result, Err(RegistryError::BlobIntegrity { .. })));
        assert!(!output.exists());
        let leftovers: Vec<_> = std::fs::read_dir(output.parent().unwrap())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
