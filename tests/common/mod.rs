//! In-process registry used by the export tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use docker_image_exporter::error::Result;
use docker_image_exporter::image::digest::DigestUtils;
use docker_image_exporter::image::manifest::{DOCKER_MANIFEST_LIST, DOCKER_MANIFEST_V2};
use docker_image_exporter::registry::transport::{
    BodyStream, RegistryRequest, RegistryResponse, RegistryTransport,
};
use flate2::Compression;
use flate2::write::GzEncoder;
use futures::stream;
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const REPOSITORY: &str = "team/app";
pub const TOKEN: &str = "abc";

#[derive(Debug, Clone, PartialEq)]
pub enum MockAuth {
    Anonymous,
    Bearer,
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub query: Option<String>,
    pub authorization: Option<String>,
}

/// Counts a request as in flight until its body stream is finished or dropped
struct InFlight {
    current: Arc<AtomicUsize>,
}

impl InFlight {
    fn enter(current: &Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self {
            current: Arc::clone(current),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockRegistry {
    auth: MockAuth,
    manifests: HashMap<String, (String, Vec<u8>)>,
    blobs: HashMap<String, Vec<u8>>,
    delays: HashMap<String, Duration>,
    corrupt: HashSet<String>,
    denied: HashSet<String>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: AtomicUsize,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockRegistry {
    pub fn new(auth: MockAuth) -> Self {
        Self {
            auth,
            manifests: HashMap::new(),
            blobs: HashMap::new(),
            delays: HashMap::new(),
            corrupt: HashSet::new(),
            denied: HashSet::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn add_manifest(&mut self, reference: &str, media_type: &str, body: Vec<u8>) {
        self.manifests
            .insert(reference.to_string(), (media_type.to_string(), body));
    }

    /// Store a blob and return its digest
    pub fn add_blob(&mut self, data: Vec<u8>) -> String {
        let digest = DigestUtils::compute_docker_digest(&data);
        self.blobs.insert(digest.clone(), data);
        digest
    }

    pub fn delay_blob(&mut self, digest: &str, delay: Duration) {
        self.delays.insert(digest.to_string(), delay);
    }

    pub fn corrupt_blob(&mut self, digest: &str) {
        self.corrupt.insert(digest.to_string());
    }

    /// Answer 401 for a manifest reference or blob digest whatever the credential
    pub fn deny(&mut self, reference: &str) {
        self.denied.insert(reference.to_string());
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn blob_requests(&self, digest: &str) -> usize {
        let path = format!("/v2/{}/blobs/{}", REPOSITORY, digest);
        self.requests()
            .iter()
            .filter(|request| request.path == path)
            .count()
    }

    fn respond(
        &self,
        status: u16,
        headers: Vec<(String, String)>,
        data: Vec<u8>,
        delay: Duration,
        guard: InFlight,
    ) -> RegistryResponse {
        let chunks: Vec<Bytes> = data.chunks(512).map(Bytes::copy_from_slice).collect();
        let body: BodyStream = Box::pin(stream::unfold(
            (chunks.into_iter(), guard),
            move |(mut chunks, guard)| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                chunks
                    .next()
                    .map(|chunk| (Ok(chunk), (chunks, guard)))
            },
        ));
        RegistryResponse::new(status, headers, body)
    }
}

#[async_trait]
impl RegistryTransport for MockRegistry {
    async fn get(&self, request: RegistryRequest) -> Result<RegistryResponse> {
        let guard = InFlight::enter(&self.in_flight, &self.peak_in_flight);
        let path = request.url.path().to_string();
        let authorization = request.header_value("authorization").map(str::to_string);
        self.requests.lock().unwrap().push(RecordedRequest {
            path: path.clone(),
            query: request.url.query().map(str::to_string),
            authorization: authorization.clone(),
        });

        let none = Duration::ZERO;

        if path == "/v2/" {
            return Ok(match self.auth {
                MockAuth::Anonymous => self.respond(200, Vec::new(), b"{}".to_vec(), none, guard),
                MockAuth::Bearer => self.respond(
                    401,
                    vec![(
                        "WWW-Authenticate".to_string(),
                        r#"Bearer realm="https://auth.example/token",service="registry.example""#
                            .to_string(),
                    )],
                    Vec::new(),
                    none,
                    guard,
                ),
            });
        }

        if path == "/token" {
            let body = format!(r#"{{"token":"{}","expires_in":300}}"#, TOKEN);
            return Ok(self.respond(200, Vec::new(), body.into_bytes(), none, guard));
        }

        if self.auth == MockAuth::Bearer
            && authorization.as_deref() != Some(format!("Bearer {}", TOKEN).as_str())
        {
            return Ok(self.respond(401, Vec::new(), b"UNAUTHORIZED".to_vec(), none, guard));
        }

        let manifest_prefix = format!("/v2/{}/manifests/", REPOSITORY);
        let blob_prefix = format!("/v2/{}/blobs/", REPOSITORY);

        let target = path
            .strip_prefix(&manifest_prefix)
            .or_else(|| path.strip_prefix(&blob_prefix));
        if target.is_some_and(|target| self.denied.contains(target)) {
            return Ok(self.respond(
                401,
                Vec::new(),
                br#"{"errors":[{"code":"UNAUTHORIZED"}]}"#.to_vec(),
                none,
                guard,
            ));
        }

        if let Some(reference) = path.strip_prefix(&manifest_prefix) {
            return Ok(match self.manifests.get(reference) {
                Some((media_type, body)) => self.respond(
                    200,
                    vec![("Content-Type".to_string(), media_type.clone())],
                    body.clone(),
                    none,
                    guard,
                ),
                None => self.respond(
                    404,
                    Vec::new(),
                    br#"{"errors":[{"code":"MANIFEST_UNKNOWN"}]}"#.to_vec(),
                    none,
                    guard,
                ),
            });
        }

        if let Some(digest) = path.strip_prefix(&blob_prefix) {
            let delay = self.delays.get(digest).copied().unwrap_or(none);
            return Ok(match self.blobs.get(digest) {
                Some(data) => {
                    let mut data = data.clone();
                    if self.corrupt.contains(digest) {
                        data[0] ^= 0xff;
                    }
                    self.respond(200, Vec::new(), data, delay, guard)
                }
                None => self.respond(404, Vec::new(), b"BLOB_UNKNOWN".to_vec(), none, guard),
            });
        }

        Ok(self.respond(404, Vec::new(), Vec::new(), none, guard))
    }
}

pub struct LayerFixture {
    /// Uncompressed layer tar
    pub tar: Vec<u8>,
    /// Digest of the gzip blob served by the registry
    pub digest: String,
    pub size: usize,
}

pub struct ImageFixture {
    pub config_digest: String,
    pub layers: Vec<LayerFixture>,
    pub manifest: Vec<u8>,
    pub manifest_digest: String,
}

pub fn layer_tar(name: &str, content: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, content).unwrap();
    builder.into_inner().unwrap()
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Register a single-platform image whose layers each hold one file
pub fn add_image(registry: &mut MockRegistry, architecture: &str, contents: &[&str]) -> ImageFixture {
    let layers: Vec<LayerFixture> = contents
        .iter()
        .enumerate()
        .map(|(index, content)| {
            let tar = layer_tar(&format!("layer-{}.txt", index), content.as_bytes());
            let compressed = gzip(&tar);
            let size = compressed.len();
            let digest = registry.add_blob(compressed);
            LayerFixture { tar, digest, size }
        })
        .collect();

    let diff_ids: Vec<String> = layers
        .iter()
        .map(|layer| DigestUtils::compute_docker_digest(&layer.tar))
        .collect();
    let config = serde_json::json!({
        "architecture": architecture,
        "os": "linux",
        "config": {"Cmd": ["/bin/sh"]},
        "rootfs": {"type": "layers", "diff_ids": diff_ids},
        "history": [{"created_by": "test"}]
    });
    let config = serde_json::to_vec(&config).unwrap();
    let config_size = config.len();
    let config_digest = registry.add_blob(config);

    let layer_descriptors: Vec<serde_json::Value> = layers
        .iter()
        .map(|layer| {
            serde_json::json!({
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "digest": layer.digest,
                "size": layer.size
            })
        })
        .collect();
    let manifest = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": DOCKER_MANIFEST_V2,
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "digest": config_digest,
            "size": config_size
        },
        "layers": layer_descriptors
    }))
    .unwrap();
    let manifest_digest = DigestUtils::compute_docker_digest(&manifest);
    registry.add_manifest(&manifest_digest, DOCKER_MANIFEST_V2, manifest.clone());

    ImageFixture {
        config_digest,
        layers,
        manifest,
        manifest_digest,
    }
}

/// Manifest list body pointing at per-platform manifests
pub fn manifest_list(entries: &[(&ImageFixture, &str)]) -> Vec<u8> {
    let manifests: Vec<serde_json::Value> = entries
        .iter()
        .map(|(image, architecture)| {
            serde_json::json!({
                "mediaType": DOCKER_MANIFEST_V2,
                "digest": image.manifest_digest,
                "size": image.manifest.len(),
                "platform": {"os": "linux", "architecture": architecture}
            })
        })
        .collect();
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": DOCKER_MANIFEST_LIST,
        "manifests": manifests
    }))
    .unwrap()
}

/// All entries of a tar file by path
pub fn read_archive(path: &Path) -> HashMap<String, Vec<u8>> {
    let mut archive = tar::Archive::new(std::fs::File::open(path).unwrap());
    let mut entries = HashMap::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().to_string_lossy().to_string();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        entries.insert(name, data);
    }
    entries
}
