//! Remote-file transports for hola.
//!
//! The `remote_file` resource downloads an artifact and converges the
//! destination file against it. This crate owns the transport side:
//! the [`Fetcher`] trait, scheme dispatch, the HTTPS implementation
//! with conditional requests (ETag / Last-Modified), the cache-state
//! sidecar persisted next to the destination, and SHA-256 checksum
//! helpers.
//!
//! SFTP and S3 are replaceable drivers: embedders register their own
//! [`Fetcher`] for those schemes via [`TransportRegistry::register`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Default connect timeout for network fetches.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default total timeout for network fetches.
pub const TOTAL_TIMEOUT: Duration = Duration::from_secs(120);

/// Suffix of the cache sidecar persisted next to a destination file.
pub const CACHE_SIDECAR_SUFFIX: &str = ".hola.state";

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum FetchError {
    /// No fetcher registered for the URL's scheme.
    #[error("no transport registered for scheme '{0}'")]
    UnsupportedScheme(String),
    /// The server answered with a non-success status.
    #[error("fetch failed with HTTP status {status}: {url}")]
    HttpStatus { status: u16, url: String },
    /// Downloaded bytes did not match the declared checksum.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    /// Anything else (connect error, timeout, I/O).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Credentials the resource carries; each transport picks what it needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportCredentials {
    /// HTTP basic-auth / SFTP user.
    pub remote_user: Option<String>,
    /// HTTP basic-auth / SFTP password.
    pub remote_password: Option<String>,
    /// NTLM-style domain qualifier.
    pub remote_domain: Option<String>,
    /// SFTP private key path.
    pub ssh_private_key: Option<String>,
    /// SFTP public key path.
    pub ssh_public_key: Option<String>,
    /// SFTP known-hosts path.
    pub ssh_known_hosts: Option<String>,
    /// S3 access key.
    pub aws_access_key: Option<String>,
    /// S3 secret key.
    pub aws_secret_key: Option<String>,
    /// S3 region.
    pub aws_region: Option<String>,
    /// S3 endpoint override.
    pub aws_endpoint: Option<String>,
}

/// One fetch: where from, with what validators and credentials.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Source URL.
    pub url: String,
    /// Extra request headers.
    pub headers: BTreeMap<String, String>,
    /// Send `If-None-Match` from the cached validator.
    pub use_etag: bool,
    /// Send `If-Modified-Since` from the cached validator.
    pub use_last_modified: bool,
    /// Validators from the previous successful fetch.
    pub cached: CacheState,
    /// Transport credentials.
    pub credentials: TransportCredentials,
    /// Connect timeout (default 30s).
    pub connect_timeout: Duration,
    /// Total timeout (default 120s).
    pub total_timeout: Duration,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            use_etag: true,
            use_last_modified: true,
            cached: CacheState::default(),
            credentials: TransportCredentials::default(),
            connect_timeout: CONNECT_TIMEOUT,
            total_timeout: TOTAL_TIMEOUT,
        }
    }

    /// The URL's scheme, lowercased (`https`, `sftp`, `s3`, ...).
    pub fn scheme(&self) -> String {
        self.url
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .unwrap_or_default()
    }
}

/// What a fetch produced.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Server says the cached copy is still current.
    NotModified,
    /// Fresh bytes, with validators for the next conditional request.
    Fetched {
        body: Vec<u8>,
        etag: Option<String>,
        last_modified: Option<String>,
    },
}

/// A transport that can resolve a [`FetchRequest`].
pub trait Fetcher: Send + Sync {
    fn fetch(&self, req: &FetchRequest) -> Result<FetchOutcome, FetchError>;
}

/// Scheme → transport dispatch table.
///
/// `http`/`https` are registered out of the box; `sftp` and `s3`
/// resolve only after an embedder registers a driver for them.
pub struct TransportRegistry {
    fetchers: BTreeMap<String, Arc<dyn Fetcher>>,
}

impl Default for TransportRegistry {
    fn default() -> Self {
        let mut registry = Self {
            fetchers: BTreeMap::new(),
        };
        let http = Arc::new(HttpFetcher::new());
        registry.register("http", http.clone());
        registry.register("https", http);
        registry
    }
}

impl TransportRegistry {
    /// Register (or replace) the transport for a scheme.
    pub fn register(&mut self, scheme: &str, fetcher: Arc<dyn Fetcher>) {
        self.fetchers.insert(scheme.to_ascii_lowercase(), fetcher);
    }

    /// Dispatch a request to the transport for its scheme.
    pub fn fetch(&self, req: &FetchRequest) -> Result<FetchOutcome, FetchError> {
        let scheme = req.scheme();
        let fetcher = self
            .fetchers
            .get(&scheme)
            .ok_or(FetchError::UnsupportedScheme(scheme))?;
        fetcher.fetch(req)
    }
}

/// HTTPS transport on a blocking reqwest client.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(TOTAL_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self { client }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, req: &FetchRequest) -> Result<FetchOutcome, FetchError> {
        let mut builder = self.client.get(&req.url).timeout(req.total_timeout);

        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }
        if req.use_etag {
            if let Some(etag) = &req.cached.etag {
                builder = builder.header("If-None-Match", etag);
            }
        }
        if req.use_last_modified {
            if let Some(lm) = &req.cached.last_modified {
                builder = builder.header("If-Modified-Since", lm);
            }
        }
        if let Some(user) = &req.credentials.remote_user {
            let user = match &req.credentials.remote_domain {
                Some(domain) => format!("{domain}\\{user}"),
                None => user.clone(),
            };
            builder = builder.basic_auth(user, req.credentials.remote_password.as_deref());
        }

        let response = builder
            .send()
            .with_context(|| format!("request to {} failed", req.url))?;

        let status = response.status();
        if status.as_u16() == 304 {
            tracing::debug!(url = %req.url, "not modified; keeping cached copy");
            return Ok(FetchOutcome::NotModified);
        }
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: req.url.clone(),
            });
        }

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        };
        let etag = header("etag");
        let last_modified = header("last-modified");

        let body = response
            .bytes()
            .with_context(|| format!("reading body from {} failed", req.url))?
            .to_vec();

        tracing::debug!(url = %req.url, bytes = body.len(), "fetched");
        Ok(FetchOutcome::Fetched {
            body,
            etag,
            last_modified,
        })
    }
}

/// Validators persisted between runs in the `.hola.state` sidecar.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheState {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl CacheState {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Sidecar path for a destination: `<path>.hola.state`.
pub fn sidecar_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(CACHE_SIDECAR_SUFFIX);
    PathBuf::from(name)
}

/// Load the cache sidecar next to `destination`; absent file → empty state.
///
/// The format is line-oriented: `etag: <value>` / `last_modified: <value>`.
/// Unknown lines are ignored so the format can grow.
pub fn load_cache_state(destination: &Path) -> Result<CacheState> {
    let path = sidecar_path(destination);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(CacheState::default());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };

    let mut state = CacheState::default();
    for line in content.lines() {
        if let Some(value) = line.strip_prefix("etag: ") {
            state.etag = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix("last_modified: ") {
            state.last_modified = Some(value.to_string());
        }
    }
    Ok(state)
}

/// Persist the cache sidecar next to `destination`; an empty state
/// removes the sidecar instead of writing an empty file.
pub fn store_cache_state(destination: &Path, state: &CacheState) -> Result<()> {
    let path = sidecar_path(destination);
    if state.is_empty() {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("failed to remove {}", path.display()));
            }
        }
        return Ok(());
    }

    let mut content = String::new();
    if let Some(etag) = &state.etag {
        content.push_str(&format!("etag: {etag}\n"));
    }
    if let Some(lm) = &state.last_modified {
        content.push_str(&format!("last_modified: {lm}\n"));
    }
    fs::write(&path, content).with_context(|| format!("failed to write {}", path.display()))
}

/// Hex SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Enforce a declared checksum on downloaded bytes.
pub fn verify_checksum(bytes: &[u8], expected: &str) -> Result<(), FetchError> {
    let actual = sha256_hex(bytes);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(FetchError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use tiny_http::{Header, Response, Server, StatusCode};

    use super::*;

    fn with_server<F>(handler: F, request_count: usize) -> (String, thread::JoinHandle<()>)
    where
        F: Fn(tiny_http::Request) + Send + 'static,
    {
        let server = Server::http("127.0.0.1:0").expect("server");
        let base = format!("http://{}", server.server_addr());
        let handle = thread::spawn(move || {
            for _ in 0..request_count {
                match server.recv_timeout(Duration::from_secs(5)) {
                    Ok(Some(req)) => handler(req),
                    _ => break,
                }
            }
        });
        (base, handle)
    }

    #[test]
    fn fetches_body_and_validators() {
        let (base, handle) = with_server(
            |req| {
                let response = Response::from_data(b"payload".to_vec())
                    .with_header(Header::from_bytes("ETag", "\"v1\"").expect("header"))
                    .with_header(
                        Header::from_bytes("Last-Modified", "Wed, 01 Jan 2025 00:00:00 GMT")
                            .expect("header"),
                    );
                req.respond(response).expect("respond");
            },
            1,
        );

        let registry = TransportRegistry::default();
        let outcome = registry
            .fetch(&FetchRequest::new(format!("{base}/artifact")))
            .expect("fetch");

        match outcome {
            FetchOutcome::Fetched {
                body,
                etag,
                last_modified,
            } => {
                assert_eq!(body, b"payload");
                assert_eq!(etag.as_deref(), Some("\"v1\""));
                assert!(last_modified.is_some());
            }
            FetchOutcome::NotModified => panic!("expected a body"),
        }
        handle.join().expect("join");
    }

    #[test]
    fn conditional_fetch_sends_validators_and_honours_304() {
        let (base, handle) = with_server(
            |req| {
                let sent_etag = req
                    .headers()
                    .iter()
                    .any(|h| h.field.equiv("If-None-Match") && h.value.as_str() == "\"v1\"");
                let response = if sent_etag {
                    Response::from_data(Vec::new()).with_status_code(StatusCode(304))
                } else {
                    Response::from_data(b"fresh".to_vec())
                };
                req.respond(response).expect("respond");
            },
            2,
        );

        let mut req = FetchRequest::new(format!("{base}/artifact"));
        req.cached.etag = Some("\"v1\"".to_string());

        let registry = TransportRegistry::default();
        match registry.fetch(&req).expect("fetch") {
            FetchOutcome::NotModified => {}
            FetchOutcome::Fetched { .. } => panic!("expected 304"),
        }

        // Without validators the same URL serves a body.
        req.cached = CacheState::default();
        match registry.fetch(&req).expect("fetch") {
            FetchOutcome::Fetched { body, .. } => assert_eq!(body, b"fresh"),
            FetchOutcome::NotModified => panic!("expected a body"),
        }
        handle.join().expect("join");
    }

    #[test]
    fn http_error_status_is_typed() {
        let (base, handle) = with_server(
            |req| {
                req.respond(Response::empty(StatusCode(404))).expect("respond");
            },
            1,
        );

        let registry = TransportRegistry::default();
        let err = registry
            .fetch(&FetchRequest::new(format!("{base}/missing")))
            .expect_err("404 must fail");
        match err {
            FetchError::HttpStatus { status, .. } => assert_eq!(status, 404),
            other => panic!("unexpected error: {other}"),
        }
        handle.join().expect("join");
    }

    #[test]
    fn unregistered_scheme_is_rejected() {
        let registry = TransportRegistry::default();
        let err = registry
            .fetch(&FetchRequest::new("sftp://host/file"))
            .expect_err("sftp has no default driver");
        assert!(matches!(err, FetchError::UnsupportedScheme(s) if s == "sftp"));
    }

    #[test]
    fn custom_transport_can_be_registered() {
        struct Fixed;
        impl Fetcher for Fixed {
            fn fetch(&self, _req: &FetchRequest) -> Result<FetchOutcome, FetchError> {
                Ok(FetchOutcome::Fetched {
                    body: b"from-s3".to_vec(),
                    etag: None,
                    last_modified: None,
                })
            }
        }

        let mut registry = TransportRegistry::default();
        registry.register("s3", Arc::new(Fixed));
        match registry
            .fetch(&FetchRequest::new("s3://bucket/key"))
            .expect("fetch")
        {
            FetchOutcome::Fetched { body, .. } => assert_eq!(body, b"from-s3"),
            FetchOutcome::NotModified => panic!("expected a body"),
        }
    }

    #[test]
    fn cache_sidecar_roundtrips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("artifact.tar.gz");

        let state = CacheState {
            etag: Some("\"abc\"".to_string()),
            last_modified: Some("Wed, 01 Jan 2025 00:00:00 GMT".to_string()),
        };
        store_cache_state(&dest, &state).expect("store");

        let sidecar = sidecar_path(&dest);
        assert!(sidecar.ends_with("artifact.tar.gz.hola.state"));
        let raw = fs::read_to_string(&sidecar).expect("read");
        assert!(raw.contains("etag: \"abc\""));
        assert!(raw.contains("last_modified: Wed, 01 Jan 2025 00:00:00 GMT"));

        assert_eq!(load_cache_state(&dest).expect("load"), state);
    }

    #[test]
    fn missing_sidecar_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = load_cache_state(&dir.path().join("nothing")).expect("load");
        assert!(state.is_empty());
    }

    #[test]
    fn empty_state_removes_sidecar() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("artifact");
        store_cache_state(
            &dest,
            &CacheState {
                etag: Some("\"x\"".to_string()),
                last_modified: None,
            },
        )
        .expect("store");
        assert!(sidecar_path(&dest).exists());

        store_cache_state(&dest, &CacheState::default()).expect("store empty");
        assert!(!sidecar_path(&dest).exists());
    }

    #[test]
    fn checksum_verification() {
        let expected = sha256_hex(b"bytes");
        verify_checksum(b"bytes", &expected).expect("match");
        verify_checksum(b"bytes", &expected.to_uppercase()).expect("case-insensitive");

        let err = verify_checksum(b"other", &expected).expect_err("mismatch");
        assert!(matches!(err, FetchError::ChecksumMismatch { .. }));
    }
}
