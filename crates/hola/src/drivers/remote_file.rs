//! The `remote_file` driver: scheme-dispatched download with
//! conditional fetch, authoritative checksums, and atomic writes.

use std::fs;

use anyhow::Context;

use hola_fetch::{
    CacheState, FetchError, FetchOutcome, FetchRequest, load_cache_state, sha256_hex,
    store_cache_state,
};

use crate::drivers::{DriverContext, file};
use crate::fsutil;
use crate::types::{ApplyResult, DriverError, FileAction, RemoteFileSpec};

pub fn apply(
    spec: &RemoteFileSpec,
    action: FileAction,
    ctx: &DriverContext,
) -> Result<ApplyResult, DriverError> {
    match action {
        FileAction::Create => fetch_converge(spec, ctx, FileAction::Create),
        FileAction::CreateIfMissing => {
            if spec.path.exists() {
                Ok(ApplyResult::up_to_date(FileAction::CreateIfMissing.as_str()))
            } else {
                fetch_converge(spec, ctx, FileAction::CreateIfMissing)
            }
        }
        FileAction::Delete => {
            let result = file::delete(&spec.path, FileAction::Delete)?;
            if result.was_updated {
                store_cache_state(&spec.path, &CacheState::default())
                    .map_err(DriverError::Other)?;
            }
            Ok(result)
        }
        FileAction::Touch => {
            // Touch never fetches: it only guarantees the destination
            // exists.
            if spec.path.exists() {
                Ok(ApplyResult::up_to_date(FileAction::Touch.as_str()))
            } else {
                let mode = fsutil::parse_mode(&spec.mode)?;
                fsutil::atomic_write(&spec.path, b"", mode, 0)?;
                Ok(ApplyResult::updated(FileAction::Touch.as_str()))
            }
        }
    }
}

fn fetch_converge(
    spec: &RemoteFileSpec,
    ctx: &DriverContext,
    action: FileAction,
) -> Result<ApplyResult, DriverError> {
    let exists = spec.path.exists();
    let desired_mode = fsutil::parse_mode(&spec.mode)?;

    // A declared checksum that already matches short-circuits before
    // any network I/O.
    if let Some(expected) = &spec.checksum {
        if exists {
            let current = fs::read(&spec.path)
                .with_context(|| format!("failed to read {}", spec.path.display()))?;
            if sha256_hex(&current).eq_ignore_ascii_case(expected) {
                return converged(spec, desired_mode, action);
            }
        }
    }

    let mut request = FetchRequest::new(spec.source_url.clone());
    request.headers = spec.headers.clone();
    request.use_etag = spec.use_etag;
    request.use_last_modified = spec.use_last_modified;
    request.credentials = spec.credentials.clone();
    // Validators only make sense while the destination they validated
    // still exists.
    if exists && (spec.use_etag || spec.use_last_modified) {
        request.cached = load_cache_state(&spec.path).map_err(DriverError::Other)?;
    }

    match ctx.transports.fetch(&request).map_err(map_fetch_err)? {
        FetchOutcome::NotModified => converged(spec, desired_mode, action),
        FetchOutcome::Fetched {
            body,
            etag,
            last_modified,
        } => {
            if let Some(expected) = &spec.checksum {
                // Authoritative: mismatching bytes are discarded and the
                // destination stays untouched.
                hola_fetch::verify_checksum(&body, expected).map_err(map_fetch_err)?;
            }

            if exists {
                let current = fs::read(&spec.path)
                    .with_context(|| format!("failed to read {}", spec.path.display()))?;
                if current == body {
                    store_cache_state(&spec.path, &CacheState { etag, last_modified })
                        .map_err(DriverError::Other)?;
                    return converged(spec, desired_mode, action);
                }
            }

            if spec.force_unlink && exists {
                let metadata = spec
                    .path
                    .symlink_metadata()
                    .with_context(|| format!("failed to stat {}", spec.path.display()))?;
                if !metadata.file_type().is_file() {
                    fs::remove_file(&spec.path).with_context(|| {
                        format!("failed to unlink {}", spec.path.display())
                    })?;
                }
            }

            fsutil::atomic_write(&spec.path, &body, desired_mode, spec.backup)?;
            fsutil::apply_ownership(&spec.path, spec.owner.as_deref(), spec.group.as_deref())?;
            store_cache_state(&spec.path, &CacheState { etag, last_modified })
                .map_err(DriverError::Other)?;

            tracing::debug!(
                url = %spec.source_url,
                path = %spec.path.display(),
                bytes = body.len(),
                "remote file converged"
            );
            Ok(ApplyResult::updated(action.as_str()))
        }
    }
}

/// Destination already matches the remote copy; converge metadata only.
fn converged(
    spec: &RemoteFileSpec,
    desired_mode: Option<u32>,
    action: FileAction,
) -> Result<ApplyResult, DriverError> {
    let mut changed = fsutil::apply_mode(&spec.path, desired_mode)?;
    changed |= fsutil::apply_ownership(
        &spec.path,
        spec.owner.as_deref(),
        spec.group.as_deref(),
    )?;
    if changed {
        Ok(ApplyResult::updated(action.as_str()))
    } else {
        Ok(ApplyResult::up_to_date(action.as_str()))
    }
}

fn map_fetch_err(err: FetchError) -> DriverError {
    match err {
        FetchError::ChecksumMismatch { expected, actual } => {
            DriverError::ChecksumMismatch { expected, actual }
        }
        FetchError::HttpStatus { status: 404, url } => DriverError::NotFound(url),
        other => DriverError::Other(anyhow::Error::new(other)),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use hola_fetch::{Fetcher, TransportRegistry};

    use super::*;

    /// Transport double: serves a fixed payload, counts calls, honours
    /// the cached ETag like a well-behaved origin.
    struct FixedOrigin {
        body: Vec<u8>,
        etag: String,
        calls: AtomicUsize,
    }

    impl FixedOrigin {
        fn new(body: &[u8], etag: &str) -> Self {
            Self {
                body: body.to_vec(),
                etag: etag.to_string(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Fetcher for FixedOrigin {
        fn fetch(&self, req: &FetchRequest) -> Result<FetchOutcome, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if req.use_etag && req.cached.etag.as_deref() == Some(self.etag.as_str()) {
                return Ok(FetchOutcome::NotModified);
            }
            Ok(FetchOutcome::Fetched {
                body: self.body.clone(),
                etag: Some(self.etag.clone()),
                last_modified: None,
            })
        }
    }

    fn context_with(origin: Arc<FixedOrigin>) -> DriverContext {
        let mut transports = TransportRegistry::default();
        transports.register("https", origin);
        DriverContext {
            transports: Arc::new(transports),
            ..DriverContext::default()
        }
    }

    fn spec(path: PathBuf) -> RemoteFileSpec {
        RemoteFileSpec {
            path,
            source_url: "https://example.test/artifact".to_string(),
            mode: String::new(),
            owner: None,
            group: None,
            checksum: None,
            backup: 0,
            headers: Default::default(),
            use_etag: true,
            use_last_modified: true,
            force_unlink: false,
            credentials: Default::default(),
            action: FileAction::Create,
        }
    }

    #[test]
    fn downloads_then_revalidates_with_etag() {
        let dir = tempfile::tempdir().expect("tempdir");
        let origin = Arc::new(FixedOrigin::new(b"artifact-v1", "\"v1\""));
        let ctx = context_with(origin.clone());
        let spec = spec(dir.path().join("artifact"));

        let first = apply(&spec, FileAction::Create, &ctx).expect("apply");
        assert!(first.was_updated);
        assert_eq!(fs::read(&spec.path).expect("read"), b"artifact-v1");
        // Sidecar captured the validator.
        let cached = load_cache_state(&spec.path).expect("load");
        assert_eq!(cached.etag.as_deref(), Some("\"v1\""));

        let second = apply(&spec, FileAction::Create, &ctx).expect("apply");
        assert!(!second.was_updated);
        assert_eq!(second.skip_reason.as_deref(), Some("up to date"));
        assert_eq!(origin.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn checksum_match_skips_the_network_entirely() {
        let dir = tempfile::tempdir().expect("tempdir");
        let origin = Arc::new(FixedOrigin::new(b"artifact-v1", "\"v1\""));
        let ctx = context_with(origin.clone());

        let mut spec = spec(dir.path().join("artifact"));
        fs::write(&spec.path, b"artifact-v1").expect("write");
        spec.checksum = Some(sha256_hex(b"artifact-v1"));

        let result = apply(&spec, FileAction::Create, &ctx).expect("apply");
        assert!(!result.was_updated);
        assert_eq!(origin.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn checksum_mismatch_discards_download() {
        let dir = tempfile::tempdir().expect("tempdir");
        let origin = Arc::new(FixedOrigin::new(b"tampered", "\"v1\""));
        let ctx = context_with(origin);

        let mut spec = spec(dir.path().join("artifact"));
        fs::write(&spec.path, b"previous").expect("write");
        spec.checksum = Some(sha256_hex(b"expected-bytes"));

        let err = apply(&spec, FileAction::Create, &ctx).expect_err("mismatch");
        assert!(matches!(err, DriverError::ChecksumMismatch { .. }));
        // Destination untouched.
        assert_eq!(fs::read(&spec.path).expect("read"), b"previous");
    }

    #[test]
    fn create_if_missing_skips_when_present() {
        let dir = tempfile::tempdir().expect("tempdir");
        let origin = Arc::new(FixedOrigin::new(b"artifact", "\"v1\""));
        let ctx = context_with(origin.clone());

        let spec = spec(dir.path().join("artifact"));
        fs::write(&spec.path, b"whatever").expect("write");

        let result = apply(&spec, FileAction::CreateIfMissing, &ctx).expect("apply");
        assert!(!result.was_updated);
        assert_eq!(origin.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn delete_removes_file_and_sidecar() {
        let dir = tempfile::tempdir().expect("tempdir");
        let origin = Arc::new(FixedOrigin::new(b"artifact", "\"v1\""));
        let ctx = context_with(origin);

        let spec = spec(dir.path().join("artifact"));
        apply(&spec, FileAction::Create, &ctx).expect("apply");
        assert!(hola_fetch::sidecar_path(&spec.path).exists());

        let result = apply(&spec, FileAction::Delete, &ctx).expect("apply");
        assert!(result.was_updated);
        assert!(!spec.path.exists());
        assert!(!hola_fetch::sidecar_path(&spec.path).exists());
    }

    #[test]
    fn changed_origin_content_rewrites() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = spec(dir.path().join("artifact"));

        let ctx = context_with(Arc::new(FixedOrigin::new(b"v1", "\"v1\"")));
        apply(&spec, FileAction::Create, &ctx).expect("apply");

        let ctx = context_with(Arc::new(FixedOrigin::new(b"v2", "\"v2\"")));
        let result = apply(&spec, FileAction::Create, &ctx).expect("apply");
        assert!(result.was_updated);
        assert_eq!(fs::read(&spec.path).expect("read"), b"v2");
    }
}
