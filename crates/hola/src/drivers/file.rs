//! The `file` driver: byte-for-byte content convergence with atomic
//! writes, numbered backups, and mode/ownership management.

use std::fs;
use std::path::Path;

use anyhow::Context;

use crate::fsutil;
use crate::types::{ApplyResult, DriverError, FileAction, FileSpec};

pub fn apply(spec: &FileSpec, action: FileAction) -> Result<ApplyResult, DriverError> {
    match action {
        FileAction::Create => create(spec, false),
        FileAction::CreateIfMissing => create(spec, true),
        FileAction::Delete => delete(&spec.path, action),
        FileAction::Touch => touch(spec),
    }
}

fn create(spec: &FileSpec, only_if_missing: bool) -> Result<ApplyResult, DriverError> {
    let action = if only_if_missing {
        FileAction::CreateIfMissing
    } else {
        FileAction::Create
    };
    let exists = spec.path.exists();
    if only_if_missing && exists {
        return converge_metadata_only(spec, action);
    }

    let desired_mode = fsutil::parse_mode(&spec.mode)?;
    let desired = spec.content.as_deref();

    let content_diverged = if !exists {
        true
    } else {
        match desired {
            // No managed content: an existing file is left alone.
            None => false,
            Some(content) => {
                let current = fs::read(&spec.path)
                    .with_context(|| format!("failed to read {}", spec.path.display()))?;
                current != content.as_bytes()
            }
        }
    };

    let mut changed = false;
    if content_diverged {
        let bytes = desired.unwrap_or("").as_bytes();
        let mode = desired_mode.or(existing_mode(&spec.path)?);
        fsutil::atomic_write(&spec.path, bytes, mode, spec.backup)?;
        verify_written(&spec.path, bytes)?;
        changed = true;
    } else {
        changed |= fsutil::apply_mode(&spec.path, desired_mode)?;
    }
    changed |= fsutil::apply_ownership(
        &spec.path,
        spec.owner.as_deref(),
        spec.group.as_deref(),
    )?;

    if changed {
        tracing::debug!(path = %spec.path.display(), "file converged");
        Ok(ApplyResult::updated(action.as_str()))
    } else {
        Ok(ApplyResult::up_to_date(action.as_str()))
    }
}

fn converge_metadata_only(spec: &FileSpec, action: FileAction) -> Result<ApplyResult, DriverError> {
    let desired_mode = fsutil::parse_mode(&spec.mode)?;
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

pub(crate) fn delete(path: &Path, action: FileAction) -> Result<ApplyResult, DriverError> {
    if path.symlink_metadata().is_ok() {
        fs::remove_file(path)
            .with_context(|| format!("failed to delete {}", path.display()))?;
        Ok(ApplyResult::updated(action.as_str()))
    } else {
        Ok(ApplyResult::up_to_date(action.as_str()))
    }
}

fn touch(spec: &FileSpec) -> Result<ApplyResult, DriverError> {
    if !spec.path.exists() {
        let mode = fsutil::parse_mode(&spec.mode)?;
        fsutil::atomic_write(&spec.path, b"", mode, 0)?;
        fsutil::apply_ownership(&spec.path, spec.owner.as_deref(), spec.group.as_deref())?;
        return Ok(ApplyResult::updated(FileAction::Touch.as_str()));
    }

    // Refresh mtime without counting it as an update, so repeated
    // convergence of an unchanged recipe stays quiet.
    let file = fs::File::options()
        .write(true)
        .open(&spec.path)
        .with_context(|| format!("failed to open {}", spec.path.display()))?;
    file.set_modified(std::time::SystemTime::now())
        .with_context(|| format!("failed to touch {}", spec.path.display()))?;
    Ok(ApplyResult::up_to_date(FileAction::Touch.as_str()))
}

fn existing_mode(path: &Path) -> Result<Option<u32>, DriverError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match fs::metadata(path) {
            Ok(metadata) => Ok(Some(metadata.permissions().mode() & 0o7777)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(DriverError::Other(anyhow::Error::new(err).context(format!(
                "failed to stat {}",
                path.display()
            )))),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(None)
    }
}

fn verify_written(path: &Path, expected: &[u8]) -> Result<(), DriverError> {
    let written = fs::read(path)
        .with_context(|| format!("failed to re-read {}", path.display()))?;
    if written != expected {
        return Err(DriverError::Other(anyhow::anyhow!(
            "write verification failed for {}",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn spec(path: PathBuf) -> FileSpec {
        FileSpec {
            path,
            content: Some("managed\n".to_string()),
            mode: String::new(),
            owner: None,
            group: None,
            backup: 0,
            action: FileAction::Create,
        }
    }

    #[test]
    fn create_writes_then_reports_up_to_date() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = spec(dir.path().join("motd"));

        let first = apply(&spec, FileAction::Create).expect("apply");
        assert!(first.was_updated);
        assert_eq!(fs::read_to_string(&spec.path).expect("read"), "managed\n");

        let second = apply(&spec, FileAction::Create).expect("apply");
        assert!(!second.was_updated);
        assert_eq!(second.skip_reason.as_deref(), Some("up to date"));
    }

    #[test]
    fn create_repairs_drifted_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = spec(dir.path().join("motd"));
        fs::write(&spec.path, "drifted").expect("write");

        let result = apply(&spec, FileAction::Create).expect("apply");
        assert!(result.was_updated);
        assert_eq!(fs::read_to_string(&spec.path).expect("read"), "managed\n");
    }

    #[test]
    fn create_without_content_manages_existence_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut spec = spec(dir.path().join("marker"));
        spec.content = None;

        let first = apply(&spec, FileAction::Create).expect("apply");
        assert!(first.was_updated);
        assert!(spec.path.exists());

        fs::write(&spec.path, "user data").expect("write");
        let second = apply(&spec, FileAction::Create).expect("apply");
        assert!(!second.was_updated);
        assert_eq!(fs::read_to_string(&spec.path).expect("read"), "user data");
    }

    #[test]
    fn create_if_missing_leaves_existing_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = spec(dir.path().join("motd"));
        fs::write(&spec.path, "original").expect("write");

        let result = apply(&spec, FileAction::CreateIfMissing).expect("apply");
        assert!(!result.was_updated);
        assert_eq!(fs::read_to_string(&spec.path).expect("read"), "original");
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = spec(dir.path().join("motd"));
        fs::write(&spec.path, "x").expect("write");

        let first = apply(&spec, FileAction::Delete).expect("apply");
        assert!(first.was_updated);
        assert!(!spec.path.exists());

        let second = apply(&spec, FileAction::Delete).expect("apply");
        assert!(!second.was_updated);
    }

    #[test]
    fn touch_updates_only_on_creation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = spec(dir.path().join("stamp"));

        let first = apply(&spec, FileAction::Touch).expect("apply");
        assert!(first.was_updated);
        assert!(spec.path.exists());

        let second = apply(&spec, FileAction::Touch).expect("apply");
        assert!(!second.was_updated);
    }

    #[cfg(unix)]
    #[test]
    fn mode_divergence_alone_counts_as_update() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let mut spec = spec(dir.path().join("conf"));
        spec.mode = "0600".to_string();

        apply(&spec, FileAction::Create).expect("apply");
        let mode = fs::metadata(&spec.path).expect("stat").permissions().mode() & 0o7777;
        assert_eq!(mode, 0o600);

        fs::set_permissions(&spec.path, fs::Permissions::from_mode(0o644)).expect("chmod");
        let result = apply(&spec, FileAction::Create).expect("apply");
        assert!(result.was_updated);
        let mode = fs::metadata(&spec.path).expect("stat").permissions().mode() & 0o7777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn backups_rotate_on_replacement() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut spec = spec(dir.path().join("conf"));
        spec.backup = 2;
        fs::write(&spec.path, "previous").expect("write");

        apply(&spec, FileAction::Create).expect("apply");
        assert_eq!(
            fs::read_to_string(format!("{}.1", spec.path.display())).expect("read backup"),
            "previous"
        );
    }
}
