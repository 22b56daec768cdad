//! The `directory` driver.

use std::fs;

use anyhow::Context;

use crate::fsutil;
use crate::types::{ApplyResult, DirectoryAction, DirectorySpec, DriverError};

pub fn apply(spec: &DirectorySpec, action: DirectoryAction) -> Result<ApplyResult, DriverError> {
    match action {
        DirectoryAction::Create => create(spec),
        DirectoryAction::Delete => delete(spec),
    }
}

fn create(spec: &DirectorySpec) -> Result<ApplyResult, DriverError> {
    let mut changed = false;

    if spec.path.exists() {
        if !spec.path.is_dir() {
            return Err(DriverError::Other(anyhow::anyhow!(
                "{} exists but is not a directory",
                spec.path.display()
            )));
        }
    } else {
        if spec.recursive {
            fs::create_dir_all(&spec.path)
        } else {
            fs::create_dir(&spec.path)
        }
        .with_context(|| format!("failed to create {}", spec.path.display()))?;
        changed = true;
    }

    let desired_mode = fsutil::parse_mode(&spec.mode)?;
    changed |= fsutil::apply_mode(&spec.path, desired_mode)?;
    changed |= fsutil::apply_ownership(
        &spec.path,
        spec.owner.as_deref(),
        spec.group.as_deref(),
    )?;

    if changed {
        Ok(ApplyResult::updated(DirectoryAction::Create.as_str()))
    } else {
        Ok(ApplyResult::up_to_date(DirectoryAction::Create.as_str()))
    }
}

fn delete(spec: &DirectorySpec) -> Result<ApplyResult, DriverError> {
    if spec.path.exists() {
        fs::remove_dir_all(&spec.path)
            .with_context(|| format!("failed to delete {}", spec.path.display()))?;
        Ok(ApplyResult::updated(DirectoryAction::Delete.as_str()))
    } else {
        Ok(ApplyResult::up_to_date(DirectoryAction::Delete.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn spec(path: PathBuf, recursive: bool) -> DirectorySpec {
        DirectorySpec {
            path,
            mode: String::new(),
            owner: None,
            group: None,
            recursive,
            action: DirectoryAction::Create,
        }
    }

    #[test]
    fn create_then_up_to_date() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = spec(dir.path().join("data"), false);

        assert!(apply(&spec, DirectoryAction::Create).expect("apply").was_updated);
        assert!(spec.path.is_dir());
        assert!(!apply(&spec, DirectoryAction::Create).expect("apply").was_updated);
    }

    #[test]
    fn recursive_creates_parents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = spec(dir.path().join("a/b/c"), true);
        assert!(apply(&spec, DirectoryAction::Create).expect("apply").was_updated);
        assert!(spec.path.is_dir());
    }

    #[test]
    fn non_recursive_needs_parent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = spec(dir.path().join("a/b/c"), false);
        assert!(apply(&spec, DirectoryAction::Create).is_err());
    }

    #[test]
    fn existing_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = spec(dir.path().join("occupied"), false);
        fs::write(&spec.path, "file").expect("write");
        assert!(apply(&spec, DirectoryAction::Create).is_err());
    }

    #[test]
    fn delete_removes_tree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = spec(dir.path().join("tree"), true);
        fs::create_dir_all(spec.path.join("nested")).expect("mkdir");
        fs::write(spec.path.join("nested/file"), "x").expect("write");

        assert!(apply(&spec, DirectoryAction::Delete).expect("apply").was_updated);
        assert!(!spec.path.exists());
        assert!(!apply(&spec, DirectoryAction::Delete).expect("apply").was_updated);
    }

    #[cfg(unix)]
    #[test]
    fn mode_converges() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let mut spec = spec(dir.path().join("secure"), false);
        spec.mode = "0700".to_string();

        apply(&spec, DirectoryAction::Create).expect("apply");
        let mode = fs::metadata(&spec.path).expect("stat").permissions().mode() & 0o7777;
        assert_eq!(mode, 0o700);
        assert!(!apply(&spec, DirectoryAction::Create).expect("apply").was_updated);
    }
}
