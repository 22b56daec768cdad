//! The `link` driver: symlinks managed as the link itself, never the
//! target.

use std::fs;

use anyhow::Context;

use crate::fsutil;
use crate::types::{ApplyResult, DriverError, LinkAction, LinkSpec};

pub fn apply(spec: &LinkSpec, action: LinkAction) -> Result<ApplyResult, DriverError> {
    match action {
        LinkAction::Create => create(spec),
        LinkAction::Delete => delete(spec),
    }
}

fn create(spec: &LinkSpec) -> Result<ApplyResult, DriverError> {
    match fs::read_link(&spec.path) {
        Ok(current) if current == spec.target => {
            let changed = fsutil::apply_ownership(
                &spec.path,
                spec.owner.as_deref(),
                spec.group.as_deref(),
            )?;
            if changed {
                return Ok(ApplyResult::updated(LinkAction::Create.as_str()));
            }
            return Ok(ApplyResult::up_to_date(LinkAction::Create.as_str()));
        }
        Ok(_) => {
            // Points somewhere else; replace it.
            fs::remove_file(&spec.path)
                .with_context(|| format!("failed to remove stale link {}", spec.path.display()))?;
        }
        Err(_) => {
            // Not a symlink. A regular file in the way is replaced too.
            if spec.path.symlink_metadata().is_ok() {
                fs::remove_file(&spec.path).with_context(|| {
                    format!("failed to clear {} for link", spec.path.display())
                })?;
            }
        }
    }

    make_symlink(spec)?;
    fsutil::apply_ownership(&spec.path, spec.owner.as_deref(), spec.group.as_deref())?;

    // Verify the link now resolves to the declared target.
    let written = fs::read_link(&spec.path)
        .with_context(|| format!("failed to re-read link {}", spec.path.display()))?;
    if written != spec.target {
        return Err(DriverError::Other(anyhow::anyhow!(
            "link verification failed for {}",
            spec.path.display()
        )));
    }
    Ok(ApplyResult::updated(LinkAction::Create.as_str()))
}

fn delete(spec: &LinkSpec) -> Result<ApplyResult, DriverError> {
    match spec.path.symlink_metadata() {
        Ok(metadata) if metadata.file_type().is_symlink() => {
            fs::remove_file(&spec.path)
                .with_context(|| format!("failed to delete link {}", spec.path.display()))?;
            Ok(ApplyResult::updated(LinkAction::Delete.as_str()))
        }
        Ok(_) => Err(DriverError::Other(anyhow::anyhow!(
            "refusing to delete {}: not a symlink",
            spec.path.display()
        ))),
        Err(_) => Ok(ApplyResult::up_to_date(LinkAction::Delete.as_str())),
    }
}

#[cfg(unix)]
fn make_symlink(spec: &LinkSpec) -> Result<(), DriverError> {
    std::os::unix::fs::symlink(&spec.target, &spec.path)
        .with_context(|| format!("failed to create link {}", spec.path.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn make_symlink(spec: &LinkSpec) -> Result<(), DriverError> {
    Err(DriverError::Other(anyhow::anyhow!(
        "symlinks are only supported on unix ({})",
        spec.path.display()
    )))
}
