//! Filesystem plumbing shared by the path-bearing drivers: path
//! expansion at registration time, atomic writes, backup rotation, and
//! mode/ownership convergence.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};

/// Expand a user-supplied path to absolute form.
///
/// Tilde expands against the home directory, relative paths against the
/// current working directory; `.` and `..` components are normalised
/// lexically and the parent directory is symlink-resolved when it
/// already exists. The final component is kept verbatim so that `link`
/// resources manage the link itself, not its target.
pub fn expand_path(raw: &str) -> PathBuf {
    let path = if raw == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"))
    } else if let Some(rest) = raw.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => PathBuf::from(raw),
        }
    } else {
        PathBuf::from(raw)
    };

    let absolute = if path.is_absolute() {
        path
    } else {
        std::env::current_dir().map(|cwd| cwd.join(&path)).unwrap_or(path)
    };
    let normalised = normalise(&absolute);

    if let (Some(parent), Some(name)) = (normalised.parent(), normalised.file_name()) {
        if let Ok(resolved) = parent.canonicalize() {
            return resolved.join(name);
        }
    }
    normalised
}

fn normalise(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Parse an octal mode string; empty means "preserve existing".
pub fn parse_mode(mode: &str) -> Result<Option<u32>> {
    if mode.is_empty() {
        return Ok(None);
    }
    let digits = mode.strip_prefix("0o").unwrap_or(mode);
    let value = u32::from_str_radix(digits, 8)
        .with_context(|| format!("invalid mode string: {mode:?}"))?;
    if value > 0o7777 {
        bail!("mode out of range: {mode:?}");
    }
    Ok(Some(value))
}

/// Write `bytes` to `path` atomically: a sibling temp file named
/// `<path>.tmp.<pid>.<nonce>` is written, given its mode, and renamed
/// over the destination. When `backup > 0` and the destination already
/// exists, the prior file rotates into `<path>.1` … `<path>.N` first.
pub fn atomic_write(path: &Path, bytes: &[u8], mode: Option<u32>, backup: u32) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;

    let tmp = parent.join(format!(
        "{}.tmp.{}.{:08x}",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        std::process::id(),
        rand::random::<u32>(),
    ));

    fs::write(&tmp, bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
    if let Some(mode) = mode {
        set_mode(&tmp, mode)?;
    }

    if backup > 0 && path.exists() {
        rotate_backups(path, backup)?;
    }

    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err).with_context(|| format!("failed to rename {} into place", tmp.display()));
    }
    Ok(())
}

/// Shift `<path>.N-1` → `<path>.N` down the chain, then move the
/// current file to `<path>.1`. The oldest backup falls off the end.
pub fn rotate_backups(path: &Path, keep: u32) -> Result<()> {
    let numbered = |n: u32| PathBuf::from(format!("{}.{}", path.display(), n));

    let oldest = numbered(keep);
    if oldest.exists() {
        fs::remove_file(&oldest)
            .with_context(|| format!("failed to drop oldest backup {}", oldest.display()))?;
    }
    for n in (1..keep).rev() {
        let from = numbered(n);
        if from.exists() {
            let to = numbered(n + 1);
            fs::rename(&from, &to)
                .with_context(|| format!("failed to rotate {}", from.display()))?;
        }
    }
    fs::rename(path, numbered(1))
        .with_context(|| format!("failed to back up {}", path.display()))?;
    Ok(())
}

/// Converge the file mode; returns whether anything changed.
#[cfg(unix)]
pub fn apply_mode(path: &Path, mode: Option<u32>) -> Result<bool> {
    use std::os::unix::fs::PermissionsExt;

    let Some(mode) = mode else { return Ok(false) };
    let metadata = fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?;
    if metadata.permissions().mode() & 0o7777 == mode {
        return Ok(false);
    }
    set_mode(path, mode)?;
    Ok(true)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to chmod {}", path.display()))
}

#[cfg(not(unix))]
pub fn apply_mode(_path: &Path, _mode: Option<u32>) -> Result<bool> {
    Ok(false)
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Converge owner/group; returns whether anything changed.
#[cfg(unix)]
pub fn apply_ownership(path: &Path, owner: Option<&str>, group: Option<&str>) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;

    if owner.is_none() && group.is_none() {
        return Ok(false);
    }

    let uid = owner
        .map(|name| {
            nix::unistd::User::from_name(name)
                .with_context(|| format!("passwd lookup failed for user {name}"))?
                .map(|u| u.uid)
                .with_context(|| format!("unknown user: {name}"))
        })
        .transpose()?;
    let gid = group
        .map(|name| {
            nix::unistd::Group::from_name(name)
                .with_context(|| format!("group lookup failed for {name}"))?
                .map(|g| g.gid)
                .with_context(|| format!("unknown group: {name}"))
        })
        .transpose()?;

    let metadata = fs::symlink_metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?;
    let uid_diverged = uid.map(|u| u.as_raw() != metadata.uid()).unwrap_or(false);
    let gid_diverged = gid.map(|g| g.as_raw() != metadata.gid()).unwrap_or(false);
    if !uid_diverged && !gid_diverged {
        return Ok(false);
    }

    nix::unistd::chown(path, uid, gid)
        .with_context(|| format!("failed to chown {}", path.display()))?;
    Ok(true)
}

#[cfg(not(unix))]
pub fn apply_ownership(_path: &Path, owner: Option<&str>, group: Option<&str>) -> Result<bool> {
    if owner.is_some() || group.is_some() {
        bail!("ownership management is only supported on unix");
    }
    Ok(false)
}
