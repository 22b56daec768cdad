//! Run lock: prevents two convergence runs from fighting over one
//! host. The lock file holds JSON metadata about the holder and is
//! released on drop.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default lock location.
pub const DEFAULT_LOCK_PATH: &str = "/tmp/hola.lock";

/// Metadata stored in the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Process id of the holder.
    pub pid: u32,
    /// Host where the lock was acquired.
    pub hostname: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
}

/// Held run lock; the file is removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Acquire the lock, failing when another live process holds it.
    /// A lock whose pid no longer exists is considered stale and is
    /// replaced.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        if path.exists() {
            let info = Self::read_info(path)?;
            if process_alive(info.pid) {
                bail!(
                    "another run holds the lock: pid {} on {} since {}",
                    info.pid,
                    info.hostname,
                    info.acquired_at
                );
            }
            tracing::warn!(pid = info.pid, "removing stale lock");
            fs::remove_file(path)
                .with_context(|| format!("failed to remove stale lock {}", path.display()))?;
        }

        let info = LockInfo {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            acquired_at: Utc::now(),
        };
        let body = serde_json::to_vec_pretty(&info).context("failed to serialize lock info")?;
        fs::write(path, body).with_context(|| format!("failed to write {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Read the current holder's metadata.
    pub fn read_info(path: &Path) -> Result<LockInfo> {
        let body = fs::read_to_string(path)
            .with_context(|| format!("failed to read lock {}", path.display()))?;
        serde_json::from_str(&body).context("malformed lock file")
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Null signal probes for existence without delivering anything.
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // No cheap probe; assume the holder is alive.
    true
}
