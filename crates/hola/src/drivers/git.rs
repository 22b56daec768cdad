//! The `git` driver: clone-or-fetch convergence of a working copy.
//!
//! The git binary honours `HOLA_GIT_BIN` so tests can substitute a
//! hermetic fake.

use std::path::Path;

use hola_process::{ShellOutput, resolve_program, run_program_as};

use crate::types::{ApplyResult, DriverError, GitAction, GitSpec};

fn git_bin() -> String {
    resolve_program("git", "HOLA_GIT_BIN")
}

pub fn apply(spec: &GitSpec, action: GitAction) -> Result<ApplyResult, DriverError> {
    if !is_repo(&spec.destination) {
        clone(spec)?;
        if spec.enable_checkout && spec.revision != "HEAD" {
            checkout(spec)?;
        }
        update_submodules(spec)?;
        return Ok(ApplyResult::updated(action.as_str()));
    }

    let before = rev_parse(spec, "HEAD")?;
    if action == GitAction::Sync {
        run_git(spec, &["fetch", &spec.remote], Some(&spec.destination))?;
    }

    let mut changed = false;
    if spec.enable_checkout {
        let target = resolve_revision(spec)?;
        if before != target {
            checkout(spec)?;
            changed = true;
        }
    }
    update_submodules(spec)?;

    if changed {
        Ok(ApplyResult::updated(action.as_str()))
    } else {
        Ok(ApplyResult::up_to_date(action.as_str()))
    }
}

fn is_repo(destination: &Path) -> bool {
    destination.join(".git").exists()
}

fn clone(spec: &GitSpec) -> Result<(), DriverError> {
    let depth;
    let mut args: Vec<&str> = vec!["clone", "--origin", &spec.remote];
    if let Some(n) = spec.depth {
        depth = n.to_string();
        args.push("--depth");
        args.push(&depth);
    }
    let destination = spec.destination.display().to_string();
    args.push(&spec.repository);
    args.push(&destination);

    run_git(spec, &args, None)?;
    tracing::debug!(repository = %spec.repository, destination = %destination, "cloned");
    Ok(())
}

/// Reset `checkout_branch` to the requested revision.
fn checkout(spec: &GitSpec) -> Result<(), DriverError> {
    let target = resolve_revision(spec)?;
    run_git(
        spec,
        &["checkout", "-B", &spec.checkout_branch, &target],
        Some(&spec.destination),
    )?;
    Ok(())
}

/// Resolve the declared revision to a commit id. The remote tracking
/// ref wins (so `sync` follows upstream branches); tags and bare SHAs
/// fall through to local resolution.
fn resolve_revision(spec: &GitSpec) -> Result<String, DriverError> {
    match rev_parse(spec, &format!("{}/{}", spec.remote, spec.revision)) {
        Ok(sha) => Ok(sha),
        Err(_) => rev_parse(spec, &spec.revision),
    }
}

fn rev_parse(spec: &GitSpec, rev: &str) -> Result<String, DriverError> {
    let out = run_git(spec, &["rev-parse", rev], Some(&spec.destination))?;
    Ok(out.stdout.trim().to_string())
}

fn update_submodules(spec: &GitSpec) -> Result<(), DriverError> {
    if !spec.enable_submodules {
        return Ok(());
    }
    run_git(
        spec,
        &["submodule", "update", "--init", "--recursive"],
        Some(&spec.destination),
    )?;
    Ok(())
}

fn run_git(spec: &GitSpec, args: &[&str], cwd: Option<&Path>) -> Result<ShellOutput, DriverError> {
    let env = git_env(spec);
    let out = run_program_as(
        &git_bin(),
        args,
        cwd,
        &env,
        spec.user.as_deref(),
        spec.group.as_deref(),
    )
    .map_err(DriverError::Other)?;

    if let Some(signal) = out.signal {
        return Err(DriverError::CommandKilled { signal });
    }
    if !out.success() {
        return Err(DriverError::CommandFailed {
            code: out.exit_code.unwrap_or(-1),
            stderr: out.stderr,
        });
    }
    Ok(out)
}

fn git_env(spec: &GitSpec) -> Vec<(String, String)> {
    let mut ssh = Vec::new();
    if let Some(key) = &spec.ssh_key {
        ssh.push(format!("-i {}", key.display()));
    }
    if !spec.enable_strict_host_key_checking {
        ssh.push("-o StrictHostKeyChecking=no".to_string());
    }
    if ssh.is_empty() {
        return Vec::new();
    }
    vec![("GIT_SSH_COMMAND".to_string(), format!("ssh {}", ssh.join(" ")))]
}
