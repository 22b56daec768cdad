//! The `execute` driver: arbitrary shell commands gated by `creates`.

use hola_process::ShellRequest;

use crate::types::{ApplyResult, DriverError, ExecuteSpec, RunAction};

pub fn apply(spec: &ExecuteSpec, action: RunAction) -> Result<ApplyResult, DriverError> {
    match action {
        RunAction::Nothing => Ok(ApplyResult::skipped(
            RunAction::Nothing.as_str(),
            "action nothing requested",
        )),
        RunAction::Run => run(spec),
    }
}

fn run(spec: &ExecuteSpec) -> Result<ApplyResult, DriverError> {
    // The sentinel is checked before the command runs, never after; the
    // driver does not create it.
    if let Some(creates) = &spec.creates {
        if creates.exists() {
            return Ok(ApplyResult::skipped(
                RunAction::Run.as_str(),
                format!(
                    "file specified by 'creates' already exists: {}",
                    creates.display()
                ),
            ));
        }
    }

    let mut request = ShellRequest::new(&spec.command)
        .envs(spec.environment.iter().cloned())
        .live_stream(spec.live_stream);
    if let Some(cwd) = &spec.cwd {
        request = request.cwd(cwd);
    }
    if let Some(user) = &spec.user {
        request = request.user(user);
    }
    if let Some(group) = &spec.group {
        request = request.group(group);
    }

    let out = request.run().map_err(DriverError::Other)?;

    if !out.stdout.is_empty() {
        tracing::debug!(command = %spec.command, stdout = %out.stdout.trim_end());
    }
    if !out.stderr.is_empty() {
        tracing::warn!(command = %spec.command, stderr = %out.stderr.trim_end());
    }

    if let Some(signal) = out.signal {
        return Err(DriverError::CommandKilled { signal });
    }
    if !out.success() {
        return Err(DriverError::CommandFailed {
            code: out.exit_code.unwrap_or(-1),
            stderr: out.stderr,
        });
    }
    Ok(ApplyResult::updated(RunAction::Run.as_str()))
}
