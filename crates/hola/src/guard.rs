//! Guard evaluation: `only_if` / `not_if` predicates that can veto a
//! resource before its driver runs.
//!
//! Shell guards run through `/bin/sh -c`; non-zero exit is simply
//! "false". A guard that cannot be evaluated at all (spawn failure,
//! killed by signal, scripted guard raising) skips the resource with a
//! "guard error" reason rather than failing the run. Interpreter host
//! faults are fatal and bubble up.

use anyhow::{Result, anyhow};

use hola_process::ShellRequest;

use crate::interp::InterpreterError;
use crate::types::{EnvPairs, Guard, ResourceRecord, ResourceSpec};

/// The scheduler-facing outcome of guard evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Run,
    Skip { reason: String },
}

enum Check {
    True,
    False,
    Error,
}

/// Evaluate a record's guards in order: `only_if` first, then
/// `not_if`; the first veto wins.
pub fn evaluate(record: &ResourceRecord) -> Result<Verdict> {
    // Execute resources lend their working directory and environment
    // to their own shell guards.
    let (cwd, env): (Option<std::path::PathBuf>, EnvPairs) = match &record.spec {
        ResourceSpec::Execute(spec) => (spec.cwd.clone(), spec.environment.clone()),
        _ => (None, Vec::new()),
    };

    if let Some(guard) = &record.common.only_if {
        match check(guard, cwd.as_deref(), &env)? {
            Check::True => {}
            Check::False => {
                return Ok(Verdict::Skip {
                    reason: "guard".to_string(),
                });
            }
            Check::Error => {
                return Ok(Verdict::Skip {
                    reason: "guard error".to_string(),
                });
            }
        }
    }

    if let Some(guard) = &record.common.not_if {
        match check(guard, cwd.as_deref(), &env)? {
            Check::True => {
                return Ok(Verdict::Skip {
                    reason: "guard".to_string(),
                });
            }
            Check::False => {}
            Check::Error => {
                return Ok(Verdict::Skip {
                    reason: "guard error".to_string(),
                });
            }
        }
    }

    Ok(Verdict::Run)
}

fn check(guard: &Guard, cwd: Option<&std::path::Path>, env: &EnvPairs) -> Result<Check> {
    match guard {
        Guard::Command(command) => {
            let mut request = ShellRequest::new(command).envs(env.iter().cloned());
            if let Some(dir) = cwd {
                request = request.cwd(dir);
            }
            match request.run() {
                Ok(out) if out.killed() => {
                    tracing::warn!(%command, signal = ?out.signal, "guard killed");
                    Ok(Check::Error)
                }
                Ok(out) if out.success() => Ok(Check::True),
                Ok(_) => Ok(Check::False),
                Err(err) => {
                    tracing::warn!(%command, error = %err, "guard could not run");
                    Ok(Check::Error)
                }
            }
        }
        Guard::Block(callable) => match callable.call_predicate() {
            Ok(true) => Ok(Check::True),
            Ok(false) => Ok(Check::False),
            Err(InterpreterError::Raised(message)) => {
                tracing::warn!(%message, "scripted guard raised");
                Ok(Check::Error)
            }
            Err(fatal) => Err(anyhow!("interpreter fault during guard: {fatal}")),
        },
    }
}
