//! The `ruby_block` driver: invoke a pinned scripted callable with its
//! environment exported transactionally.
//!
//! This is the one driver the scheduler runs on the main thread; the
//! interpreter must never be entered from a worker.

use crate::env::EnvTransaction;
use crate::interp::InterpreterError;
use crate::types::{ApplyResult, DriverError, RubyBlockSpec, RunAction};

pub fn apply(spec: &RubyBlockSpec, action: RunAction) -> Result<ApplyResult, DriverError> {
    match action {
        RunAction::Nothing => Ok(ApplyResult::skipped(
            RunAction::Nothing.as_str(),
            "action nothing requested",
        )),
        RunAction::Run => {
            let _env = EnvTransaction::apply(&spec.environment);
            match spec.callable.call_block() {
                Ok(()) => Ok(ApplyResult::updated(RunAction::Run.as_str())),
                Err(InterpreterError::Raised(message)) => {
                    tracing::warn!(block = %spec.name, %message, "block raised");
                    Err(DriverError::RubyBlockFailed(message))
                }
                Err(fatal) => Err(DriverError::Host(fatal.to_string())),
            }
            // _env drops here, restoring the environment on all paths.
        }
    }
}
