//! Resource drivers: one idempotence protocol per resource kind.
//!
//! Every driver follows the same skeleton: diff current state against
//! desired, return "up to date" when they already match, otherwise act,
//! re-read to verify, and report an update. Guard evaluation happens in
//! the scheduler before a driver ever runs.

use std::sync::Arc;

use hola_fetch::TransportRegistry;
use hola_kms::{KmsClient, LocalKms};

use crate::types::{
    ApplyResult, DirectoryAction, DriverError, FileAction, GitAction, KmsAction, LinkAction,
    PackageAction, ResourceRecord, ResourceSpec, RunAction, SystemdAction,
};

pub mod directory;
pub mod execute;
pub mod file;
pub mod git;
pub mod kms;
pub mod link;
pub mod package;
pub mod remote_file;
pub mod ruby_block;
pub mod systemd;
pub mod template;

/// Shared backends handed to drivers.
///
/// Cheap to clone; drivers run on a worker thread and take their own
/// handle.
pub struct DriverContext {
    /// Scheme-dispatched transports for `remote_file`.
    pub transports: Arc<TransportRegistry>,
    /// Key service for `aws_kms`.
    pub kms: Arc<dyn KmsClient>,
}

impl Default for DriverContext {
    fn default() -> Self {
        Self {
            transports: Arc::new(TransportRegistry::default()),
            kms: Arc::new(LocalKms::default()),
        }
    }
}

impl Clone for DriverContext {
    fn clone(&self) -> Self {
        Self {
            transports: self.transports.clone(),
            kms: self.kms.clone(),
        }
    }
}

/// Apply one action to one record, dispatching to the kind's driver.
pub fn apply(
    record: &ResourceRecord,
    action: &str,
    ctx: &DriverContext,
) -> Result<ApplyResult, DriverError> {
    match &record.spec {
        ResourceSpec::File(spec) => file::apply(spec, FileAction::parse("file", action)?),
        ResourceSpec::Directory(spec) => {
            directory::apply(spec, DirectoryAction::parse("directory", action)?)
        }
        ResourceSpec::Link(spec) => link::apply(spec, LinkAction::parse("link", action)?),
        ResourceSpec::RemoteFile(spec) => {
            remote_file::apply(spec, FileAction::parse("remote_file", action)?, ctx)
        }
        ResourceSpec::Execute(spec) => {
            execute::apply(spec, RunAction::parse("execute", action)?)
        }
        ResourceSpec::Template(spec) => {
            template::apply(spec, FileAction::parse("template", action)?)
        }
        ResourceSpec::Git(spec) => git::apply(spec, GitAction::parse("git", action)?),
        ResourceSpec::Package(spec) => {
            package::apply(spec, PackageAction::parse("package", action)?)
        }
        ResourceSpec::SystemdUnit(spec) => {
            systemd::apply(spec, SystemdAction::parse("systemd_unit", action)?)
        }
        ResourceSpec::RubyBlock(spec) => {
            ruby_block::apply(spec, RunAction::parse("ruby_block", action)?)
        }
        ResourceSpec::AwsKms(spec) => kms::apply(spec, KmsAction::parse("aws_kms", action)?, ctx),
    }
}
