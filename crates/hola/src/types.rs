//! Core domain types: resource records, common properties, actions,
//! apply results, and the driver error taxonomy.
//!
//! A [`ResourceRecord`] is immutable after registration; drivers only
//! observe it by reference. Path-bearing fields are absolute by the
//! time a record exists (builders expand them), and scripted callables
//! referenced from [`CommonProps`] are pinned against garbage
//! collection for the record's lifetime.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::interp::{InterpreterRef, PinnedCallable};
use crate::source::{Encoding, SourceRef};
use hola_fetch::TransportCredentials;

/// Environment entries as `(key, value)` pairs, declaration-ordered.
pub type EnvPairs = Vec<(String, String)>;

/// When a notification fires relative to the main pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timing {
    /// Fire as soon as the notifying resource reports an update.
    Immediate,
    /// Queue for end-of-run replay (default).
    #[default]
    Delayed,
}

impl Timing {
    /// Normalise a timing string; anything other than `immediate` maps
    /// to `delayed`.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "immediate" | "immediately" => Timing::Immediate,
            "delayed" => Timing::Delayed,
            other => {
                tracing::warn!(timing = other, "unknown notification timing; using delayed");
                Timing::Delayed
            }
        }
    }
}

/// A forward event edge: when the declaring resource updates, run
/// `action` on the resource named `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub target: String,
    pub action: String,
    pub timing: Timing,
}

/// A reverse event edge: when the resource named `source` updates, run
/// `action` on the declaring resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub source: String,
    pub action: String,
    pub timing: Timing,
}

/// An `only_if` / `not_if` predicate.
#[derive(Debug, Clone)]
pub enum Guard {
    /// Shell command; exit 0 means "true".
    Command(String),
    /// Scripted predicate; truthy return means "true".
    Block(PinnedCallable),
}

/// Properties shared by every resource kind.
#[derive(Clone, Default)]
pub struct CommonProps {
    /// Run the resource only when this predicate holds.
    pub only_if: Option<Guard>,
    /// Skip the resource when this predicate holds.
    pub not_if: Option<Guard>,
    /// Convert driver failures into non-update results and keep going.
    pub ignore_failure: bool,
    /// Forward event edges, registration-ordered.
    pub notifications: Vec<Notification>,
    /// Reverse event edges, synthesised into notifications at load.
    pub subscriptions: Vec<Subscription>,
    /// The scripting runtime, needed to invoke guards and blocks.
    pub interpreter: Option<InterpreterRef>,
}

impl fmt::Debug for CommonProps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommonProps")
            .field("only_if", &self.only_if)
            .field("not_if", &self.not_if)
            .field("ignore_failure", &self.ignore_failure)
            .field("notifications", &self.notifications)
            .field("subscriptions", &self.subscriptions)
            .field("interpreter", &self.interpreter.as_ref().map(|_| "<interpreter>"))
            .finish()
    }
}

/// What one `apply` did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    /// True when observable state changed; the trigger for notifications.
    pub was_updated: bool,
    /// String form of the action actually executed.
    pub action: String,
    /// Why nothing happened, when nothing happened.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl ApplyResult {
    /// An apply that changed state.
    pub fn updated(action: impl Into<String>) -> Self {
        Self {
            was_updated: true,
            action: action.into(),
            skip_reason: None,
        }
    }

    /// An apply that found nothing to do.
    pub fn skipped(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            was_updated: false,
            action: action.into(),
            skip_reason: Some(reason.into()),
        }
    }

    /// The canonical "already converged" result.
    pub fn up_to_date(action: impl Into<String>) -> Self {
        Self::skipped(action, "up to date")
    }
}

/// Driver failure taxonomy (spec-level, not transport-level).
#[derive(Debug, Error)]
pub enum DriverError {
    /// Subprocess exited non-zero.
    #[error("command failed with exit code {code}: {stderr}")]
    CommandFailed { code: i32, stderr: String },
    /// Subprocess died on a signal.
    #[error("command killed by signal {signal}")]
    CommandKilled { signal: i32 },
    /// Package install transaction failed.
    #[error("package install failed: {0}")]
    InstallFailed(String),
    /// Package remove transaction failed.
    #[error("package remove failed: {0}")]
    RemoveFailed(String),
    /// Package upgrade transaction failed.
    #[error("package upgrade failed: {0}")]
    UpgradeFailed(String),
    /// A scripted block raised.
    #[error("block failed: {0}")]
    RubyBlockFailed(String),
    /// A referenced object (target resource, repo, unit) is missing.
    #[error("not found: {0}")]
    NotFound(String),
    /// Downloaded or rendered bytes failed checksum enforcement.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    /// Unit file verification failed; the write was backed out.
    #[error("unit verification failed: {0}")]
    VerifyFailed(String),
    /// The key service refused the operation.
    #[error("key service denied: {0}")]
    KmsDenied(String),
    /// An action string that the resource kind does not understand.
    #[error("unknown action '{action}' for {kind} resource")]
    UnknownAction { kind: &'static str, action: String },
    /// Interpreter host fault (allocation failure, lost handle).
    /// Always fatal; `ignore_failure` does not apply.
    #[error("interpreter host failure: {0}")]
    Host(String),
    /// Anything else (I/O, transport, lookup).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

macro_rules! actions {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $repr:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            pub fn parse(kind: &'static str, raw: &str) -> Result<Self, DriverError> {
                match raw {
                    $($repr => Ok(Self::$variant),)+
                    other => Err(DriverError::UnknownAction {
                        kind,
                        action: other.to_string(),
                    }),
                }
            }

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $repr,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

actions!(
    /// Actions for `file`, `template`, and `remote_file` resources.
    FileAction {
        Create => "create",
        CreateIfMissing => "create_if_missing",
        Delete => "delete",
        Touch => "touch",
    }
);

actions!(
    /// Actions for `directory` resources.
    DirectoryAction {
        Create => "create",
        Delete => "delete",
    }
);

actions!(
    /// Actions for `link` resources.
    LinkAction {
        Create => "create",
        Delete => "delete",
    }
);

actions!(
    /// Actions for `execute` and `ruby_block` resources.
    RunAction {
        Run => "run",
        Nothing => "nothing",
    }
);

actions!(
    /// Actions for `git` resources.
    GitAction {
        Sync => "sync",
        Checkout => "checkout",
    }
);

actions!(
    /// Actions for `package` resources.
    PackageAction {
        Install => "install",
        Remove => "remove",
        Upgrade => "upgrade",
        Nothing => "nothing",
    }
);

actions!(
    /// Actions for `systemd_unit` resources (a record carries an
    /// ordered list of these).
    SystemdAction {
        Create => "create",
        Delete => "delete",
        Enable => "enable",
        Disable => "disable",
        Start => "start",
        Stop => "stop",
        Restart => "restart",
        Reload => "reload",
    }
);

actions!(
    /// Actions for `aws_kms` resources.
    KmsAction {
        Encrypt => "encrypt",
        Decrypt => "decrypt",
    }
);

/// Desired state of a plain file.
#[derive(Debug, Clone)]
pub struct FileSpec {
    /// Absolute destination path; doubles as the resource name.
    pub path: PathBuf,
    /// Managed content; `None` manages existence/permissions only.
    pub content: Option<String>,
    /// Octal mode string; empty preserves the existing mode.
    pub mode: String,
    pub owner: Option<String>,
    pub group: Option<String>,
    /// Keep up to this many numbered backups of replaced content.
    pub backup: u32,
    pub action: FileAction,
}

/// Desired state of a directory.
#[derive(Debug, Clone)]
pub struct DirectorySpec {
    pub path: PathBuf,
    pub mode: String,
    pub owner: Option<String>,
    pub group: Option<String>,
    /// Create missing parents too.
    pub recursive: bool,
    pub action: DirectoryAction,
}

/// Desired state of a symlink.
#[derive(Debug, Clone)]
pub struct LinkSpec {
    /// The link itself.
    pub path: PathBuf,
    /// Where it points.
    pub target: PathBuf,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub action: LinkAction,
}

/// Desired state of a downloaded file.
#[derive(Debug, Clone)]
pub struct RemoteFileSpec {
    pub path: PathBuf,
    pub source_url: String,
    pub mode: String,
    pub owner: Option<String>,
    pub group: Option<String>,
    /// Authoritative SHA-256 of the artifact, when declared.
    pub checksum: Option<String>,
    pub backup: u32,
    /// Extra request headers.
    pub headers: BTreeMap<String, String>,
    pub use_etag: bool,
    pub use_last_modified: bool,
    /// Unlink the destination before writing the fresh copy.
    pub force_unlink: bool,
    pub credentials: TransportCredentials,
    pub action: FileAction,
}

/// A command to run.
#[derive(Debug, Clone)]
pub struct ExecuteSpec {
    pub name: String,
    pub command: String,
    pub cwd: Option<PathBuf>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub environment: EnvPairs,
    /// Echo child output to the terminal while it runs.
    pub live_stream: bool,
    /// Skip when this file already exists.
    pub creates: Option<PathBuf>,
    pub action: RunAction,
}

/// Scalar type tag for template variables crossing the ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueTag {
    String,
    Integer,
    Float,
    Boolean,
    Nil,
    Array,
}

/// One template variable: name, wire literal, and its scalar type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateVar {
    pub name: String,
    pub literal: String,
    pub tag: ValueTag,
}

/// Desired state of a rendered template.
#[derive(Debug, Clone)]
pub struct TemplateSpec {
    pub path: PathBuf,
    /// Template source file.
    pub source: PathBuf,
    pub mode: String,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub variables: Vec<TemplateVar>,
    pub action: FileAction,
}

/// Desired state of a git checkout.
#[derive(Debug, Clone)]
pub struct GitSpec {
    /// Working-copy path; doubles as the resource name.
    pub destination: PathBuf,
    pub repository: String,
    pub revision: String,
    pub checkout_branch: String,
    pub remote: String,
    /// Shallow-clone depth; `None` is unlimited.
    pub depth: Option<u32>,
    pub enable_checkout: bool,
    pub enable_submodules: bool,
    pub ssh_key: Option<PathBuf>,
    pub enable_strict_host_key_checking: bool,
    pub user: Option<String>,
    pub group: Option<String>,
    pub action: GitAction,
}

/// Which package manager services a `package` resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageProvider {
    Apt,
    Homebrew,
}

/// Desired state of one or more packages.
#[derive(Debug, Clone)]
pub struct PackageSpec {
    /// First name doubles as the resource name.
    pub names: Vec<String>,
    pub version: Option<String>,
    /// Extra arguments passed through to the package manager.
    pub options: Option<String>,
    /// Explicit provider; platform default otherwise.
    pub provider: Option<PackageProvider>,
    pub action: PackageAction,
}

/// Desired state of a systemd unit.
#[derive(Debug, Clone)]
pub struct SystemdUnitSpec {
    /// Unit file name, e.g. `demo.service`.
    pub name: String,
    pub content: String,
    /// Ordered actions applied sequentially.
    pub actions: Vec<SystemdAction>,
    /// Run `systemd-analyze verify` between write and reload.
    pub verify: bool,
}

/// A scripted block run through the interpreter.
#[derive(Debug, Clone)]
pub struct RubyBlockSpec {
    pub name: String,
    pub callable: PinnedCallable,
    /// Exported transactionally around the call.
    pub environment: EnvPairs,
    pub action: RunAction,
}

/// An encrypt/decrypt artifact produced through the key service.
#[derive(Debug, Clone)]
pub struct AwsKmsSpec {
    pub name: String,
    pub key_id: String,
    pub algorithm: String,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    /// Parsed source reference (path or inline payload).
    pub source: SourceRef,
    pub source_encoding: Encoding,
    pub target_encoding: Encoding,
    /// Output artifact path.
    pub path: PathBuf,
    pub mode: String,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub action: KmsAction,
}

/// The tagged union of resource kinds.
#[derive(Debug, Clone)]
pub enum ResourceSpec {
    File(FileSpec),
    Directory(DirectorySpec),
    Link(LinkSpec),
    RemoteFile(RemoteFileSpec),
    Execute(ExecuteSpec),
    Template(TemplateSpec),
    Git(GitSpec),
    Package(PackageSpec),
    SystemdUnit(SystemdUnitSpec),
    RubyBlock(RubyBlockSpec),
    AwsKms(AwsKmsSpec),
}

/// One registered resource: kind-specific spec plus shared properties.
#[derive(Debug, Clone)]
pub struct ResourceRecord {
    pub spec: ResourceSpec,
    pub common: CommonProps,
}

impl ResourceRecord {
    /// Resource identity: the expanded path for path-bearing kinds, the
    /// user-supplied name otherwise.
    pub fn name(&self) -> String {
        match &self.spec {
            ResourceSpec::File(s) => s.path.display().to_string(),
            ResourceSpec::Directory(s) => s.path.display().to_string(),
            ResourceSpec::Link(s) => s.path.display().to_string(),
            ResourceSpec::RemoteFile(s) => s.path.display().to_string(),
            ResourceSpec::Execute(s) => s.name.clone(),
            ResourceSpec::Template(s) => s.path.display().to_string(),
            ResourceSpec::Git(s) => s.destination.display().to_string(),
            ResourceSpec::Package(s) => s.names.first().cloned().unwrap_or_default(),
            ResourceSpec::SystemdUnit(s) => s.name.clone(),
            ResourceSpec::RubyBlock(s) => s.name.clone(),
            ResourceSpec::AwsKms(s) => s.name.clone(),
        }
    }

    /// Lower-case kind label for logs and error messages.
    pub fn kind(&self) -> &'static str {
        match &self.spec {
            ResourceSpec::File(_) => "file",
            ResourceSpec::Directory(_) => "directory",
            ResourceSpec::Link(_) => "link",
            ResourceSpec::RemoteFile(_) => "remote_file",
            ResourceSpec::Execute(_) => "execute",
            ResourceSpec::Template(_) => "template",
            ResourceSpec::Git(_) => "git",
            ResourceSpec::Package(_) => "package",
            ResourceSpec::SystemdUnit(_) => "systemd_unit",
            ResourceSpec::RubyBlock(_) => "ruby_block",
            ResourceSpec::AwsKms(_) => "aws_kms",
        }
    }

    /// The declared actions, as strings, in the order the main pass
    /// runs them. Single-action kinds yield one entry; `systemd_unit`
    /// yields its ordered list.
    pub fn declared_actions(&self) -> Vec<String> {
        match &self.spec {
            ResourceSpec::File(s) => vec![s.action.to_string()],
            ResourceSpec::Directory(s) => vec![s.action.to_string()],
            ResourceSpec::Link(s) => vec![s.action.to_string()],
            ResourceSpec::RemoteFile(s) => vec![s.action.to_string()],
            ResourceSpec::Execute(s) => vec![s.action.to_string()],
            ResourceSpec::Template(s) => vec![s.action.to_string()],
            ResourceSpec::Git(s) => vec![s.action.to_string()],
            ResourceSpec::Package(s) => vec![s.action.to_string()],
            ResourceSpec::SystemdUnit(s) => {
                s.actions.iter().map(|a| a.to_string()).collect()
            }
            ResourceSpec::RubyBlock(s) => vec![s.action.to_string()],
            ResourceSpec::AwsKms(s) => vec![s.action.to_string()],
        }
    }
}

/// The ordered collection of registered resources.
#[derive(Debug, Default, Clone)]
pub struct ResourceList {
    records: Vec<Arc<ResourceRecord>>,
}

impl ResourceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record; declaration order is apply order.
    pub fn push(&mut self, record: ResourceRecord) {
        self.records.push(Arc::new(record));
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ResourceRecord>> {
        self.records.iter()
    }

    /// First record with the given name, in declaration order.
    pub fn find(&self, name: &str) -> Option<&Arc<ResourceRecord>> {
        self.records.iter().find(|r| r.name() == name)
    }

    pub fn get(&self, index: usize) -> Option<&Arc<ResourceRecord>> {
        self.records.get(index)
    }
}
