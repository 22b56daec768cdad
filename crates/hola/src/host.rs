//! The registration ABI between the scripting runtime and the native
//! engine.
//!
//! Each resource declaration in a recipe funnels through exactly one
//! `add_*` call on [`RecipeHost`], carrying a flattened property bag of
//! wire-level values: strings for actions and timings, raw callable
//! handles for guards, NUL-separated `KEY=VALUE` runs for environments.
//! The host copies everything into native-owned records, pins scripted
//! callables, and appends to the [`ResourceList`]. No pointer into the
//! interpreter heap outlives the call.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};

use hola_fetch::TransportCredentials;

use crate::interp::{CallableHandle, InterpreterRef, PinnedCallable};
use crate::source::{Encoding, SourceRef};
use crate::types::{
    AwsKmsSpec, CommonProps, DirectoryAction, DirectorySpec, EnvPairs, ExecuteSpec, FileAction,
    FileSpec, GitAction, GitSpec, Guard, KmsAction, LinkAction, LinkSpec, Notification,
    PackageAction, PackageProvider, PackageSpec, RemoteFileSpec, ResourceList, ResourceRecord,
    ResourceSpec, RubyBlockSpec, RunAction, Subscription, SystemdAction, SystemdUnitSpec,
    TemplateSpec, TemplateVar, Timing,
};

/// A guard as it crosses the ABI: a shell command string or a raw
/// callable handle into the interpreter heap.
#[derive(Debug, Clone)]
pub enum GuardWire {
    Command(String),
    Callable(u64),
}

/// A notification or subscription edge as it crosses the ABI.
#[derive(Debug, Clone)]
pub struct EventWire {
    /// Target resource name (source name for subscriptions).
    pub resource: String,
    pub action: String,
    pub timing: String,
}

/// The shared property bundle as it crosses the ABI.
#[derive(Debug, Clone, Default)]
pub struct CommonWire {
    pub only_if: Option<GuardWire>,
    pub not_if: Option<GuardWire>,
    pub ignore_failure: bool,
    pub notifications: Vec<EventWire>,
    pub subscriptions: Vec<EventWire>,
}

/// Parse a NUL-separated `KEY=VALUE` run into ordered pairs.
pub fn parse_env_wire(wire: &str) -> Result<EnvPairs> {
    let mut pairs = Vec::new();
    for entry in wire.split('\0') {
        if entry.is_empty() {
            continue;
        }
        let (key, value) = entry
            .split_once('=')
            .with_context(|| format!("malformed environment entry: {entry:?}"))?;
        if key.is_empty() {
            bail!("empty environment key in entry: {entry:?}");
        }
        pairs.push((key.to_string(), value.to_string()));
    }
    Ok(pairs)
}

/// Join ordered pairs into the NUL-separated wire form.
pub fn encode_env_wire(pairs: &EnvPairs) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\0")
}

/// The native side of recipe evaluation: collects registrations into
/// the [`ResourceList`] the scheduler will drive.
#[derive(Default)]
pub struct RecipeHost {
    interpreter: Option<InterpreterRef>,
    resources: ResourceList,
}

impl RecipeHost {
    /// A host without an interpreter. Callable guards and `ruby_block`
    /// registrations are rejected.
    pub fn new() -> Self {
        Self::default()
    }

    /// A host bound to a scripting runtime.
    pub fn with_interpreter(interpreter: InterpreterRef) -> Self {
        Self {
            interpreter: Some(interpreter),
            resources: ResourceList::new(),
        }
    }

    /// Hand the registered resources to the scheduler.
    pub fn into_resources(self) -> ResourceList {
        self.resources
    }

    pub fn resources(&self) -> &ResourceList {
        &self.resources
    }

    fn push(&mut self, spec: ResourceSpec, common: CommonWire) -> Result<()> {
        let common = self.convert_common(common)?;
        self.resources.push(ResourceRecord { spec, common });
        Ok(())
    }

    fn convert_common(&self, wire: CommonWire) -> Result<CommonProps> {
        let only_if = wire.only_if.map(|g| self.convert_guard(g)).transpose()?;
        let not_if = wire.not_if.map(|g| self.convert_guard(g)).transpose()?;

        let notifications = wire
            .notifications
            .into_iter()
            .map(|e| Notification {
                target: e.resource,
                action: e.action,
                timing: Timing::parse(&e.timing),
            })
            .collect();
        let subscriptions = wire
            .subscriptions
            .into_iter()
            .map(|e| Subscription {
                source: e.resource,
                action: e.action,
                timing: Timing::parse(&e.timing),
            })
            .collect();

        Ok(CommonProps {
            only_if,
            not_if,
            ignore_failure: wire.ignore_failure,
            notifications,
            subscriptions,
            interpreter: self.interpreter.clone(),
        })
    }

    fn convert_guard(&self, wire: GuardWire) -> Result<Guard> {
        match wire {
            GuardWire::Command(command) => Ok(Guard::Command(command)),
            GuardWire::Callable(handle) => {
                let interpreter = self
                    .interpreter
                    .clone()
                    .context("callable guard requires an interpreter")?;
                Ok(Guard::Block(PinnedCallable::new(
                    interpreter,
                    CallableHandle(handle),
                )))
            }
        }
    }

    fn require_absolute(path: &str, field: &str) -> Result<PathBuf> {
        let path = PathBuf::from(path);
        if !path.is_absolute() {
            bail!("{field} must be absolute at registration time: {}", path.display());
        }
        Ok(path)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_file(
        &mut self,
        path: &str,
        content: Option<String>,
        mode: String,
        owner: Option<String>,
        group: Option<String>,
        backup: u32,
        action: &str,
        common: CommonWire,
    ) -> Result<()> {
        let spec = FileSpec {
            path: Self::require_absolute(path, "file path")?,
            content,
            mode,
            owner,
            group,
            backup,
            action: FileAction::parse("file", action)?,
        };
        self.push(ResourceSpec::File(spec), common)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_directory(
        &mut self,
        path: &str,
        mode: String,
        owner: Option<String>,
        group: Option<String>,
        recursive: bool,
        action: &str,
        common: CommonWire,
    ) -> Result<()> {
        let spec = DirectorySpec {
            path: Self::require_absolute(path, "directory path")?,
            mode,
            owner,
            group,
            recursive,
            action: DirectoryAction::parse("directory", action)?,
        };
        self.push(ResourceSpec::Directory(spec), common)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_link(
        &mut self,
        path: &str,
        target: &str,
        owner: Option<String>,
        group: Option<String>,
        action: &str,
        common: CommonWire,
    ) -> Result<()> {
        let spec = LinkSpec {
            path: Self::require_absolute(path, "link path")?,
            target: Self::require_absolute(target, "link target")?,
            owner,
            group,
            action: LinkAction::parse("link", action)?,
        };
        self.push(ResourceSpec::Link(spec), common)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_remote_file(
        &mut self,
        path: &str,
        source_url: String,
        mode: String,
        owner: Option<String>,
        group: Option<String>,
        checksum: Option<String>,
        backup: u32,
        headers: BTreeMap<String, String>,
        use_etag: bool,
        use_last_modified: bool,
        force_unlink: bool,
        credentials: TransportCredentials,
        action: &str,
        common: CommonWire,
    ) -> Result<()> {
        let spec = RemoteFileSpec {
            path: Self::require_absolute(path, "remote_file path")?,
            source_url,
            mode,
            owner,
            group,
            checksum,
            backup,
            headers,
            use_etag,
            use_last_modified,
            force_unlink,
            credentials,
            action: FileAction::parse("remote_file", action)?,
        };
        self.push(ResourceSpec::RemoteFile(spec), common)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_execute(
        &mut self,
        name: String,
        command: String,
        cwd: Option<String>,
        user: Option<String>,
        group: Option<String>,
        environment_wire: &str,
        live_stream: bool,
        creates: Option<String>,
        action: &str,
        common: CommonWire,
    ) -> Result<()> {
        let cwd = cwd
            .map(|dir| Self::require_absolute(&dir, "execute cwd"))
            .transpose()?;
        let creates = creates
            .map(|path| Self::require_absolute(&path, "execute creates"))
            .transpose()?;
        let spec = ExecuteSpec {
            name,
            command,
            cwd,
            user,
            group,
            environment: parse_env_wire(environment_wire)?,
            live_stream,
            creates,
            action: RunAction::parse("execute", action)?,
        };
        self.push(ResourceSpec::Execute(spec), common)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_template(
        &mut self,
        path: &str,
        template_source: &str,
        mode: String,
        owner: Option<String>,
        group: Option<String>,
        variables: Vec<TemplateVar>,
        action: &str,
        common: CommonWire,
    ) -> Result<()> {
        let action = FileAction::parse("template", action)?;
        if action == FileAction::Touch {
            bail!("template resources do not support the touch action");
        }
        let spec = TemplateSpec {
            path: Self::require_absolute(path, "template path")?,
            source: Self::require_absolute(template_source, "template source")?,
            mode,
            owner,
            group,
            variables,
            action,
        };
        self.push(ResourceSpec::Template(spec), common)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_git(
        &mut self,
        repository: String,
        destination: &str,
        revision: String,
        checkout_branch: String,
        remote: String,
        depth: Option<u32>,
        enable_checkout: bool,
        enable_submodules: bool,
        ssh_key: Option<String>,
        enable_strict_host_key_checking: bool,
        user: Option<String>,
        group: Option<String>,
        action: &str,
        common: CommonWire,
    ) -> Result<()> {
        let spec = GitSpec {
            destination: Self::require_absolute(destination, "git destination")?,
            repository,
            revision,
            checkout_branch,
            remote,
            depth,
            enable_checkout,
            enable_submodules,
            ssh_key: ssh_key.map(PathBuf::from),
            enable_strict_host_key_checking,
            user,
            group,
            action: GitAction::parse("git", action)?,
        };
        self.push(ResourceSpec::Git(spec), common)
    }

    pub fn add_package(
        &mut self,
        names: Vec<String>,
        version: Option<String>,
        options: Option<String>,
        provider: Option<PackageProvider>,
        action: &str,
        common: CommonWire,
    ) -> Result<()> {
        let spec = PackageSpec {
            names,
            version,
            options,
            provider,
            action: PackageAction::parse("package", action)?,
        };
        self.push(ResourceSpec::Package(spec), common)
    }

    pub fn add_systemd_unit(
        &mut self,
        name: String,
        content: String,
        actions: &[String],
        verify: bool,
        common: CommonWire,
    ) -> Result<()> {
        let actions = actions
            .iter()
            .map(|a| SystemdAction::parse("systemd_unit", a))
            .collect::<Result<Vec<_>, _>>()?;
        let spec = SystemdUnitSpec {
            name,
            content,
            actions,
            verify,
        };
        self.push(ResourceSpec::SystemdUnit(spec), common)
    }

    pub fn add_ruby_block(
        &mut self,
        name: String,
        callable: u64,
        environment_wire: &str,
        action: &str,
        common: CommonWire,
    ) -> Result<()> {
        let interpreter = self
            .interpreter
            .clone()
            .context("ruby_block requires an interpreter")?;
        let spec = RubyBlockSpec {
            name,
            callable: PinnedCallable::new(interpreter, CallableHandle(callable)),
            environment: parse_env_wire(environment_wire)?,
            action: RunAction::parse("ruby_block", action)?,
        };
        self.push(ResourceSpec::RubyBlock(spec), common)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_aws_kms(
        &mut self,
        name: String,
        region: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        session_token: Option<String>,
        key_id: String,
        algorithm: String,
        source: SourceRef,
        source_encoding: &str,
        target_encoding: &str,
        path: &str,
        mode: String,
        owner: Option<String>,
        group: Option<String>,
        action: &str,
        common: CommonWire,
    ) -> Result<()> {
        let spec = AwsKmsSpec {
            name,
            key_id,
            algorithm,
            region,
            access_key_id,
            secret_access_key,
            session_token,
            source,
            source_encoding: parse_encoding(source_encoding)?,
            target_encoding: parse_encoding(target_encoding)?,
            path: Self::require_absolute(path, "aws_kms path")?,
            mode,
            owner,
            group,
            action: KmsAction::parse("aws_kms", action)?,
        };
        self.push(ResourceSpec::AwsKms(spec), common)
    }
}

fn parse_encoding(raw: &str) -> Result<Encoding> {
    match raw {
        "binary" => Ok(Encoding::Binary),
        "base64" => Ok(Encoding::Base64),
        other => bail!("unknown encoding: {other:?}"),
    }
}
