//! Per-kind resource builders: the declarative-to-imperative bridge.
//!
//! A builder collects setter mutations for one declaration, fills in
//! kind defaults, coerces scalar property values the way the scripting
//! runtime would (to-string, truthiness, to-integer), resolves
//! filesystem paths to absolute form, and fires exactly one typed
//! registration call on [`RecipeHost`].
//!
//! Builders accept properties two ways: typed setters for embedders,
//! and [`set`](FileBuilder::set)-style dynamic assignment from JSON
//! values for recipe-manifest loading.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use serde_json::Value;

use hola_fetch::TransportCredentials;

use crate::fsutil::expand_path;
use crate::host::{CommonWire, EventWire, GuardWire, RecipeHost, encode_env_wire};
use crate::source::parse_source;
use crate::types::{EnvPairs, PackageProvider, TemplateVar, ValueTag};

/// Scripted to-string coercion.
pub fn coerce_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Scripted truthiness: only `false` and `nil` are false.
pub fn coerce_bool(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        _ => true,
    }
}

/// Scripted to-integer coercion.
pub fn coerce_int(value: &Value) -> Result<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .with_context(|| format!("not an integer: {n}")),
        Value::String(s) => s
            .trim()
            .parse()
            .with_context(|| format!("not an integer: {s:?}")),
        other => bail!("cannot coerce {other} to an integer"),
    }
}

fn coerce_opt_string(value: &Value) -> Option<String> {
    if value.is_null() {
        None
    } else {
        Some(coerce_string(value))
    }
}

fn env_pairs_from_json(value: &Value) -> Result<EnvPairs> {
    let map = value
        .as_object()
        .context("environment must be an object of KEY: VALUE")?;
    Ok(map
        .iter()
        .map(|(k, v)| (k.clone(), coerce_string(v)))
        .collect())
}

/// Handle the guard/notification/subscription keys shared by every
/// kind; returns false when the key is kind-specific.
fn set_common_key(common: &mut CommonWire, key: &str, value: &Value) -> Result<bool> {
    match key {
        "only_if" => common.only_if = Some(GuardWire::Command(coerce_string(value))),
        "not_if" => common.not_if = Some(GuardWire::Command(coerce_string(value))),
        "ignore_failure" => common.ignore_failure = coerce_bool(value),
        "notifies" => {
            for event in event_list(value, "target")? {
                common.notifications.push(event);
            }
        }
        "subscribes" => {
            for event in event_list(value, "source")? {
                common.subscriptions.push(event);
            }
        }
        _ => return Ok(false),
    }
    Ok(true)
}

fn event_list(value: &Value, peer_key: &str) -> Result<Vec<EventWire>> {
    let entries: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        single => vec![single],
    };
    entries
        .into_iter()
        .map(|entry| {
            let obj = entry
                .as_object()
                .with_context(|| format!("event edge must be an object with action/{peer_key}"))?;
            let action = obj
                .get("action")
                .map(coerce_string)
                .context("event edge missing action")?;
            let resource = obj
                .get(peer_key)
                .map(coerce_string)
                .with_context(|| format!("event edge missing {peer_key}"))?;
            let timing = obj
                .get("timing")
                .map(coerce_string)
                .unwrap_or_else(|| "delayed".to_string());
            Ok(EventWire {
                resource,
                action,
                timing,
            })
        })
        .collect()
}

macro_rules! common_setters {
    () => {
        /// `only_if("cmd")`: run the resource only when the command
        /// exits zero.
        pub fn only_if(mut self, command: impl Into<String>) -> Self {
            self.common.only_if = Some(GuardWire::Command(command.into()));
            self
        }

        /// `only_if { block }`: scripted predicate by callable handle.
        pub fn only_if_block(mut self, handle: u64) -> Self {
            self.common.only_if = Some(GuardWire::Callable(handle));
            self
        }

        pub fn not_if(mut self, command: impl Into<String>) -> Self {
            self.common.not_if = Some(GuardWire::Command(command.into()));
            self
        }

        pub fn not_if_block(mut self, handle: u64) -> Self {
            self.common.not_if = Some(GuardWire::Callable(handle));
            self
        }

        pub fn ignore_failure(mut self, ignore: bool) -> Self {
            self.common.ignore_failure = ignore;
            self
        }

        /// `notifies(action, "target", timing)`; timing defaults to
        /// `delayed` at the call sites that omit it.
        pub fn notifies(
            mut self,
            action: impl Into<String>,
            target: impl Into<String>,
            timing: impl Into<String>,
        ) -> Self {
            self.common.notifications.push(EventWire {
                resource: target.into(),
                action: action.into(),
                timing: timing.into(),
            });
            self
        }

        pub fn subscribes(
            mut self,
            action: impl Into<String>,
            source: impl Into<String>,
            timing: impl Into<String>,
        ) -> Self {
            self.common.subscriptions.push(EventWire {
                resource: source.into(),
                action: action.into(),
                timing: timing.into(),
            });
            self
        }
    };
}

/// Builder for `file` resources.
#[derive(Debug, Clone)]
pub struct FileBuilder {
    path: String,
    content: Option<String>,
    mode: String,
    owner: Option<String>,
    group: Option<String>,
    backup: u32,
    action: String,
    common: CommonWire,
}

impl FileBuilder {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: None,
            mode: String::new(),
            owner: None,
            group: None,
            backup: 0,
            action: "create".to_string(),
            common: CommonWire::default(),
        }
    }

    common_setters!();

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn backup(mut self, backup: u32) -> Self {
        self.backup = backup;
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    /// Dynamic property assignment with scripted coercion.
    pub fn set(&mut self, key: &str, value: &Value) -> Result<()> {
        if set_common_key(&mut self.common, key, value)? {
            return Ok(());
        }
        match key {
            "content" => self.content = coerce_opt_string(value),
            "mode" => self.mode = coerce_string(value),
            "owner" => self.owner = coerce_opt_string(value),
            "group" => self.group = coerce_opt_string(value),
            "backup" => self.backup = coerce_int(value)?.max(0) as u32,
            "action" => self.action = coerce_string(value),
            other => bail!("file has no property {other:?}"),
        }
        Ok(())
    }

    pub fn register(self, host: &mut RecipeHost) -> Result<()> {
        let path = expand_path(&self.path);
        host.add_file(
            &path.display().to_string(),
            self.content,
            self.mode,
            self.owner,
            self.group,
            self.backup,
            &self.action,
            self.common,
        )
    }
}

/// Builder for `directory` resources.
#[derive(Debug, Clone)]
pub struct DirectoryBuilder {
    path: String,
    mode: String,
    owner: Option<String>,
    group: Option<String>,
    recursive: bool,
    action: String,
    common: CommonWire,
}

impl DirectoryBuilder {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode: String::new(),
            owner: None,
            group: None,
            recursive: false,
            action: "create".to_string(),
            common: CommonWire::default(),
        }
    }

    common_setters!();

    pub fn mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    pub fn set(&mut self, key: &str, value: &Value) -> Result<()> {
        if set_common_key(&mut self.common, key, value)? {
            return Ok(());
        }
        match key {
            "mode" => self.mode = coerce_string(value),
            "owner" => self.owner = coerce_opt_string(value),
            "group" => self.group = coerce_opt_string(value),
            "recursive" => self.recursive = coerce_bool(value),
            "action" => self.action = coerce_string(value),
            other => bail!("directory has no property {other:?}"),
        }
        Ok(())
    }

    pub fn register(self, host: &mut RecipeHost) -> Result<()> {
        let path = expand_path(&self.path);
        host.add_directory(
            &path.display().to_string(),
            self.mode,
            self.owner,
            self.group,
            self.recursive,
            &self.action,
            self.common,
        )
    }
}

/// Builder for `link` resources.
#[derive(Debug, Clone)]
pub struct LinkBuilder {
    path: String,
    target: String,
    owner: Option<String>,
    group: Option<String>,
    action: String,
    common: CommonWire,
}

impl LinkBuilder {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            target: String::new(),
            owner: None,
            group: None,
            action: "create".to_string(),
            common: CommonWire::default(),
        }
    }

    common_setters!();

    /// Where the link points (`to` in recipe syntax).
    pub fn to(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    pub fn set(&mut self, key: &str, value: &Value) -> Result<()> {
        if set_common_key(&mut self.common, key, value)? {
            return Ok(());
        }
        match key {
            "to" | "target" => self.target = coerce_string(value),
            "owner" => self.owner = coerce_opt_string(value),
            "group" => self.group = coerce_opt_string(value),
            "action" => self.action = coerce_string(value),
            other => bail!("link has no property {other:?}"),
        }
        Ok(())
    }

    pub fn register(self, host: &mut RecipeHost) -> Result<()> {
        if self.target.is_empty() {
            bail!("link {} requires a target", self.path);
        }
        let path = expand_path(&self.path);
        let target = expand_path(&self.target);
        host.add_link(
            &path.display().to_string(),
            &target.display().to_string(),
            self.owner,
            self.group,
            &self.action,
            self.common,
        )
    }
}

/// Builder for `remote_file` resources.
#[derive(Debug, Clone)]
pub struct RemoteFileBuilder {
    path: String,
    source: String,
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
    action: String,
    common: CommonWire,
}

impl RemoteFileBuilder {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            source: String::new(),
            mode: String::new(),
            owner: None,
            group: None,
            checksum: None,
            backup: 0,
            headers: BTreeMap::new(),
            use_etag: true,
            use_last_modified: true,
            force_unlink: false,
            credentials: TransportCredentials::default(),
            action: "create".to_string(),
            common: CommonWire::default(),
        }
    }

    common_setters!();

    pub fn source(mut self, url: impl Into<String>) -> Self {
        self.source = url.into();
        self
    }

    pub fn mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    pub fn checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn use_etag(mut self, use_etag: bool) -> Self {
        self.use_etag = use_etag;
        self
    }

    pub fn use_last_modified(mut self, use_last_modified: bool) -> Self {
        self.use_last_modified = use_last_modified;
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    pub fn set(&mut self, key: &str, value: &Value) -> Result<()> {
        if set_common_key(&mut self.common, key, value)? {
            return Ok(());
        }
        match key {
            "source" => self.source = coerce_string(value),
            "mode" => self.mode = coerce_string(value),
            "owner" => self.owner = coerce_opt_string(value),
            "group" => self.group = coerce_opt_string(value),
            "checksum" => self.checksum = coerce_opt_string(value),
            "backup" => self.backup = coerce_int(value)?.max(0) as u32,
            "headers" => {
                let map = value.as_object().context("headers must be an object")?;
                self.headers = map
                    .iter()
                    .map(|(k, v)| (k.clone(), coerce_string(v)))
                    .collect();
            }
            "use_etag" => self.use_etag = coerce_bool(value),
            "use_last_modified" => self.use_last_modified = coerce_bool(value),
            "force_unlink" => self.force_unlink = coerce_bool(value),
            "remote_user" => self.credentials.remote_user = coerce_opt_string(value),
            "remote_password" => self.credentials.remote_password = coerce_opt_string(value),
            "remote_domain" => self.credentials.remote_domain = coerce_opt_string(value),
            "ssh_private_key" => self.credentials.ssh_private_key = coerce_opt_string(value),
            "ssh_public_key" => self.credentials.ssh_public_key = coerce_opt_string(value),
            "ssh_known_hosts" => self.credentials.ssh_known_hosts = coerce_opt_string(value),
            "aws_access_key" => self.credentials.aws_access_key = coerce_opt_string(value),
            "aws_secret_key" => self.credentials.aws_secret_key = coerce_opt_string(value),
            "aws_region" => self.credentials.aws_region = coerce_opt_string(value),
            "aws_endpoint" => self.credentials.aws_endpoint = coerce_opt_string(value),
            "action" => self.action = coerce_string(value),
            other => bail!("remote_file has no property {other:?}"),
        }
        Ok(())
    }

    pub fn register(self, host: &mut RecipeHost) -> Result<()> {
        if self.source.is_empty() {
            bail!("remote_file {} requires a source", self.path);
        }
        let path = expand_path(&self.path);
        host.add_remote_file(
            &path.display().to_string(),
            self.source,
            self.mode,
            self.owner,
            self.group,
            self.checksum,
            self.backup,
            self.headers,
            self.use_etag,
            self.use_last_modified,
            self.force_unlink,
            self.credentials,
            &self.action,
            self.common,
        )
    }
}

/// Builder for `execute` resources.
#[derive(Debug, Clone)]
pub struct ExecuteBuilder {
    name: String,
    command: Option<String>,
    cwd: Option<String>,
    user: Option<String>,
    group: Option<String>,
    environment: EnvPairs,
    live_stream: bool,
    creates: Option<String>,
    action: String,
    common: CommonWire,
}

impl ExecuteBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: None,
            cwd: None,
            user: None,
            group: None,
            environment: Vec::new(),
            live_stream: false,
            creates: None,
            action: "run".to_string(),
            common: CommonWire::default(),
        }
    }

    common_setters!();

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.push((key.into(), value.into()));
        self
    }

    pub fn live_stream(mut self, live_stream: bool) -> Self {
        self.live_stream = live_stream;
        self
    }

    pub fn creates(mut self, creates: impl Into<String>) -> Self {
        self.creates = Some(creates.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    pub fn set(&mut self, key: &str, value: &Value) -> Result<()> {
        if set_common_key(&mut self.common, key, value)? {
            return Ok(());
        }
        match key {
            "command" => self.command = coerce_opt_string(value),
            "cwd" => self.cwd = coerce_opt_string(value),
            "user" => self.user = coerce_opt_string(value),
            "group" => self.group = coerce_opt_string(value),
            "environment" => self.environment = env_pairs_from_json(value)?,
            "live_stream" => self.live_stream = coerce_bool(value),
            "creates" => self.creates = coerce_opt_string(value),
            "action" => self.action = coerce_string(value),
            other => bail!("execute has no property {other:?}"),
        }
        Ok(())
    }

    pub fn register(self, host: &mut RecipeHost) -> Result<()> {
        // The name doubles as the command when none is declared.
        let command = self.command.unwrap_or_else(|| self.name.clone());
        let cwd = self.cwd.map(|dir| expand_path(&dir).display().to_string());
        let creates = self
            .creates
            .map(|path| expand_path(&path).display().to_string());
        host.add_execute(
            self.name,
            command,
            cwd,
            self.user,
            self.group,
            &encode_env_wire(&self.environment),
            self.live_stream,
            creates,
            &self.action,
            self.common,
        )
    }
}

/// Builder for `template` resources.
#[derive(Debug, Clone)]
pub struct TemplateBuilder {
    path: String,
    source: String,
    mode: String,
    owner: Option<String>,
    group: Option<String>,
    variables: Vec<TemplateVar>,
    action: String,
    common: CommonWire,
}

impl TemplateBuilder {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            source: String::new(),
            mode: String::new(),
            owner: None,
            group: None,
            variables: Vec::new(),
            action: "create".to_string(),
            common: CommonWire::default(),
        }
    }

    common_setters!();

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    pub fn variable(mut self, name: impl Into<String>, literal: impl Into<String>, tag: ValueTag) -> Self {
        self.variables.push(TemplateVar {
            name: name.into(),
            literal: literal.into(),
            tag,
        });
        self
    }

    /// Tag-and-flatten a JSON object of variables.
    pub fn variables_from_json(mut self, value: &Value) -> Result<Self> {
        let map = value.as_object().context("variables must be an object")?;
        for (name, value) in map {
            self.variables.push(tag_variable(name, value)?);
        }
        Ok(self)
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    pub fn set(&mut self, key: &str, value: &Value) -> Result<()> {
        if set_common_key(&mut self.common, key, value)? {
            return Ok(());
        }
        match key {
            "source" => self.source = coerce_string(value),
            "mode" => self.mode = coerce_string(value),
            "owner" => self.owner = coerce_opt_string(value),
            "group" => self.group = coerce_opt_string(value),
            "variables" => {
                let map = value.as_object().context("variables must be an object")?;
                self.variables = map
                    .iter()
                    .map(|(name, value)| tag_variable(name, value))
                    .collect::<Result<Vec<_>>>()?;
            }
            "action" => self.action = coerce_string(value),
            other => bail!("template has no property {other:?}"),
        }
        Ok(())
    }

    pub fn register(self, host: &mut RecipeHost) -> Result<()> {
        if self.source.is_empty() {
            bail!("template {} requires a source", self.path);
        }
        let path = expand_path(&self.path);
        let source = expand_path(&self.source);
        host.add_template(
            &path.display().to_string(),
            &source.display().to_string(),
            self.mode,
            self.owner,
            self.group,
            self.variables,
            &self.action,
            self.common,
        )
    }
}

fn tag_variable(name: &str, value: &Value) -> Result<TemplateVar> {
    let (literal, tag) = match value {
        Value::Null => (String::new(), ValueTag::Nil),
        Value::Bool(b) => (b.to_string(), ValueTag::Boolean),
        Value::Number(n) if n.is_i64() || n.is_u64() => (n.to_string(), ValueTag::Integer),
        Value::Number(n) => (n.to_string(), ValueTag::Float),
        Value::String(s) => (s.clone(), ValueTag::String),
        Value::Array(_) => (value.to_string(), ValueTag::Array),
        Value::Object(_) => bail!("template variable {name} has unsupported object type"),
    };
    Ok(TemplateVar {
        name: name.to_string(),
        literal,
        tag,
    })
}

/// Builder for `git` resources.
#[derive(Debug, Clone)]
pub struct GitBuilder {
    destination: String,
    repository: String,
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
    action: String,
    common: CommonWire,
}

impl GitBuilder {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            repository: String::new(),
            revision: "HEAD".to_string(),
            checkout_branch: "deploy".to_string(),
            remote: "origin".to_string(),
            depth: None,
            enable_checkout: true,
            enable_submodules: false,
            ssh_key: None,
            enable_strict_host_key_checking: true,
            user: None,
            group: None,
            action: "sync".to_string(),
            common: CommonWire::default(),
        }
    }

    common_setters!();

    pub fn repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = repository.into();
        self
    }

    pub fn revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    pub fn depth(mut self, depth: u32) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    pub fn set(&mut self, key: &str, value: &Value) -> Result<()> {
        if set_common_key(&mut self.common, key, value)? {
            return Ok(());
        }
        match key {
            "repository" => self.repository = coerce_string(value),
            "revision" => self.revision = coerce_string(value),
            "checkout_branch" => self.checkout_branch = coerce_string(value),
            "remote" => self.remote = coerce_string(value),
            "depth" => self.depth = Some(coerce_int(value)?.max(0) as u32),
            "enable_checkout" => self.enable_checkout = coerce_bool(value),
            "enable_submodules" => self.enable_submodules = coerce_bool(value),
            "ssh_key" => self.ssh_key = coerce_opt_string(value),
            "enable_strict_host_key_checking" => {
                self.enable_strict_host_key_checking = coerce_bool(value)
            }
            "user" => self.user = coerce_opt_string(value),
            "group" => self.group = coerce_opt_string(value),
            "action" => self.action = coerce_string(value),
            other => bail!("git has no property {other:?}"),
        }
        Ok(())
    }

    pub fn register(self, host: &mut RecipeHost) -> Result<()> {
        let destination = expand_path(&self.destination);
        host.add_git(
            self.repository,
            &destination.display().to_string(),
            self.revision,
            self.checkout_branch,
            self.remote,
            self.depth,
            self.enable_checkout,
            self.enable_submodules,
            self.ssh_key,
            self.enable_strict_host_key_checking,
            self.user,
            self.group,
            &self.action,
            self.common,
        )
    }
}

/// Builder for `package` resources (APT / Homebrew by platform).
#[derive(Debug, Clone)]
pub struct PackageBuilder {
    names: Vec<String>,
    version: Option<String>,
    options: Option<String>,
    provider: Option<PackageProvider>,
    action: String,
    common: CommonWire,
}

impl PackageBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            names: vec![name.into()],
            version: None,
            options: None,
            provider: None,
            action: "install".to_string(),
            common: CommonWire::default(),
        }
    }

    pub fn new_multi(names: Vec<String>) -> Self {
        Self {
            names,
            version: None,
            options: None,
            provider: None,
            action: "install".to_string(),
            common: CommonWire::default(),
        }
    }

    common_setters!();

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn provider(mut self, provider: PackageProvider) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    pub fn set(&mut self, key: &str, value: &Value) -> Result<()> {
        if set_common_key(&mut self.common, key, value)? {
            return Ok(());
        }
        match key {
            "package_name" => match value {
                Value::Array(items) => {
                    self.names = items.iter().map(coerce_string).collect();
                }
                single => self.names = vec![coerce_string(single)],
            },
            "version" => self.version = coerce_opt_string(value),
            "options" => self.options = coerce_opt_string(value),
            "provider" => {
                self.provider = Some(match coerce_string(value).as_str() {
                    "apt" => PackageProvider::Apt,
                    "homebrew" | "brew" => PackageProvider::Homebrew,
                    other => bail!("unknown package provider {other:?}"),
                });
            }
            "action" => self.action = coerce_string(value),
            other => bail!("package has no property {other:?}"),
        }
        Ok(())
    }

    pub fn register(self, host: &mut RecipeHost) -> Result<()> {
        if self.names.is_empty() || self.names.iter().any(|n| n.is_empty()) {
            bail!("package requires at least one non-empty name");
        }
        host.add_package(
            self.names,
            self.version,
            self.options,
            self.provider,
            &self.action,
            self.common,
        )
    }
}

/// Builder for `systemd_unit` resources.
#[derive(Debug, Clone)]
pub struct SystemdUnitBuilder {
    name: String,
    content: String,
    actions: Vec<String>,
    verify: bool,
    common: CommonWire,
}

impl SystemdUnitBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: String::new(),
            actions: vec!["create".to_string()],
            verify: true,
            common: CommonWire::default(),
        }
    }

    common_setters!();

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Replace the ordered action list.
    pub fn actions(mut self, actions: Vec<String>) -> Self {
        self.actions = actions;
        self
    }

    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn set(&mut self, key: &str, value: &Value) -> Result<()> {
        if set_common_key(&mut self.common, key, value)? {
            return Ok(());
        }
        match key {
            "content" => self.content = coerce_string(value),
            "action" => match value {
                Value::Array(items) => {
                    self.actions = items.iter().map(coerce_string).collect();
                }
                single => self.actions = vec![coerce_string(single)],
            },
            "verify" => self.verify = coerce_bool(value),
            other => bail!("systemd_unit has no property {other:?}"),
        }
        Ok(())
    }

    pub fn register(self, host: &mut RecipeHost) -> Result<()> {
        host.add_systemd_unit(self.name, self.content, &self.actions, self.verify, self.common)
    }
}

/// Builder for `ruby_block` resources. The callable handle has no JSON
/// form; manifest loaders reject this kind.
#[derive(Debug, Clone)]
pub struct RubyBlockBuilder {
    name: String,
    callable: Option<u64>,
    environment: EnvPairs,
    action: String,
    common: CommonWire,
}

impl RubyBlockBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            callable: None,
            environment: Vec::new(),
            action: "run".to_string(),
            common: CommonWire::default(),
        }
    }

    common_setters!();

    pub fn callable(mut self, handle: u64) -> Self {
        self.callable = Some(handle);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.push((key.into(), value.into()));
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    pub fn register(self, host: &mut RecipeHost) -> Result<()> {
        let callable = self
            .callable
            .with_context(|| format!("ruby_block {} requires a block", self.name))?;
        host.add_ruby_block(
            self.name,
            callable,
            &encode_env_wire(&self.environment),
            &self.action,
            self.common,
        )
    }
}

/// Builder for `aws_kms` resources. The identifier is the output path.
#[derive(Debug, Clone)]
pub struct AwsKmsBuilder {
    path: String,
    name: Option<String>,
    region: Option<String>,
    access_key_id: Option<String>,
    secret_access_key: Option<String>,
    session_token: Option<String>,
    key_id: String,
    algorithm: String,
    source: String,
    source_encoding: Option<String>,
    target_encoding: Option<String>,
    mode: String,
    owner: Option<String>,
    group: Option<String>,
    action: String,
    common: CommonWire,
}

impl AwsKmsBuilder {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: None,
            region: None,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            key_id: String::new(),
            algorithm: "SYMMETRIC_DEFAULT".to_string(),
            source: String::new(),
            source_encoding: None,
            target_encoding: None,
            mode: "0600".to_string(),
            owner: None,
            group: None,
            action: "decrypt".to_string(),
            common: CommonWire::default(),
        }
    }

    common_setters!();

    pub fn key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = key_id.into();
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    pub fn set(&mut self, key: &str, value: &Value) -> Result<()> {
        if set_common_key(&mut self.common, key, value)? {
            return Ok(());
        }
        match key {
            "name" => self.name = coerce_opt_string(value),
            "region" => self.region = coerce_opt_string(value),
            "access_key_id" => self.access_key_id = coerce_opt_string(value),
            "secret_access_key" => self.secret_access_key = coerce_opt_string(value),
            "session_token" => self.session_token = coerce_opt_string(value),
            "key_id" => self.key_id = coerce_string(value),
            "algorithm" => self.algorithm = coerce_string(value),
            "source" => self.source = coerce_string(value),
            "source_encoding" => self.source_encoding = coerce_opt_string(value),
            "target_encoding" => self.target_encoding = coerce_opt_string(value),
            "mode" => self.mode = coerce_string(value),
            "owner" => self.owner = coerce_opt_string(value),
            "group" => self.group = coerce_opt_string(value),
            "action" => self.action = coerce_string(value),
            other => bail!("aws_kms has no property {other:?}"),
        }
        Ok(())
    }

    pub fn register(self, host: &mut RecipeHost) -> Result<()> {
        if self.source.is_empty() {
            bail!("aws_kms {} requires a source", self.path);
        }

        // Encoding precedence: explicit field, then what the source
        // grammar prescribes, then the action's defaults (decrypt reads
        // base64 and writes binary; encrypt is the dual).
        let parsed = parse_source(&self.source);
        let (default_source, default_target) = match self.action.as_str() {
            "encrypt" => ("binary", "base64"),
            _ => ("base64", "binary"),
        };
        let source_encoding = self
            .source_encoding
            .or(parsed.encoding.map(|e| e.as_str().to_string()))
            .unwrap_or_else(|| default_source.to_string());
        let target_encoding = self
            .target_encoding
            .unwrap_or_else(|| default_target.to_string());

        let source = match parsed.source {
            crate::source::SourceRef::Path(path) => crate::source::SourceRef::Path(expand_path(
                &path.display().to_string(),
            )),
            inline => inline,
        };

        let path = expand_path(&self.path);
        let name = self.name.unwrap_or_else(|| path.display().to_string());
        host.add_aws_kms(
            name,
            self.region,
            self.access_key_id,
            self.secret_access_key,
            self.session_token,
            self.key_id,
            self.algorithm,
            source,
            &source_encoding,
            &target_encoding,
            &path.display().to_string(),
            self.mode,
            self.owner,
            self.group,
            &self.action,
            self.common,
        )
    }
}
