//! The convergence scheduler.
//!
//! Drives the [`ResourceList`] in declaration order: preflight
//! validation, guard evaluation, driver invocation (offloaded to a
//! worker thread so the reporter can heartbeat), then event
//! propagation: immediate notifications nest inline, delayed ones
//! queue for end-of-run replay with run-wide `(target, action)`
//! deduplication.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};

use hola_task::Task;

use crate::drivers::{self, DriverContext};
use crate::guard::{self, Verdict};
use crate::types::{
    ApplyResult, DirectoryAction, DriverError, FileAction, GitAction, KmsAction, LinkAction,
    Notification, PackageAction, ResourceList, ResourceRecord, ResourceSpec, RunAction,
    SystemdAction, Timing,
};

/// How often the scheduler wakes the reporter while a driver works.
const HEARTBEAT: Duration = Duration::from_millis(100);

/// Per-resource log sink driven by the scheduler.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
    /// Called while an offloaded driver operation is in flight.
    fn heartbeat(&mut self) {}
}

/// Reporter that swallows everything.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

/// One record's outcome in the run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceOutcome {
    pub name: String,
    pub kind: String,
    pub result: ApplyResult,
}

/// End-of-run summary.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub duration: Duration,
    pub updated: usize,
    pub up_to_date: usize,
    pub skipped: usize,
    pub failed: usize,
    pub outcomes: Vec<ResourceOutcome>,
}

impl RunReport {
    /// True when every resource converged without even an ignored
    /// failure.
    pub fn clean(&self) -> bool {
        self.failed == 0
    }
}

/// Delayed-notification queue with run-wide dedup by `(target, action)`.
#[derive(Debug, Default)]
struct NotificationQueue {
    queue: VecDeque<(String, String)>,
    seen: HashSet<(String, String)>,
}

impl NotificationQueue {
    /// Enqueue unless this `(target, action)` already fired or was
    /// queued this run.
    fn push(&mut self, target: String, action: String) -> bool {
        let key = (target, action);
        if self.seen.insert(key.clone()) {
            self.queue.push_back(key);
            true
        } else {
            tracing::debug!(notify_target = %key.0, action = %key.1, "delayed notification deduplicated");
            false
        }
    }

    fn pop(&mut self) -> Option<(String, String)> {
        self.queue.pop_front()
    }
}

/// Converge every resource in the list, then drain delayed
/// notifications. Errors abort the run unless the failing record set
/// `ignore_failure`.
pub fn run(
    resources: &ResourceList,
    ctx: &DriverContext,
    reporter: &mut dyn Reporter,
) -> Result<RunReport> {
    let started_at = Utc::now();
    let start = Instant::now();

    preflight(resources)?;

    let name_index = build_name_index(resources);
    let edges = build_edges(resources, &name_index);

    let mut queue = NotificationQueue::default();
    let mut outcomes = Vec::with_capacity(resources.len());

    for (idx, record) in resources.iter().enumerate() {
        let label = label(record);

        match guard::evaluate(record)? {
            Verdict::Skip { reason } => {
                reporter.warn(&format!("{label}: skipped ({reason})"));
                let action = record
                    .declared_actions()
                    .into_iter()
                    .next()
                    .unwrap_or_default();
                outcomes.push(ResourceOutcome {
                    name: record.name(),
                    kind: record.kind().to_string(),
                    result: ApplyResult::skipped(action, reason),
                });
                continue;
            }
            Verdict::Run => {}
        }

        let mut results = Vec::new();
        let mut had_ignored_failure = false;
        for action in record.declared_actions() {
            match invoke(record, &action, ctx, reporter)? {
                Ok(result) => results.push(result),
                Err(DriverError::Host(msg)) => {
                    bail!("{label}: interpreter host failure: {msg}");
                }
                Err(err) if record.common.ignore_failure => {
                    reporter.warn(&format!("{label}: ignored failure: {err}"));
                    results.push(ApplyResult::skipped(
                        action,
                        format!("ignored failure: {err}"),
                    ));
                    had_ignored_failure = true;
                    break;
                }
                Err(err) => {
                    reporter.error(&format!("{label}: {action} failed: {err}"));
                    return Err(anyhow::Error::new(err))
                        .with_context(|| format!("{label}: action {action} failed"));
                }
            }
        }

        let result = merge_results(results);
        if result.was_updated {
            reporter.info(&format!("{label}: updated ({})", result.action));
        } else {
            reporter.info(&format!(
                "{label}: {}",
                result.skip_reason.as_deref().unwrap_or("up to date")
            ));
        }
        let fire = result.was_updated && !had_ignored_failure;
        outcomes.push(ResourceOutcome {
            name: record.name(),
            kind: record.kind().to_string(),
            result,
        });

        if fire {
            let mut stack = Vec::new();
            fire_edges(
                idx, resources, &edges, &name_index, ctx, reporter, &mut queue, &mut stack, false,
            )?;
        }
    }

    drain_delayed(resources, &edges, &name_index, ctx, reporter, &mut queue)?;

    let finished_at = Utc::now();
    let mut report = RunReport {
        started_at,
        finished_at,
        duration: start.elapsed(),
        updated: 0,
        up_to_date: 0,
        skipped: 0,
        failed: 0,
        outcomes,
    };
    for outcome in &report.outcomes {
        match (outcome.result.was_updated, outcome.result.skip_reason.as_deref()) {
            (true, _) => report.updated += 1,
            (false, Some("up to date")) => report.up_to_date += 1,
            (false, Some(reason)) if reason.starts_with("ignored failure") => report.failed += 1,
            (false, _) => report.skipped += 1,
        }
    }
    Ok(report)
}

fn label(record: &ResourceRecord) -> String {
    format!("{}[{}]", record.kind(), record.name())
}

/// Run one driver action, offloaded so the reporter can heartbeat.
/// `ruby_block` stays on this thread: the interpreter must never be
/// entered from a worker.
fn invoke(
    record: &Arc<ResourceRecord>,
    action: &str,
    ctx: &DriverContext,
    reporter: &mut dyn Reporter,
) -> Result<Result<ApplyResult, DriverError>> {
    if matches!(record.spec, ResourceSpec::RubyBlock(_)) {
        return Ok(drivers::apply(record, action, ctx));
    }

    let task = Task::spawn(
        (record.clone(), action.to_string(), ctx.clone()),
        |(record, action, ctx)| drivers::apply(&record, &action, &ctx),
    );
    task.wait_with(|| reporter.heartbeat(), HEARTBEAT)
        .map_err(|err| anyhow::anyhow!("driver worker died for {}: {err}", record.name()))
}

fn merge_results(results: Vec<ApplyResult>) -> ApplyResult {
    match results.len() {
        0 => ApplyResult::skipped(String::new(), "no actions declared"),
        1 => results.into_iter().next().expect("one result"),
        _ => {
            let was_updated = results.iter().any(|r| r.was_updated);
            let action = results
                .iter()
                .map(|r| r.action.as_str())
                .collect::<Vec<_>>()
                .join(",");
            let skip_reason = if was_updated {
                None
            } else {
                results.iter().find_map(|r| r.skip_reason.clone())
            };
            ApplyResult {
                was_updated,
                action,
                skip_reason,
            }
        }
    }
}

fn build_name_index(resources: &ResourceList) -> HashMap<String, usize> {
    let mut index = HashMap::new();
    for (idx, record) in resources.iter().enumerate() {
        index.entry(record.name()).or_insert(idx);
    }
    index
}

/// Forward edges per record: declared notifications plus one
/// synthesised from every subscription pointing at it.
fn build_edges(
    resources: &ResourceList,
    name_index: &HashMap<String, usize>,
) -> Vec<Vec<Notification>> {
    let mut edges: Vec<Vec<Notification>> = resources
        .iter()
        .map(|r| r.common.notifications.clone())
        .collect();

    for record in resources.iter() {
        for sub in &record.common.subscriptions {
            // A subscription to a name that never registered is inert.
            if let Some(&source_idx) = name_index.get(&sub.source) {
                edges[source_idx].push(Notification {
                    target: record.name(),
                    action: sub.action.clone(),
                    timing: sub.timing,
                });
            }
        }
    }
    edges
}

#[allow(clippy::too_many_arguments)]
fn fire_edges(
    idx: usize,
    resources: &ResourceList,
    edges: &[Vec<Notification>],
    name_index: &HashMap<String, usize>,
    ctx: &DriverContext,
    reporter: &mut dyn Reporter,
    queue: &mut NotificationQueue,
    stack: &mut Vec<(String, String)>,
    in_delayed_drain: bool,
) -> Result<()> {
    for notification in &edges[idx] {
        // During the delayed drain everything produced re-queues; in
        // the main pass only delayed edges do.
        if in_delayed_drain || notification.timing == Timing::Delayed {
            queue.push(notification.target.clone(), notification.action.clone());
        } else {
            dispatch_immediate(
                &notification.target,
                &notification.action,
                resources,
                edges,
                name_index,
                ctx,
                reporter,
                queue,
                stack,
            )?;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn dispatch_immediate(
    target: &str,
    action: &str,
    resources: &ResourceList,
    edges: &[Vec<Notification>],
    name_index: &HashMap<String, usize>,
    ctx: &DriverContext,
    reporter: &mut dyn Reporter,
    queue: &mut NotificationQueue,
    stack: &mut Vec<(String, String)>,
) -> Result<()> {
    let key = (target.to_string(), action.to_string());
    if stack.contains(&key) {
        bail!(
            "immediate notification cycle detected at {target} ({action}); \
             break the cycle or use delayed timing"
        );
    }
    stack.push(key);
    let outcome = dispatch_to(target, action, resources, name_index, ctx, reporter);
    let result = match outcome {
        Ok(result) => result,
        Err(err) => {
            stack.pop();
            return Err(err);
        }
    };

    if let Some(result) = result {
        if result.was_updated {
            let idx = name_index[target];
            if let Err(err) = fire_edges(
                idx, resources, edges, name_index, ctx, reporter, queue, stack, false,
            ) {
                stack.pop();
                return Err(err);
            }
        }
    }
    stack.pop();
    Ok(())
}

/// Invoke a notified action on a target record, honouring its
/// `ignore_failure`. Returns `None` when a failure was ignored.
fn dispatch_to(
    target: &str,
    action: &str,
    resources: &ResourceList,
    name_index: &HashMap<String, usize>,
    ctx: &DriverContext,
    reporter: &mut dyn Reporter,
) -> Result<Option<ApplyResult>> {
    let idx = *name_index
        .get(target)
        .with_context(|| format!("notification target '{target}' not found"))?;
    let record = resources.get(idx).expect("indexed record");
    let label = label(record);

    match invoke(record, action, ctx, reporter)? {
        Ok(result) => {
            if result.was_updated {
                reporter.info(&format!("{label}: updated ({action}) [notified]"));
            } else {
                reporter.info(&format!(
                    "{label}: {} [notified]",
                    result.skip_reason.as_deref().unwrap_or("up to date")
                ));
            }
            Ok(Some(result))
        }
        Err(DriverError::Host(msg)) => bail!("{label}: interpreter host failure: {msg}"),
        Err(err) if record.common.ignore_failure => {
            reporter.warn(&format!("{label}: ignored failure: {err}"));
            Ok(None)
        }
        Err(err) => {
            reporter.error(&format!("{label}: {action} failed: {err}"));
            Err(anyhow::Error::new(err))
                .with_context(|| format!("{label}: notified action {action} failed"))
        }
    }
}

fn drain_delayed(
    resources: &ResourceList,
    edges: &[Vec<Notification>],
    name_index: &HashMap<String, usize>,
    ctx: &DriverContext,
    reporter: &mut dyn Reporter,
    queue: &mut NotificationQueue,
) -> Result<()> {
    // Run-wide dedup bounds the drain by distinct (target, action)
    // pairs; the cap is a safety valve should that invariant break.
    let cap = resources.len() * resources.len() * 8 + 64;
    let mut dispatched = 0usize;

    while let Some((target, action)) = queue.pop() {
        dispatched += 1;
        if dispatched > cap {
            bail!("delayed notification drain exceeded {cap} dispatches; cycle suspected");
        }

        let result = dispatch_to(&target, &action, resources, name_index, ctx, reporter)?;
        if let Some(result) = result {
            if result.was_updated {
                let idx = name_index[&target];
                let mut stack = Vec::new();
                fire_edges(
                    idx, resources, edges, name_index, ctx, reporter, queue, &mut stack, true,
                )?;
            }
        }
    }
    Ok(())
}

/// Validate required fields before any apply; a failure here aborts
/// the run with nothing done.
fn preflight(resources: &ResourceList) -> Result<()> {
    for record in resources.iter() {
        let label = label(record);
        match &record.spec {
            ResourceSpec::Git(spec) => {
                if spec.repository.is_empty() {
                    bail!("{label}: repository is required");
                }
            }
            ResourceSpec::Execute(spec) => {
                if spec.command.is_empty() {
                    bail!("{label}: command is required");
                }
            }
            ResourceSpec::Package(spec) => {
                if spec.names.is_empty() || spec.names.iter().any(|n| n.is_empty()) {
                    bail!("{label}: at least one non-empty package name is required");
                }
            }
            ResourceSpec::SystemdUnit(spec) => {
                if spec.name.is_empty() || spec.name.contains('/') {
                    bail!("{label}: invalid unit name");
                }
                if spec.actions.is_empty() {
                    bail!("{label}: at least one action is required");
                }
            }
            ResourceSpec::RemoteFile(spec) => {
                if !spec.source_url.contains("://") {
                    bail!("{label}: source URL has no scheme: {}", spec.source_url);
                }
                if let Some(checksum) = &spec.checksum {
                    if checksum.len() != 64 || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
                        bail!("{label}: checksum is not a SHA-256 hex digest");
                    }
                }
            }
            ResourceSpec::AwsKms(spec) => {
                if spec.key_id.is_empty() {
                    bail!("{label}: key_id is required");
                }
            }
            _ => {}
        }

        // Mode strings fail here, not mid-apply.
        if let Some(mode) = declared_mode(record) {
            crate::fsutil::parse_mode(mode)
                .with_context(|| format!("{label}: invalid mode"))?;
        }

        for notification in &record.common.notifications {
            let target = resources.find(&notification.target).with_context(|| {
                format!(
                    "{label}: notifies unknown resource '{}'",
                    notification.target
                )
            })?;
            validate_action(target, &notification.action).with_context(|| {
                format!(
                    "{label}: notifies '{}' with an invalid action",
                    notification.target
                )
            })?;
        }
        for subscription in &record.common.subscriptions {
            // Missing sources are inert, but a registered source must
            // accept the subscribed action on *this* record.
            if resources.find(&subscription.source).is_some() {
                validate_action(record, &subscription.action).with_context(|| {
                    format!(
                        "{label}: subscribes to '{}' with an invalid action",
                        subscription.source
                    )
                })?;
            }
        }
    }
    Ok(())
}

fn declared_mode(record: &ResourceRecord) -> Option<&str> {
    match &record.spec {
        ResourceSpec::File(s) => Some(&s.mode),
        ResourceSpec::Directory(s) => Some(&s.mode),
        ResourceSpec::RemoteFile(s) => Some(&s.mode),
        ResourceSpec::Template(s) => Some(&s.mode),
        ResourceSpec::AwsKms(s) => Some(&s.mode),
        _ => None,
    }
}

/// Check an action string against the target's kind without running
/// anything.
fn validate_action(record: &ResourceRecord, action: &str) -> Result<(), DriverError> {
    match &record.spec {
        ResourceSpec::File(_) => FileAction::parse("file", action).map(|_| ()),
        ResourceSpec::Directory(_) => DirectoryAction::parse("directory", action).map(|_| ()),
        ResourceSpec::Link(_) => LinkAction::parse("link", action).map(|_| ()),
        ResourceSpec::RemoteFile(_) => FileAction::parse("remote_file", action).map(|_| ()),
        ResourceSpec::Execute(_) => RunAction::parse("execute", action).map(|_| ()),
        ResourceSpec::Template(_) => FileAction::parse("template", action).map(|_| ()),
        ResourceSpec::Git(_) => GitAction::parse("git", action).map(|_| ()),
        ResourceSpec::Package(_) => PackageAction::parse("package", action).map(|_| ()),
        ResourceSpec::SystemdUnit(_) => SystemdAction::parse("systemd_unit", action).map(|_| ()),
        ResourceSpec::RubyBlock(_) => RunAction::parse("ruby_block", action).map(|_| ()),
        ResourceSpec::AwsKms(_) => KmsAction::parse("aws_kms", action).map(|_| ()),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use crate::builder::{ExecuteBuilder, FileBuilder, GitBuilder};
    use crate::host::RecipeHost;

    use super::*;

    fn run_list(resources: &ResourceList) -> Result<RunReport> {
        run(resources, &DriverContext::default(), &mut NullReporter)
    }

    /// Shell snippet that appends one line to a witness file.
    fn append_cmd(witness: &Path) -> String {
        format!("echo ran >> {}", witness.display())
    }

    fn line_count(path: &Path) -> usize {
        fs::read_to_string(path)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    #[test]
    fn delayed_notification_fires_once_at_end_of_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let managed = dir.path().join("a");
        let witness = dir.path().join("witness");

        let build = || {
            let mut host = RecipeHost::new();
            FileBuilder::new(managed.display().to_string())
                .content("x")
                .notifies("run", "say", "delayed")
                .register(&mut host)
                .expect("file");
            ExecuteBuilder::new("say")
                .command(append_cmd(&witness))
                .action("nothing")
                .register(&mut host)
                .expect("execute");
            host.into_resources()
        };

        // First run: file created, say runs once at end.
        let report = run_list(&build()).expect("run");
        assert_eq!(report.updated, 1);
        assert_eq!(line_count(&witness), 1);

        // Second run: file up to date, say does not run.
        let report = run_list(&build()).expect("run");
        assert_eq!(report.updated, 0);
        assert_eq!(report.up_to_date, 1);
        assert_eq!(line_count(&witness), 1);
    }

    #[test]
    fn delayed_notifications_deduplicate_across_notifiers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let witness = dir.path().join("witness");

        let mut host = RecipeHost::new();
        for n in 0..3 {
            FileBuilder::new(dir.path().join(format!("f{n}")).display().to_string())
                .content("x")
                .notifies("run", "say", "delayed")
                .register(&mut host)
                .expect("file");
        }
        ExecuteBuilder::new("say")
            .command(append_cmd(&witness))
            .action("nothing")
            .register(&mut host)
            .expect("execute");

        run_list(&host.into_resources()).expect("run");
        assert_eq!(line_count(&witness), 1);
    }

    #[test]
    fn immediate_notification_observes_notifier_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let managed = dir.path().join("conf");
        let copied = dir.path().join("copy");

        let mut host = RecipeHost::new();
        FileBuilder::new(managed.display().to_string())
            .content("fresh")
            .notifies("run", "copy it", "immediate")
            .register(&mut host)
            .expect("file");
        ExecuteBuilder::new("copy it")
            .command(format!("cp {} {}", managed.display(), copied.display()))
            .action("nothing")
            .register(&mut host)
            .expect("execute");

        run_list(&host.into_resources()).expect("run");
        // The notified command saw the notifier's post-state.
        assert_eq!(fs::read_to_string(&copied).expect("read"), "fresh");
    }

    #[test]
    fn subscription_is_equivalent_to_notification() {
        let dir = tempfile::tempdir().expect("tempdir");
        let managed = dir.path().join("conf");
        let witness = dir.path().join("witness");

        let mut host = RecipeHost::new();
        FileBuilder::new(managed.display().to_string())
            .content("x")
            .register(&mut host)
            .expect("file");
        ExecuteBuilder::new("restart nginx")
            .command(append_cmd(&witness))
            .action("nothing")
            .subscribes("run", managed.display().to_string(), "delayed")
            .register(&mut host)
            .expect("execute");

        run_list(&host.into_resources()).expect("run");
        assert_eq!(line_count(&witness), 1);
    }

    #[test]
    fn subscription_to_unknown_source_is_inert() {
        let dir = tempfile::tempdir().expect("tempdir");
        let witness = dir.path().join("witness");

        let mut host = RecipeHost::new();
        ExecuteBuilder::new("listener")
            .command(append_cmd(&witness))
            .action("nothing")
            .subscribes("run", "/no/such/resource", "delayed")
            .register(&mut host)
            .expect("execute");

        let report = run_list(&host.into_resources()).expect("run");
        assert_eq!(report.skipped, 1);
        assert_eq!(line_count(&witness), 0);
    }

    #[test]
    fn guard_skip_suppresses_apply_and_notifications() {
        let dir = tempfile::tempdir().expect("tempdir");
        let managed = dir.path().join("guarded");
        let witness = dir.path().join("witness");

        let mut host = RecipeHost::new();
        FileBuilder::new(managed.display().to_string())
            .content("x")
            .only_if("false")
            .notifies("run", "say", "delayed")
            .register(&mut host)
            .expect("file");
        ExecuteBuilder::new("say")
            .command(append_cmd(&witness))
            .action("nothing")
            .register(&mut host)
            .expect("execute");

        let report = run_list(&host.into_resources()).expect("run");
        // Both the guarded file and the action-nothing handler count
        // as skips.
        assert_eq!(report.skipped, 2);
        assert!(!managed.exists());
        assert_eq!(line_count(&witness), 0);

        let skip = &report.outcomes[0];
        assert_eq!(skip.result.skip_reason.as_deref(), Some("guard"));
    }

    #[test]
    fn ignored_failure_continues_and_suppresses_notifications() {
        let dir = tempfile::tempdir().expect("tempdir");
        let witness = dir.path().join("witness");
        let later = dir.path().join("later");

        let mut host = RecipeHost::new();
        ExecuteBuilder::new("broken")
            .command("exit 13")
            .ignore_failure(true)
            .notifies("run", "say", "delayed")
            .register(&mut host)
            .expect("execute");
        ExecuteBuilder::new("say")
            .command(append_cmd(&witness))
            .action("nothing")
            .register(&mut host)
            .expect("execute");
        FileBuilder::new(later.display().to_string())
            .content("still ran")
            .register(&mut host)
            .expect("file");

        let report = run_list(&host.into_resources()).expect("run");
        assert_eq!(report.failed, 1);
        assert_eq!(report.updated, 1);
        assert!(later.exists());
        assert_eq!(line_count(&witness), 0);

        let failed = &report.outcomes[0];
        assert!(
            failed
                .result
                .skip_reason
                .as_deref()
                .unwrap_or("")
                .starts_with("ignored failure")
        );
    }

    #[test]
    fn unignored_failure_aborts_the_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let later = dir.path().join("later");

        let mut host = RecipeHost::new();
        ExecuteBuilder::new("broken")
            .command("exit 13")
            .register(&mut host)
            .expect("execute");
        FileBuilder::new(later.display().to_string())
            .content("never")
            .register(&mut host)
            .expect("file");

        let err = run_list(&host.into_resources()).expect_err("must abort");
        assert!(format!("{err:#}").contains("execute[broken]"));
        assert!(!later.exists());
    }

    #[test]
    fn notified_action_overrides_the_declared_action() {
        let dir = tempfile::tempdir().expect("tempdir");
        let managed = dir.path().join("conf");
        let witness = dir.path().join("witness");

        let mut host = RecipeHost::new();
        FileBuilder::new(managed.display().to_string())
            .content("x")
            .notifies("run", "handler", "immediate")
            .register(&mut host)
            .expect("file");
        // Declared action nothing: only the notification runs it.
        ExecuteBuilder::new("handler")
            .command(append_cmd(&witness))
            .action("nothing")
            .register(&mut host)
            .expect("execute");

        run_list(&host.into_resources()).expect("run");
        assert_eq!(line_count(&witness), 1);
    }

    #[test]
    fn immediate_cycle_is_detected() {
        let dir = tempfile::tempdir().expect("tempdir");

        let mut host = RecipeHost::new();
        ExecuteBuilder::new("a")
            .command(format!("touch {}", dir.path().join("a").display()))
            .notifies("run", "b", "immediate")
            .register(&mut host)
            .expect("a");
        ExecuteBuilder::new("b")
            .command("true")
            .action("nothing")
            .notifies("run", "a", "immediate")
            .register(&mut host)
            .expect("b");

        let err = run_list(&host.into_resources()).expect_err("cycle");
        assert!(format!("{err:#}").contains("cycle"));
    }

    #[test]
    fn delayed_cycle_terminates_via_dedup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a_witness = dir.path().join("a");
        let b_witness = dir.path().join("b");

        let mut host = RecipeHost::new();
        ExecuteBuilder::new("a")
            .command(append_cmd(&a_witness))
            .notifies("run", "b", "delayed")
            .register(&mut host)
            .expect("a");
        ExecuteBuilder::new("b")
            .command(append_cmd(&b_witness))
            .action("nothing")
            .notifies("run", "a", "delayed")
            .register(&mut host)
            .expect("b");

        run_list(&host.into_resources()).expect("run");
        // a ran in the main pass and once more via b's notification;
        // the second a → b edge deduplicates.
        assert_eq!(line_count(&a_witness), 2);
        assert_eq!(line_count(&b_witness), 1);
    }

    #[test]
    fn preflight_failure_aborts_before_any_apply() {
        let dir = tempfile::tempdir().expect("tempdir");
        let managed = dir.path().join("early");

        let mut host = RecipeHost::new();
        FileBuilder::new(managed.display().to_string())
            .content("x")
            .register(&mut host)
            .expect("file");
        GitBuilder::new(dir.path().join("checkout").display().to_string())
            .register(&mut host)
            .expect("git");

        let err = run_list(&host.into_resources()).expect_err("preflight");
        assert!(format!("{err:#}").contains("repository is required"));
        assert!(!managed.exists());
    }

    #[test]
    fn unknown_notification_target_fails_preflight() {
        let dir = tempfile::tempdir().expect("tempdir");

        let mut host = RecipeHost::new();
        FileBuilder::new(dir.path().join("f").display().to_string())
            .content("x")
            .notifies("run", "ghost", "delayed")
            .register(&mut host)
            .expect("file");

        let err = run_list(&host.into_resources()).expect_err("preflight");
        assert!(format!("{err:#}").contains("ghost"));
    }

    #[test]
    fn invalid_notification_action_fails_preflight() {
        let dir = tempfile::tempdir().expect("tempdir");

        let mut host = RecipeHost::new();
        FileBuilder::new(dir.path().join("f").display().to_string())
            .content("x")
            .notifies("explode", "say", "delayed")
            .register(&mut host)
            .expect("file");
        ExecuteBuilder::new("say")
            .command("true")
            .action("nothing")
            .register(&mut host)
            .expect("execute");

        let err = run_list(&host.into_resources()).expect_err("preflight");
        assert!(format!("{err:#}").contains("invalid action"));
    }

    #[test]
    fn second_run_of_converged_recipe_reports_no_updates() {
        let dir = tempfile::tempdir().expect("tempdir");

        let build = || {
            let mut host = RecipeHost::new();
            FileBuilder::new(dir.path().join("a").display().to_string())
                .content("a")
                .register(&mut host)
                .expect("a");
            crate::builder::DirectoryBuilder::new(dir.path().join("d").display().to_string())
                .register(&mut host)
                .expect("d");
            FileBuilder::new(dir.path().join("d/child").display().to_string())
                .content("c")
                .register(&mut host)
                .expect("child");
            host.into_resources()
        };

        let first = run_list(&build()).expect("first");
        assert_eq!(first.updated, 3);

        let second = run_list(&build()).expect("second");
        assert_eq!(second.updated, 0);
        assert_eq!(second.up_to_date, 3);
    }

    #[test]
    fn report_counts_and_serialization() {
        let dir = tempfile::tempdir().expect("tempdir");

        let mut host = RecipeHost::new();
        FileBuilder::new(dir.path().join("f").display().to_string())
            .content("x")
            .register(&mut host)
            .expect("file");

        let report = run_list(&host.into_resources()).expect("run");
        assert!(report.clean());
        assert_eq!(report.outcomes.len(), 1);

        let json = serde_json::to_string(&report).expect("serialize");
        assert!(json.contains("\"updated\":1"));
        assert!(json.contains("\"was_updated\":true"));
    }
}
