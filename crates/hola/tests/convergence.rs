//! Full-stack convergence tests through the public API: builders →
//! registration → scheduler → drivers.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use hola::builder::{ExecuteBuilder, FileBuilder, RubyBlockBuilder, TemplateBuilder};
use hola::drivers::DriverContext;
use hola::engine::{self, NullReporter, Reporter};
use hola::host::RecipeHost;
use hola::interp::{CallableHandle, Interpreter, InterpreterError};
use hola::types::ResourceList;

fn converge(resources: &ResourceList) -> anyhow::Result<engine::RunReport> {
    engine::run(resources, &DriverContext::default(), &mut NullReporter)
}

#[test]
fn execute_with_creates_skips_once_the_sentinel_exists() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sentinel = dir.path().join("sentinel");
    let witness = dir.path().join("witness");

    // The execute resource does not create its own sentinel; a paired
    // file resource does, after the command has run once.
    let build = || {
        let mut host = RecipeHost::new();
        ExecuteBuilder::new("once")
            .command(format!("echo ran >> {}", witness.display()))
            .creates(sentinel.display().to_string())
            .register(&mut host)
            .expect("execute");
        FileBuilder::new(sentinel.display().to_string())
            .register(&mut host)
            .expect("file");
        host.into_resources()
    };

    let first = converge(&build()).expect("first run");
    assert_eq!(first.updated, 2);
    assert_eq!(fs::read_to_string(&witness).expect("read").lines().count(), 1);

    let second = converge(&build()).expect("second run");
    assert_eq!(second.updated, 0);
    let skip = second.outcomes[0].result.skip_reason.clone().unwrap_or_default();
    assert!(skip.contains("creates"), "unexpected skip reason: {skip}");
    assert_eq!(fs::read_to_string(&witness).expect("read").lines().count(), 1);
}

#[test]
fn template_change_restarts_its_subscriber() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("app.conf.tera");
    fs::write(&source, "port={{ port }}\n").expect("write template");
    let rendered = dir.path().join("app.conf");
    let witness = dir.path().join("restarts");

    let build = |port: i64| {
        let mut host = RecipeHost::new();
        let mut template = TemplateBuilder::new(rendered.display().to_string())
            .source(source.display().to_string());
        template
            .set("variables", &serde_json::json!({ "port": port }))
            .expect("variables");
        template.register(&mut host).expect("template");
        ExecuteBuilder::new("restart app")
            .command(format!("echo restart >> {}", witness.display()))
            .action("nothing")
            .subscribes("run", rendered.display().to_string(), "delayed")
            .register(&mut host)
            .expect("execute");
        host.into_resources()
    };

    converge(&build(8080)).expect("first");
    assert_eq!(fs::read_to_string(&rendered).expect("read"), "port=8080\n");
    assert_eq!(fs::read_to_string(&witness).expect("read").lines().count(), 1);

    // Same variables: no render change, no restart.
    converge(&build(8080)).expect("second");
    assert_eq!(fs::read_to_string(&witness).expect("read").lines().count(), 1);

    // Changed variables: re-render and restart once more.
    converge(&build(9090)).expect("third");
    assert_eq!(fs::read_to_string(&rendered).expect("read"), "port=9090\n");
    assert_eq!(fs::read_to_string(&witness).expect("read").lines().count(), 2);
}

/// Interpreter double for block resources: callable #1 records the
/// value of `FOO` as seen inside the block.
struct EnvProbe {
    observed: std::sync::Mutex<Option<String>>,
    pins: AtomicUsize,
}

impl Interpreter for EnvProbe {
    fn pin(&self, _handle: CallableHandle) {
        self.pins.fetch_add(1, Ordering::SeqCst);
    }

    fn unpin(&self, _handle: CallableHandle) {
        self.pins.fetch_sub(1, Ordering::SeqCst);
    }

    fn call_predicate(&self, _handle: CallableHandle) -> Result<bool, InterpreterError> {
        Ok(true)
    }

    fn call_block(&self, _handle: CallableHandle) -> Result<(), InterpreterError> {
        *self.observed.lock().unwrap() = std::env::var("FOO").ok();
        Ok(())
    }
}

#[test]
#[serial_test::serial]
fn ruby_block_environment_is_transactional() {
    let interp = Arc::new(EnvProbe {
        observed: std::sync::Mutex::new(None),
        pins: AtomicUsize::new(0),
    });

    temp_env::with_var("FOO", None::<&str>, || {
        let mut host = RecipeHost::with_interpreter(interp.clone());
        RubyBlockBuilder::new("env")
            .callable(1)
            .env("FOO", "1")
            .register(&mut host)
            .expect("ruby_block");
        let resources = host.into_resources();
        assert!(interp.pins.load(Ordering::SeqCst) >= 1);

        let report = converge(&resources).expect("run");
        assert_eq!(report.updated, 1);
        assert_eq!(interp.observed.lock().unwrap().as_deref(), Some("1"));
        // Parent environment untouched.
        assert!(std::env::var("FOO").is_err());
    });

    // Records dropped: every pinned callable was released.
    assert_eq!(interp.pins.load(Ordering::SeqCst), 0);
}

#[test]
fn reporter_receives_one_line_per_resource() {
    #[derive(Default)]
    struct CountingReporter {
        lines: Vec<String>,
    }

    impl Reporter for CountingReporter {
        fn info(&mut self, msg: &str) {
            self.lines.push(format!("info: {msg}"));
        }
        fn warn(&mut self, msg: &str) {
            self.lines.push(format!("warn: {msg}"));
        }
        fn error(&mut self, msg: &str) {
            self.lines.push(format!("error: {msg}"));
        }
    }

    let dir = tempfile::tempdir().expect("tempdir");
    let mut host = RecipeHost::new();
    FileBuilder::new(dir.path().join("a").display().to_string())
        .content("x")
        .register(&mut host)
        .expect("a");
    ExecuteBuilder::new("skipped")
        .command("true")
        .only_if("false")
        .register(&mut host)
        .expect("skipped");

    let mut reporter = CountingReporter::default();
    engine::run(&host.into_resources(), &DriverContext::default(), &mut reporter)
        .expect("run");

    assert_eq!(reporter.lines.len(), 2);
    assert!(reporter.lines[0].starts_with("info: file["));
    assert!(reporter.lines[1].starts_with("warn: execute[skipped]"));
}
