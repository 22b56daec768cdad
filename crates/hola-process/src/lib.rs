//! Shell execution for hola.
//!
//! Resource drivers shell out constantly: guards, `execute` resources,
//! package managers, git, systemctl. This crate owns the mechanics
//! (`/bin/sh -c` invocation, working directory, environment merging,
//! privilege drop, output capture with optional live streaming,
//! cooperative timeouts) so drivers only describe *what* to run.
//!
//! External programs honour `HOLA_<NAME>_BIN` override variables (e.g.
//! `HOLA_SHELL_BIN`, `HOLA_GIT_BIN`) so tests can substitute hermetic
//! fakes without touching the host.
//!
//! # Example
//!
//! ```
//! use hola_process::ShellRequest;
//!
//! let out = ShellRequest::new("echo converged").run().expect("run");
//! assert!(out.success());
//! assert_eq!(out.stdout.trim(), "converged");
//! ```

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Default shell used for command strings.
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Resolve an external program, honouring its `HOLA_*_BIN` override.
///
/// `resolve_program("git", "HOLA_GIT_BIN")` returns the override value
/// when set, the bare program name otherwise.
pub fn resolve_program(program: &str, override_var: &str) -> String {
    std::env::var(override_var).unwrap_or_else(|_| program.to_string())
}

/// The shell binary used for `sh -c` invocations.
pub fn shell_program() -> String {
    resolve_program(DEFAULT_SHELL, "HOLA_SHELL_BIN")
}

/// Check whether a program is present on PATH.
pub fn program_exists(program: &str) -> bool {
    which::which(program).is_ok()
}

/// Outcome of a shell invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellOutput {
    /// Exit code, when the process exited normally.
    pub exit_code: Option<i32>,
    /// Terminating signal, when the process was killed (unix).
    pub signal: Option<i32>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Whether execution exceeded the requested timeout.
    pub timed_out: bool,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl ShellOutput {
    /// True when the process exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// True when the process died on a signal rather than exiting.
    pub fn killed(&self) -> bool {
        self.signal.is_some()
    }
}

/// A shell command plus everything about how to run it.
#[derive(Debug, Clone)]
pub struct ShellRequest {
    /// Command string handed to `sh -c`.
    pub command: String,
    /// Working directory, if different from the parent's.
    pub cwd: Option<PathBuf>,
    /// Environment entries merged onto the inherited environment.
    pub env: Vec<(String, String)>,
    /// Run as this user (uid looked up via passwd).
    pub user: Option<String>,
    /// Run under this group (gid looked up via group db).
    pub group: Option<String>,
    /// Echo child output to the terminal while capturing it.
    pub live_stream: bool,
    /// Kill the child after this long.
    pub timeout: Option<Duration>,
}

impl ShellRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            env: Vec::new(),
            user: None,
            group: None,
            live_stream: false,
            timeout: None,
        }
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn envs(mut self, pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(pairs);
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn live_stream(mut self, live: bool) -> Self {
        self.live_stream = live;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run the command through the shell and collect its output.
    pub fn run(&self) -> Result<ShellOutput> {
        let shell = shell_program();
        let mut cmd = Command::new(&shell);
        cmd.arg("-c").arg(&self.command);
        self.configure(&mut cmd)?;
        run_child(cmd, self.live_stream, self.timeout)
            .with_context(|| format!("failed to run shell command: {}", self.command))
    }

    fn configure(&self, cmd: &mut Command) -> Result<()> {
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        apply_user_group(cmd, self.user.as_deref(), self.group.as_deref())?;
        Ok(())
    }
}

/// Run an argv-style command (no shell) and collect its output.
///
/// Used by drivers that build their own argument vectors (git, apt,
/// systemctl) where shell quoting would only add failure modes.
pub fn run_program(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    env: &[(String, String)],
) -> Result<ShellOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    for (key, value) in env {
        cmd.env(key, value);
    }
    run_child(cmd, false, None).with_context(|| format!("failed to run: {} {:?}", program, args))
}

/// Run an argv-style command under a different user/group.
pub fn run_program_as(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    env: &[(String, String)],
    user: Option<&str>,
    group: Option<&str>,
) -> Result<ShellOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    for (key, value) in env {
        cmd.env(key, value);
    }
    apply_user_group(&mut cmd, user, group)?;
    run_child(cmd, false, None).with_context(|| format!("failed to run: {} {:?}", program, args))
}

#[cfg(unix)]
fn apply_user_group(cmd: &mut Command, user: Option<&str>, group: Option<&str>) -> Result<()> {
    use std::os::unix::process::CommandExt;

    if let Some(name) = user {
        let entry = nix::unistd::User::from_name(name)
            .with_context(|| format!("passwd lookup failed for user {name}"))?;
        let Some(entry) = entry else {
            bail!("unknown user: {name}");
        };
        cmd.uid(entry.uid.as_raw());
        // The user's primary group applies unless an explicit group wins below.
        cmd.gid(entry.gid.as_raw());
    }
    if let Some(name) = group {
        let entry = nix::unistd::Group::from_name(name)
            .with_context(|| format!("group lookup failed for {name}"))?;
        let Some(entry) = entry else {
            bail!("unknown group: {name}");
        };
        cmd.gid(entry.gid.as_raw());
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_user_group(_cmd: &mut Command, user: Option<&str>, group: Option<&str>) -> Result<()> {
    if user.is_some() || group.is_some() {
        bail!("user/group switching is only supported on unix");
    }
    Ok(())
}

fn run_child(mut cmd: Command, live_stream: bool, timeout: Option<Duration>) -> Result<ShellOutput> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let start = Instant::now();
    let mut child = cmd.spawn().context("spawn failed")?;

    let stdout_rx = drain_pipe(child.stdout.take(), live_stream, false);
    let stderr_rx = drain_pipe(child.stderr.take(), live_stream, true);

    let status = match timeout {
        None => child.wait().context("wait failed")?,
        Some(limit) => match wait_with_deadline(&mut child, start + limit)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let status = child.wait().context("wait after kill failed")?;
                let mut stderr = stderr_rx.recv().unwrap_or_default();
                stderr.push_str(&format!(
                    "\ncommand timed out after {}",
                    humantime::format_duration(limit)
                ));
                return Ok(ShellOutput {
                    exit_code: status.code(),
                    signal: unix_signal(&status),
                    stdout: stdout_rx.recv().unwrap_or_default(),
                    stderr,
                    timed_out: true,
                    duration_ms: start.elapsed().as_millis() as u64,
                });
            }
        },
    };

    Ok(ShellOutput {
        exit_code: status.code(),
        signal: unix_signal(&status),
        stdout: stdout_rx.recv().unwrap_or_default(),
        stderr: stderr_rx.recv().unwrap_or_default(),
        timed_out: false,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

fn wait_with_deadline(child: &mut Child, deadline: Instant) -> Result<Option<std::process::ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait().context("poll failed")? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(Duration::from_millis(50));
    }
}

// Each pipe gets its own reader thread so a child filling one pipe
// cannot deadlock against us reading the other.
fn drain_pipe<R: std::io::Read + Send + 'static>(
    stream: Option<R>,
    live_stream: bool,
    is_stderr: bool,
) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    match stream {
        None => {
            let _ = tx.send(String::new());
        }
        Some(stream) => {
            thread::spawn(move || {
                let mut collected = String::new();
                let reader = BufReader::new(stream);
                for line in reader.lines() {
                    let Ok(line) = line else { break };
                    if live_stream {
                        if is_stderr {
                            eprintln!("  {}", console::style(&line).red());
                        } else {
                            println!("  {line}");
                        }
                    }
                    collected.push_str(&line);
                    collected.push('\n');
                }
                let _ = tx.send(collected);
            });
        }
    }
    rx
}

#[cfg(unix)]
fn unix_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn unix_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
