//! The `systemd_unit` driver: unit file management plus systemctl
//! verbs, applied as an ordered action sequence.
//!
//! The unit directory and binaries honour `HOLA_SYSTEMD_UNIT_DIR`,
//! `HOLA_SYSTEMCTL_BIN`, and `HOLA_SYSTEMD_ANALYZE_BIN` so tests can
//! run without touching the host's service manager.

use std::fs;
use std::path::PathBuf;

use anyhow::Context;

use hola_process::{ShellOutput, resolve_program, run_program};

use crate::fsutil;
use crate::types::{ApplyResult, DriverError, SystemdAction, SystemdUnitSpec};

/// Where unit files land.
pub const DEFAULT_UNIT_DIR: &str = "/etc/systemd/system";

fn unit_dir() -> PathBuf {
    std::env::var("HOLA_SYSTEMD_UNIT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_UNIT_DIR))
}

fn systemctl_bin() -> String {
    resolve_program("systemctl", "HOLA_SYSTEMCTL_BIN")
}

fn systemd_analyze_bin() -> String {
    resolve_program("systemd-analyze", "HOLA_SYSTEMD_ANALYZE_BIN")
}

pub fn apply(spec: &SystemdUnitSpec, action: SystemdAction) -> Result<ApplyResult, DriverError> {
    match action {
        SystemdAction::Create => create(spec),
        SystemdAction::Delete => delete(spec),
        SystemdAction::Enable => toggle(spec, "enable", "is-enabled", "enabled"),
        SystemdAction::Disable => toggle(spec, "disable", "is-enabled", "disabled"),
        SystemdAction::Start => toggle(spec, "start", "is-active", "active"),
        SystemdAction::Stop => toggle(spec, "stop", "is-active", "inactive"),
        SystemdAction::Restart => verb(spec, SystemdAction::Restart),
        SystemdAction::Reload => verb(spec, SystemdAction::Reload),
    }
}

fn create(spec: &SystemdUnitSpec) -> Result<ApplyResult, DriverError> {
    let path = unit_dir().join(&spec.name);

    let previous = match fs::read_to_string(&path) {
        Ok(content) => Some(content),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => {
            return Err(DriverError::Other(anyhow::Error::new(err).context(format!(
                "failed to read {}",
                path.display()
            ))));
        }
    };

    if previous.as_deref() == Some(spec.content.as_str()) {
        return Ok(ApplyResult::up_to_date(SystemdAction::Create.as_str()));
    }

    fsutil::atomic_write(&path, spec.content.as_bytes(), Some(0o644), 0)?;

    if spec.verify {
        let unit_path = path.display().to_string();
        let out = run_systemd(&systemd_analyze_bin(), &["verify", &unit_path])?;
        if !out.success() {
            // Back out the write before surfacing the failure.
            match &previous {
                Some(content) => {
                    fsutil::atomic_write(&path, content.as_bytes(), Some(0o644), 0)?;
                }
                None => {
                    fs::remove_file(&path).with_context(|| {
                        format!("failed to back out {}", path.display())
                    })?;
                }
            }
            return Err(DriverError::VerifyFailed(format!(
                "{}: {}",
                spec.name,
                out.stderr.trim()
            )));
        }
    }

    systemctl(&["daemon-reload"])?;
    tracing::debug!(unit = %spec.name, "unit file converged");
    Ok(ApplyResult::updated(SystemdAction::Create.as_str()))
}

fn delete(spec: &SystemdUnitSpec) -> Result<ApplyResult, DriverError> {
    let path = unit_dir().join(&spec.name);
    if !path.exists() {
        return Ok(ApplyResult::up_to_date(SystemdAction::Delete.as_str()));
    }
    fs::remove_file(&path)
        .with_context(|| format!("failed to delete {}", path.display()))?;
    systemctl(&["daemon-reload"])?;
    Ok(ApplyResult::updated(SystemdAction::Delete.as_str()))
}

/// Stateful verbs: probe first so re-runs stay quiet.
fn toggle(
    spec: &SystemdUnitSpec,
    verb: &str,
    probe: &str,
    desired_state: &str,
) -> Result<ApplyResult, DriverError> {
    let out = run_systemd(&systemctl_bin(), &[probe, &spec.name])?;
    if out.stdout.trim() == desired_state {
        return Ok(ApplyResult::up_to_date(verb));
    }
    systemctl(&[verb, &spec.name])?;
    Ok(ApplyResult::updated(verb))
}

/// Always-run verbs (restart, reload).
fn verb(spec: &SystemdUnitSpec, action: SystemdAction) -> Result<ApplyResult, DriverError> {
    systemctl(&[action.as_str(), &spec.name])?;
    Ok(ApplyResult::updated(action.as_str()))
}

fn systemctl(args: &[&str]) -> Result<ShellOutput, DriverError> {
    let out = run_systemd(&systemctl_bin(), args)?;
    if !out.success() {
        return Err(DriverError::CommandFailed {
            code: out.exit_code.unwrap_or(-1),
            stderr: out.stderr,
        });
    }
    Ok(out)
}

/// Run a systemd tool without failing on non-zero exit (probes use the
/// exit code as data).
fn run_systemd(bin: &str, args: &[&str]) -> Result<ShellOutput, DriverError> {
    let out = run_program(bin, args, None, &[]).map_err(DriverError::Other)?;
    if let Some(signal) = out.signal {
        return Err(DriverError::CommandKilled { signal });
    }
    Ok(out)
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use super::*;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    /// systemctl fake: logs argv; `is-enabled`/`is-active` answer from
    /// HOLA_TEST_UNIT_STATE ("enabled:active" style).
    fn fake_systemctl(dir: &Path, log: &Path) -> PathBuf {
        write_script(
            dir,
            "systemctl",
            &format!(
                r#"echo "$@" >> {log}
case "$1" in
  is-enabled) printf '%s' "${{HOLA_TEST_ENABLED:-disabled}}"; exit 0 ;;
  is-active) printf '%s' "${{HOLA_TEST_ACTIVE:-inactive}}"; exit 0 ;;
  *) exit 0 ;;
esac
"#,
                log = log.display()
            ),
        )
    }

    fn spec(name: &str, content: &str) -> SystemdUnitSpec {
        SystemdUnitSpec {
            name: name.to_string(),
            content: content.to_string(),
            actions: vec![SystemdAction::Create],
            verify: false,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        unit_dir: PathBuf,
        log: PathBuf,
    }

    fn fixture() -> (Fixture, Vec<(&'static str, Option<String>)>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let unit_dir = dir.path().join("units");
        fs::create_dir(&unit_dir).expect("mkdir");
        let log = dir.path().join("systemctl.log");
        let systemctl = fake_systemctl(dir.path(), &log);

        let vars = vec![
            ("HOLA_SYSTEMD_UNIT_DIR", Some(unit_dir.display().to_string())),
            ("HOLA_SYSTEMCTL_BIN", Some(systemctl.display().to_string())),
        ];
        (
            Fixture {
                _dir: dir,
                unit_dir,
                log,
            },
            vars,
        )
    }

    #[test]
    #[serial_test::serial]
    fn create_writes_unit_and_reloads() {
        let (fx, vars) = fixture();
        temp_env::with_vars(vars, || {
            let spec = spec("demo.service", "[Unit]\nDescription=demo\n");

            let first = apply(&spec, SystemdAction::Create).expect("apply");
            assert!(first.was_updated);
            assert_eq!(
                fs::read_to_string(fx.unit_dir.join("demo.service")).expect("read"),
                "[Unit]\nDescription=demo\n"
            );
            assert!(fs::read_to_string(&fx.log).expect("log").contains("daemon-reload"));

            let second = apply(&spec, SystemdAction::Create).expect("apply");
            assert!(!second.was_updated);
        });
    }

    #[test]
    #[serial_test::serial]
    fn failed_verification_backs_out_the_write() {
        let (fx, mut vars) = fixture();
        let analyze = write_script(
            fx._dir.path(),
            "systemd-analyze",
            "echo 'demo.service: invalid section' >&2\nexit 1\n",
        );
        vars.push(("HOLA_SYSTEMD_ANALYZE_BIN", Some(analyze.display().to_string())));

        temp_env::with_vars(vars, || {
            let unit = fx.unit_dir.join("demo.service");
            fs::write(&unit, "[Unit]\nDescription=previous\n").expect("write");

            let mut spec = spec("demo.service", "[Broken\n");
            spec.verify = true;

            let err = apply(&spec, SystemdAction::Create).expect_err("verify fails");
            assert!(matches!(err, DriverError::VerifyFailed(_)));
            // Prior content restored.
            assert_eq!(
                fs::read_to_string(&unit).expect("read"),
                "[Unit]\nDescription=previous\n"
            );
        });
    }

    #[test]
    #[serial_test::serial]
    fn enable_probes_before_acting() {
        let (fx, mut vars) = fixture();
        vars.push(("HOLA_TEST_ENABLED", Some("enabled".to_string())));

        temp_env::with_vars(vars, || {
            let spec = spec("demo.service", "");
            let result = apply(&spec, SystemdAction::Enable).expect("apply");
            assert!(!result.was_updated);

            let log = fs::read_to_string(&fx.log).expect("log");
            assert!(log.contains("is-enabled demo.service"));
            assert!(!log.contains("\nenable demo.service"));
        });
    }

    #[test]
    #[serial_test::serial]
    fn start_acts_when_inactive() {
        let (fx, vars) = fixture();
        temp_env::with_vars(vars, || {
            let spec = spec("demo.service", "");
            let result = apply(&spec, SystemdAction::Start).expect("apply");
            assert!(result.was_updated);
            assert!(fs::read_to_string(&fx.log).expect("log").contains("start demo.service"));
        });
    }

    #[test]
    #[serial_test::serial]
    fn restart_always_runs() {
        let (fx, vars) = fixture();
        temp_env::with_vars(vars, || {
            let spec = spec("demo.service", "");
            let result = apply(&spec, SystemdAction::Restart).expect("apply");
            assert!(result.was_updated);
            assert!(
                fs::read_to_string(&fx.log)
                    .expect("log")
                    .contains("restart demo.service")
            );
        });
    }

    #[test]
    #[serial_test::serial]
    fn delete_removes_unit_file() {
        let (fx, vars) = fixture();
        temp_env::with_vars(vars, || {
            let spec = spec("demo.service", "[Unit]\n");
            apply(&spec, SystemdAction::Create).expect("create");
            assert!(fx.unit_dir.join("demo.service").exists());

            let result = apply(&spec, SystemdAction::Delete).expect("delete");
            assert!(result.was_updated);
            assert!(!fx.unit_dir.join("demo.service").exists());
            assert!(!apply(&spec, SystemdAction::Delete).expect("again").was_updated);
        });
    }
}
