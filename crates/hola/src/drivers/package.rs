//! The `package` driver: platform dispatch to APT or Homebrew.
//!
//! Both sub-drivers diff per package first and batch only diverging
//! packages into a single transaction. Binaries honour
//! `HOLA_APT_GET_BIN` / `HOLA_DPKG_QUERY_BIN` / `HOLA_BREW_BIN` so
//! tests can substitute hermetic fakes.

use crate::types::{ApplyResult, DriverError, PackageAction, PackageProvider, PackageSpec};

pub fn apply(spec: &PackageSpec, action: PackageAction) -> Result<ApplyResult, DriverError> {
    if action == PackageAction::Nothing {
        return Ok(ApplyResult::skipped(
            PackageAction::Nothing.as_str(),
            "action nothing requested",
        ));
    }

    match provider(spec)? {
        #[cfg(target_os = "linux")]
        PackageProvider::Apt => apt::apply(spec, action),
        #[cfg(target_os = "macos")]
        PackageProvider::Homebrew => homebrew::apply(spec, action),
        #[allow(unreachable_patterns)]
        other => Err(DriverError::Other(anyhow::anyhow!(
            "package provider {other:?} is not available on this platform"
        ))),
    }
}

fn provider(spec: &PackageSpec) -> Result<PackageProvider, DriverError> {
    if let Some(explicit) = spec.provider {
        return Ok(explicit);
    }
    if cfg!(target_os = "linux") {
        Ok(PackageProvider::Apt)
    } else if cfg!(target_os = "macos") {
        Ok(PackageProvider::Homebrew)
    } else {
        Err(DriverError::Other(anyhow::anyhow!(
            "no default package provider for this platform"
        )))
    }
}

/// Versioned install argument: `name` or `name=version` / `name@version`.
fn versioned(name: &str, version: Option<&str>, separator: char) -> String {
    match version {
        Some(version) => format!("{name}{separator}{version}"),
        None => name.to_string(),
    }
}

fn transaction_error(action: PackageAction, detail: String) -> DriverError {
    match action {
        PackageAction::Install => DriverError::InstallFailed(detail),
        PackageAction::Remove => DriverError::RemoveFailed(detail),
        PackageAction::Upgrade => DriverError::UpgradeFailed(detail),
        PackageAction::Nothing => DriverError::Other(anyhow::anyhow!(detail)),
    }
}

#[cfg(target_os = "linux")]
mod apt {
    use hola_process::{resolve_program, run_program};

    use super::{transaction_error, versioned};
    use crate::types::{ApplyResult, DriverError, PackageAction, PackageSpec};

    /// Environment forced onto every APT transaction.
    const APT_ENV: [(&str, &str); 3] = [
        ("DEBIAN_FRONTEND", "noninteractive"),
        ("APT_LISTCHANGES_FRONTEND", "none"),
        ("NEEDRESTART_MODE", "l"),
    ];

    fn apt_get_bin() -> String {
        resolve_program("apt-get", "HOLA_APT_GET_BIN")
    }

    fn dpkg_query_bin() -> String {
        resolve_program("dpkg-query", "HOLA_DPKG_QUERY_BIN")
    }

    fn apt_env() -> Vec<(String, String)> {
        APT_ENV
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn installed(name: &str) -> Result<bool, DriverError> {
        let out = run_program(
            &dpkg_query_bin(),
            &["-W", "-f=${Status}", name],
            None,
            &[],
        )
        .map_err(DriverError::Other)?;
        // Unknown packages exit non-zero; that just means "not installed".
        Ok(out.success() && out.stdout.contains("install ok installed"))
    }

    fn run_apt_get(
        action: PackageAction,
        verb_args: &[&str],
        packages: &[String],
        options: Option<&str>,
    ) -> Result<String, DriverError> {
        let mut args: Vec<&str> = Vec::new();
        args.extend_from_slice(verb_args);
        args.extend_from_slice(&["-y", "-qq", "-o", "Dpkg::Use-Pty=0"]);
        let extra: Vec<String> = options
            .map(|o| o.split_whitespace().map(|s| s.to_string()).collect())
            .unwrap_or_default();
        args.extend(extra.iter().map(|s| s.as_str()));
        args.extend(packages.iter().map(|s| s.as_str()));

        let out = run_program(&apt_get_bin(), &args, None, &apt_env())
            .map_err(DriverError::Other)?;
        if !out.success() {
            return Err(transaction_error(
                action,
                format!(
                    "apt-get exited with {:?}: {}",
                    out.exit_code,
                    out.stderr.trim()
                ),
            ));
        }
        Ok(out.stdout)
    }

    pub(super) fn apply(
        spec: &PackageSpec,
        action: PackageAction,
    ) -> Result<ApplyResult, DriverError> {
        match action {
            PackageAction::Install => {
                let mut diverging = Vec::new();
                for name in &spec.names {
                    if !installed(name)? {
                        diverging.push(versioned(name, spec.version.as_deref(), '='));
                    }
                }
                if diverging.is_empty() {
                    return Ok(ApplyResult::up_to_date(action.as_str()));
                }
                tracing::debug!(packages = ?diverging, "installing via apt-get");
                run_apt_get(action, &["install"], &diverging, spec.options.as_deref())?;
                Ok(ApplyResult::updated(action.as_str()))
            }
            PackageAction::Remove => {
                let mut diverging = Vec::new();
                for name in &spec.names {
                    if installed(name)? {
                        diverging.push(name.clone());
                    }
                }
                if diverging.is_empty() {
                    return Ok(ApplyResult::up_to_date(action.as_str()));
                }
                run_apt_get(action, &["remove"], &diverging, spec.options.as_deref())?;
                Ok(ApplyResult::updated(action.as_str()))
            }
            PackageAction::Upgrade => {
                // apt decides whether anything is actually newer; its
                // summary line tells us whether state changed.
                let names: Vec<String> = spec
                    .names
                    .iter()
                    .map(|n| versioned(n, spec.version.as_deref(), '='))
                    .collect();
                let stdout = run_apt_get(
                    action,
                    &["install", "--only-upgrade"],
                    &names,
                    spec.options.as_deref(),
                )?;
                if stdout.contains("0 upgraded, 0 newly installed") {
                    Ok(ApplyResult::up_to_date(action.as_str()))
                } else {
                    Ok(ApplyResult::updated(action.as_str()))
                }
            }
            PackageAction::Nothing => unreachable!("handled by the dispatcher"),
        }
    }
}

#[cfg(target_os = "macos")]
mod homebrew {
    use hola_process::{resolve_program, run_program};

    use super::{transaction_error, versioned};
    use crate::types::{ApplyResult, DriverError, PackageAction, PackageSpec};

    fn brew_bin() -> String {
        resolve_program("brew", "HOLA_BREW_BIN")
    }

    fn installed(name: &str) -> Result<bool, DriverError> {
        let out = run_program(&brew_bin(), &["list", "--versions", name], None, &[])
            .map_err(DriverError::Other)?;
        Ok(out.success() && !out.stdout.trim().is_empty())
    }

    fn run_brew(
        action: PackageAction,
        verb: &str,
        packages: &[String],
        options: Option<&str>,
    ) -> Result<String, DriverError> {
        let mut args: Vec<&str> = vec![verb];
        let extra: Vec<String> = options
            .map(|o| o.split_whitespace().map(|s| s.to_string()).collect())
            .unwrap_or_default();
        args.extend(extra.iter().map(|s| s.as_str()));
        args.extend(packages.iter().map(|s| s.as_str()));

        let out = run_program(&brew_bin(), &args, None, &[]).map_err(DriverError::Other)?;
        if !out.success() {
            return Err(transaction_error(
                action,
                format!("brew exited with {:?}: {}", out.exit_code, out.stderr.trim()),
            ));
        }
        Ok(out.stdout)
    }

    pub(super) fn apply(
        spec: &PackageSpec,
        action: PackageAction,
    ) -> Result<ApplyResult, DriverError> {
        match action {
            PackageAction::Install => {
                let mut diverging = Vec::new();
                for name in &spec.names {
                    if !installed(name)? {
                        diverging.push(versioned(name, spec.version.as_deref(), '@'));
                    }
                }
                if diverging.is_empty() {
                    return Ok(ApplyResult::up_to_date(action.as_str()));
                }
                run_brew(action, "install", &diverging, spec.options.as_deref())?;
                Ok(ApplyResult::updated(action.as_str()))
            }
            PackageAction::Remove => {
                let mut diverging = Vec::new();
                for name in &spec.names {
                    if installed(name)? {
                        diverging.push(name.clone());
                    }
                }
                if diverging.is_empty() {
                    return Ok(ApplyResult::up_to_date(action.as_str()));
                }
                run_brew(action, "uninstall", &diverging, spec.options.as_deref())?;
                Ok(ApplyResult::updated(action.as_str()))
            }
            PackageAction::Upgrade => {
                let names: Vec<String> = spec.names.clone();
                run_brew(action, "upgrade", &names, spec.options.as_deref())?;
                Ok(ApplyResult::updated(action.as_str()))
            }
            PackageAction::Nothing => unreachable!("handled by the dispatcher"),
        }
    }
}
