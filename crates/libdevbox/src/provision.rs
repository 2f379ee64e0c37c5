use std::process::{Command, Stdio};

use tracing::{info, warn};

use crate::error::{DevboxError, Result};

/// Debian ships the bare `python` name only through this shim package.
fn debian_package_name(name: &str) -> &str {
    match name {
        "python" => "python-is-python3",
        other => other,
    }
}

pub fn normalize_packages(requested: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(requested.len());
    for name in requested.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
        let mapped = debian_package_name(name);
        if mapped != name {
            info!("replacing '{name}' with '{mapped}' for Debian compatibility");
        }
        if !out.iter().any(|existing| existing == mapped) {
            out.push(mapped.to_string());
        }
    }
    out
}

/// Install extra packages with apt. Any failure aborts session start.
pub fn install_packages(packages: &[String]) -> Result<()> {
    let packages = normalize_packages(packages);
    if packages.is_empty() {
        return Ok(());
    }
    info!(packages = %packages.join(" "), "installing extra packages");

    run_checked(Command::new("apt-get").arg("update"))?;
    run_checked(
        Command::new("apt-get")
            .arg("install")
            .arg("-y")
            .args(&packages),
    )?;

    info!("extra packages installed");
    Ok(())
}

fn run_checked(cmd: &mut Command) -> Result<()> {
    let rendered = format!("{cmd:?}");
    let status = cmd
        .stdin(Stdio::null())
        .status()
        .map_err(|err| DevboxError::Provision(format!("failed to run {rendered}: {err}")))?;
    if !status.success() {
        return Err(DevboxError::Provision(format!("{rendered} exited with {status}")));
    }
    Ok(())
}

/// Launch each service command and wait for it to return (daemons such as
/// sshd fork into the background). Failures are reported, not fatal.
pub fn start_services(services: &[Vec<String>]) -> usize {
    let mut started = 0;
    for argv in services {
        let Some((program, args)) = argv.split_first() else {
            continue;
        };
        match Command::new(program).args(args).stdin(Stdio::null()).status() {
            Ok(status) if status.success() => {
                info!(service = %program, "service started");
                started += 1;
            }
            Ok(status) => warn!(service = %program, "service exited with {status}"),
            Err(err) => warn!(service = %program, "failed to start service: {err}"),
        }
    }
    started
}
