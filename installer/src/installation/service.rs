// Process supervisor (systemd) helpers
//
// The stack runs as a systemd unit wrapping `docker compose up` so it comes back
// after a reboot or a crash of the compose process.

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info};
use std::path::Path;
use std::time::Instant;
use tokio::time::Duration;

use crate::installation::docker::ComposeProject;
use crate::installation::linux::HostFiles;
use crate::installation::CommandRunner;

const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(30);
/// `start` waits for compose to come up on the first boot of the unit.
const SYSTEMCTL_START_TIMEOUT: Duration = Duration::from_secs(300);
const UNIT_FILE_MODE: u32 = 0o644;

// ============================================================================
// Unit file generation (pure function)
// ============================================================================

/// Build the unit text for the compose stack.
///
/// Paths are quoted when they contain spaces (systemd supports quoted arguments).
pub fn build_systemd_unit_text(
    service_name: &str,
    docker_path: &Path,
    project: &ComposeProject,
) -> String {
    let docker = quote_systemd_path(&docker_path.to_string_lossy());
    let file = quote_systemd_path(&project.file.to_string_lossy());
    let dir = quote_systemd_path(&project.dir.to_string_lossy());

    format!(
        r#"[Unit]
Description=PowerDNS stack ({service_name})
Requires=docker.service
After=docker.service network-online.target
Wants=network-online.target

[Service]
Type=simple
WorkingDirectory={dir}
ExecStart={docker} compose -f {file} --project-directory {dir} up
ExecStop={docker} compose -f {file} --project-directory {dir} down
Restart=always
RestartSec=10

[Install]
WantedBy=multi-user.target
"#
    )
}

/// Quote a path for systemd unit files if it contains spaces or special characters.
fn quote_systemd_path(path: &str) -> String {
    if path.contains(' ') || path.contains('\t') || path.contains('"') {
        format!("\"{}\"", path.replace('"', "\\\""))
    } else {
        path.to_string()
    }
}

// ============================================================================
// systemctl
// ============================================================================

#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn is_active(&self, unit: &str) -> bool;
    async fn stop_and_disable(&self, unit: &str) -> Result<()>;
    async fn daemon_reload(&self) -> Result<()>;
    async fn enable_and_start(&self, unit: &str) -> Result<()>;
}

pub struct Systemd<R> {
    runner: R,
}

impl<R: CommandRunner> Systemd<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    /// Always appends `--no-pager` so nothing blocks on an interactive pager.
    async fn systemctl(&self, cmd_args: &[&str], timeout_dur: Duration, operation: &str) -> Result<()> {
        let mut argv: Vec<String> = cmd_args.iter().map(|s| s.to_string()).collect();
        argv.push("--no-pager".to_string());

        let out = self
            .runner
            .run("systemctl", &argv, timeout_dur, operation)
            .await?;
        if !out.success() {
            anyhow::bail!(
                "systemctl {} failed (exit_code={:?}): {}",
                cmd_args.join(" "),
                out.exit_code,
                out.stderr.trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl<R: CommandRunner> ServiceManager for Systemd<R> {
    async fn is_active(&self, unit: &str) -> bool {
        match self
            .runner
            .run(
                "systemctl",
                &[
                    "is-active".to_string(),
                    "--no-pager".to_string(),
                    unit.to_string(),
                ],
                Duration::from_secs(15),
                "systemctl_is_active",
            )
            .await
        {
            Ok(out) => out.stdout.trim().eq_ignore_ascii_case("active"),
            Err(e) => {
                debug!(
                    "[PHASE: service] [STEP: is_active] systemctl is-active failed (unit={}, error={})",
                    unit, e
                );
                false
            }
        }
    }

    async fn stop_and_disable(&self, unit: &str) -> Result<()> {
        self.systemctl(&["stop", unit], SYSTEMCTL_TIMEOUT, "systemctl_stop")
            .await?;
        self.systemctl(&["disable", unit], SYSTEMCTL_TIMEOUT, "systemctl_disable")
            .await
    }

    async fn daemon_reload(&self) -> Result<()> {
        self.systemctl(&["daemon-reload"], SYSTEMCTL_TIMEOUT, "systemctl_daemon_reload")
            .await
    }

    async fn enable_and_start(&self, unit: &str) -> Result<()> {
        self.systemctl(&["enable", unit], SYSTEMCTL_TIMEOUT, "systemctl_enable")
            .await?;
        self.systemctl(&["start", unit], SYSTEMCTL_START_TIMEOUT, "systemctl_start")
            .await
    }
}

/// Outcome of registering the stack unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitChange {
    Written,
    Unchanged,
}

/// Write the unit file (only when its content differs), reload, enable and start it.
pub async fn register_stack_unit(
    manager: &dyn ServiceManager,
    files: &dyn HostFiles,
    unit_path: &Path,
    service_name: &str,
    docker_path: &Path,
    project: &ComposeProject,
) -> Result<UnitChange> {
    let started = Instant::now();
    info!(
        "[PHASE: service] [STEP: register] register_stack_unit entered (service_name={}, unit_path={:?})",
        service_name, unit_path
    );

    let unit_text = build_systemd_unit_text(service_name, docker_path, project);
    let change = match files.read(unit_path).await? {
        Some(existing) if existing == unit_text => UnitChange::Unchanged,
        _ => {
            files.write(unit_path, &unit_text, UNIT_FILE_MODE).await?;
            UnitChange::Written
        }
    };

    if change == UnitChange::Written {
        info!(
            "[PHASE: service] [STEP: write] Wrote systemd unit file: {:?}",
            unit_path
        );
        manager.daemon_reload().await?;
    } else {
        info!(
            "[PHASE: service] [STEP: write] Unit file already up to date: {:?}",
            unit_path
        );
    }

    let unit = format!("{}.service", service_name);
    manager.enable_and_start(&unit).await?;

    info!(
        "[PHASE: service] [STEP: register] register_stack_unit exit ok (change={:?}, duration_ms={})",
        change,
        started.elapsed().as_millis()
    );
    Ok(change)
}
