// Host firewall (ufw)
//
// Best-effort: a rule that fails to apply becomes a warning, never an abort.
// Hosts without ufw are skipped silently.

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::PathBuf;
use tokio::time::Duration;

use crate::installation::CommandRunner;

const UFW_TIMEOUT: Duration = Duration::from_secs(30);

/// SSH, HTTP, HTTPS, DNS over TCP and UDP, PowerDNS API.
pub const REQUIRED_RULES: &[&str] = &["22/tcp", "80/tcp", "443/tcp", "53/tcp", "53/udp", "8081/tcp"];

#[async_trait]
pub trait Firewall: Send + Sync {
    fn available(&self) -> bool;
    async fn is_active(&self) -> Result<bool>;
    async fn allow(&self, rule: &str) -> Result<()>;
    async fn enable(&self) -> Result<()>;
}

pub struct Ufw<R> {
    runner: R,
    binary: Option<PathBuf>,
}

impl<R: CommandRunner> Ufw<R> {
    /// Locates `ufw` on PATH.
    pub fn new(runner: R) -> Self {
        let binary = which::which("ufw").ok();
        debug!(
            "[PHASE: firewall] [STEP: detect] ufw lookup (found={:?})",
            binary
        );
        Self { runner, binary }
    }

    pub fn with_binary(runner: R, binary: Option<PathBuf>) -> Self {
        Self { runner, binary }
    }

    async fn ufw(&self, cmd_args: &[&str], operation: &str) -> Result<String> {
        let program = self
            .binary
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow::anyhow!("ufw is not installed"))?;
        let argv: Vec<String> = cmd_args.iter().map(|s| s.to_string()).collect();
        let out = self.runner.run(&program, &argv, UFW_TIMEOUT, operation).await?;
        if !out.success() {
            anyhow::bail!(
                "ufw {} failed (exit_code={:?}): {}",
                cmd_args.join(" "),
                out.exit_code,
                out.stderr.trim()
            );
        }
        Ok(out.stdout)
    }
}

/// `ufw status` prints "Status: active" or "Status: inactive" on its first line.
pub fn parse_ufw_active(status_output: &str) -> bool {
    status_output.lines().any(|l| {
        l.trim()
            .strip_prefix("Status:")
            .map(|s| s.trim().eq_ignore_ascii_case("active"))
            .unwrap_or(false)
    })
}

#[async_trait]
impl<R: CommandRunner> Firewall for Ufw<R> {
    fn available(&self) -> bool {
        self.binary.is_some()
    }

    async fn is_active(&self) -> Result<bool> {
        let stdout = self.ufw(&["status"], "ufw_status").await?;
        Ok(parse_ufw_active(&stdout))
    }

    async fn allow(&self, rule: &str) -> Result<()> {
        self.ufw(&["allow", rule], "ufw_allow").await.map(|_| ())
    }

    async fn enable(&self) -> Result<()> {
        self.ufw(&["--force", "enable"], "ufw_enable").await.map(|_| ())
    }
}

/// Open the fixed rules plus `extra_rules`, then enable the firewall if inactive.
///
/// Returns one warning per step that failed.
pub async fn configure_firewall(fw: &dyn Firewall, extra_rules: &[String]) -> Vec<String> {
    let mut warnings = Vec::new();

    if !fw.available() {
        debug!("[PHASE: firewall] [STEP: skip] ufw not present; skipping firewall configuration");
        return warnings;
    }

    let rules = REQUIRED_RULES
        .iter()
        .map(|r| r.to_string())
        .chain(extra_rules.iter().cloned());
    for rule in rules {
        match fw.allow(&rule).await {
            Ok(()) => info!("[PHASE: firewall] [STEP: allow] Allowed {}", rule),
            Err(e) => {
                warn!(
                    "[PHASE: firewall] [STEP: allow] Could not allow {}: {:#}",
                    rule, e
                );
                warnings.push(format!("Firewall rule {} was not applied: {:#}", rule, e));
            }
        }
    }

    match fw.is_active().await {
        Ok(true) => info!("[PHASE: firewall] [STEP: enable] Firewall already active"),
        Ok(false) => match fw.enable().await {
            Ok(()) => info!("[PHASE: firewall] [STEP: enable] Firewall enabled"),
            Err(e) => {
                warn!("[PHASE: firewall] [STEP: enable] Could not enable firewall: {:#}", e);
                warnings.push(format!("Firewall could not be enabled: {:#}", e));
            }
        },
        Err(e) => {
            warn!("[PHASE: firewall] [STEP: status] Could not read firewall status: {:#}", e);
            warnings.push(format!("Firewall status unknown: {:#}", e));
        }
    }

    warnings
}
