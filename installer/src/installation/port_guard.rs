// Port 53 guard
//
// PowerDNS binds 53/tcp and 53/udp on the host. systemd-resolved's stub listener
// usually holds it; that one is stopped and replaced with a static resolv.conf.
// Anything else is left alone and the run aborts.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use regex::Regex;
use std::path::{Path, PathBuf};
use tokio::time::Duration;

use crate::error::InstallerError;
use crate::installation::linux::HostFiles;
use crate::installation::service::ServiceManager;
use crate::installation::CommandRunner;
use crate::utils::validation::compile;

pub const DNS_PORT: u16 = 53;
pub const STUB_RESOLVER_UNIT: &str = "systemd-resolved";
/// `ss` reports the kernel comm name, truncated to 15 characters.
const STUB_RESOLVER_PROCESS: &str = "systemd-resolve";
pub const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";
pub const FALLBACK_NAMESERVERS: &[&str] = &["1.1.1.1", "8.8.8.8"];

/// One socket bound to the inspected port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub protocol: String,
    pub local_address: String,
    /// `None` when `ss` could not attribute the socket (e.g. not running as root).
    pub process: Option<String>,
    pub pid: Option<u32>,
}

impl Listener {
    fn holder(&self) -> String {
        match (&self.process, self.pid) {
            (Some(p), Some(pid)) => format!("{} (pid {})", p, pid),
            (Some(p), None) => p.clone(),
            _ => format!("unknown process on {}", self.local_address),
        }
    }

    /// The stub listener lives on 127.0.0.53/54; used when `ss` has no process name.
    fn on_stub_address(&self) -> bool {
        self.local_address.starts_with("127.0.0.53") || self.local_address.starts_with("127.0.0.54")
    }
}

#[async_trait]
pub trait PortInspector: Send + Sync {
    async fn listeners(&self, port: u16) -> Result<Vec<Listener>>;
}

pub struct SsPortInspector<R> {
    runner: R,
}

impl<R: CommandRunner> SsPortInspector<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl<R: CommandRunner> PortInspector for SsPortInspector<R> {
    async fn listeners(&self, port: u16) -> Result<Vec<Listener>> {
        let filter = format!("sport = :{}", port);
        let out = self
            .runner
            .run(
                "ss",
                &["-H".to_string(), "-lntup".to_string(), filter],
                Duration::from_secs(15),
                "ss_listeners",
            )
            .await?;
        if !out.success() {
            anyhow::bail!(
                "ss failed (exit_code={:?}): {}",
                out.exit_code,
                out.stderr.trim()
            );
        }
        parse_ss_listeners(&out.stdout, port)
    }
}

/// Parse `ss -lntup` output, keeping sockets whose local port is `port`.
///
/// ```text
/// udp UNCONN 0 0 127.0.0.53%lo:53 0.0.0.0:* users:(("systemd-resolve",pid=651,fd=13))
/// ```
pub fn parse_ss_listeners(output: &str, port: u16) -> Result<Vec<Listener>> {
    let users_re: Regex = compile(r#"\("([^"]+)",pid=(\d+)"#)?;
    let suffix = format!(":{}", port);

    let mut out = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 || fields[0].eq_ignore_ascii_case("netid") {
            continue;
        }
        let local = fields[4];
        if !local.ends_with(&suffix) {
            continue;
        }

        let (process, pid) = match users_re.captures(line) {
            Some(c) => (
                c.get(1).map(|m| m.as_str().to_string()),
                c.get(2).and_then(|m| m.as_str().parse().ok()),
            ),
            None => (None, None),
        };
        out.push(Listener {
            protocol: fields[0].to_string(),
            local_address: local.to_string(),
            process,
            pid,
        });
    }
    Ok(out)
}

pub fn fallback_resolv_conf() -> String {
    let mut s = String::from("# Written by pdns-stack-installer after disabling systemd-resolved\n");
    for ns in FALLBACK_NAMESERVERS {
        s.push_str("nameserver ");
        s.push_str(ns);
        s.push('\n');
    }
    s
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortGuardOutcome {
    /// Nothing listened; nothing was touched.
    Free,
    /// The stub resolver was stopped, disabled and replaced.
    ResolverStopped,
}

/// Free `port` if only the stub resolver holds it; fail with `PortInUse` otherwise.
pub async fn guard_dns_port(
    inspector: &dyn PortInspector,
    services: &dyn ServiceManager,
    files: &dyn HostFiles,
    port: u16,
    resolv_conf: &Path,
) -> Result<PortGuardOutcome> {
    let listeners = inspector
        .listeners(port)
        .await
        .with_context(|| format!("Failed to inspect port {}", port))?;

    if listeners.is_empty() {
        info!("[PHASE: port_guard] [STEP: check] Port {} is free", port);
        return Ok(PortGuardOutcome::Free);
    }
    debug!(
        "[PHASE: port_guard] [STEP: check] Port {} listeners: {:?}",
        port, listeners
    );

    let resolver_active = services.is_active(STUB_RESOLVER_UNIT).await;
    let foreign = listeners.iter().find(|l| match &l.process {
        Some(p) => p != STUB_RESOLVER_PROCESS,
        None => !(resolver_active && l.on_stub_address()),
    });
    if let Some(l) = foreign {
        warn!(
            "[PHASE: port_guard] [STEP: check] Port {} held by {}; refusing to stop it",
            port,
            l.holder()
        );
        return Err(InstallerError::PortInUse {
            port,
            holder: l.holder(),
        }
        .into());
    }

    info!(
        "[PHASE: port_guard] [STEP: resolver] Port {} held by {}; stopping it",
        port, STUB_RESOLVER_UNIT
    );
    services
        .stop_and_disable(STUB_RESOLVER_UNIT)
        .await
        .with_context(|| format!("Failed to stop {}", STUB_RESOLVER_UNIT))?;

    files
        .write(resolv_conf, &fallback_resolv_conf(), 0o644)
        .await
        .with_context(|| format!("Failed to write {:?}", resolv_conf))?;
    info!(
        "[PHASE: port_guard] [STEP: resolv_conf] Wrote {:?} (nameservers={:?})",
        resolv_conf, FALLBACK_NAMESERVERS
    );

    let remaining = inspector.listeners(port).await?;
    if let Some(l) = remaining.first() {
        return Err(InstallerError::PortInUse {
            port,
            holder: l.holder(),
        }
        .into());
    }

    Ok(PortGuardOutcome::ResolverStopped)
}

pub fn default_resolv_conf_path() -> PathBuf {
    PathBuf::from(RESOLV_CONF_PATH)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Answers each inspection from a queue; an empty queue means the port is free.
    #[derive(Default)]
    pub struct ScriptedPorts {
        answers: Mutex<VecDeque<Vec<Listener>>>,
        pub inspections: AtomicU32,
    }

    impl ScriptedPorts {
        pub fn free() -> Self {
            Self::default()
        }

        pub fn held_by(process: &str) -> Self {
            let s = Self::default();
            s.answers.lock().unwrap().push_back(vec![Listener {
                protocol: "udp".into(),
                local_address: "127.0.0.53%lo:53".into(),
                process: Some(process.to_string()),
                pid: Some(651),
            }]);
            s
        }

        pub fn inspections(&self) -> u32 {
            self.inspections.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PortInspector for ScriptedPorts {
        async fn listeners(&self, _port: u16) -> Result<Vec<Listener>> {
            self.inspections.fetch_add(1, Ordering::SeqCst);
            Ok(self.answers.lock().unwrap().pop_front().unwrap_or_default())
        }
    }
}
