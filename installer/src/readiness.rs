// Readiness gating
//
// Each target gets its own fixed budget of attempts at a fixed interval. Nothing
// retries past the budget: strict policy aborts the run, lenient policy turns
// the timeout into a warning and moves on to the next target.

use anyhow::Result;
use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use std::io::IsTerminal;
use std::time::Instant;
use tokio::time::Duration;

use crate::error::InstallerError;
use crate::installation::docker::{ComposeProject, ContainerRuntime};
use crate::models::stack_config::StackConfig;
use crate::settings::{ReadinessPolicy, ReadinessSettings};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait HttpProber: Send + Sync {
    /// True when a GET of `url` returns a 2xx status.
    async fn probe(&self, url: &str, api_key: Option<&str>) -> bool;
}

#[derive(Debug, Clone)]
pub struct ReqwestProber {
    client: reqwest::Client,
}

impl ReqwestProber {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpProber for ReqwestProber {
    async fn probe(&self, url: &str, api_key: Option<&str>) -> bool {
        let mut req = self.client.get(url);
        if let Some(key) = api_key {
            req = req.header("X-API-Key", key);
        }
        match req.send().await {
            Ok(resp) => {
                let ok = resp.status().is_success();
                debug!(
                    "[PHASE: readiness] [STEP: probe] GET {} -> {}",
                    url,
                    resp.status()
                );
                ok
            }
            Err(e) => {
                debug!("[PHASE: readiness] [STEP: probe] GET {} failed: {}", url, e);
                false
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeKind {
    Http { url: String, send_api_key: bool },
    Database { service: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub name: String,
    pub kind: ProbeKind,
}

impl ProbeTarget {
    fn http(name: &str, url: String, send_api_key: bool) -> Self {
        Self {
            name: name.to_string(),
            kind: ProbeKind::Http { url, send_api_key },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessBudget {
    pub attempts: u32,
    pub interval: Duration,
}

impl ReadinessBudget {
    pub fn from_settings(settings: &ReadinessSettings) -> Self {
        Self {
            attempts: settings.attempts.max(1),
            interval: Duration::from_secs(settings.interval_secs),
        }
    }
}

/// PowerDNS API, backend UI, then (optionally) the database and the public HTTPS site.
pub fn readiness_targets(settings: &ReadinessSettings, config: &StackConfig) -> Vec<ProbeTarget> {
    let mut targets = vec![
        ProbeTarget::http(
            "PowerDNS API",
            format!("http://localhost:{}", settings.api_port),
            true,
        ),
        ProbeTarget::http(
            "Backend UI",
            format!("http://localhost:{}", settings.backend_port),
            false,
        ),
    ];
    if settings.check_database {
        targets.push(ProbeTarget {
            name: "Database".to_string(),
            kind: ProbeKind::Database {
                service: settings.database_service.clone(),
            },
        });
    }
    if config.edge.is_some() {
        targets.push(ProbeTarget::http(
            "HTTPS site",
            format!("https://{}", config.domain),
            false,
        ));
    }
    targets
}

fn spinner() -> ProgressBar {
    if !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg}") {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Probe one target until it succeeds or the budget runs out. Returns attempts used on success.
async fn poll_target(
    target: &ProbeTarget,
    budget: ReadinessBudget,
    prober: &dyn HttpProber,
    runtime: &dyn ContainerRuntime,
    project: &ComposeProject,
    config: &StackConfig,
    pb: &ProgressBar,
) -> Option<u32> {
    for attempt in 1..=budget.attempts {
        pb.set_message(format!(
            "Waiting for {} (attempt {}/{})",
            target.name, attempt, budget.attempts
        ));

        let ready = match &target.kind {
            ProbeKind::Http { url, send_api_key } => {
                let key = send_api_key.then_some(config.api_key.as_str());
                prober.probe(url, key).await
            }
            ProbeKind::Database { service } => runtime
                .database_ready(project, service)
                .await
                .unwrap_or(false),
        };
        if ready {
            return Some(attempt);
        }
        if attempt < budget.attempts {
            tokio::time::sleep(budget.interval).await;
        }
    }
    None
}

/// Wait for every target. Returns lenient-policy timeouts as warnings.
pub async fn wait_until_ready(
    targets: &[ProbeTarget],
    budget: ReadinessBudget,
    policy: ReadinessPolicy,
    prober: &dyn HttpProber,
    runtime: &dyn ContainerRuntime,
    project: &ComposeProject,
    config: &StackConfig,
) -> Result<Vec<String>> {
    let started = Instant::now();
    info!(
        "[PHASE: readiness] [STEP: start] wait_until_ready entered (targets={}, attempts={}, interval_ms={}, policy={:?})",
        targets.len(),
        budget.attempts,
        budget.interval.as_millis(),
        policy
    );

    let pb = spinner();
    let mut warnings = Vec::new();
    for target in targets {
        match poll_target(target, budget, prober, runtime, project, config, &pb).await {
            Some(attempt) => info!(
                "[PHASE: readiness] [STEP: ready] {} is ready (attempt={})",
                target.name, attempt
            ),
            None => match policy {
                ReadinessPolicy::Strict => {
                    pb.finish_and_clear();
                    warn!(
                        "[PHASE: readiness] [STEP: timeout] {} not ready after {} attempts; aborting",
                        target.name, budget.attempts
                    );
                    return Err(InstallerError::ReadinessTimeout {
                        target: target.name.clone(),
                        attempts: budget.attempts,
                    }
                    .into());
                }
                ReadinessPolicy::Lenient => {
                    warn!(
                        "[PHASE: readiness] [STEP: timeout] {} not ready after {} attempts; continuing",
                        target.name, budget.attempts
                    );
                    warnings.push(format!(
                        "{} did not become ready after {} attempts",
                        target.name, budget.attempts
                    ));
                }
            },
        }
    }
    pb.finish_and_clear();

    info!(
        "[PHASE: readiness] [STEP: done] wait_until_ready exit (warnings={}, duration_ms={})",
        warnings.len(),
        started.elapsed().as_millis()
    );
    Ok(warnings)
}


#[cfg(test)]
mod tests {
    use super::testing::CountingProber;
    use super::*;
    use crate::installation::docker::testing::FakeRuntime;
    use crate::models::stack_config::EdgeConfig;
    use std::sync::atomic::Ordering;

    fn config(edge: bool) -> StackConfig {
        StackConfig::new(
            "dns.example.com".into(),
            "ops@example.com".into(),
            "api-key-value".into(),
            "root-password".into(),
            "pdns-password".into(),
            "admin".into(),
            "dash-password".into(),
            edge.then(|| EdgeConfig {
                dashboard_domain: "traefik.dns.example.com".into(),
                basic_auth: "admin:$$2y$$10$$x".into(),
            }),
        )
    }

    fn fast(attempts: u32) -> ReadinessBudget {
        ReadinessBudget {
            attempts,
            interval: Duration::from_millis(1),
        }
    }

    fn project() -> ComposeProject {
        ComposeProject::new("/opt/pdns-stack/docker-compose.yml", "/opt/pdns-stack")
    }

    #[test]
    fn targets_follow_settings_and_edge_mode() {
        let settings = ReadinessSettings::default();
        let plain = readiness_targets(&settings, &config(false));
        let names: Vec<&str> = plain.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["PowerDNS API", "Backend UI", "Database"]);
        assert_eq!(
            plain[0].kind,
            ProbeKind::Http {
                url: "http://localhost:8081".into(),
                send_api_key: true
            }
        );

        let edge = readiness_targets(
            &ReadinessSettings {
                check_database: false,
                ..Default::default()
            },
            &config(true),
        );
        assert_eq!(edge.len(), 3);
        assert_eq!(
            edge[2].kind,
            ProbeKind::Http {
                url: "https://dns.example.com".into(),
                send_api_key: false
            }
        );
    }

    #[tokio::test]
    async fn never_ready_endpoint_gets_exactly_the_budget() {
        let cfg = config(false);
        let targets = vec![ProbeTarget::http("PowerDNS API", "http://localhost:8081".into(), true)];
        let prober = CountingProber::default();
        let err = wait_until_ready(
            &targets,
            fast(60),
            ReadinessPolicy::Strict,
            &prober,
            &FakeRuntime::installed(),
            &project(),
            &cfg,
        )
        .await
        .unwrap_err();

        assert_eq!(prober.attempts_for("http://localhost:8081"), 60);
        assert!(matches!(
            err.downcast_ref::<InstallerError>(),
            Some(InstallerError::ReadinessTimeout { attempts: 60, .. })
        ));
    }

    #[tokio::test]
    async fn interval_is_respected_between_attempts() {
        let cfg = config(false);
        let targets = vec![ProbeTarget::http("Backend UI", "http://localhost:8080".into(), false)];
        let budget = ReadinessBudget {
            attempts: 4,
            interval: Duration::from_millis(20),
        };
        let started = Instant::now();
        let warnings = wait_until_ready(
            &targets,
            budget,
            ReadinessPolicy::Lenient,
            &CountingProber::default(),
            &FakeRuntime::installed(),
            &project(),
            &cfg,
        )
        .await
        .unwrap();
        // Three sleeps between four attempts.
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert_eq!(warnings.len(), 1);
    }

    #[tokio::test]
    async fn lenient_policy_continues_to_later_targets() {
        let cfg = config(false);
        let targets = readiness_targets(&ReadinessSettings::default(), &cfg);
        let prober = CountingProber::all_ready(&["http://localhost:8080"]);
        let runtime = FakeRuntime::installed();
        let warnings = wait_until_ready(
            &targets,
            fast(3),
            ReadinessPolicy::Lenient,
            &prober,
            &runtime,
            &project(),
            &cfg,
        )
        .await
        .unwrap();

        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("PowerDNS API"));
        assert_eq!(prober.attempts_for("http://localhost:8081"), 3);
        assert_eq!(prober.attempts_for("http://localhost:8080"), 1);
        assert_eq!(runtime.db_probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_on_later_attempt() {
        let cfg = config(false);
        let targets = vec![ProbeTarget::http("PowerDNS API", "http://localhost:8081".into(), true)];
        let mut prober = CountingProber::default();
        prober.ready_after.insert("http://localhost:8081".into(), 4);
        let warnings = wait_until_ready(
            &targets,
            fast(10),
            ReadinessPolicy::Strict,
            &prober,
            &FakeRuntime::installed(),
            &project(),
            &cfg,
        )
        .await
        .unwrap();
        assert!(warnings.is_empty());
        assert_eq!(prober.attempts_for("http://localhost:8081"), 4);
    }

    #[tokio::test]
    async fn database_readiness_uses_runtime() {
        let cfg = config(false);
        let targets = vec![ProbeTarget {
            name: "Database".into(),
            kind: ProbeKind::Database {
                service: "db".into(),
            },
        }];
        let runtime = FakeRuntime {
            db_ready_after: 0,
            ..FakeRuntime::installed()
        };
        let err = wait_until_ready(
            &targets,
            fast(5),
            ReadinessPolicy::Strict,
            &CountingProber::default(),
            &runtime,
            &project(),
            &cfg,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("Database"));
        assert_eq!(runtime.db_probes.load(Ordering::SeqCst), 5);
    }
}
