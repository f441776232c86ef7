// Provisioning pipeline
//
// One linear pass per invocation. Install mode:
//   workspace -> port 53 -> configuration -> dependencies -> artifacts ->
//   firewall -> compose up + unit -> readiness
// Update mode skips the port guard, wizard, firewall and unit steps and pulls
// new images before restarting.

use anyhow::{Context, Result};
use log::{info, warn};
use std::path::PathBuf;
use std::time::Instant;

use crate::cli::InstallArgs;
use crate::installation::artifacts::{fetch_artifacts, ArtifactReport, ArtifactSource};
use crate::installation::docker::{ensure_dependencies, ComposeProject, ContainerRuntime};
use crate::installation::firewall::{configure_firewall, Firewall};
use crate::installation::linux::HostFiles;
use crate::installation::port_guard::{
    default_resolv_conf_path, guard_dns_port, PortGuardOutcome, PortInspector, DNS_PORT,
};
use crate::installation::service::{register_stack_unit, ServiceManager, UnitChange};
use crate::models::stack_config::StackConfig;
use crate::readiness::{readiness_targets, wait_until_ready, HttpProber, ReadinessBudget};
use crate::settings::InstallerSettings;
use crate::wizard::{load_existing, load_or_collect, Prompter, WizardState};
use crate::workspace::{prepare_workspace, Workspace};

const DEFAULT_DOCKER_PATH: &str = "/usr/bin/docker";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionMode {
    Install,
    Update,
}

/// Non-fatal problems collected during a run, reported in the summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Warnings(Vec<String>);

impl Warnings {
    pub fn push(&mut self, warning: impl Into<String>) {
        self.0.push(warning.into());
    }

    pub fn extend(&mut self, warnings: impl IntoIterator<Item = String>) {
        self.0.extend(warnings);
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

#[derive(Debug, Clone)]
pub struct ProvisionReport {
    pub mode: ProvisionMode,
    pub config: StackConfig,
    /// `None` in update mode (the wizard never runs).
    pub wizard: Option<WizardState>,
    pub port_guard: Option<PortGuardOutcome>,
    pub unit: Option<UnitChange>,
    pub artifacts: ArtifactReport,
    pub warnings: Warnings,
}

/// Every host-facing dependency of the pipeline.
pub struct Capabilities<'a> {
    pub runtime: &'a dyn ContainerRuntime,
    pub firewall: &'a dyn Firewall,
    pub services: &'a dyn ServiceManager,
    pub ports: &'a dyn PortInspector,
    pub artifacts: &'a dyn ArtifactSource,
    pub prober: &'a dyn HttpProber,
    pub prompter: &'a dyn Prompter,
    pub host_files: &'a dyn HostFiles,
}

pub struct Provisioner<'a> {
    settings: &'a InstallerSettings,
    caps: Capabilities<'a>,
    resolv_conf: PathBuf,
    docker_path: Option<PathBuf>,
}

impl<'a> Provisioner<'a> {
    pub fn new(settings: &'a InstallerSettings, caps: Capabilities<'a>) -> Self {
        Self {
            settings,
            caps,
            resolv_conf: default_resolv_conf_path(),
            docker_path: None,
        }
    }

    /// Pin the docker binary written into the unit instead of looking it up on PATH.
    pub fn with_docker_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.docker_path = Some(path.into());
        self
    }

    pub async fn run(&self, args: InstallArgs) -> Result<ProvisionReport> {
        if args.update_only {
            if args.reinstall {
                warn!("[PHASE: provision] [STEP: args] --reinstall is ignored together with --update");
            }
            self.update().await
        } else {
            self.install(args.reinstall).await
        }
    }

    fn compose_project(&self, workspace: &Workspace) -> ComposeProject {
        ComposeProject::new(
            workspace.join(&self.settings.artifacts.compose_local),
            workspace.root(),
        )
    }

    fn docker_path(&self) -> PathBuf {
        self.docker_path.clone().unwrap_or_else(|| {
            which::which("docker").unwrap_or_else(|_| PathBuf::from(DEFAULT_DOCKER_PATH))
        })
    }

    async fn install(&self, reinstall: bool) -> Result<ProvisionReport> {
        let started = Instant::now();
        let s = self.settings;
        info!(
            "[PHASE: provision] [STEP: start] Install entered (dir={:?}, reinstall={}, edge_proxy={:?})",
            s.install.dir, reinstall, s.install.edge_proxy
        );
        let mut warnings = Warnings::default();

        let workspace = prepare_workspace(&s.install.dir, reinstall).await?;

        let port_guard = guard_dns_port(
            self.caps.ports,
            self.caps.services,
            self.caps.host_files,
            DNS_PORT,
            &self.resolv_conf,
        )
        .await?;

        let env_path = workspace.join(&s.install.env_file);
        let (config, wizard) =
            load_or_collect(self.caps.prompter, &env_path, s.install.edge_proxy, reinstall)
                .await
                .context("Configuration step failed")?;

        ensure_dependencies(self.caps.runtime).await?;

        let artifacts = fetch_artifacts(
            self.caps.artifacts,
            &s.artifacts,
            s.install.edge_proxy,
            &workspace,
            reinstall,
        )
        .await?;

        warnings.extend(configure_firewall(self.caps.firewall, &s.firewall.extra_ports).await);

        let project = self.compose_project(&workspace);
        info!("[PHASE: launch] [STEP: compose_up] Starting the stack");
        self.caps
            .runtime
            .compose_up(&project)
            .await
            .context("Failed to start the stack")?;

        let unit = register_stack_unit(
            self.caps.services,
            self.caps.host_files,
            &s.unit_path(),
            &s.install.service_name,
            &self.docker_path(),
            &project,
        )
        .await
        .context("Failed to register the stack service")?;

        let targets = readiness_targets(&s.readiness, &config);
        warnings.extend(
            wait_until_ready(
                &targets,
                ReadinessBudget::from_settings(&s.readiness),
                s.readiness.install_policy,
                self.caps.prober,
                self.caps.runtime,
                &project,
                &config,
            )
            .await?,
        );

        info!(
            "[PHASE: provision] [STEP: done] Install exit ok (warnings={}, duration_ms={})",
            warnings.len(),
            started.elapsed().as_millis()
        );
        Ok(ProvisionReport {
            mode: ProvisionMode::Install,
            config,
            wizard: Some(wizard),
            port_guard: Some(port_guard),
            unit: Some(unit),
            artifacts,
            warnings,
        })
    }

    async fn update(&self) -> Result<ProvisionReport> {
        let started = Instant::now();
        let s = self.settings;
        info!(
            "[PHASE: provision] [STEP: start] Update entered (dir={:?})",
            s.install.dir
        );
        let mut warnings = Warnings::default();

        let workspace = prepare_workspace(&s.install.dir, false).await?;
        let config = load_existing(&workspace.join(&s.install.env_file), s.install.edge_proxy).await?;

        ensure_dependencies(self.caps.runtime).await?;

        let artifacts = fetch_artifacts(
            self.caps.artifacts,
            &s.artifacts,
            s.install.edge_proxy,
            &workspace,
            true,
        )
        .await?;

        let project = self.compose_project(&workspace);
        info!("[PHASE: launch] [STEP: compose_pull] Pulling images");
        self.caps
            .runtime
            .compose_pull(&project)
            .await
            .context("Failed to pull images")?;
        info!("[PHASE: launch] [STEP: compose_up] Restarting the stack");
        self.caps
            .runtime
            .compose_up(&project)
            .await
            .context("Failed to restart the stack")?;

        let targets = readiness_targets(&s.readiness, &config);
        warnings.extend(
            wait_until_ready(
                &targets,
                ReadinessBudget::from_settings(&s.readiness),
                s.readiness.update_policy,
                self.caps.prober,
                self.caps.runtime,
                &project,
                &config,
            )
            .await?,
        );

        info!(
            "[PHASE: provision] [STEP: done] Update exit ok (warnings={}, duration_ms={})",
            warnings.len(),
            started.elapsed().as_millis()
        );
        Ok(ProvisionReport {
            mode: ProvisionMode::Update,
            config,
            wizard: None,
            port_guard: None,
            unit: None,
            artifacts,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InstallerError;
    use crate::installation::artifacts::testing::StaticArtifactSource;
    use crate::installation::docker::testing::FakeRuntime;
    use crate::installation::firewall::testing::FakeFirewall;
    use crate::installation::linux::testing::MemoryHostFiles;
    use crate::installation::port_guard::testing::ScriptedPorts;
    use crate::installation::port_guard::RESOLV_CONF_PATH;
    use crate::installation::service::testing::RecordingServices;
    use crate::models::env_file::EnvRecord;
    use crate::models::stack_config::{
        KEY_API_KEY, KEY_DASHBOARD_PASSWORD, KEY_DB_PASSWORD, KEY_DB_ROOT_PASSWORD, KEY_DOMAIN,
        KEY_EMAIL,
    };
    use crate::readiness::testing::CountingProber;
    use crate::settings::ReadinessPolicy;
    use crate::wizard::testing::ScriptedPrompter;

    const FRESH_ANSWERS: [&str; 7] = ["dns.example.com", "ops@example.com", "", "", "", "", ""];
    const API_URL: &str = "http://localhost:8081";
    const BACKEND_URL: &str = "http://localhost:8080";

    struct Harness {
        _tmp: tempfile::TempDir,
        settings: InstallerSettings,
        runtime: FakeRuntime,
        firewall: FakeFirewall,
        services: RecordingServices,
        ports: ScriptedPorts,
        artifacts: StaticArtifactSource,
        prober: CountingProber,
        files: MemoryHostFiles,
    }

    impl Harness {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let mut settings = InstallerSettings::default();
            settings.install.dir = tmp.path().join("pdns-stack");
            settings.install.log_dir = tmp.path().join("logs");
            settings.artifacts.base_url = "https://example.com/stack/".into();
            settings.readiness.attempts = 3;
            settings.readiness.interval_secs = 0;
            Self {
                _tmp: tmp,
                settings,
                runtime: FakeRuntime::installed(),
                firewall: FakeFirewall::inactive(),
                services: RecordingServices::new(),
                ports: ScriptedPorts::free(),
                artifacts: StaticArtifactSource::new(),
                prober: CountingProber::all_ready(&[API_URL, BACKEND_URL]),
                files: MemoryHostFiles::new(),
            }
        }

        async fn run(&self, args: InstallArgs, answers: &[&str]) -> Result<ProvisionReport> {
            let prompter = ScriptedPrompter::new(answers);
            let caps = Capabilities {
                runtime: &self.runtime,
                firewall: &self.firewall,
                services: &self.services,
                ports: &self.ports,
                artifacts: &self.artifacts,
                prober: &self.prober,
                prompter: &prompter,
                host_files: &self.files,
            };
            Provisioner::new(&self.settings, caps)
                .with_docker_path("/usr/bin/docker")
                .run(args)
                .await
        }

        fn env_path(&self) -> PathBuf {
            self.settings.env_file_path()
        }

        fn env_bytes(&self) -> Vec<u8> {
            std::fs::read(self.env_path()).unwrap()
        }
    }

    fn install() -> InstallArgs {
        InstallArgs::default()
    }

    fn reinstall() -> InstallArgs {
        InstallArgs {
            reinstall: true,
            update_only: false,
        }
    }

    fn update() -> InstallArgs {
        InstallArgs {
            reinstall: false,
            update_only: true,
        }
    }

    #[tokio::test]
    async fn fresh_install_end_to_end() {
        let h = Harness::new();
        let report = h.run(install(), &FRESH_ANSWERS).await.unwrap();

        let text = std::fs::read_to_string(h.env_path()).unwrap();
        assert!(text.contains("DOMAIN=dns.example.com\n"), "{}", text);
        assert!(text.contains("EMAIL=ops@example.com\n"), "{}", text);

        let record = EnvRecord::parse(&text);
        let secrets: Vec<&str> = [KEY_API_KEY, KEY_DB_ROOT_PASSWORD, KEY_DB_PASSWORD, KEY_DASHBOARD_PASSWORD]
            .iter()
            .map(|k| record.get(k).unwrap())
            .collect();
        for (i, a) in secrets.iter().enumerate() {
            assert!(!a.is_empty());
            for b in &secrets[i + 1..] {
                assert_ne!(a, b);
            }
        }

        assert_eq!(h.runtime.ups(), 1);
        let urls = h.prober.urls();
        assert!(urls.contains(&API_URL.to_string()));
        assert!(urls.contains(&BACKEND_URL.to_string()));

        assert_eq!(report.mode, ProvisionMode::Install);
        assert_eq!(report.wizard, Some(WizardState::Fresh));
        assert_eq!(report.port_guard, Some(PortGuardOutcome::Free));
        assert_eq!(report.unit, Some(UnitChange::Written));
        assert!(report.warnings.is_empty());
        assert!(h.settings.compose_path().is_file());
        assert!(h.settings.schema_path().is_file());
        assert!(h
            .files
            .get("/etc/systemd/system/pdns-stack.service")
            .unwrap()
            .contains("ExecStart=/usr/bin/docker compose -f"));
        assert!(h.firewall.is_enabled());
        assert_eq!(
            h.services.calls(),
            vec!["daemon_reload", "enable_and_start pdns-stack.service"]
        );
    }

    #[tokio::test]
    async fn rerun_without_reinstall_keeps_configuration_byte_identical() {
        let h = Harness::new();
        h.run(install(), &FRESH_ANSWERS).await.unwrap();
        let first = h.env_bytes();

        let report = h.run(install(), &[]).await.unwrap();
        assert_eq!(report.wizard, Some(WizardState::Existing));
        assert_eq!(report.unit, Some(UnitChange::Unchanged));
        assert_eq!(h.env_bytes(), first);
    }

    #[tokio::test]
    async fn reinstall_regenerates_secrets() {
        let h = Harness::new();
        h.run(install(), &FRESH_ANSWERS).await.unwrap();
        let before = EnvRecord::parse(&String::from_utf8(h.env_bytes()).unwrap());
        std::fs::write(h.settings.install.dir.join("stale.txt"), "x").unwrap();

        let report = h.run(reinstall(), &FRESH_ANSWERS).await.unwrap();
        let after = EnvRecord::parse(&String::from_utf8(h.env_bytes()).unwrap());

        assert_eq!(report.wizard, Some(WizardState::Fresh));
        assert_eq!(before.get(KEY_DOMAIN), after.get(KEY_DOMAIN));
        assert_eq!(before.get(KEY_EMAIL), after.get(KEY_EMAIL));
        for key in [KEY_API_KEY, KEY_DB_ROOT_PASSWORD, KEY_DB_PASSWORD, KEY_DASHBOARD_PASSWORD] {
            assert_ne!(before.get(key), after.get(key), "{} should change", key);
        }
        assert!(!h.settings.install.dir.join("stale.txt").exists());
    }

    #[tokio::test]
    async fn update_requires_existing_configuration() {
        let h = Harness::new();
        let err = h.run(update(), &[]).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<InstallerError>(),
            Some(InstallerError::MissingConfiguration { .. })
        ));
        assert_eq!(h.runtime.ups(), 0);
    }

    #[tokio::test]
    async fn update_pulls_and_restarts_without_host_steps() {
        let h = Harness::new();
        h.run(install(), &FRESH_ANSWERS).await.unwrap();
        let env_before = h.env_bytes();
        let allowed_before = h.firewall.allowed().len();
        let writes_before = h.files.write_count();
        let services_before = h.services.calls().len();

        let report = h.run(update(), &[]).await.unwrap();

        assert_eq!(report.mode, ProvisionMode::Update);
        assert!(report.wizard.is_none());
        assert!(report.port_guard.is_none());
        assert!(report.unit.is_none());
        assert_eq!(report.artifacts.fetched.len(), 2);
        assert_eq!(h.runtime.pulls(), 1);
        assert_eq!(h.runtime.ups(), 2);
        assert_eq!(h.env_bytes(), env_before);
        assert_eq!(h.firewall.allowed().len(), allowed_before);
        assert_eq!(h.files.write_count(), writes_before);
        assert_eq!(h.services.calls().len(), services_before);
        assert_eq!(h.ports.inspections(), 1);
    }

    #[tokio::test]
    async fn strict_install_aborts_when_api_never_answers() {
        let mut h = Harness::new();
        h.prober = CountingProber::all_ready(&[BACKEND_URL]);
        let err = h.run(install(), &FRESH_ANSWERS).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<InstallerError>(),
            Some(InstallerError::ReadinessTimeout { attempts: 3, .. })
        ));
        assert_eq!(h.prober.attempts_for(API_URL), 3);
        assert_eq!(h.prober.attempts_for(BACKEND_URL), 0);
    }

    #[tokio::test]
    async fn lenient_update_reports_timeout_as_warning() {
        let mut h = Harness::new();
        h.run(install(), &FRESH_ANSWERS).await.unwrap();
        h.prober = CountingProber::all_ready(&[BACKEND_URL]);
        assert_eq!(h.settings.readiness.update_policy, ReadinessPolicy::Lenient);

        let report = h.run(update(), &[]).await.unwrap();
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings.as_slice()[0].contains("PowerDNS API"));
    }

    #[tokio::test]
    async fn stub_resolver_is_replaced_before_configuration() {
        let mut h = Harness::new();
        h.ports = ScriptedPorts::held_by("systemd-resolve");
        let report = h.run(install(), &FRESH_ANSWERS).await.unwrap();
        assert_eq!(report.port_guard, Some(PortGuardOutcome::ResolverStopped));
        assert!(h.files.get(RESOLV_CONF_PATH).unwrap().contains("nameserver 1.1.1.1"));
        assert_eq!(h.services.calls()[0], "stop_and_disable systemd-resolved");
    }

    #[tokio::test]
    async fn unknown_port_holder_aborts_before_any_change() {
        let mut h = Harness::new();
        h.ports = ScriptedPorts::held_by("named");
        let err = h.run(install(), &FRESH_ANSWERS).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<InstallerError>(),
            Some(InstallerError::PortInUse { port: 53, .. })
        ));
        assert!(!h.env_path().exists());
        assert!(h.services.calls().is_empty());
        assert_eq!(h.runtime.ups(), 0);
    }

    #[tokio::test]
    async fn firewall_failures_are_collected_as_warnings() {
        let mut h = Harness::new();
        h.firewall = FakeFirewall {
            present: true,
            rejected: vec!["53/udp".to_string(), "8081/tcp".to_string()],
            ..Default::default()
        };
        let report = h.run(install(), &FRESH_ANSWERS).await.unwrap();
        assert_eq!(report.warnings.len(), 2);
        assert_eq!(h.runtime.ups(), 1);
    }

    #[tokio::test]
    async fn missing_dependencies_are_installed() {
        let mut h = Harness::new();
        h.runtime = FakeRuntime {
            db_ready_after: 1,
            ..Default::default()
        };
        h.run(install(), &FRESH_ANSWERS).await.unwrap();
        assert_eq!(
            h.runtime
                .runtime_installs
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        assert_eq!(
            h.runtime
                .plugin_installs
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }
}
