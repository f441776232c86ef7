// Container runtime (Docker Engine + compose plugin)
//
// Presence checks, upstream installers and the compose operations the stack
// needs. Compose is always run with an explicit `-f` and `--project-directory`
// so nothing depends on the process working directory.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::OnceCell;
use tokio::time::Duration;
use url::Url;

use crate::installation::artifacts::ArtifactSource;
use crate::installation::linux::compose_arch;
use crate::installation::{args, CommandOutput, CommandRunner};

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(900);
/// `up` and `pull` may download images.
const COMPOSE_TIMEOUT: Duration = Duration::from_secs(900);
const EXEC_TIMEOUT: Duration = Duration::from_secs(20);

pub const DOCKER_INSTALL_SCRIPT_URL: &str = "https://get.docker.com";
pub const COMPOSE_RELEASE_BASE: &str =
    "https://github.com/docker/compose/releases/latest/download/";
pub const COMPOSE_PLUGIN_DIR: &str = "/usr/local/lib/docker/cli-plugins";

/// Runs inside the database container, which already holds the root password.
const DATABASE_PING_SCRIPT: &str =
    r#"MYSQL_PWD="$MYSQL_ROOT_PASSWORD" mysql -uroot -e "SELECT 1""#;

/// Docker version information.
#[derive(Debug, Clone, Default)]
pub struct DockerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    /// Original version string for display/logging.
    pub raw: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeInvocation {
    /// `docker-compose` (V1 standalone binary)
    DockerComposeBinary,
    /// `docker compose` (V2 plugin)
    DockerSubcommand,
}

/// A compose descriptor plus the directory its `.env` and relative paths resolve against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeProject {
    pub file: PathBuf,
    pub dir: PathBuf,
}

impl ComposeProject {
    pub fn new(file: impl Into<PathBuf>, dir: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            dir: dir.into(),
        }
    }
}

/// Parse docker version output into a DockerVersion struct.
///
/// Expected format: "Docker version 24.0.5, build abcdef"
pub fn parse_docker_version(output: &str) -> Option<DockerVersion> {
    let output = output.trim();

    let version_str = if let Some(pos) = output.to_lowercase().find("docker version ") {
        &output[pos + "docker version ".len()..]
    } else {
        output
    };

    let version_part = version_str
        .split(|c: char| c == ',' || c == ' ' || c == '-')
        .next()?;

    let parts: Vec<&str> = version_part.split('.').collect();
    let major: u32 = parts.first().and_then(|s| s.parse().ok()).unwrap_or(0);
    let minor: u32 = parts.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
    let patch: u32 = parts.get(2).and_then(|s| s.parse().ok()).unwrap_or(0);

    if major == 0 && minor == 0 && patch == 0 && !version_part.starts_with('0') {
        return None;
    }

    Some(DockerVersion {
        major,
        minor,
        patch,
        raw: output.to_string(),
    })
}

/// Build program + argv for a compose subcommand.
pub fn compose_command(
    inv: ComposeInvocation,
    project: &ComposeProject,
    subcommand: &[&str],
) -> (&'static str, Vec<String>) {
    let mut a = Vec::with_capacity(subcommand.len() + 5);
    if inv == ComposeInvocation::DockerSubcommand {
        a.push("compose".to_string());
    }
    a.push("-f".to_string());
    a.push(project.file.to_string_lossy().into_owned());
    a.push("--project-directory".to_string());
    a.push(project.dir.to_string_lossy().into_owned());
    a.extend(subcommand.iter().map(|s| s.to_string()));

    match inv {
        ComposeInvocation::DockerSubcommand => ("docker", a),
        ComposeInvocation::DockerComposeBinary => ("docker-compose", a),
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn runtime_version(&self) -> Option<DockerVersion>;
    /// `docker compose` (V2) answers. The systemd unit runs the stack through it,
    /// so a host with only the V1 binary still needs the plugin.
    async fn compose_plugin_available(&self) -> bool;
    async fn install_runtime(&self) -> Result<()>;
    async fn install_compose_plugin(&self) -> Result<()>;
    /// `compose up -d`
    async fn compose_up(&self, project: &ComposeProject) -> Result<()>;
    async fn compose_pull(&self, project: &ComposeProject) -> Result<()>;
    /// Runs a trivial query inside the database service; `Ok(false)` when it fails.
    /// The password comes from the container's own environment, never from argv.
    async fn database_ready(&self, project: &ComposeProject, service: &str) -> Result<bool>;
}

/// Docker CLI driven through a `CommandRunner`; installers download through an `ArtifactSource`.
pub struct DockerCli<R, S> {
    runner: R,
    source: S,
    plugin_dir: PathBuf,
    invocation: OnceCell<ComposeInvocation>,
}

impl<R: CommandRunner, S: ArtifactSource> DockerCli<R, S> {
    pub fn new(runner: R, source: S) -> Self {
        Self {
            runner,
            source,
            plugin_dir: PathBuf::from(COMPOSE_PLUGIN_DIR),
            invocation: OnceCell::new(),
        }
    }

    pub fn with_plugin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plugin_dir = dir.into();
        self
    }

    /// Detect which compose invocation works, V2 preferred. Cached after the first success.
    async fn detect_compose_invocation(&self) -> Result<ComposeInvocation> {
        self.invocation
            .get_or_try_init(|| async {
                let v2 = self
                    .runner
                    .run("docker", &args(&["compose", "version"]), PROBE_TIMEOUT, "docker_compose_version")
                    .await;
                if v2.as_ref().map(CommandOutput::success).unwrap_or(false) {
                    debug!("[PHASE: dependencies] [STEP: compose] using docker compose (V2)");
                    return Ok(ComposeInvocation::DockerSubcommand);
                }

                let v1 = self
                    .runner
                    .run("docker-compose", &args(&["--version"]), PROBE_TIMEOUT, "docker_compose_v1_version")
                    .await;
                if v1.as_ref().map(CommandOutput::success).unwrap_or(false) {
                    debug!("[PHASE: dependencies] [STEP: compose] using docker-compose (V1)");
                    return Ok(ComposeInvocation::DockerComposeBinary);
                }

                anyhow::bail!(
                    "Neither 'docker compose' (V2) nor 'docker-compose' (V1) is available"
                )
            })
            .await
            .copied()
    }

    async fn run_compose(
        &self,
        project: &ComposeProject,
        subcommand: &[&str],
        timeout_dur: Duration,
        operation: &str,
    ) -> Result<CommandOutput> {
        let inv = self.detect_compose_invocation().await?;
        let (program, argv) = compose_command(inv, project, subcommand);
        self.runner.run(program, &argv, timeout_dur, operation).await
    }
}

#[async_trait]
impl<R: CommandRunner, S: ArtifactSource> ContainerRuntime for DockerCli<R, S> {
    async fn runtime_version(&self) -> Option<DockerVersion> {
        let out = self
            .runner
            .run("docker", &args(&["--version"]), PROBE_TIMEOUT, "docker_version")
            .await
            .ok()?;
        if !out.success() {
            return None;
        }
        parse_docker_version(&out.stdout)
    }

    async fn compose_plugin_available(&self) -> bool {
        self.runner
            .run("docker", &args(&["compose", "version"]), PROBE_TIMEOUT, "docker_compose_version")
            .await
            .map(|out| out.success())
            .unwrap_or(false)
    }

    async fn install_runtime(&self) -> Result<()> {
        let url = Url::parse(DOCKER_INSTALL_SCRIPT_URL)?;
        let script = self.source.fetch(&url).await?;

        let path = std::env::temp_dir().join(format!("get-docker-{}.sh", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, &script)
            .await
            .with_context(|| format!("Failed to write Docker install script to {:?}", path))?;

        let result = self
            .runner
            .run(
                "sh",
                &[path.to_string_lossy().into_owned()],
                INSTALL_TIMEOUT,
                "docker_install_script",
            )
            .await;
        let _ = tokio::fs::remove_file(&path).await;

        let out = result?;
        if !out.success() {
            anyhow::bail!(
                "Docker install script failed (exit_code={:?}): {}",
                out.exit_code,
                out.stderr.trim()
            );
        }

        // The script usually enables the daemon already; a failure here is not fatal.
        match self
            .runner
            .run(
                "systemctl",
                &args(&["enable", "--now", "docker", "--no-pager"]),
                Duration::from_secs(60),
                "docker_enable",
            )
            .await
        {
            Ok(out) if out.success() => {}
            Ok(out) => warn!(
                "[PHASE: dependencies] [STEP: docker] systemctl enable --now docker failed (exit_code={:?}): {}",
                out.exit_code,
                out.stderr.trim()
            ),
            Err(e) => warn!(
                "[PHASE: dependencies] [STEP: docker] systemctl enable --now docker failed: {:#}",
                e
            ),
        }
        Ok(())
    }

    async fn install_compose_plugin(&self) -> Result<()> {
        let arch = compose_arch(std::env::consts::ARCH).ok_or_else(|| {
            anyhow::anyhow!(
                "No compose plugin build for architecture {}",
                std::env::consts::ARCH
            )
        })?;
        let url = Url::parse(COMPOSE_RELEASE_BASE)?
            .join(&format!("docker-compose-linux-{}", arch))?;
        let bytes = self.source.fetch(&url).await?;

        write_executable(&self.plugin_dir.join("docker-compose"), &bytes).await
    }

    async fn compose_up(&self, project: &ComposeProject) -> Result<()> {
        let out = self
            .run_compose(project, &["up", "-d"], COMPOSE_TIMEOUT, "compose_up")
            .await?;
        if out.success() {
            return Ok(());
        }
        warn!(
            "[PHASE: launch] [STEP: compose_up] compose up failed: {}",
            out.stderr.trim()
        );
        anyhow::bail!("compose up failed: {}", out.stderr.trim());
    }

    async fn compose_pull(&self, project: &ComposeProject) -> Result<()> {
        let out = self
            .run_compose(project, &["pull"], COMPOSE_TIMEOUT, "compose_pull")
            .await?;
        if out.success() {
            return Ok(());
        }
        warn!(
            "[PHASE: launch] [STEP: compose_pull] compose pull failed: {}",
            out.stderr.trim()
        );
        anyhow::bail!("compose pull failed: {}", out.stderr.trim());
    }

    async fn database_ready(&self, project: &ComposeProject, service: &str) -> Result<bool> {
        let out = self
            .run_compose(
                project,
                &["exec", "-T", service, "sh", "-c", DATABASE_PING_SCRIPT],
                EXEC_TIMEOUT,
                "database_ready",
            )
            .await?;
        Ok(out.success())
    }
}

async fn write_executable(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {:?}", parent))?;
    }
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("Failed to write {:?}", path))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .await
            .with_context(|| format!("Failed to mark {:?} executable", path))?;
    }
    Ok(())
}

/// Make sure the runtime and compose are present, installing whichever is missing.
pub async fn ensure_dependencies(runtime: &dyn ContainerRuntime) -> Result<()> {
    let started = Instant::now();
    info!("[PHASE: dependencies] [STEP: start] ensure_dependencies entered");

    match runtime.runtime_version().await {
        Some(v) => info!(
            "[PHASE: dependencies] [STEP: docker] Docker present ({}.{}.{})",
            v.major, v.minor, v.patch
        ),
        None => {
            info!("[PHASE: dependencies] [STEP: docker] Docker not found; installing");
            runtime
                .install_runtime()
                .await
                .context("Failed to install Docker")?;
            let v = runtime
                .runtime_version()
                .await
                .ok_or_else(|| anyhow::anyhow!("Docker is still unavailable after installation"))?;
            info!(
                "[PHASE: dependencies] [STEP: docker] Docker installed ({}.{}.{})",
                v.major, v.minor, v.patch
            );
        }
    }

    if runtime.compose_plugin_available().await {
        info!("[PHASE: dependencies] [STEP: compose] Compose plugin present");
    } else {
        info!("[PHASE: dependencies] [STEP: compose] docker compose (V2) not found; installing plugin");
        runtime
            .install_compose_plugin()
            .await
            .context("Failed to install the compose plugin")?;
        if !runtime.compose_plugin_available().await {
            anyhow::bail!("docker compose is still unavailable after installing the plugin");
        }
    }

    info!(
        "[PHASE: dependencies] [STEP: done] ensure_dependencies exit ok (duration_ms={})",
        started.elapsed().as_millis()
    );
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Container runtime fake. Counts operations; the database answers after
    /// `db_ready_after` probes (0 = never).
    #[derive(Default)]
    pub struct FakeRuntime {
        pub docker_present: AtomicBool,
        pub compose_present: AtomicBool,
        pub runtime_installs: AtomicU32,
        pub plugin_installs: AtomicU32,
        pub ups: AtomicU32,
        pub pulls: AtomicU32,
        pub db_probes: AtomicU32,
        pub db_ready_after: u32,
        pub projects: Mutex<Vec<ComposeProject>>,
    }

    impl FakeRuntime {
        pub fn installed() -> Self {
            let r = Self {
                db_ready_after: 1,
                ..Default::default()
            };
            r.docker_present.store(true, Ordering::SeqCst);
            r.compose_present.store(true, Ordering::SeqCst);
            r
        }

        pub fn ups(&self) -> u32 {
            self.ups.load(Ordering::SeqCst)
        }

        pub fn pulls(&self) -> u32 {
            self.pulls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn runtime_version(&self) -> Option<DockerVersion> {
            if self.docker_present.load(Ordering::SeqCst) {
                parse_docker_version("Docker version 27.1.1, build 6312585")
            } else {
                None
            }
        }

        async fn compose_plugin_available(&self) -> bool {
            self.compose_present.load(Ordering::SeqCst)
        }

        async fn install_runtime(&self) -> Result<()> {
            self.runtime_installs.fetch_add(1, Ordering::SeqCst);
            self.docker_present.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn install_compose_plugin(&self) -> Result<()> {
            self.plugin_installs.fetch_add(1, Ordering::SeqCst);
            self.compose_present.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn compose_up(&self, project: &ComposeProject) -> Result<()> {
            self.ups.fetch_add(1, Ordering::SeqCst);
            self.projects.lock().unwrap().push(project.clone());
            Ok(())
        }

        async fn compose_pull(&self, _project: &ComposeProject) -> Result<()> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn database_ready(&self, _project: &ComposeProject, _service: &str) -> Result<bool> {
            let n = self.db_probes.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(self.db_ready_after != 0 && n >= self.db_ready_after)
        }
    }
}
