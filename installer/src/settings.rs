// Installer settings
//
// Behaviour that used to differ between copies of the installer script (fetch
// policy, readiness policy, edge proxy, ports) is an explicit setting here.
// Sources, later overriding earlier:
//   1. built-in defaults
//   2. /etc/pdns-stack-installer/installer.toml (or $PDNS_INSTALLER_CONFIG)
//   3. PDNS_INSTALLER_<SECTION>__<KEY> environment variables

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_SETTINGS_PATH: &str = "/etc/pdns-stack-installer/installer.toml";
pub const SETTINGS_PATH_ENV: &str = "PDNS_INSTALLER_CONFIG";
const ENV_PREFIX: &str = "PDNS_INSTALLER";

/// Which reverse proxy fronts the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EdgeProxy {
    #[default]
    None,
    Traefik,
}

/// When a fetched artifact already exists locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FetchPolicy {
    /// Always download and overwrite the local copy.
    #[default]
    Always,
    /// Keep an existing local copy (preserves local edits across re-runs).
    IfAbsent,
}

/// What to do when a readiness probe exhausts its attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessPolicy {
    /// Abort the run.
    Strict,
    /// Record a warning and continue.
    Lenient,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallSettings {
    pub dir: PathBuf,
    pub log_dir: PathBuf,
    pub service_name: String,
    pub edge_proxy: EdgeProxy,
    /// Name of the configuration record inside `dir`.
    pub env_file: String,
}

impl Default for InstallSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/opt/pdns-stack"),
            log_dir: PathBuf::from("/var/log/pdns-stack-installer"),
            service_name: "pdns-stack".to_string(),
            edge_proxy: EdgeProxy::None,
            env_file: ".env".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactSettings {
    /// Remote directory both artifacts are fetched from (always the `main` branch).
    pub base_url: String,
    /// Remote descriptor name; derived from the edge proxy when unset.
    pub compose_remote: Option<String>,
    pub schema_remote: String,
    /// Local descriptor name the stack is started from.
    pub compose_local: String,
    pub schema_local: String,
    pub policy: FetchPolicy,
}

impl Default for ArtifactSettings {
    fn default() -> Self {
        Self {
            base_url: "https://raw.githubusercontent.com/pdns-stack/pdns-stack-installer/main/stack/"
                .to_string(),
            compose_remote: None,
            schema_remote: "schema.sql".to_string(),
            compose_local: "docker-compose.yml".to_string(),
            schema_local: "schema.sql".to_string(),
            policy: FetchPolicy::Always,
        }
    }
}

impl ArtifactSettings {
    pub fn compose_remote_for(&self, proxy: EdgeProxy) -> String {
        match &self.compose_remote {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => match proxy {
                EdgeProxy::None => "docker-compose.yml".to_string(),
                EdgeProxy::Traefik => "docker-compose.traefik.yml".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessSettings {
    pub attempts: u32,
    pub interval_secs: u64,
    pub install_policy: ReadinessPolicy,
    pub update_policy: ReadinessPolicy,
    pub check_database: bool,
    /// Compose service name of the database container.
    pub database_service: String,
    pub api_port: u16,
    pub backend_port: u16,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            attempts: 60,
            interval_secs: 5,
            install_policy: ReadinessPolicy::Strict,
            update_policy: ReadinessPolicy::Lenient,
            check_database: true,
            database_service: "db".to_string(),
            api_port: 8081,
            backend_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallSettings {
    /// Rules appended to the fixed list, in `ufw allow` syntax (e.g. "9100/tcp").
    pub extra_ports: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarySettings {
    pub reveal_secrets: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerSettings {
    pub install: InstallSettings,
    pub artifacts: ArtifactSettings,
    pub readiness: ReadinessSettings,
    pub firewall: FirewallSettings,
    pub summary: SummarySettings,
}

impl InstallerSettings {
    /// Load settings from the default file location and the environment.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(SETTINGS_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH));
        Self::load_from(&path)
    }

    /// Load settings from `path` (optional) layered under the environment.
    pub fn load_from(path: &Path) -> Result<Self> {
        let cfg = Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("firewall.extra_ports"),
            )
            .build()
            .with_context(|| format!("Failed to read installer settings from {:?}", path))?;

        cfg.try_deserialize()
            .with_context(|| format!("Invalid installer settings in {:?}", path))
    }

    pub fn env_file_path(&self) -> PathBuf {
        self.install.dir.join(&self.install.env_file)
    }

    pub fn compose_path(&self) -> PathBuf {
        self.install.dir.join(&self.artifacts.compose_local)
    }

    pub fn schema_path(&self) -> PathBuf {
        self.install.dir.join(&self.artifacts.schema_local)
    }

    pub fn unit_path(&self) -> PathBuf {
        PathBuf::from(format!(
            "/etc/systemd/system/{}.service",
            self.install.service_name
        ))
    }
}
