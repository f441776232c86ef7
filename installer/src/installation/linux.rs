// Linux host facts and privileged file writes
//
// Parsing functions are pure so they can be tested anywhere; the file-system
// side sits behind `HostFiles` so the pipeline can run against a recorder.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::Path;

use crate::error::InstallerError;

/// Linux distribution information parsed from /etc/os-release.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinuxDistro {
    /// Distribution ID (e.g., "ubuntu", "debian").
    pub id: String,
    pub version_id: String,
    /// Human-readable name (e.g., "Ubuntu 22.04.3 LTS").
    pub pretty_name: String,
    pub id_like: Vec<String>,
}

/// Parse /etc/os-release content into a `LinuxDistro`.
pub fn parse_os_release(contents: &str) -> LinuxDistro {
    let mut distro = LinuxDistro::default();

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);

        match key.trim() {
            "ID" => distro.id = value.to_string(),
            "VERSION_ID" => distro.version_id = value.to_string(),
            "PRETTY_NAME" => distro.pretty_name = value.to_string(),
            "ID_LIKE" => distro.id_like = value.split_whitespace().map(str::to_string).collect(),
            _ => {}
        }
    }

    if distro.id.is_empty() {
        distro.id = "linux".to_string();
    }
    if distro.pretty_name.is_empty() {
        distro.pretty_name = if distro.version_id.is_empty() {
            distro.id.clone()
        } else {
            format!("{} {}", distro.id, distro.version_id)
        };
    }
    distro
}

/// Map a Rust target arch onto the naming used by the compose release assets.
pub fn compose_arch(rust_arch: &str) -> Option<&'static str> {
    match rust_arch {
        "x86_64" => Some("x86_64"),
        "aarch64" => Some("aarch64"),
        "arm" => Some("armv7"),
        _ => None,
    }
}

#[cfg(unix)]
pub fn is_running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
pub fn is_running_as_root() -> bool {
    false
}

/// Host-level steps (apt, systemctl, ufw, /etc writes) need an effective uid of 0.
pub fn require_root() -> Result<(), InstallerError> {
    if is_running_as_root() {
        Ok(())
    } else {
        Err(InstallerError::NotRoot)
    }
}

/// Read and log /etc/os-release. A missing file is not an error; the installer
/// only targets Debian-family hosts but does not refuse others.
pub async fn log_host_facts() -> Option<LinuxDistro> {
    match tokio::fs::read_to_string("/etc/os-release").await {
        Ok(contents) => {
            let distro = parse_os_release(&contents);
            info!(
                "[PHASE: preflight] [STEP: host] Host OS: {} (id={}, version_id={}, id_like={:?}, arch={})",
                distro.pretty_name,
                distro.id,
                distro.version_id,
                distro.id_like,
                std::env::consts::ARCH
            );
            if distro.id != "debian"
                && distro.id != "ubuntu"
                && !distro.id_like.iter().any(|l| l == "debian")
            {
                warn!(
                    "[PHASE: preflight] [STEP: host] Untested distribution {}; continuing",
                    distro.id
                );
            }
            Some(distro)
        }
        Err(e) => {
            warn!(
                "[PHASE: preflight] [STEP: host] Could not read /etc/os-release: {}",
                e
            );
            None
        }
    }
}

// ============================================================================
// System files outside the installation directory
// ============================================================================

#[async_trait]
pub trait HostFiles: Send + Sync {
    /// Returns `None` when the file does not exist.
    async fn read(&self, path: &Path) -> Result<Option<String>>;
    async fn write(&self, path: &Path, contents: &str, mode: u32) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DiskHostFiles;

#[async_trait]
impl HostFiles for DiskHostFiles {
    async fn read(&self, path: &Path) -> Result<Option<String>> {
        match tokio::fs::read_to_string(path).await {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(anyhow::Error::new(e)).with_context(|| format!("Failed to read {:?}", path)),
        }
    }

    async fn write(&self, path: &Path, contents: &str, mode: u32) -> Result<()> {
        debug!(
            "[PHASE: installation] [STEP: host_files] write entered (path={:?}, bytes={}, mode={:o})",
            path,
            contents.len(),
            mode
        );

        // /etc/resolv.conf is commonly a symlink into /run/systemd/resolve; once the
        // stub resolver is stopped that target is stale, so replace the link itself.
        if let Ok(meta) = tokio::fs::symlink_metadata(path).await {
            if meta.file_type().is_symlink() {
                tokio::fs::remove_file(path)
                    .await
                    .with_context(|| format!("Failed to remove symlink {:?}", path))?;
            }
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        tokio::fs::write(path, contents)
            .await
            .with_context(|| format!("Failed to write {:?}", path))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
                .await
                .with_context(|| format!("Failed to set permissions on {:?}", path))?;
        }
        Ok(())
    }
}
