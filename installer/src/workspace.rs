// Installation directory preparation

use anyhow::{Context, Result};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::time::{timeout, Duration};

/// The installation directory every later step resolves relative paths against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

/// Ensure the installation directory exists, wiping it first when `reinstall` is set.
///
/// Wiping removes the configuration record, fetched artifacts and anything else
/// under the directory.
pub async fn prepare_workspace(root: &Path, reinstall: bool) -> Result<Workspace> {
    let started = Instant::now();
    info!(
        "[PHASE: workspace] [STEP: prepare] prepare_workspace entered (root={:?}, reinstall={})",
        root, reinstall
    );

    if reinstall {
        match tokio::fs::metadata(root).await {
            Ok(meta) if meta.is_dir() => {
                warn!(
                    "[PHASE: workspace] [STEP: wipe] Removing existing installation directory {:?}",
                    root
                );
                tokio::fs::remove_dir_all(root)
                    .await
                    .with_context(|| format!("Failed to remove installation directory {:?}", root))?;
            }
            Ok(_) => {
                tokio::fs::remove_file(root)
                    .await
                    .with_context(|| format!("Failed to remove file at {:?}", root))?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(anyhow::Error::new(e))
                    .with_context(|| format!("Failed to inspect {:?}", root));
            }
        }
    }

    ensure_dir_with_retries(root).await?;

    info!(
        "[PHASE: workspace] [STEP: prepare] prepare_workspace exit ok (root={:?}, duration_ms={})",
        root,
        started.elapsed().as_millis()
    );
    Ok(Workspace {
        root: root.to_path_buf(),
    })
}

async fn ensure_dir_with_retries(path: &Path) -> Result<()> {
    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 1..=3 {
        match timeout(Duration::from_secs(5), tokio::fs::create_dir_all(path)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => {
                let permanent = matches!(
                    e.kind(),
                    std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::AlreadyExists
                );
                warn!(
                    "[PHASE: workspace] [STEP: mkdir] create_dir_all failed (attempt={}, path={:?}, error={:?})",
                    attempt, path, e
                );
                last_err = Some(
                    anyhow::Error::new(e)
                        .context(format!("Failed to create installation directory {:?}", path)),
                );
                if permanent {
                    break;
                }
            }
            Err(_) => {
                warn!(
                    "[PHASE: workspace] [STEP: mkdir] create_dir_all timed out (attempt={}, path={:?})",
                    attempt, path
                );
                last_err = Some(anyhow::anyhow!("create_dir_all timed out for {:?}", path));
            }
        }
        let backoff_ms = 50_u64.saturating_mul(1_u64 << ((attempt - 1) as u32));
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Failed to create directory {:?}", path)))
}
