use anyhow::Result;
use std::path::{Path, PathBuf};

/// Fallback when the configured log folder cannot be created (e.g. a non-root
/// run that is about to fail the privilege check anyway).
const FALLBACK_LOG_DIR_NAME: &str = "pdns-stack-installer";

/// Resolve log folder (absolute path), creating it if needed.
///
/// The folder lives outside the installation directory so `--reinstall` never
/// deletes the log of the run doing the wiping.
pub fn resolve_log_folder(configured: &Path) -> Result<PathBuf> {
    let configured = absolutize(configured);
    match std::fs::create_dir_all(&configured) {
        Ok(()) => Ok(configured),
        Err(primary) => {
            let fallback = std::env::temp_dir().join(FALLBACK_LOG_DIR_NAME);
            std::fs::create_dir_all(&fallback).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to create log folder {:?} ({}) or fallback {:?} ({})",
                    configured,
                    primary,
                    fallback,
                    e
                )
            })?;
            Ok(fallback)
        }
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("/"))
        .join(path)
}
