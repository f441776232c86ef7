// Named fatal conditions
//
// Everything else travels as `anyhow::Error` with context; these are the failures
// the operator is expected to act on, so they get their own wording.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstallerError {
    #[error(
        "Port {port} is in use by '{holder}'. Stop that service manually and re-run the installer."
    )]
    PortInUse { port: u16, holder: String },

    #[error("{target} did not become ready after {attempts} attempts")]
    ReadinessTimeout { target: String, attempts: u32 },

    #[error("No configuration found at {path:?}. Run the installer without --update first.")]
    MissingConfiguration { path: PathBuf },

    #[error("Configuration at {path:?} is missing '{key}'. Re-run with --reinstall to regenerate it.")]
    IncompleteConfiguration { path: PathBuf, key: String },

    #[error("The installer must run as root (try: sudo pdns-stack-installer)")]
    NotRoot,
}
