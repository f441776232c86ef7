//! Remote artifact fetch (orchestration descriptor + database schema).
//!
//! Goals:
//! - Fetch over HTTPS with a bounded timeout and a few transient retries
//! - Write into the installation directory under canonical local names
//! - Log the SHA-256 of every artifact written so two installs can be compared
//!
//! Nothing is verified against a pinned digest; the remote is trusted at install time.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use url::Url;

use crate::security::crypto::sha256_hex;
use crate::settings::{ArtifactSettings, EdgeProxy, FetchPolicy};
use crate::workspace::Workspace;

const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>>;
}

/// Plain HTTPS GET via reqwest; non-2xx is an error.
#[derive(Debug, Clone)]
pub struct HttpArtifactSource {
    client: reqwest::Client,
}

impl HttpArtifactSource {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(concat!("pdns-stack-installer/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    async fn fetch_once(&self, url: &Url) -> Result<Vec<u8>> {
        let resp = self.client.get(url.clone()).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("HTTP {} for {}", resp.status(), url);
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

#[async_trait]
impl ArtifactSource for HttpArtifactSource {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>> {
        let started = Instant::now();
        debug!(
            "[PHASE: artifacts] [STEP: fetch] fetch entered (url={})",
            url
        );

        let strategy = ExponentialBackoff::from_millis(500)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(2);
        let bytes = Retry::start(strategy, || self.fetch_once(url))
            .await
            .with_context(|| format!("Failed to download {}", url))?;

        debug!(
            "[PHASE: artifacts] [STEP: fetch] fetch exit ok (url={}, bytes={}, duration_ms={})",
            url,
            bytes.len(),
            started.elapsed().as_millis()
        );
        Ok(bytes)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ArtifactReport {
    pub fetched: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

/// Join a remote file name onto the base URL (a missing trailing `/` is tolerated).
pub fn artifact_url(base_url: &str, remote_name: &str) -> Result<Url> {
    let base = if base_url.ends_with('/') {
        Url::parse(base_url)
    } else {
        Url::parse(&format!("{}/", base_url))
    }
    .with_context(|| format!("Invalid artifact base URL: {}", base_url))?;
    base.join(remote_name)
        .with_context(|| format!("Invalid artifact name: {}", remote_name))
}

/// Download the descriptor and schema into the workspace.
///
/// `force` overrides `FetchPolicy::IfAbsent` (reinstall and update always fetch).
pub async fn fetch_artifacts(
    source: &dyn ArtifactSource,
    settings: &ArtifactSettings,
    proxy: EdgeProxy,
    workspace: &Workspace,
    force: bool,
) -> Result<ArtifactReport> {
    let started = Instant::now();
    let always = force || settings.policy == FetchPolicy::Always;
    info!(
        "[PHASE: artifacts] [STEP: start] fetch_artifacts entered (base_url={}, policy={:?}, force={})",
        settings.base_url, settings.policy, force
    );

    let plan = [
        (
            settings.compose_remote_for(proxy),
            workspace.join(&settings.compose_local),
        ),
        (
            settings.schema_remote.clone(),
            workspace.join(&settings.schema_local),
        ),
    ];

    let mut report = ArtifactReport::default();
    for (remote, local) in plan {
        remove_stray_directory(&local).await?;

        if !always && tokio::fs::metadata(&local).await.is_ok() {
            info!(
                "[PHASE: artifacts] [STEP: skip] Keeping existing {:?}",
                local
            );
            report.skipped.push(local);
            continue;
        }

        let url = artifact_url(&settings.base_url, &remote)?;
        let bytes = source.fetch(&url).await?;
        tokio::fs::write(&local, &bytes)
            .await
            .with_context(|| format!("Failed to write artifact {:?}", local))?;
        info!(
            "[PHASE: artifacts] [STEP: write] Wrote {:?} (url={}, bytes={}, sha256={})",
            local,
            url,
            bytes.len(),
            sha256_hex(&bytes)
        );
        report.fetched.push(local);
    }

    info!(
        "[PHASE: artifacts] [STEP: done] fetch_artifacts exit ok (fetched={}, skipped={}, duration_ms={})",
        report.fetched.len(),
        report.skipped.len(),
        started.elapsed().as_millis()
    );
    Ok(report)
}

/// A directory where a file should be is left over from a bad bind mount; remove it.
async fn remove_stray_directory(path: &Path) -> Result<()> {
    if let Ok(meta) = tokio::fs::metadata(path).await {
        if meta.is_dir() {
            warn!(
                "[PHASE: artifacts] [STEP: cleanup] Removing directory found at artifact path {:?}",
                path
            );
            tokio::fs::remove_dir_all(path)
                .await
                .with_context(|| format!("Failed to remove directory {:?}", path))?;
        }
    }
    Ok(())
}
