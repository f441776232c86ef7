// Host installation steps
//
// This module holds every step that touches the host (container runtime, firewall,
// process supervisor, port 53, fetched artifacts) plus the shared runner for
// external commands with timeouts/retries.
//
// IMPORTANT:
// - Never log secrets (passwords, API keys, basic-auth hashes).
// - Every external tool sits behind a trait so the pipeline can run against fakes.

pub mod artifacts;
pub mod docker;
pub mod firewall;
pub mod linux;
pub mod port_guard;
pub mod service;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u128,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs external programs. `SystemCommandRunner` spawns real processes; tests
/// substitute a recorder that returns canned output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Returns captured output even when the exit code is non-zero (caller decides success).
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout_dur: Duration,
        operation: &str,
    ) -> Result<CommandOutput>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout_dur: Duration,
        operation: &str,
    ) -> Result<CommandOutput> {
        run_cmd_with_timeout(program, args, timeout_dur, operation).await
    }
}

/// Turn a list of `&str` into the owned argument vector the runner expects.
pub fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

fn mask_arg_for_log(arg: &str) -> String {
    // Heuristic masking: treat anything that looks like a secret as sensitive.
    let lower = arg.to_ascii_lowercase();
    if lower.contains("password=")
        || lower.contains("pwd=")
        || lower.contains("secret")
        || lower.contains("token")
        || lower.contains("apikey")
        || lower.contains("api_key")
        || lower.contains("api-key")
    {
        return "***".to_string();
    }

    // Registered secrets are replaced wholesale; short flags pass through untouched.
    let redacted = crate::utils::logging::redact_secrets(arg);
    if redacted != arg {
        return redacted;
    }
    arg.to_string()
}

/// Spawn failures worth another attempt (busy binaries, EAGAIN). Timeouts and
/// non-zero exits are never retried: `sh get-docker.sh` and `compose up` must
/// not run twice while a killed attempt may still be tearing down.
fn is_transient_exec_error(e: &anyhow::Error) -> bool {
    let msg = e.to_string().to_ascii_lowercase();
    ["temporarily", "temporary", "resource busy", "text file busy", "i/o", "io error"]
        .iter()
        .any(|needle| msg.contains(needle))
}

/// One spawn of `program`. The child is killed when `timeout_dur` elapses.
async fn exec_once(
    program: &str,
    args: &[String],
    timeout_dur: Duration,
    operation: &str,
) -> Result<CommandOutput> {
    let started = Instant::now();
    debug!(
        "[PHASE: host] [STEP: exec] {} -> {} {} (timeout_ms={})",
        operation,
        program,
        args.iter().map(|a| mask_arg_for_log(a)).collect::<Vec<_>>().join(" "),
        timeout_dur.as_millis()
    );

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn '{}' ({})", program, operation))?;

    // Dropping the pending future on timeout drops the child, which kills it.
    let output = match timeout(timeout_dur, child.wait_with_output()).await {
        Ok(result) => {
            result.with_context(|| format!("Failed to wait for '{}' ({})", program, operation))?
        }
        Err(_) => {
            warn!(
                "[PHASE: host] [STEP: exec] {} exceeded {}ms; killed {}",
                operation,
                timeout_dur.as_millis(),
                program
            );
            anyhow::bail!(
                "'{}' timed out after {}ms ({})",
                program,
                timeout_dur.as_millis(),
                operation
            );
        }
    };

    let out = CommandOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        duration_ms: started.elapsed().as_millis(),
    };
    debug!(
        "[PHASE: host] [STEP: exec] {} finished (exit_code={:?}, duration_ms={}, stdout_len={}, stderr_len={})",
        operation,
        out.exit_code,
        out.duration_ms,
        out.stdout.len(),
        out.stderr.len()
    );
    Ok(out)
}

/// Run a host tool (docker, systemctl, ufw, ss, sh) with a timeout.
///
/// Transient spawn failures are retried up to three times with jittered backoff.
/// A non-zero exit is returned as output, not as an error.
pub async fn run_cmd_with_timeout(
    program: &str,
    args: &[String],
    timeout_dur: Duration,
    operation: &str,
) -> Result<CommandOutput> {
    let strategy = ExponentialBackoff::from_millis(200)
        .factor(2)
        .max_delay(Duration::from_secs(2))
        .map(jitter)
        .take(3);

    let result = RetryIf::start(
        strategy,
        || exec_once(program, args, timeout_dur, operation),
        |e: &anyhow::Error| {
            let retry = is_transient_exec_error(e);
            if retry {
                warn!(
                    "[PHASE: host] [STEP: exec] {} hit a transient failure; retrying: {}",
                    operation, e
                );
            }
            retry
        },
    )
    .await;

    match &result {
        Ok(out) if out.success() => {
            info!("[PHASE: host] [STEP: exec] {} ok ({}ms)", operation, out.duration_ms)
        }
        Ok(out) => info!(
            "[PHASE: host] [STEP: exec] {} exited with {:?} ({}ms)",
            operation, out.exit_code, out.duration_ms
        ),
        Err(e) => error!("[PHASE: host] [STEP: exec] {} failed: {:#}", operation, e),
    }
    result
}
