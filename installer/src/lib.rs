// pdns-stack-installer
// Library entry point: logging setup and wiring of the real host capabilities.

pub mod cli;
pub mod error;
pub mod installation;
pub mod models;
pub mod provision;
pub mod readiness;
pub mod security;
pub mod settings;
pub mod summary;
pub mod utils;
pub mod wizard;
pub mod workspace;

use anyhow::{Context, Result};
use log::{error, info};
use std::path::{Path, PathBuf};

use cli::InstallArgs;
use installation::artifacts::HttpArtifactSource;
use installation::docker::DockerCli;
use installation::firewall::Ufw;
use installation::linux::{log_host_facts, require_root, DiskHostFiles};
use installation::port_guard::SsPortInspector;
use installation::service::Systemd;
use installation::SystemCommandRunner;
use provision::{Capabilities, Provisioner};
use readiness::ReqwestProber;
use settings::InstallerSettings;
use wizard::StdinPrompter;

/// Initialize logging: human-readable to stdout and a `.txt` file, JSON lines to a
/// `.log` file. Registered secrets are redacted in every sink.
pub fn init_logging(log_dir: &Path, run_id: &str) -> Result<(PathBuf, PathBuf)> {
    let timestamp = chrono::Utc::now().format("%Y-%m-%d-%H%M%S");
    let json_log_file = log_dir.join(format!("installer-{}.log", timestamp));
    let txt_log_file = log_dir.join(format!("installer-{}.txt", timestamp));

    let run_id = run_id.to_string();
    fern::Dispatch::new()
        .level(log::LevelFilter::Debug)
        .level_for("reqwest", log::LevelFilter::Info)
        .level_for("hyper_util", log::LevelFilter::Info)
        .chain(
            fern::Dispatch::new()
                .level(log::LevelFilter::Info)
                .format(|out, message, record| {
                    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let message_str = utils::logging::redact_secrets(&message.to_string());
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let txt_line = utils::logging::format_human_readable_log(
                        &timestamp_local.to_string(),
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}", txt_line));
                })
                .chain(std::io::stdout()),
        )
        .chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    let timestamp_utc = chrono::Utc::now().to_rfc3339();
                    let message_str = utils::logging::redact_secrets(&message.to_string());
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let json_line = utils::logging::format_json_log(
                        &timestamp_utc,
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                        Some(&run_id),
                    );
                    out.finish(format_args!("{}", json_line));
                })
                .chain(fern::log_file(&json_log_file)?),
        )
        .chain(
            fern::Dispatch::new()
                .format(|out, message, record| {
                    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let message_str = utils::logging::redact_secrets(&message.to_string());
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let txt_line = utils::logging::format_human_readable_log(
                        &timestamp_local.to_string(),
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}", txt_line));
                })
                .chain(fern::log_file(&txt_log_file)?),
        )
        .apply()
        .context("Failed to install the logger")?;

    Ok((json_log_file, txt_log_file))
}

/// Full installer run against the real host.
pub async fn run(args: InstallArgs) -> Result<()> {
    let settings = InstallerSettings::load()?;

    let run_id = uuid::Uuid::new_v4().to_string();
    let log_dir = utils::path_resolver::resolve_log_folder(&settings.install.log_dir)?;
    match init_logging(&log_dir, &run_id) {
        Ok((json, txt)) => info!(
            "[PHASE: initialization] Logging initialized (run_id={}, json={:?}, txt={:?})",
            run_id, json, txt
        ),
        Err(e) => eprintln!("Failed to initialize logging: {:#}", e),
    }
    info!(
        "[PHASE: initialization] pdns-stack-installer {} starting at {} (reinstall={}, update={})",
        env!("CARGO_PKG_VERSION"),
        chrono::Utc::now(),
        args.reinstall,
        args.update_only
    );

    if let Err(e) = require_root() {
        error!("[PHASE: preflight] [STEP: privileges] {}", e);
        return Err(e.into());
    }
    log_host_facts().await;

    let source = HttpArtifactSource::new()?;
    let runtime = DockerCli::new(SystemCommandRunner, source.clone());
    let firewall = Ufw::new(SystemCommandRunner);
    let services = Systemd::new(SystemCommandRunner);
    let ports = SsPortInspector::new(SystemCommandRunner);
    let prober = ReqwestProber::new()?;
    let prompter = StdinPrompter;
    let host_files = DiskHostFiles;

    let caps = Capabilities {
        runtime: &runtime,
        firewall: &firewall,
        services: &services,
        ports: &ports,
        artifacts: &source,
        prober: &prober,
        prompter: &prompter,
        host_files: &host_files,
    };

    match Provisioner::new(&settings, caps).run(args).await {
        Ok(report) => {
            summary::print_summary(
                report.mode,
                &report.config,
                &settings,
                report.warnings.as_slice(),
            );
            Ok(())
        }
        Err(e) => {
            error!("[PHASE: provision] [STEP: failed] {:#}", e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The global logger can be installed once per process; this is the only test that does.
    #[test]
    fn log_files_never_contain_registered_secrets() {
        let tmp = tempfile::tempdir().unwrap();
        let (json_log, txt_log) = init_logging(tmp.path(), "run-redaction").unwrap();

        utils::logging::register_secret("Vx9-log-secret-Qm2");
        log::info!("[PHASE: configuration] [STEP: save] db password is Vx9-log-secret-Qm2");
        log::warn!("api key Vx9-log-secret-Qm2 rejected");
        log::logger().flush();

        let json = std::fs::read_to_string(&json_log).unwrap();
        let txt = std::fs::read_to_string(&txt_log).unwrap();
        for text in [&json, &txt] {
            assert!(!text.contains("Vx9-log-secret-Qm2"), "{}", text);
            assert!(text.contains("db password is ***"), "{}", text);
            assert!(text.contains("api key *** rejected"), "{}", text);
        }

        let entry: serde_json::Value = json
            .lines()
            .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
            .find(|v| v["message"] == "db password is ***")
            .unwrap();
        assert_eq!(entry["phase"], "configuration");
        assert_eq!(entry["step"], "save");
        assert_eq!(entry["run_id"], "run-redaction");
    }
}
