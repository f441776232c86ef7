// Configuration wizard
//
// Two states: fresh (no record, or --reinstall) prompts and persists; existing
// loads the record and never prompts. Either way every secret is registered for
// log redaction before any later step runs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use std::io::{BufRead, IsTerminal, Write};
use std::path::Path;

use crate::error::InstallerError;
use crate::models::env_file::EnvRecord;
use crate::models::stack_config::{EdgeConfig, StackConfig, DEFAULT_DASHBOARD_USER};
use crate::security::crypto::{
    basic_auth_entry, generate_secret, DASHBOARD_PASSWORD_BYTES, SECRET_BYTES,
};
use crate::settings::EdgeProxy;
use crate::utils::logging::register_secret;
use crate::utils::validation::{
    validate_domain_name, validate_email, validate_record_value, validate_secret,
    validate_username,
};

/// Invalid answers re-prompt at most this many times before the run aborts.
const MAX_ATTEMPTS: u32 = 5;

#[async_trait]
pub trait Prompter: Send + Sync {
    /// Ask one question; `hidden` suppresses echo where the terminal allows it.
    async fn ask(&self, question: &str, hidden: bool) -> Result<String>;
    /// Show a message to the operator (validation feedback).
    fn notify(&self, message: &str);
}

/// Reads answers from the controlling terminal (or plain stdin when piped).
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinPrompter;

#[async_trait]
impl Prompter for StdinPrompter {
    async fn ask(&self, question: &str, hidden: bool) -> Result<String> {
        let question = question.to_string();
        tokio::task::spawn_blocking(move || -> Result<String> {
            print!("{}: ", question);
            std::io::stdout().flush()?;
            if hidden && std::io::stdin().is_terminal() {
                read_hidden_line()
            } else {
                read_plain_line()
            }
        })
        .await
        .context("Prompt task failed")?
    }

    fn notify(&self, message: &str) {
        println!("  {}", message);
    }
}

fn read_plain_line() -> Result<String> {
    let mut line = String::new();
    let n = std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read from stdin")?;
    if n == 0 {
        anyhow::bail!("stdin closed while waiting for input");
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn read_hidden_line() -> Result<String> {
    use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
    use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

    enable_raw_mode().context("Failed to switch terminal to raw mode")?;
    let result = (|| -> Result<String> {
        let mut line = String::new();
        loop {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                match key.code {
                    KeyCode::Enter => return Ok(line),
                    KeyCode::Backspace => {
                        line.pop();
                    }
                    KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                        anyhow::bail!("Input cancelled");
                    }
                    KeyCode::Char(c) => line.push(c),
                    _ => {}
                }
            }
        }
    })();
    let _ = disable_raw_mode();
    println!();
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WizardState {
    /// Values were collected and a new record was written.
    Fresh,
    /// The existing record was loaded; nothing was prompted.
    Existing,
}

/// Load the record at `env_path`, or run the wizard and write it.
pub async fn load_or_collect(
    prompter: &dyn Prompter,
    env_path: &Path,
    proxy: EdgeProxy,
    reinstall: bool,
) -> Result<(StackConfig, WizardState)> {
    let exists = tokio::fs::metadata(env_path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);

    let (config, state) = if exists && !reinstall {
        info!(
            "[PHASE: configuration] [STEP: load] Existing configuration found at {:?}; skipping prompts",
            env_path
        );
        (load_existing(env_path, proxy).await?, WizardState::Existing)
    } else {
        info!("[PHASE: configuration] [STEP: wizard] Collecting configuration");
        let config = run_wizard(prompter, proxy).await?;
        config.record().save(env_path).await?;
        (config, WizardState::Fresh)
    };

    for secret in config.secrets() {
        register_secret(secret);
    }
    info!(
        "[PHASE: configuration] [STEP: done] Configuration ready (state={:?}, domain={}, edge_proxy={:?})",
        state, config.domain, proxy
    );
    Ok((config, state))
}

/// Load and validate an existing record; a missing file is `MissingConfiguration`.
pub async fn load_existing(env_path: &Path, proxy: EdgeProxy) -> Result<StackConfig> {
    if tokio::fs::metadata(env_path).await.is_err() {
        return Err(InstallerError::MissingConfiguration {
            path: env_path.to_path_buf(),
        }
        .into());
    }
    let record = EnvRecord::load(env_path).await?;
    let config = StackConfig::from_record(record, proxy, env_path)?;
    for secret in config.secrets() {
        register_secret(secret);
    }
    Ok(config)
}

/// Prompt for every value, generating secrets the operator leaves blank.
pub async fn run_wizard(prompter: &dyn Prompter, proxy: EdgeProxy) -> Result<StackConfig> {
    let domain = ask_validated(
        prompter,
        "Domain name for the stack (e.g. dns.example.com)",
        None,
        validate_domain_name,
    )
    .await?
    .trim_end_matches('.')
    .to_string();
    let email = ask_validated(
        prompter,
        "Contact email (used for certificate registration)",
        None,
        validate_email,
    )
    .await?;

    let dashboard_domain = match proxy {
        EdgeProxy::None => None,
        EdgeProxy::Traefik => {
            let default = format!("traefik.{}", domain);
            let question = format!("Traefik dashboard domain [{}]", default);
            Some(
                ask_validated(prompter, &question, Some(&default), validate_domain_name)
                    .await?
                    .trim_end_matches('.')
                    .to_string(),
            )
        }
    };

    let api_key = ask_secret(prompter, "PowerDNS API key", SECRET_BYTES).await?;
    let db_root_password = ask_secret(prompter, "MySQL root password", SECRET_BYTES).await?;
    let db_password = ask_secret(prompter, "PowerDNS database password", SECRET_BYTES).await?;
    let dashboard_user = ask_validated(
        prompter,
        &format!("Dashboard user name [{}]", DEFAULT_DASHBOARD_USER),
        Some(DEFAULT_DASHBOARD_USER),
        validate_username,
    )
    .await?;
    let dashboard_password =
        ask_secret(prompter, "Dashboard password", DASHBOARD_PASSWORD_BYTES).await?;

    let edge = match dashboard_domain {
        Some(dashboard_domain) => Some(EdgeConfig {
            dashboard_domain,
            basic_auth: basic_auth_entry(&dashboard_user, &dashboard_password)?,
        }),
        None => None,
    };

    Ok(StackConfig::new(
        domain,
        email,
        api_key,
        db_root_password,
        db_password,
        dashboard_user,
        dashboard_password,
        edge,
    ))
}

async fn ask_validated(
    prompter: &dyn Prompter,
    question: &str,
    default: Option<&str>,
    validate: fn(&str) -> Result<()>,
) -> Result<String> {
    for _ in 0..MAX_ATTEMPTS {
        let answer = prompter.ask(question, false).await?;
        let answer = answer.trim();
        let value = match (answer.is_empty(), default) {
            (true, Some(d)) => d,
            _ => answer,
        };
        match validate(value).and_then(|_| validate_record_value(value)) {
            Ok(()) => return Ok(value.to_string()),
            Err(e) => prompter.notify(&format!("{} Please try again.", e)),
        }
    }
    anyhow::bail!("No valid answer for '{}' after {} attempts", question, MAX_ATTEMPTS)
}

/// Blank answer generates `bytes` of randomness; anything else is taken as typed.
async fn ask_secret(prompter: &dyn Prompter, label: &str, bytes: usize) -> Result<String> {
    let question = format!("{} (leave blank to generate)", label);
    for _ in 0..MAX_ATTEMPTS {
        let answer = prompter.ask(&question, true).await?;
        if answer.is_empty() {
            info!(
                "[PHASE: configuration] [STEP: secret] Generated {} ({} random bytes)",
                label, bytes
            );
            return generate_secret(bytes);
        }
        match validate_secret(&answer) {
            Ok(()) => return Ok(answer),
            Err(e) => prompter.notify(&format!("{} Please try again.", e)),
        }
    }
    anyhow::bail!("No valid answer for '{}' after {} attempts", label, MAX_ATTEMPTS)
}
