// Final summary
//
// Printed to stdout only, never through the logger, so it does not end up in
// the log files. Secrets are masked unless `summary.reveal_secrets` is set; the
// full values live in the configuration record.

use crate::models::stack_config::StackConfig;
use crate::provision::ProvisionMode;
use crate::settings::InstallerSettings;
use crate::utils::logging::mask_sensitive;

const RULE: &str = "==============================================================";

pub fn render_summary(
    mode: ProvisionMode,
    config: &StackConfig,
    settings: &InstallerSettings,
    warnings: &[String],
) -> String {
    let secret = |value: &str| -> String {
        if settings.summary.reveal_secrets {
            value.to_string()
        } else {
            mask_sensitive(value)
        }
    };

    let mut rows: Vec<(&str, String)> = vec![
        (
            "PowerDNS API",
            format!("http://{}:{}", config.domain, settings.readiness.api_port),
        ),
        (
            "Backend UI",
            format!("http://{}:{}", config.domain, settings.readiness.backend_port),
        ),
    ];
    if let Some(edge) = &config.edge {
        rows.push(("HTTPS site", format!("https://{}", config.domain)));
        rows.push(("Traefik dashboard", format!("https://{}", edge.dashboard_domain)));
    }
    rows.push(("Dashboard user", config.dashboard_user.clone()));
    rows.push(("Dashboard password", secret(&config.dashboard_password)));
    rows.push(("PowerDNS API key", secret(&config.api_key)));
    rows.push(("MySQL root password", secret(&config.db_root_password)));
    rows.push(("PowerDNS DB password", secret(&config.db_password)));
    rows.push((
        "Configuration",
        format!("{} (mode 0600)", settings.env_file_path().display()),
    ));
    rows.push(("Service", format!("{}.service", settings.install.service_name)));

    let width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    let headline = match mode {
        ProvisionMode::Install => "PowerDNS stack installed",
        ProvisionMode::Update => "PowerDNS stack updated",
    };

    let mut out = String::new();
    out.push_str(RULE);
    out.push('\n');
    out.push_str(&format!(" {}\n", headline));
    out.push_str(RULE);
    out.push('\n');
    for (key, value) in rows {
        out.push_str(&format!(" {:<width$}  {}\n", format!("{}:", key), value, width = width + 1));
    }
    if !settings.summary.reveal_secrets {
        out.push_str(&format!(
            "\n Full credentials are stored in {}\n",
            settings.env_file_path().display()
        ));
    }
    if !warnings.is_empty() {
        out.push_str(&format!("\n Warnings ({}):\n", warnings.len()));
        for w in warnings {
            out.push_str(&format!("  - {}\n", w));
        }
    }
    out.push_str(RULE);
    out.push('\n');
    out
}

pub fn print_summary(
    mode: ProvisionMode,
    config: &StackConfig,
    settings: &InstallerSettings,
    warnings: &[String],
) {
    print!("{}", render_summary(mode, config, settings, warnings));
}
