// Logging utilities
// Structured logging with JSON and human-readable formats, plus secret redaction.

use log::Level;
use serde_json::json;
use std::sync::{OnceLock, RwLock};

/// Secrets shorter than this are not registered: redacting two-letter values would
/// shred ordinary log text.
const MIN_REDACTABLE_LEN: usize = 6;

fn registry() -> &'static RwLock<Vec<String>> {
    static SECRETS: OnceLock<RwLock<Vec<String>>> = OnceLock::new();
    SECRETS.get_or_init(|| RwLock::new(Vec::new()))
}

/// Register a secret value so every log sink replaces it with `***`.
pub fn register_secret(value: &str) {
    let value = value.trim();
    if value.len() < MIN_REDACTABLE_LEN {
        return;
    }
    if let Ok(mut secrets) = registry().write() {
        if !secrets.iter().any(|s| s == value) {
            secrets.push(value.to_string());
            // Longest first so a secret containing another is replaced whole.
            secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        }
    }
}

/// Replace every registered secret in `input` with `***`.
pub fn redact_secrets(input: &str) -> String {
    let Ok(secrets) = registry().read() else {
        return input.to_string();
    };
    let mut out = input.to_string();
    for secret in secrets.iter() {
        if out.contains(secret.as_str()) {
            out = out.replace(secret.as_str(), "***");
        }
    }
    out
}

/// Mask sensitive data for display (first/last four characters kept).
pub fn mask_sensitive(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }

    let visible = 4;
    let start: String = chars[..visible].iter().collect();
    let end: String = chars[chars.len() - visible..].iter().collect();

    format!("{}...{}", start, end)
}

/// Parse phase and step from log message
/// Extracts [PHASE: ...] and [STEP: ...] patterns
pub fn parse_log_metadata(message: &str) -> (Option<String>, Option<String>, String) {
    let mut phase = None;
    let mut step = None;
    let mut cleaned_message = message.to_string();

    if let Some(start) = message.find("[PHASE:") {
        if let Some(end) = message[start..].find(']') {
            let phase_str = message[start + 7..start + end].trim();
            phase = Some(phase_str.to_string());
            cleaned_message = format!("{} {}", &message[..start], &message[start + end + 1..])
                .trim()
                .to_string();
        }
    }

    if let Some(start) = cleaned_message.find("[STEP:") {
        if let Some(end) = cleaned_message[start..].find(']') {
            let step_str = cleaned_message[start + 6..start + end].trim();
            step = Some(step_str.to_string());
            cleaned_message = format!(
                "{} {}",
                &cleaned_message[..start],
                &cleaned_message[start + end + 1..]
            )
            .trim()
            .to_string();
        }
    }

    (phase, step, cleaned_message)
}

/// Format log entry as JSON for structured logging
pub fn format_json_log(
    timestamp: &str,
    level: Level,
    target: &str,
    message: &str,
    phase: Option<&str>,
    step: Option<&str>,
    run_id: Option<&str>,
) -> String {
    let mut log_entry = json!({
        "timestamp": timestamp,
        "level": level.as_str(),
        "target": target,
        "message": message,
    });

    if let Some(phase) = phase {
        log_entry["phase"] = json!(phase);
    }

    if let Some(step) = step {
        log_entry["step"] = json!(step);
    }

    if let Some(run_id) = run_id {
        log_entry["run_id"] = json!(run_id);
    }

    serde_json::to_string(&log_entry).unwrap_or_else(|_| "{}".to_string())
}

/// Format log entry as human-readable text
pub fn format_human_readable_log(
    timestamp: &str,
    level: Level,
    target: &str,
    message: &str,
    phase: Option<&str>,
    step: Option<&str>,
) -> String {
    let mut log_line = format!("[{}] [{}]", timestamp, level.as_str());

    if let Some(phase) = phase {
        log_line.push_str(&format!(" [PHASE: {}]", phase));
    }

    if let Some(step) = step {
        log_line.push_str(&format!(" [STEP: {}]", step));
    }

    log_line.push_str(&format!(" [{}] {}", target, message));
    log_line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_secret_is_redacted_everywhere() {
        register_secret("c2VjcmV0LXZhbHVlLWZvci10ZXN0");
        let line = "wrote MYSQL_ROOT_PASSWORD=c2VjcmV0LXZhbHVlLWZvci10ZXN0 and again c2VjcmV0LXZhbHVlLWZvci10ZXN0";
        let redacted = redact_secrets(line);
        assert!(!redacted.contains("c2VjcmV0LXZhbHVlLWZvci10ZXN0"), "{}", redacted);
        assert_eq!(redacted.matches("***").count(), 2);
    }

    #[test]
    fn short_values_are_not_registered() {
        register_secret("abc");
        assert_eq!(redact_secrets("abc def"), "abc def");
    }

    #[test]
    fn longer_secret_wins_over_contained_secret() {
        register_secret("inner-secret-1");
        register_secret("outer-inner-secret-1-tail");
        let redacted = redact_secrets("value=outer-inner-secret-1-tail");
        assert_eq!(redacted, "value=***");
    }

    #[test]
    fn mask_sensitive_short_values_fully_masked() {
        assert_eq!(mask_sensitive("abc"), "***");
        assert_eq!(mask_sensitive("12345678"), "***");
    }

    #[test]
    fn mask_sensitive_long_values_partially_masked() {
        let masked = mask_sensitive("abcdefghijklmnop");
        assert_eq!(masked, "abcd...mnop");
    }

    #[test]
    fn mask_sensitive_handles_multibyte_input() {
        let masked = mask_sensitive("ééééééééééxyz");
        assert!(masked.ends_with("éxyz"), "{}", masked);
    }

    #[test]
    fn parse_log_metadata_extracts_phase_and_step() {
        let (phase, step, msg) =
            parse_log_metadata("[PHASE: readiness] [STEP: poll] PowerDNS API reachable");
        assert_eq!(phase.as_deref(), Some("readiness"));
        assert_eq!(step.as_deref(), Some("poll"));
        assert_eq!(msg, "PowerDNS API reachable");
    }

    #[test]
    fn parse_log_metadata_without_tags_is_untouched() {
        let (phase, step, msg) = parse_log_metadata("plain message");
        assert!(phase.is_none());
        assert!(step.is_none());
        assert_eq!(msg, "plain message");
    }

    #[test]
    fn format_json_log_includes_optional_fields() {
        let line = format_json_log(
            "2026-01-01T00:00:00Z",
            Level::Info,
            "pdns_stack_installer",
            "hello",
            Some("wizard"),
            None,
            Some("run-1"),
        );
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["phase"], "wizard");
        assert_eq!(v["run_id"], "run-1");
        assert!(v.get("step").is_none());
    }

    #[test]
    fn format_human_readable_log_layout() {
        let line = format_human_readable_log(
            "2026-01-01 00:00:00.000",
            Level::Warn,
            "t",
            "msg",
            Some("firewall"),
            Some("allow"),
        );
        assert_eq!(
            line,
            "[2026-01-01 00:00:00.000] [WARN] [PHASE: firewall] [STEP: allow] [t] msg"
        );
    }
}
