// Input validation utilities
//
// The wizard validates operator input up front so a typo surfaces as a re-prompt
// instead of a failed readiness probe or a certificate that never issues.

use anyhow::Result;
use regex::Regex;

pub fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| anyhow::anyhow!("Internal error: failed to compile validation regex: {}", e))
}

/// Validate a fully-qualified domain name (RFC 1123 labels, at least two labels).
pub fn validate_domain_name(name: &str) -> Result<()> {
    let s = name.trim().trim_end_matches('.');
    if s.is_empty() {
        return Err(anyhow::anyhow!("Domain name cannot be empty"));
    }
    if s.len() > 253 {
        return Err(anyhow::anyhow!("Domain name cannot exceed 253 characters"));
    }

    let labels: Vec<&str> = s.split('.').collect();
    if labels.len() < 2 {
        return Err(anyhow::anyhow!(
            "Domain name must contain at least two labels (e.g. dns.example.com)"
        ));
    }

    let label_re = compile(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?$")?;
    for label in &labels {
        if !label_re.is_match(label) {
            return Err(anyhow::anyhow!("Domain name contains invalid label: '{}'", label));
        }
    }

    // A purely numeric TLD means someone typed an IP address.
    if labels
        .last()
        .map(|tld| tld.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
    {
        return Err(anyhow::anyhow!("Domain name must not be an IP address"));
    }

    Ok(())
}

/// Validate a contact email (conservative `local@domain` check).
pub fn validate_email(email: &str) -> Result<()> {
    let s = email.trim();
    let Some((local, domain)) = s.rsplit_once('@') else {
        return Err(anyhow::anyhow!("Email address must contain '@'"));
    };
    let local_re = compile(r"^[A-Za-z0-9.!#%&'*+/=?^_`{|}~-]+$")?;
    if local.is_empty() || local.len() > 64 || !local_re.is_match(local) {
        return Err(anyhow::anyhow!("Email address has an invalid local part"));
    }
    validate_domain_name(domain)
        .map_err(|e| anyhow::anyhow!("Email address has an invalid domain: {}", e))
}

/// Validate a value that will be stored in the configuration record.
///
/// The record is line-oriented, so line breaks and NUL bytes cannot be represented.
pub fn validate_record_value(value: &str) -> Result<()> {
    if value.contains('\n') || value.contains('\r') {
        return Err(anyhow::anyhow!("Value cannot contain line breaks"));
    }
    if value.contains('\0') {
        return Err(anyhow::anyhow!("Value cannot contain null bytes"));
    }
    Ok(())
}

/// Shortest secret the wizard accepts when typed by the operator. Never below
/// the log redaction threshold, so every accepted secret is also redacted.
pub const MIN_SECRET_LEN: usize = 8;

/// Validate an operator-typed secret.
///
/// compose interpolates `$` inside `.env` values, so a password containing one
/// would reach the containers altered while the record keeps the original.
pub fn validate_secret(value: &str) -> Result<()> {
    if value.chars().count() < MIN_SECRET_LEN {
        return Err(anyhow::anyhow!(
            "Secret must be at least {} characters (leave blank to generate one)",
            MIN_SECRET_LEN
        ));
    }
    if value.contains('$') {
        return Err(anyhow::anyhow!("Secret cannot contain '$'"));
    }
    validate_record_value(value)
}

/// Validate a dashboard user name (used verbatim in basic-auth entries).
pub fn validate_username(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(anyhow::anyhow!("User name cannot be empty"));
    }
    if name.contains(':') || name.chars().any(|c| c.is_whitespace()) {
        return Err(anyhow::anyhow!(
            "User name cannot contain ':' or whitespace"
        ));
    }
    validate_record_value(name)
}
