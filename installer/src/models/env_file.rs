// Configuration record codec
//
// The record is a flat `KEY=VALUE` text file that compose also reads as its
// `.env`. Entries keep file order so a loaded record renders back unchanged.

use anyhow::{Context, Result};
use log::{debug, info};
use std::path::Path;

const HEADER: &str = "# Generated by pdns-stack-installer. Re-run with --reinstall to regenerate.";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvRecord {
    entries: Vec<(String, String)>,
}

impl EnvRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `key`, keeping the original position when replacing.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse record text. Accepts `KEY=VALUE`, `KEY="VALUE"`, `KEY='VALUE'` and an
    /// optional `export ` prefix; blank lines and `#` comments are skipped.
    pub fn parse(contents: &str) -> Self {
        let mut record = Self::new();

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                if key.is_empty() {
                    continue;
                }
                record.set(key, unquote(value.trim()));
            }
        }

        record
    }

    /// Render the record as file text: header comment, then one `KEY=VALUE` per
    /// line. Values outside the plain character set are double-quoted.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(64 + self.entries.len() * 48);
        out.push_str(HEADER);
        out.push('\n');
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push('=');
            if is_plain(value) {
                out.push_str(value);
            } else {
                out.push('"');
                out.push_str(&escape_double_quoted(value));
                out.push('"');
            }
            out.push('\n');
        }
        out
    }

    /// Read and parse the record at `path`.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read configuration record: {:?}", path))?;
        let record = Self::parse(&contents);
        debug!(
            "[PHASE: configuration] [STEP: load] Parsed configuration record (path={:?}, keys={})",
            path,
            record.len()
        );
        Ok(record)
    }

    /// Write the record to `path` with owner-only permissions.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let rendered = self.render();
        write_private_file(path, rendered.as_bytes())
            .await
            .with_context(|| format!("Failed to write configuration record: {:?}", path))?;
        info!(
            "[PHASE: configuration] [STEP: save] Wrote configuration record (path={:?}, keys={}, mode=0600)",
            path,
            self.len()
        );
        Ok(())
    }
}

fn unquote(value: &str) -> String {
    if let Some(inner) = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        return unescape_double_quoted(inner);
    }
    if let Some(inner) = value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')) {
        return inner.to_string();
    }
    value.to_string()
}

fn is_plain(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_.:@/+=,-".contains(c))
}

fn escape_double_quoted(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn unescape_double_quoted(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next @ ('\\' | '"')) => out.push(next),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

async fn write_private_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut opts = tokio::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    opts.mode(0o600);

    let mut file = opts.open(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;

    // `mode` only applies on create; tighten a pre-existing file too.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_all_quoting_styles() {
        let contents = r#"
# comment
DOMAIN=dns.example.com
EMAIL="ops@example.com"
export PDNS_API_KEY='abc+/='

BROKEN_LINE
"#;
        let r = EnvRecord::parse(contents);
        assert_eq!(r.get("DOMAIN"), Some("dns.example.com"));
        assert_eq!(r.get("EMAIL"), Some("ops@example.com"));
        assert_eq!(r.get("PDNS_API_KEY"), Some("abc+/="));
        assert_eq!(r.len(), 3);
    }

    #[test]
    fn value_may_contain_equals_sign() {
        let r = EnvRecord::parse("KEY=\"a=b==\"\n");
        assert_eq!(r.get("KEY"), Some("a=b=="));
    }

    #[test]
    fn render_escapes_quotes_and_backslashes() {
        let mut r = EnvRecord::new();
        r.set("PASSWORD", r#"p"a\ss"#);
        let text = r.render();
        assert!(text.contains(r#"PASSWORD="p\"a\\ss""#), "{}", text);
        let back = EnvRecord::parse(&text);
        assert_eq!(back.get("PASSWORD"), Some(r#"p"a\ss"#));
    }

    #[test]
    fn dollar_signs_survive_unchanged() {
        let mut r = EnvRecord::new();
        r.set("TRAEFIK_BASIC_AUTH", "admin:$$2y$$10$$xyz");
        let back = EnvRecord::parse(&r.render());
        assert_eq!(back.get("TRAEFIK_BASIC_AUTH"), Some("admin:$$2y$$10$$xyz"));
    }

    #[test]
    fn plain_values_are_written_bare() {
        let mut r = EnvRecord::new();
        r.set("DOMAIN", "dns.example.com");
        r.set("PDNS_API_KEY", "ab+/cd==");
        r.set("EMPTY", "");
        r.set("SPACED", "a b");
        let text = r.render();
        assert!(text.contains("\nDOMAIN=dns.example.com\n"), "{}", text);
        assert!(text.contains("\nPDNS_API_KEY=ab+/cd==\n"), "{}", text);
        assert!(text.contains("\nEMPTY=\"\"\n"), "{}", text);
        assert!(text.contains("\nSPACED=\"a b\"\n"), "{}", text);
        assert_eq!(EnvRecord::parse(&text), r);
    }

    #[test]
    fn set_replaces_in_place() {
        let mut r = EnvRecord::new();
        r.set("A", "1");
        r.set("B", "2");
        r.set("A", "3");
        let keys: Vec<&str> = r.entries().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["A", "B"]);
        assert_eq!(r.get("A"), Some("3"));
    }

    #[test]
    fn render_of_parsed_render_is_stable() {
        let mut r = EnvRecord::new();
        r.set("DOMAIN", "dns.example.com");
        r.set("SECRET", "x\"y");
        let once = r.render();
        let twice = EnvRecord::parse(&once).render();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn save_uses_owner_only_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        let mut r = EnvRecord::new();
        r.set("DOMAIN", "dns.example.com");
        r.save(&path).await.unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let loaded = EnvRecord::load(&path).await.unwrap();
        assert_eq!(loaded, r);
    }
}
