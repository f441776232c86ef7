// Typed view of the configuration record
//
// Loaded once per run (from the wizard or the existing record) and passed by
// reference to every later step.

use crate::error::InstallerError;
use crate::models::env_file::EnvRecord;
use crate::settings::EdgeProxy;
use std::path::Path;

pub const KEY_DOMAIN: &str = "DOMAIN";
pub const KEY_EMAIL: &str = "EMAIL";
pub const KEY_API_KEY: &str = "PDNS_API_KEY";
pub const KEY_DB_ROOT_PASSWORD: &str = "MYSQL_ROOT_PASSWORD";
pub const KEY_DB_PASSWORD: &str = "PDNS_DB_PASSWORD";
pub const KEY_DASHBOARD_USER: &str = "DASHBOARD_USER";
pub const KEY_DASHBOARD_PASSWORD: &str = "DASHBOARD_PASSWORD";
pub const KEY_TRAEFIK_DOMAIN: &str = "TRAEFIK_DOMAIN";
pub const KEY_TRAEFIK_BASIC_AUTH: &str = "TRAEFIK_BASIC_AUTH";

pub const DEFAULT_DASHBOARD_USER: &str = "admin";

/// Traefik-only fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeConfig {
    pub dashboard_domain: String,
    /// `user:hash` with `$` doubled, ready for compose labels.
    pub basic_auth: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackConfig {
    pub domain: String,
    pub email: String,
    pub api_key: String,
    pub db_root_password: String,
    pub db_password: String,
    pub dashboard_user: String,
    pub dashboard_password: String,
    pub edge: Option<EdgeConfig>,
    /// The record this config was built from or will be written as. Keys the
    /// installer does not know about are carried along untouched.
    record: EnvRecord,
}

impl StackConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        domain: String,
        email: String,
        api_key: String,
        db_root_password: String,
        db_password: String,
        dashboard_user: String,
        dashboard_password: String,
        edge: Option<EdgeConfig>,
    ) -> Self {
        let mut cfg = Self {
            domain,
            email,
            api_key,
            db_root_password,
            db_password,
            dashboard_user,
            dashboard_password,
            edge,
            record: EnvRecord::new(),
        };
        cfg.record = cfg.build_record();
        cfg
    }

    fn build_record(&self) -> EnvRecord {
        let mut r = EnvRecord::new();
        r.set(KEY_DOMAIN, &self.domain);
        r.set(KEY_EMAIL, &self.email);
        r.set(KEY_API_KEY, &self.api_key);
        r.set(KEY_DB_ROOT_PASSWORD, &self.db_root_password);
        r.set(KEY_DB_PASSWORD, &self.db_password);
        r.set(KEY_DASHBOARD_USER, &self.dashboard_user);
        r.set(KEY_DASHBOARD_PASSWORD, &self.dashboard_password);
        if let Some(edge) = &self.edge {
            r.set(KEY_TRAEFIK_DOMAIN, &edge.dashboard_domain);
            r.set(KEY_TRAEFIK_BASIC_AUTH, &edge.basic_auth);
        }
        r
    }

    /// Build from a loaded record. Required keys must be present and non-empty.
    pub fn from_record(
        record: EnvRecord,
        proxy: EdgeProxy,
        path: &Path,
    ) -> Result<Self, InstallerError> {
        let required = |key: &str| -> Result<String, InstallerError> {
            record
                .get(key)
                .filter(|v| !v.is_empty())
                .map(|v| v.to_string())
                .ok_or_else(|| InstallerError::IncompleteConfiguration {
                    path: path.to_path_buf(),
                    key: key.to_string(),
                })
        };

        let edge = match proxy {
            EdgeProxy::None => None,
            EdgeProxy::Traefik => Some(EdgeConfig {
                dashboard_domain: required(KEY_TRAEFIK_DOMAIN)?,
                basic_auth: required(KEY_TRAEFIK_BASIC_AUTH)?,
            }),
        };

        let domain = required(KEY_DOMAIN)?;
        let email = required(KEY_EMAIL)?;
        let api_key = required(KEY_API_KEY)?;
        let db_root_password = required(KEY_DB_ROOT_PASSWORD)?;
        let db_password = required(KEY_DB_PASSWORD)?;
        let dashboard_password = required(KEY_DASHBOARD_PASSWORD)?;
        let dashboard_user = record
            .get(KEY_DASHBOARD_USER)
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_DASHBOARD_USER)
            .to_string();

        Ok(Self {
            domain,
            email,
            api_key,
            db_root_password,
            db_password,
            dashboard_user,
            dashboard_password,
            edge,
            record,
        })
    }

    pub fn record(&self) -> &EnvRecord {
        &self.record
    }

    /// Every value that must never appear in a log.
    pub fn secrets(&self) -> Vec<&str> {
        let mut out = vec![
            self.api_key.as_str(),
            self.db_root_password.as_str(),
            self.db_password.as_str(),
            self.dashboard_password.as_str(),
        ];
        if let Some(edge) = &self.edge {
            out.push(edge.basic_auth.as_str());
        }
        out
    }
}
