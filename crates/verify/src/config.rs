//! `verifyd.toml` configuration.

use std::path::PathBuf;

use serde::Deserialize;

use mail_core::config::ServerSettings;

use crate::policy::PolicyOptions;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifyConfig {
    pub server: ServerSettings,
    pub verify: VerifySection,
    pub probe: ProbeSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifySection {
    /// Persistent cache table reference (`file:/path`); empty keeps the
    /// cache in volatile memory, lost when the worker exits.
    #[serde(default)]
    pub map: String,
    /// Probe sender address; `<>` or empty selects the null sender.
    #[serde(default = "default_sender")]
    pub sender: String,
    #[serde(default = "default_positive_expire")]
    pub positive_expire_secs: i64,
    #[serde(default = "default_positive_refresh")]
    pub positive_refresh_secs: i64,
    #[serde(default = "default_negative_expire")]
    pub negative_expire_secs: i64,
    #[serde(default = "default_negative_refresh")]
    pub negative_refresh_secs: i64,
    #[serde(default = "default_negative_cache")]
    pub negative_cache: bool,
}

impl VerifySection {
    pub fn policy_options(&self) -> PolicyOptions {
        PolicyOptions {
            sender: self.effective_sender(),
            positive_expire: self.positive_expire_secs,
            positive_refresh: self.positive_refresh_secs,
            negative_expire: self.negative_expire_secs,
            negative_refresh: self.negative_refresh_secs,
            negative_cache: self.negative_cache,
        }
    }

    pub fn is_memory_only(&self) -> bool {
        self.map.is_empty()
    }

    fn effective_sender(&self) -> String {
        if self.sender == "<>" {
            String::new()
        } else {
            self.sender.clone()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeSection {
    /// Unix-domain socket of the mail submission service.
    pub submit_socket: PathBuf,
}

fn default_sender() -> String {
    "postmaster".to_string()
}

fn default_positive_expire() -> i64 {
    31 * 24 * 3600
}

fn default_positive_refresh() -> i64 {
    7 * 24 * 3600
}

fn default_negative_expire() -> i64 {
    3 * 24 * 3600
}

fn default_negative_refresh() -> i64 {
    3 * 3600
}

fn default_negative_cache() -> bool {
    true
}
