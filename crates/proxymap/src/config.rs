//! `proxymapd.toml` configuration.

use serde::Deserialize;

use mail_core::config::ServerSettings;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    pub server: ServerSettings,
    pub proxy: ProxySection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxySection {
    /// Whitespace-separated table references; only `proxy:`-prefixed
    /// entries are approved for access through this service.
    #[serde(default)]
    pub read_maps: String,
}
