//! Configuration module
//!
//! [`Config`] is the clash document the engine runs on. It doubles as the
//! validator for downloaded subscriptions: a document that fails
//! [`Config::from_str`] never becomes the live config.

pub mod settings;

pub use settings::{parse_duration, Settings, DEFAULT_SUBSCRIBE_INTERVAL};

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tokio::fs;

/// Document written by `init_config_dir` when no config exists yet
pub const DEFAULT_CONFIG: &str = "mixed-port: 7890\n";

/// Proxy names every clash document may reference without defining them
const BUILTIN_PROXIES: &[&str] = &["DIRECT", "REJECT", "REJECT-DROP", "PASS", "COMPATIBLE"];

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP proxy port
    pub port: u16,

    /// SOCKS5 proxy port
    #[serde(rename = "socks-port")]
    pub socks_port: u16,

    /// Mixed (HTTP + SOCKS5) port
    #[serde(rename = "mixed-port")]
    pub mixed_port: u16,

    /// Allow LAN access
    #[serde(rename = "allow-lan")]
    pub allow_lan: bool,

    /// Bind address
    #[serde(rename = "bind-address", skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,

    /// Mode (rule, global, direct)
    pub mode: String,

    /// Log level
    #[serde(rename = "log-level")]
    pub log_level: String,

    /// External controller address
    #[serde(rename = "external-controller", skip_serializing_if = "Option::is_none")]
    pub external_controller: Option<String>,

    /// External controller UI directory
    #[serde(rename = "external-ui", skip_serializing_if = "Option::is_none")]
    pub external_ui: Option<String>,

    /// External controller secret
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// Proxy definitions
    pub proxies: Vec<ProxyConfig>,

    /// Proxy groups
    #[serde(rename = "proxy-groups")]
    pub proxy_groups: Vec<ProxyGroupConfig>,

    /// Rules
    pub rules: Vec<String>,

    /// Keys the wrapper does not interpret (dns, tun, providers, ...)
    #[serde(flatten)]
    pub extra: HashMap<String, serde_yaml::Value>,
}

impl Config {
    /// Load configuration from file (async)
    pub async fn load_async<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| Error::fs("read", path, e))?;
        Self::from_str(&content)
    }

    /// Load from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Err(Error::validation("configuration is empty"));
        }
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self.mode.to_ascii_lowercase().as_str() {
            "rule" | "global" | "direct" => {}
            other => return Err(Error::validation(format!("unknown mode: {}", other))),
        }

        let mut names: HashSet<&str> = HashSet::new();
        for proxy in &self.proxies {
            proxy.validate()?;
            if !names.insert(proxy.name.as_str()) {
                return Err(Error::validation(format!("duplicate proxy name: {}", proxy.name)));
            }
        }

        for group in &self.proxy_groups {
            if group.name.is_empty() {
                return Err(Error::validation("proxy group name cannot be empty"));
            }
            if group.group_type.is_empty() {
                return Err(Error::validation(format!("proxy group {} has no type", group.name)));
            }
            if !names.insert(group.name.as_str()) {
                return Err(Error::validation(format!("duplicate proxy group name: {}", group.name)));
            }
        }

        for group in &self.proxy_groups {
            for member in &group.proxies {
                if !names.contains(member.as_str()) && !BUILTIN_PROXIES.contains(&member.as_str()) {
                    return Err(Error::validation(format!(
                        "proxy group {} references unknown proxy {}",
                        group.name, member
                    )));
                }
            }
        }

        for (idx, rule) in self.rules.iter().enumerate() {
            if !rule.contains(',') {
                return Err(Error::validation(format!("rule {} is malformed: {}", idx, rule)));
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 0,
            socks_port: 0,
            mixed_port: 0,
            allow_lan: false,
            bind_address: None,
            mode: "rule".to_string(),
            log_level: "info".to_string(),
            external_controller: None,
            external_ui: None,
            secret: None,
            proxies: Vec::new(),
            proxy_groups: Vec::new(),
            rules: Vec::new(),
            extra: HashMap::new(),
        }
    }
}

/// Proxy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy name
    pub name: String,

    /// Proxy type
    #[serde(rename = "type")]
    pub proxy_type: String,

    /// Server address
    pub server: String,

    /// Server port
    pub port: u16,

    /// All other fields
    #[serde(flatten)]
    pub extra: HashMap<String, serde_yaml::Value>,
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::validation("Proxy name cannot be empty"));
        }
        if self.proxy_type.is_empty() {
            return Err(Error::validation(format!("Proxy {} has no type", self.name)));
        }
        if self.server.is_empty() {
            return Err(Error::validation(format!("Proxy {} server cannot be empty", self.name)));
        }
        if self.port == 0 {
            return Err(Error::validation(format!("Proxy {} port cannot be 0", self.name)));
        }
        Ok(())
    }
}

/// Proxy group configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyGroupConfig {
    /// Group name
    #[serde(default)]
    pub name: String,

    /// Group type (select, url-test, fallback, load-balance)
    #[serde(rename = "type", default)]
    pub group_type: String,

    /// Proxies in group
    #[serde(default)]
    pub proxies: Vec<String>,

    /// Providers in group
    #[serde(rename = "use", default, skip_serializing_if = "Vec::is_empty")]
    pub use_provider: Vec<String>,

    /// All other fields
    #[serde(flatten)]
    pub extra: HashMap<String, serde_yaml::Value>,
}
