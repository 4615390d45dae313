use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use burrow_filter::FilterPattern;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Agent configuration file (JSON). Loading is a thin boundary: the agent
/// core only ever sees the validated struct.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub client_name: String,
    pub local: LocalConfig,
    /// Filter patterns pushed to every connected server at startup.
    #[serde(default)]
    pub filters: Vec<FilterPattern>,
    pub servers: BTreeMap<String, ServerTargetConfig>,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_forward_timeout_secs")]
    pub forward_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    /// Local MITM proxy port the developer's tooling points at.
    pub proxy_port: u16,
    /// Base URL of the developer's local web server.
    pub web_url: String,
    /// Where the merged environment/property overlay files are written.
    #[serde(default = "default_overlay_dir")]
    pub overlay_dir: PathBuf,
    /// Per-hostname leaf certificate cache.
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,
    #[serde(default)]
    pub ca_cert_pem: Option<PathBuf>,
    #[serde(default)]
    pub ca_key_pem: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerTargetConfig {
    /// host:port of the remote debug endpoint.
    pub address: String,
    /// Remote file path -> local destination path, fetched at startup.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    /// Local overrides merged over the server environment; a null value
    /// unsets the key instead of being ignored.
    #[serde(default)]
    pub environments: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub properties: BTreeMap<String, Option<String>>,
}

fn default_startup_timeout_secs() -> u64 {
    60
}

fn default_forward_timeout_secs() -> u64 {
    600
}

fn default_overlay_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from("certs")
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_name.trim().is_empty() {
            return Err(ConfigError::Invalid("client_name must not be empty".into()));
        }
        if self.servers.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one server target is required".into(),
            ));
        }
        for (name, server) in &self.servers {
            if server.address.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "server {name:?} has an empty address"
                )));
            }
        }
        url::Url::parse(&self.local.web_url).map_err(|error| {
            ConfigError::Invalid(format!(
                "local.web_url {:?} is not a valid URL: {error}",
                self.local.web_url
            ))
        })?;
        if self.startup_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "startup_timeout_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.forward_timeout_secs)
    }

    /// Local web server base with any trailing slash removed, so joining
    /// with a request URI never doubles the separator.
    pub fn web_base(&self) -> String {
        self.local
            .web_url
            .strip_suffix('/')
            .unwrap_or(&self.local.web_url)
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> serde_json::Value {
        serde_json::json!({
            "client_name": "dev-laptop",
            "local": {
                "proxy_port": 8888,
                "web_url": "http://localhost:8080/"
            },
            "servers": {
                "staging": {"address": "10.0.0.5:9977"}
            }
        })
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: AgentConfig =
            serde_json::from_value(minimal_json()).expect("parse minimal config");
        config.validate().expect("valid");
        assert_eq!(config.startup_timeout(), Duration::from_secs(60));
        assert_eq!(config.forward_timeout(), Duration::from_secs(600));
        assert_eq!(config.web_base(), "http://localhost:8080");
        assert!(config.filters.is_empty());
    }

    #[test]
    fn null_environment_override_parses_as_unset_marker() {
        let mut json = minimal_json();
        json["servers"]["staging"]["environments"] =
            serde_json::json!({"KEEP": "local-value", "DROP": null});

        let config: AgentConfig = serde_json::from_value(json).expect("parse");
        let staging = &config.servers["staging"];
        assert_eq!(
            staging.environments.get("KEEP"),
            Some(&Some("local-value".to_string()))
        );
        assert_eq!(staging.environments.get("DROP"), Some(&None));
    }

    #[test]
    fn validation_catches_empty_servers_and_bad_url() {
        let mut json = minimal_json();
        json["servers"] = serde_json::json!({});
        let config: AgentConfig = serde_json::from_value(json).expect("parse");
        assert!(config.validate().is_err());

        let mut json = minimal_json();
        json["local"]["web_url"] = serde_json::json!("not a url");
        let config: AgentConfig = serde_json::from_value(json).expect("parse");
        assert!(config.validate().is_err());
    }
}
