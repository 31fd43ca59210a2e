// Copyright 2025 Apache Doris Community
// Licensed under the Apache License, Version 2.0

//! Configuration management for sqlgate

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{GateError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the MySQL listener binds to
    pub listen_addr: String,

    /// MySQL protocol port
    pub port: u16,

    /// Version string advertised in the server greeting
    pub server_version: String,

    /// Read timeout while the handshake is in progress (seconds)
    pub handshake_timeout_s: u64,

    /// Idle timeout between commands (seconds)
    pub idle_timeout_s: u64,

    /// Log level used when RUST_LOG is not set
    pub log_level: String,

    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Plugin announced in the greeting and requested on auth switch
    pub plugin: String,

    /// Client plugins that trigger an auth switch to `plugin`
    pub switch_plugins: Vec<String>,

    /// Accept every login without checking credentials
    pub allow_all: bool,

    /// Known users and their plaintext passwords
    pub users: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            port: 7878,
            server_version: "5.7.25-sqlgate".to_string(),
            handshake_timeout_s: 30,
            idle_timeout_s: 28800,
            log_level: "info".to_string(),
            auth: AuthConfig::default(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            plugin: "mysql_native_password".to_string(),
            switch_plugins: vec![
                "caching_sha2_password".to_string(),
                "sha256_password".to_string(),
            ],
            allow_all: true,
            users: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GateError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| GateError::Config(e.to_string()))
    }

    /// Override settings from SQLGATE_* environment variables.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("SQLGATE_LISTEN_ADDR") {
            self.listen_addr = addr;
        }

        if let Ok(port) = std::env::var("SQLGATE_PORT") {
            if let Ok(port_num) = port.parse::<u16>() {
                self.port = port_num;
            }
        }

        if let Ok(level) = std::env::var("SQLGATE_LOG_LEVEL") {
            self.log_level = level;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(GateError::Config("port cannot be 0".to_string()));
        }
        if self.server_version.is_empty() || self.server_version.contains('\0') {
            return Err(GateError::Config(
                "server_version must be non-empty and contain no NUL".to_string(),
            ));
        }
        if self.idle_timeout_s == 0 || self.handshake_timeout_s == 0 {
            return Err(GateError::Config("timeouts must be positive".to_string()));
        }
        if self.auth.plugin.is_empty() {
            return Err(GateError::Config("auth.plugin cannot be empty".to_string()));
        }
        if !self.auth.allow_all && self.auth.users.is_empty() {
            return Err(GateError::Config(
                "auth.allow_all is false but no auth.users are configured".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.listen_addr, self.port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_s)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.idle_timeout(), Duration::from_secs(28800));
        assert_eq!(config.auth.plugin, "mysql_native_password");
        assert!(config.auth.switch_plugins.iter().any(|p| p == "caching_sha2_password"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            port = 3307

            [auth]
            allow_all = false
            users = { root = "secret" }
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 3307);
        assert_eq!(config.listen_addr, "127.0.0.1");
        assert!(!config.auth.allow_all);
        assert_eq!(config.auth.users.get("root").map(String::as_str), Some("secret"));
        assert_eq!(config.auth.plugin, "mysql_native_password");
        assert_eq!(config.bind_addr(), "127.0.0.1:3307");
    }

    #[test]
    fn test_shipped_config_file() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../conf/sqlgate.toml");
        let config = Config::from_file(&path).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 7878);
        assert_eq!(config.auth.users.get("root").map(String::as_str), Some(""));
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = Config::from_toml("port = \"not a number\"").unwrap_err();
        assert!(matches!(err, GateError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.port = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.auth.allow_all = false;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.idle_timeout_s = 0;
        assert!(config.validate().is_err());
    }
}
