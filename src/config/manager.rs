//! Configuration Manager

use super::Config;
use crate::Result;
use anyhow::{bail, Context};
use std::net::SocketAddr;
use std::path::Path;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();

        if let Ok(bind_addr) = std::env::var("PORTBRIDGE_BIND_ADDR") {
            config.server.bind_addr = bind_addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid PORTBRIDGE_BIND_ADDR: {}", bind_addr))?;
        }

        if let Ok(target_addr) = std::env::var("PORTBRIDGE_TARGET_ADDR") {
            config.server.target_addr = target_addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid PORTBRIDGE_TARGET_ADDR: {}", target_addr))?;
        }

        if let Ok(backoff) = std::env::var("PORTBRIDGE_ACCEPT_BACKOFF_INITIAL") {
            config.server.accept_backoff_initial = humantime::parse_duration(&backoff)
                .with_context(|| format!("Invalid PORTBRIDGE_ACCEPT_BACKOFF_INITIAL: {}", backoff))?;
        }

        if let Ok(backoff) = std::env::var("PORTBRIDGE_ACCEPT_BACKOFF_MAX") {
            config.server.accept_backoff_max = humantime::parse_duration(&backoff)
                .with_context(|| format!("Invalid PORTBRIDGE_ACCEPT_BACKOFF_MAX: {}", backoff))?;
        }

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Apply command-line overrides, which win over file and environment.
    pub fn merge_with_cli_args(&mut self, bind: Option<SocketAddr>, target: Option<SocketAddr>) {
        if let Some(bind) = bind {
            self.server.bind_addr = bind;
        }
        if let Some(target) = target {
            self.server.target_addr = target;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_admission_config()
            .with_context(|| "Admission configuration validation failed")?;

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        if self.server.bind_addr == self.server.target_addr {
            bail!("target_addr must differ from bind_addr");
        }

        if self.server.accept_backoff_initial.is_zero() {
            bail!("accept_backoff_initial must be greater than 0");
        }

        if self.server.accept_backoff_initial > self.server.accept_backoff_max {
            bail!("accept_backoff_initial cannot exceed accept_backoff_max");
        }

        if self.server.accept_backoff_max > std::time::Duration::from_secs(60) {
            bail!("accept_backoff_max cannot exceed 1 minute");
        }

        Ok(())
    }

    fn validate_admission_config(&self) -> Result<()> {
        if !["allow", "deny"].contains(&self.admission.default_policy.as_str()) {
            bail!("admission.default_policy must be 'allow' or 'deny'");
        }

        if self.admission.enabled {
            crate::admission::parse_entries(&self.admission.allow)
                .context("invalid admission.allow entry")?;
            crate::admission::parse_entries(&self.admission.deny)
                .context("invalid admission.deny entry")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
bind_addr = "127.0.0.1:4000"
target_addr = "10.0.0.2:9000"
accept_backoff_initial = "20ms"
accept_backoff_max = "2s"

[admission]
enabled = true
default_policy = "allow"
deny = ["10.0.0.5", "192.168.0.0/16"]
"#
        )
        .unwrap();

        let config = ConfigManager::load_from_file(file.path()).unwrap();
        assert_eq!(config.server.bind_addr, "127.0.0.1:4000".parse().unwrap());
        assert_eq!(config.server.target_addr, "10.0.0.2:9000".parse().unwrap());
        assert_eq!(config.server.accept_backoff_initial, Duration::from_millis(20));
        assert_eq!(config.server.accept_backoff_max, Duration::from_secs(2));
        assert!(config.admission.enabled);
        assert_eq!(config.admission.deny.len(), 2);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config =
            ConfigManager::load_from_file(Path::new("/nonexistent/portbridge.toml")).unwrap();
        assert_eq!(config.server.bind_addr, Config::default().server.bind_addr);
    }

    #[test]
    fn test_bind_equals_target_rejected() {
        let mut config = Config::default();
        config.server.target_addr = config.server.bind_addr;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_bounds_rejected() {
        let mut config = Config::default();
        config.server.accept_backoff_initial = Duration::from_secs(5);
        config.server.accept_backoff_max = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_admission_entry_rejected() {
        let mut config = Config::default();
        config.admission.enabled = true;
        config.admission.deny = vec!["not-an-address".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_args_override() {
        let mut config = Config::default();
        config.merge_with_cli_args(Some("0.0.0.0:7000".parse().unwrap()), None);
        assert_eq!(config.server.bind_addr, "0.0.0.0:7000".parse().unwrap());
        assert_eq!(config.server.target_addr, Config::default().server.target_addr);
    }
}
