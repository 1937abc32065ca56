//! Typed view of the configuration keys used by discovery

use crate::registration::RegistrationConfig;
use serde::de::DeserializeOwned;
use std::time::Duration;
use waypoint_config::{ConfigError, ConfigService, ConfigValidator, Validate};

/// Discovery settings with their defaults
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// `discovery.consul.hosts`
    pub consul_hosts: String,
    /// `discovery.consul.protocol`, the scheme advertised in Consul tags
    pub consul_protocol: String,
    /// `discovery.etcd.hosts`, comma separated
    pub etcd_hosts: String,
    /// `discovery.start-retry-delay-ms`
    pub start_retry_delay_ms: u64,
    /// `discovery.max-retry-delay-ms`
    pub max_retry_delay_ms: u64,
    /// `discovery.ttl`, seconds
    pub ttl: u64,
    /// `discovery.ping-interval`, seconds
    pub ping_interval: u64,
    /// `name`
    pub name: Option<String>,
    /// `env.name`
    pub environment: String,
    /// `version`
    pub version: String,
    /// `server.base-url`
    pub base_url: Option<String>,
    /// `server.http.address`
    pub address: Option<String>,
    /// `server.http.port`
    pub port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            consul_hosts: "http://localhost:8500".to_string(),
            consul_protocol: "http".to_string(),
            etcd_hosts: "http://localhost:2379".to_string(),
            start_retry_delay_ms: 500,
            max_retry_delay_ms: 900_000,
            ttl: 30,
            ping_interval: 20,
            name: None,
            environment: "dev".to_string(),
            version: "1.0.0".to_string(),
            base_url: None,
            address: None,
            port: 8080,
        }
    }
}

impl Settings {
    /// Read settings, falling back to defaults for missing keys.
    ///
    /// Every key is also accepted under the `kumuluzee.` prefix used by
    /// existing service configuration files; the unprefixed key wins.
    pub fn from_config(config: &ConfigService) -> Self {
        let defaults = Self::default();

        Self {
            consul_hosts: text(config, "discovery.consul.hosts").unwrap_or(defaults.consul_hosts),
            consul_protocol: text(config, "discovery.consul.protocol")
                .unwrap_or(defaults.consul_protocol),
            etcd_hosts: text(config, "discovery.etcd.hosts").unwrap_or(defaults.etcd_hosts),
            start_retry_delay_ms: value(
                config,
                "discovery.start-retry-delay-ms",
                defaults.start_retry_delay_ms,
            ),
            max_retry_delay_ms: value(
                config,
                "discovery.max-retry-delay-ms",
                defaults.max_retry_delay_ms,
            ),
            ttl: value(config, "discovery.ttl", defaults.ttl),
            ping_interval: value(config, "discovery.ping-interval", defaults.ping_interval),
            name: text(config, "name"),
            environment: text(config, "env.name").unwrap_or(defaults.environment),
            version: text(config, "version").unwrap_or(defaults.version),
            base_url: text(config, "server.base-url"),
            address: text(config, "server.http.address"),
            port: value(config, "server.http.port", defaults.port),
        }
    }

    /// Loop timing derived from these settings
    pub fn registration_config(&self) -> RegistrationConfig {
        RegistrationConfig {
            ping_interval: Duration::from_secs(self.ping_interval),
            start_retry_delay: Duration::from_millis(self.start_retry_delay_ms),
            max_retry_delay: Duration::from_millis(self.max_retry_delay_ms),
        }
    }
}

/// Prefix accepted in front of every settings key
const LEGACY_KEY_PREFIX: &str = "kumuluzee";

fn legacy(key: &str) -> String {
    format!("{}.{}", LEGACY_KEY_PREFIX, key)
}

fn text(config: &ConfigService, key: &str) -> Option<String> {
    config
        .get_non_empty(key)
        .or_else(|| config.get_non_empty(&legacy(key)))
}

fn value<T: DeserializeOwned>(config: &ConfigService, key: &str, default: T) -> T {
    config
        .get(key)
        .or_else(|_| config.get(&legacy(key)))
        .unwrap_or(default)
}

impl Validate for Settings {
    fn validate(&self) -> waypoint_config::Result<()> {
        ConfigValidator::is_url_list(&self.consul_hosts, "discovery.consul.hosts")?;
        ConfigValidator::is_url_list(&self.etcd_hosts, "discovery.etcd.hosts")?;
        ConfigValidator::one_of(
            &self.consul_protocol.as_str(),
            &["http", "https"],
            "discovery.consul.protocol",
        )?;
        ConfigValidator::positive(self.ttl, "discovery.ttl")?;
        ConfigValidator::positive(self.ping_interval, "discovery.ping-interval")?;
        ConfigValidator::positive(self.max_retry_delay_ms, "discovery.max-retry-delay-ms")?;

        if self.ping_interval >= self.ttl {
            return Err(ConfigError::ValidationError(format!(
                "discovery.ping-interval ({}s) must be shorter than discovery.ttl ({}s)",
                self.ping_interval, self.ttl
            )));
        }
        if let Some(ref url) = self.base_url {
            ConfigValidator::is_url(url, "server.base-url")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_config::ConfigManager;

    fn service(pairs: &[(&str, serde_json::Value)]) -> ConfigService {
        let manager = ConfigManager::new();
        for (key, value) in pairs {
            manager.set(key, value.clone()).unwrap();
        }
        ConfigService::from(manager)
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_config(&ConfigService::default());
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.environment, "dev");
        assert_eq!(settings.port, 8080);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_reads_dotted_keys() {
        let settings = Settings::from_config(&service(&[
            ("discovery.consul.hosts", "http://consul:8500".into()),
            ("discovery.ttl", 60.into()),
            ("discovery.ping-interval", "15".into()),
            ("name", "billing".into()),
            ("env.name", "prod".into()),
            ("server.http.port", 9000.into()),
            ("server.base-url", "https://billing.internal".into()),
        ]));

        assert_eq!(settings.consul_hosts, "http://consul:8500");
        assert_eq!(settings.ttl, 60);
        assert_eq!(settings.ping_interval, 15);
        assert_eq!(settings.name.as_deref(), Some("billing"));
        assert_eq!(settings.environment, "prod");
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.base_url.as_deref(), Some("https://billing.internal"));
    }

    #[test]
    fn test_reads_kumuluzee_prefixed_keys() {
        let settings = Settings::from_config(&service(&[
            ("kumuluzee.discovery.etcd.hosts", "http://etcd-1:2379".into()),
            ("kumuluzee.discovery.ttl", 45.into()),
            ("kumuluzee.name", "billing".into()),
            ("kumuluzee.env.name", "qa".into()),
            ("kumuluzee.server.base-url", "https://billing.internal".into()),
            ("env.name", "prod".into()),
        ]));

        assert_eq!(settings.etcd_hosts, "http://etcd-1:2379");
        assert_eq!(settings.ttl, 45);
        assert_eq!(settings.name.as_deref(), Some("billing"));
        assert_eq!(settings.base_url.as_deref(), Some("https://billing.internal"));
        // Unprefixed key wins
        assert_eq!(settings.environment, "prod");
    }

    #[test]
    fn test_blank_values_use_defaults() {
        let settings = Settings::from_config(&service(&[
            ("env.name", " ".into()),
            ("name", "".into()),
        ]));
        assert_eq!(settings.environment, "dev");
        assert_eq!(settings.name, None);
    }

    #[test]
    fn test_registration_config_clamps_start_delay() {
        let settings = Settings {
            start_retry_delay_ms: 5_000,
            max_retry_delay_ms: 1_000,
            ..Settings::default()
        };
        let config = settings.registration_config();
        let mut backoff =
            crate::registration::Backoff::new(config.start_retry_delay, config.max_retry_delay);
        assert_eq!(backoff.next_delay(), Duration::from_millis(1_000));
    }

    #[test]
    fn test_validation() {
        let bad_protocol = Settings {
            consul_protocol: "ftp".into(),
            ..Settings::default()
        };
        assert!(bad_protocol.validate().is_err());

        let slow_ping = Settings {
            ping_interval: 30,
            ttl: 30,
            ..Settings::default()
        };
        assert!(slow_ping.validate().is_err());

        let bad_hosts = Settings {
            etcd_hosts: "http://etcd-1:2379,etcd-2:2379".into(),
            ..Settings::default()
        };
        assert!(bad_hosts.validate().is_err());
    }
}
