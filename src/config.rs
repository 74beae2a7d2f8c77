//! Gateway configuration.
//!
//! Merge order: built-in defaults, then `<data_dir>/lanbridge.toml` if it
//! exists, then `LANBRIDGE_*` environment variables.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Application-level constants
pub const APP_NAME: &str = "lanbridge";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

const CONFIG_FILE: &str = "lanbridge.toml";
const ENV_PREFIX: &str = "LANBRIDGE_";

/// Data directory: the platform data dir (`~/.local/share/lanbridge` on
/// Linux), falling back to the working directory.
pub fn app_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Log filter used when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "lanbridge=debug,tower_http=info,warn"
    } else {
        "lanbridge=info,warn"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnv { var: String, value: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub bind_ip: IpAddr,
    pub https_port: u16,
    /// Plain HTTP listener for the same router; `None` disables it.
    pub http_port: Option<u16>,
    pub data_dir: PathBuf,
    pub keystore_alias: String,
    pub keystore_passphrase: String,
    /// Owner password the root token is derived from.
    pub password: String,
    /// Bearer token that unlocks root-key access for development tools.
    /// Empty disables developer access.
    pub dev_token: String,
    pub rate_limit_window_secs: u64,
    pub rate_limit_max_attempts: u32,
    pub peer_freshness_secs: u64,
    pub pairing_timeout_secs: u64,
    /// Name advertised for service discovery.
    pub service_name: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::from([0, 0, 0, 0]),
            https_port: 8443,
            http_port: Some(8080),
            data_dir: app_data_dir(),
            keystore_alias: APP_NAME.to_string(),
            keystore_passphrase: String::new(),
            password: String::new(),
            dev_token: String::new(),
            rate_limit_window_secs: 60,
            rate_limit_max_attempts: 5,
            peer_freshness_secs: 120,
            pairing_timeout_secs: 60,
            service_name: APP_NAME.to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("lanbridge.db")
    }

    pub fn keystore_dir(&self) -> PathBuf {
        self.data_dir.join("keystore")
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn peer_freshness(&self) -> Duration {
        Duration::from_secs(self.peer_freshness_secs)
    }

    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_secs(self.pairing_timeout_secs)
    }

    /// Passphrase for the TLS keystore; the owner password when unset.
    pub fn effective_keystore_passphrase(&self) -> &str {
        if self.keystore_passphrase.is_empty() {
            &self.password
        } else {
            &self.keystore_passphrase
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.https_port == 0 {
            return Err(ConfigError::Invalid("https_port must be non-zero".into()));
        }
        if self.http_port == Some(self.https_port) {
            return Err(ConfigError::Invalid(
                "http_port and https_port must differ".into(),
            ));
        }
        if self.keystore_alias.trim().is_empty() {
            return Err(ConfigError::Invalid("keystore_alias is empty".into()));
        }
        if self.rate_limit_max_attempts == 0 || self.rate_limit_window_secs == 0 {
            return Err(ConfigError::Invalid("rate limit must allow attempts".into()));
        }
        Ok(())
    }

    /// Apply `LANBRIDGE_*` overrides from `lookup`.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(var: &str, value: String) -> Result<T, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv {
                    var: var.to_string(),
                    value,
                })
        }

        let var = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|v| (key, v))
        };

        if let Some((k, v)) = var("BIND_IP") {
            self.bind_ip = parse(&k, v)?;
        }
        if let Some((k, v)) = var("HTTPS_PORT") {
            self.https_port = parse(&k, v)?;
        }
        if let Some((k, v)) = var("HTTP_PORT") {
            self.http_port = if matches!(v.trim(), "" | "off" | "none") {
                None
            } else {
                Some(parse(&k, v)?)
            };
        }
        if let Some((_, v)) = var("DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some((_, v)) = var("KEYSTORE_ALIAS") {
            self.keystore_alias = v;
        }
        if let Some((_, v)) = var("KEYSTORE_PASSPHRASE") {
            self.keystore_passphrase = v;
        }
        if let Some((_, v)) = var("PASSWORD") {
            self.password = v;
        }
        if let Some((_, v)) = var("DEV_TOKEN") {
            self.dev_token = v;
        }
        if let Some((k, v)) = var("RATE_LIMIT_WINDOW_SECS") {
            self.rate_limit_window_secs = parse(&k, v)?;
        }
        if let Some((k, v)) = var("RATE_LIMIT_MAX_ATTEMPTS") {
            self.rate_limit_max_attempts = parse(&k, v)?;
        }
        if let Some((k, v)) = var("PEER_FRESHNESS_SECS") {
            self.peer_freshness_secs = parse(&k, v)?;
        }
        if let Some((k, v)) = var("PAIRING_TIMEOUT_SECS") {
            self.pairing_timeout_secs = parse(&k, v)?;
        }
        if let Some((_, v)) = var("SERVICE_NAME") {
            self.service_name = v;
        }
        Ok(())
    }
}

/// Read a config file. A missing file yields the defaults.
pub fn load_from(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(GatewayConfig::default()),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load config: defaults, then the config file, then env vars.
pub fn load() -> Result<GatewayConfig, ConfigError> {
    let data_dir = std::env::var_os(format!("{ENV_PREFIX}DATA_DIR"))
        .map(PathBuf::from)
        .unwrap_or_else(app_data_dir);
    let path = data_dir.join(CONFIG_FILE);

    let mut config = load_from(&path)?;
    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;
    tracing::debug!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = GatewayConfig::default();
        config.validate().unwrap();
        assert_eq!(config.https_port, 8443);
        assert_eq!(config.rate_limit_window(), Duration::from_secs(60));
        assert_eq!(config.rate_limit_max_attempts, 5);
        assert_eq!(config.peer_freshness(), Duration::from_secs(120));
        assert_eq!(config.pairing_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn app_data_dir_ends_with_app_name() {
        assert!(app_data_dir().ends_with(APP_NAME));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, GatewayConfig::default());
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            "https_port = 9443\nhttp_port = 9080\nservice_name = \"kitchen\"\n",
        )
        .unwrap();

        let config = load_from(&path).unwrap();
        assert_eq!(config.https_port, 9443);
        assert_eq!(config.http_port, Some(9080));
        assert_eq!(config.service_name, "kitchen");
        assert_eq!(config.rate_limit_max_attempts, 5);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "htps_port = 1\n").unwrap();
        assert!(matches!(load_from(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = GatewayConfig::default();
        config
            .apply_env(env(&[
                ("LANBRIDGE_HTTPS_PORT", "10443"),
                ("LANBRIDGE_HTTP_PORT", "off"),
                ("LANBRIDGE_DEV_TOKEN", "dev-token"),
                ("LANBRIDGE_BIND_IP", "127.0.0.1"),
            ]))
            .unwrap();
        assert_eq!(config.https_port, 10443);
        assert_eq!(config.http_port, None);
        assert_eq!(config.dev_token, "dev-token");
        assert_eq!(config.bind_ip, IpAddr::from([127, 0, 0, 1]));
    }

    #[test]
    fn bad_env_value_is_reported() {
        let mut config = GatewayConfig::default();
        let err = config
            .apply_env(env(&[("LANBRIDGE_HTTPS_PORT", "not-a-port")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn same_ports_are_invalid() {
        let config = GatewayConfig {
            http_port: Some(8443),
            ..GatewayConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn keystore_passphrase_falls_back_to_password() {
        let mut config = GatewayConfig {
            password: "owner".into(),
            ..GatewayConfig::default()
        };
        assert_eq!(config.effective_keystore_passphrase(), "owner");
        config.keystore_passphrase = "ks".into();
        assert_eq!(config.effective_keystore_passphrase(), "ks");
    }
}
