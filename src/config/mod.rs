use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::Value;

pub const DEFAULT_CONFIG_FILE: &str = "tidemq.toml";
const CONFIG_ARG: &str = "--config";

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub manager: ManagerConfig,
    pub broker: BrokerConfig,
    pub wire: WireConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub remote: RemoteConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            human_friendly: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Socket read timeout; bounds how quickly workers notice shutdown.
    pub read_poll_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 9876,
            read_poll_ms: 100,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ManagerConfig {
    pub name: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name: "QM1".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerConfig {
    pub sweep_interval_ms: u64,
    /// Upper bound applied to server-side gets that ask to wait forever.
    pub max_get_wait_ms: u64,
    pub allow_unbounded_get: bool,
    pub default_poll_interval_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 1_000,
            max_get_wait_ms: 30_000,
            allow_unbounded_get: false,
            default_poll_interval_ms: 100,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WireConfig {
    pub max_envelope_size_bytes: usize,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_envelope_size_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub engine: String,
    pub path: String,
    pub backup_path: String,
    pub sled: SledConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            engine: "sled".to_owned(),
            path: "~/.tidemq/data".to_owned(),
            backup_path: "~/.tidemq/backup".to_owned(),
            sled: SledConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SledConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_capacity: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuthConfig {
    pub users: Vec<UserCredentials>,
}

impl AuthConfig {
    pub fn verify(&self, user: &str, password: &str) -> bool {
        self.users
            .iter()
            .any(|entry| entry.name == user && entry.password == password)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserCredentials {
    pub name: String,
    pub password: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RemoteConfig {
    /// Identity used when this broker logs in to another manager.
    pub user: String,
    pub password: String,
    pub pool_size: usize,
    pub acquire_timeout_ms: u64,
    pub io_timeout_ms: u64,
    pub routes: Vec<RemoteRoute>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            user: "system".to_owned(),
            password: String::new(),
            pool_size: 4,
            acquire_timeout_ms: 5_000,
            io_timeout_ms: 10_000,
            routes: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteRoute {
    pub queue: String,
    pub manager: String,
    pub host: String,
    pub port: u16,
}

impl AppConfig {
    /// Loads `--config <path>` if given, else `./tidemq.toml` if present, else defaults.
    /// Remaining arguments are `--section.key value` overrides.
    pub fn load_with_discovery(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let (explicit_path, overrides) = split_config_arg(args)?;
        let path = match explicit_path {
            Some(path) => Some(path),
            None => {
                let candidate = PathBuf::from(DEFAULT_CONFIG_FILE);
                candidate.is_file().then_some(candidate)
            }
        };

        match path {
            Some(path) => Self::load_from_toml_with_args(path, overrides),
            None => Self::load_defaults_with_args(overrides),
        }
    }

    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let toml_content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source,
        })?;

        let file_value: Value = toml_content
            .parse()
            .map_err(|source| ConfigError::TomlParse {
                path: path.as_ref().to_string_lossy().to_string(),
                source,
            })?;

        let mut root_value = default_root_value()?;
        merge_values(&mut root_value, file_value);
        Self::finish(root_value, args)
    }

    pub fn load_defaults_with_args(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        Self::finish(default_root_value()?, args)
    }

    fn finish(mut root_value: Value, args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let overrides = parse_cli_overrides(args)?;
        for (key_path, raw_value) in overrides {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        let config: Self = root_value.try_into().map_err(ConfigError::Deserialize)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, bool, &'static str); 7] = [
            ("manager.name", !self.manager.name.is_empty(), "must not be empty"),
            ("server.read_poll_ms", self.server.read_poll_ms > 0, "must be positive"),
            ("broker.sweep_interval_ms", self.broker.sweep_interval_ms > 0, "must be positive"),
            (
                "broker.max_get_wait_ms",
                self.broker.allow_unbounded_get || self.broker.max_get_wait_ms > 0,
                "must be positive unless broker.allow_unbounded_get is set",
            ),
            (
                "broker.default_poll_interval_ms",
                self.broker.default_poll_interval_ms > 0,
                "must be positive",
            ),
            (
                "wire.max_envelope_size_bytes",
                self.wire.max_envelope_size_bytes > 0,
                "must be positive",
            ),
            ("remote.pool_size", self.remote.pool_size > 0, "must be positive"),
        ];

        for (key, valid, reason) in checks {
            if !valid {
                return Err(ConfigError::InvalidSetting {
                    key: key.to_owned(),
                    reason,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    Deserialize(toml::de::Error),
    SerializeDefaults(toml::ser::Error),
    MissingValueForArg {
        key: String,
    },
    InvalidArgFormat {
        arg: String,
    },
    InvalidPath {
        key: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
    InvalidSetting {
        key: String,
        reason: &'static str,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::SerializeDefaults(source) => {
                write!(f, "failed to render default config: {source}")
            }
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI argument '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument format '{arg}', expected '--section.key value'"
            ),
            Self::InvalidPath { key } => write!(f, "invalid override key path '{key}'"),
            Self::UnknownPath { key } => write!(f, "unknown override key path '{key}'"),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
            Self::InvalidSetting { key, reason } => write!(f, "invalid setting '{key}': {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn default_root_value() -> Result<Value, ConfigError> {
    Value::try_from(AppConfig::default()).map_err(ConfigError::SerializeDefaults)
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_table), Value::Table(overlay_table)) => {
            for (key, overlay_value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge_values(existing, overlay_value),
                    None => {
                        base_table.insert(key, overlay_value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn split_config_arg(
    args: impl IntoIterator<Item = String>,
) -> Result<(Option<PathBuf>, Vec<String>), ConfigError> {
    let mut config_path = None;
    let mut rest = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        if arg == CONFIG_ARG {
            let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
                key: "config".to_owned(),
            })?;
            config_path = Some(PathBuf::from(value));
        } else {
            rest.push(arg);
        }
    }

    Ok((config_path, rest))
}

fn parse_cli_overrides(args: impl IntoIterator<Item = String>) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let Some(stripped) = arg.strip_prefix("--") else {
            return Err(ConfigError::InvalidArgFormat { arg });
        };

        if stripped.is_empty() {
            return Err(ConfigError::InvalidArgFormat { arg });
        }

        let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
            key: stripped.to_owned(),
        })?;

        parsed.push((stripped.to_owned(), value));
    }

    Ok(parsed)
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.len() < 2 || parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }

    let unknown = || ConfigError::UnknownPath {
        key: key_path.to_owned(),
    };

    let mut current = root;
    for section in &parts[..parts.len() - 1] {
        current = current
            .as_table_mut()
            .ok_or_else(unknown)?
            .get_mut(*section)
            .ok_or_else(unknown)?;
    }

    let final_key = parts[parts.len() - 1];
    let current_value = current
        .as_table_mut()
        .ok_or_else(unknown)?
        .get_mut(final_key)
        .ok_or_else(unknown)?;

    *current_value = parse_value_using_current_type(key_path, raw_value, current_value)?;
    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    let invalid = |expected: &'static str| ConfigError::InvalidValueForType {
        key: key_path.to_owned(),
        expected,
        value: raw_value.to_owned(),
    };

    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => raw_value
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid("integer")),
        Value::Float(_) => raw_value
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| invalid("float")),
        Value::Boolean(_) => raw_value
            .parse::<bool>()
            .map(Value::Boolean)
            .map_err(|_| invalid("boolean")),
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::{AppConfig, ConfigError, RemoteRoute};

    fn write_temp_config(content: &str, suffix: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "tidemq-config-test-{suffix}-{}.toml",
            std::process::id()
        ));
        fs::write(&path, content).expect("failed to write temp config");
        path
    }

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| (*value).to_owned()).collect()
    }

    #[test]
    fn defaults_serialize_and_load_without_a_file() {
        let config = AppConfig::load_defaults_with_args(Vec::new()).expect("defaults should load");
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.server.port, 9876);
        assert_eq!(config.wire.max_envelope_size_bytes, 8 * 1024 * 1024);
        assert!(!config.broker.allow_unbounded_get);
    }

    #[test]
    fn partial_file_is_merged_over_defaults() {
        let path = write_temp_config(
            r#"
[manager]
name = "QM_EAST"

[[auth.users]]
name = "admin"
password = "secret"

[[remote.routes]]
queue = "PAYMENTS"
manager = "QM_WEST"
host = "10.0.0.2"
port = 9877
"#,
            "partial",
        );

        let config = AppConfig::load_from_toml_with_args(&path, Vec::new())
            .expect("partial config should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.manager.name, "QM_EAST");
        assert_eq!(config.logging.level, "info");
        assert!(config.auth.verify("admin", "secret"));
        assert!(!config.auth.verify("admin", "wrong"));
        assert_eq!(
            config.remote.routes,
            vec![RemoteRoute {
                queue: "PAYMENTS".to_owned(),
                manager: "QM_WEST".to_owned(),
                host: "10.0.0.2".to_owned(),
                port: 9877,
            }]
        );
    }

    #[test]
    fn explicit_config_argument_and_overrides() {
        let path = write_temp_config(
            r#"
[logging]
level = "debug"
"#,
            "explicit",
        );

        let config = AppConfig::load_with_discovery(args(&[
            "--config",
            path.to_str().expect("temp path is UTF-8"),
            "--logging.level",
            "warn",
            "--server.port",
            "0",
            "--broker.allow_unbounded_get",
            "true",
        ]))
        .expect("config with overrides should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.server.port, 0);
        assert!(config.broker.allow_unbounded_get);
    }

    #[test]
    fn rejects_unknown_override_path_and_bad_types() {
        let err = AppConfig::load_defaults_with_args(args(&["--logging.nonexistent", "x"]))
            .expect_err("unknown override key should fail");
        assert!(matches!(err, ConfigError::UnknownPath { .. }));

        let err = AppConfig::load_defaults_with_args(args(&["--server.port", "many"]))
            .expect_err("non-integer port should fail");
        assert!(matches!(err, ConfigError::InvalidValueForType { .. }));

        let err = AppConfig::load_defaults_with_args(args(&["--auth.users", "x"]))
            .expect_err("arrays cannot be overridden");
        assert!(matches!(err, ConfigError::UnsupportedOverrideType { .. }));

        let err = AppConfig::load_defaults_with_args(args(&["--config"]))
            .expect_err("dangling --config should fail");
        assert!(matches!(err, ConfigError::MissingValueForArg { .. }));
    }

    #[test]
    fn validation_rejects_zero_intervals() {
        let err = AppConfig::load_defaults_with_args(args(&["--broker.sweep_interval_ms", "0"]))
            .expect_err("zero sweep interval should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidSetting { ref key, .. } if key == "broker.sweep_interval_ms"
        ));
    }

    #[test]
    fn zero_get_wait_cap_needs_unbounded_gets_enabled() {
        let err = AppConfig::load_defaults_with_args(args(&["--broker.max_get_wait_ms", "0"]))
            .expect_err("zero cap without opt-in should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidSetting { ref key, .. } if key == "broker.max_get_wait_ms"
        ));

        let config = AppConfig::load_defaults_with_args(args(&[
            "--broker.max_get_wait_ms",
            "0",
            "--broker.allow_unbounded_get",
            "true",
        ]))
        .expect("zero cap is fine when unbounded gets are allowed");
        assert_eq!(config.broker.max_get_wait_ms, 0);
    }

    #[test]
    fn sample_config_in_repository_root_loads() {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("tidemq.toml");
        let config = AppConfig::load_from_toml_with_args(&path, args(&["--server.port", "7000"]))
            .expect("sample config should load");

        assert_eq!(config.manager.name, "QM1");
        assert_eq!(config.server.port, 7000);
        assert!(config.auth.verify("app", "app-secret"));
        assert!(!config.auth.verify("app", "wrong"));
        assert_eq!(config.storage.sled.mode.as_deref(), Some("high_throughput"));
        assert!(config.remote.routes.is_empty());
    }
}
