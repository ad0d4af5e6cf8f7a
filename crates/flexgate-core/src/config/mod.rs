//! Configuration for the notification subsystem.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{FlexGateError, FlexGateResult};
use crate::events::DEFAULT_HISTORY_CAPACITY;

/// Database path that selects the in-process store.
pub const IN_MEMORY_DATABASE: &str = ":memory:";

/// Notification subsystem configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Events retained in bus history.
    pub history_capacity: usize,
    /// Production mode requires https webhook URLs.
    pub production: bool,
    /// SQLite database path, or `:memory:` for the in-process store.
    pub database_path: PathBuf,
    /// Delivery rows older than this are purged.
    pub retention_days: u32,
    /// How often the purge job runs.
    pub retention_interval_minutes: u64,
    /// Whether to schedule the purge job at all.
    pub enable_retention: bool,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        let flexgate_dir = dirs::home_dir()
            .map(|h| h.join(".flexgate"))
            .unwrap_or_else(|| PathBuf::from(".flexgate"));

        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            production: false,
            database_path: flexgate_dir.join("notifications.db"),
            retention_days: 30,
            retention_interval_minutes: 60,
            enable_retention: true,
        }
    }
}

impl NotifierConfig {
    /// Load configuration from a file (TOML, JSON, or YAML).
    pub fn from_file(path: impl AsRef<Path>) -> FlexGateResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let ext = path.as_ref().extension().and_then(|e| e.to_str());

        match ext {
            Some("toml") => {
                toml::from_str(&content).map_err(|e| FlexGateError::Configuration(e.to_string()))
            }
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| FlexGateError::Configuration(e.to_string())),
            Some("yaml" | "yml") => serde_yaml::from_str(&content)
                .map_err(|e| FlexGateError::Configuration(e.to_string())),
            _ => Err(FlexGateError::Configuration(
                "Unsupported config file format. Use .toml, .json, or .yaml".to_string(),
            )),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `FLEXGATE_*` overrides read through `lookup`.
    ///
    /// Unparseable numbers are ignored with a warning.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(capacity) = parse_var(&lookup, "FLEXGATE_EVENT_HISTORY_CAPACITY") {
            self.history_capacity = capacity;
        }
        if let Some(env) = lookup("FLEXGATE_ENV") {
            self.production = env.eq_ignore_ascii_case("production");
        }
        if let Some(path) = lookup("FLEXGATE_DB_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(days) = parse_var(&lookup, "FLEXGATE_RETENTION_DAYS") {
            self.retention_days = days;
        }
        if let Some(minutes) = parse_var(&lookup, "FLEXGATE_RETENTION_INTERVAL_MINUTES") {
            self.retention_interval_minutes = minutes;
        }
        if let Some(disabled) = lookup("FLEXGATE_DISABLE_RETENTION") {
            self.enable_retention = !matches!(disabled.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        self
    }

    /// Build configuration using builder pattern.
    pub fn builder() -> NotifierConfigBuilder {
        NotifierConfigBuilder::default()
    }

    /// Whether deliveries are kept in process memory only.
    pub fn is_in_memory(&self) -> bool {
        self.database_path.as_os_str() == IN_MEMORY_DATABASE
    }

    /// Interval between purge runs, never below one minute.
    pub fn retention_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.retention_interval_minutes.max(1) * 60)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring invalid configuration value");
            None
        }
    }
}

/// Builder for NotifierConfig.
#[derive(Default)]
pub struct NotifierConfigBuilder {
    config: NotifierConfig,
}

impl NotifierConfigBuilder {
    /// Set event history capacity.
    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.config.history_capacity = capacity;
        self
    }

    /// Enable or disable production mode.
    pub fn production(mut self, production: bool) -> Self {
        self.config.production = production;
        self
    }

    /// Set database path.
    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.database_path = path.into();
        self
    }

    /// Keep everything in memory.
    pub fn in_memory(mut self) -> Self {
        self.config.database_path = PathBuf::from(IN_MEMORY_DATABASE);
        self
    }

    /// Set retention window in days.
    pub fn retention_days(mut self, days: u32) -> Self {
        self.config.retention_days = days;
        self
    }

    pub fn retention_interval_minutes(mut self, minutes: u64) -> Self {
        self.config.retention_interval_minutes = minutes;
        self
    }

    pub fn enable_retention(mut self, enabled: bool) -> Self {
        self.config.enable_retention = enabled;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> NotifierConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = NotifierConfig::default();
        assert_eq!(config.history_capacity, 1000);
        assert!(!config.production);
        assert!(config.database_path.ends_with(".flexgate/notifications.db"));
        assert_eq!(config.retention_days, 30);
        assert!(config.enable_retention);
        assert!(!config.is_in_memory());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("FLEXGATE_EVENT_HISTORY_CAPACITY", "50"),
            ("FLEXGATE_ENV", "Production"),
            ("FLEXGATE_DB_PATH", ":memory:"),
            ("FLEXGATE_RETENTION_DAYS", "not-a-number"),
            ("FLEXGATE_RETENTION_INTERVAL_MINUTES", "0"),
            ("FLEXGATE_DISABLE_RETENTION", "true"),
        ]
        .into_iter()
        .collect();

        let config =
            NotifierConfig::default().with_overrides(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.history_capacity, 50);
        assert!(config.production);
        assert!(config.is_in_memory());
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.retention_interval(), std::time::Duration::from_secs(60));
        assert!(!config.enable_retention);
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "production = true\nretention_days = 7").unwrap();

        let config = NotifierConfig::from_file(file.path()).unwrap();
        assert!(config.production);
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.history_capacity, 1000);
    }

    #[test]
    fn test_from_yaml_and_json_files() {
        let mut yaml = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(yaml, "history_capacity: 10").unwrap();
        assert_eq!(NotifierConfig::from_file(yaml.path()).unwrap().history_capacity, 10);

        let mut json = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        writeln!(json, r#"{{"database_path": ":memory:"}}"#).unwrap();
        assert!(NotifierConfig::from_file(json.path()).unwrap().is_in_memory());
    }

    #[test]
    fn test_unsupported_extension() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        let err = NotifierConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, FlexGateError::Configuration(_)));
    }

    #[test]
    fn test_builder() {
        let config = NotifierConfig::builder()
            .history_capacity(5)
            .production(true)
            .in_memory()
            .retention_days(1)
            .enable_retention(false)
            .build();
        assert_eq!(config.history_capacity, 5);
        assert!(config.production);
        assert!(config.is_in_memory());
        assert!(!config.enable_retention);
    }
}
