//! Configuration module for Castro.

use serde::Deserialize;
use std::path::Path;

use crate::world::{Town, Vocation};
use crate::{CastroError, Result};

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL (e.g. `sqlite://data/castro.db`).
    #[serde(default = "default_db_url")]
    pub url: String,
    /// Maximum number of pooled connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_url() -> String {
    "sqlite://data/castro.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_db_url(),
            max_connections: default_max_connections(),
        }
    }
}

/// Script tree configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptsConfig {
    /// Root of the page scripts.
    #[serde(default = "default_pages_dir")]
    pub pages_dir: String,
    /// Root of the widget scripts.
    #[serde(default = "default_widgets_dir")]
    pub widgets_dir: String,
    /// Root holding one directory per extension id.
    #[serde(default = "default_extensions_dir")]
    pub extensions_dir: String,
    /// Prefix of the persisted extension tables (`<prefix>_extension_pages`).
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,
}

fn default_pages_dir() -> String {
    "pages".to_string()
}

fn default_widgets_dir() -> String {
    "widgets".to_string()
}

fn default_extensions_dir() -> String {
    "extensions".to_string()
}

fn default_table_prefix() -> String {
    "castro".to_string()
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            pages_dir: default_pages_dir(),
            widgets_dir: default_widgets_dir(),
            extensions_dir: default_extensions_dir(),
            table_prefix: default_table_prefix(),
        }
    }
}

/// Interpreter pool configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PoolConfig {
    /// Maximum idle interpreters kept per path (0 = unbounded).
    #[serde(default)]
    pub max_idle_per_path: usize,
    /// Idle interpreters older than this are evicted (0 = never).
    #[serde(default)]
    pub idle_timeout_secs: u64,
    /// How often the background sweep runs (0 = no background sweep).
    #[serde(default)]
    pub eviction_interval_secs: u64,
}

/// Per-interpreter resource limits.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LimitsConfig {
    /// Maximum instructions per top-level execution (0 = unlimited).
    #[serde(default)]
    pub max_instructions: u64,
    /// Maximum memory in bytes (0 = unlimited).
    #[serde(default)]
    pub max_memory: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/castro.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Game data exposed to scripts through the `world` global.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorldConfig {
    #[serde(default)]
    pub vocations: Vec<Vocation>,
    #[serde(default)]
    pub towns: Vec<Town>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Script tree configuration.
    #[serde(default)]
    pub scripts: ScriptsConfig,
    /// Interpreter pool configuration.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Vocations and towns.
    #[serde(default)]
    pub world: WorldConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(CastroError::Io)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| CastroError::Config(format!("config parse error: {e}")))
    }

    /// Validate the configuration.
    ///
    /// The table prefix ends up inside SQL identifiers, so it is restricted
    /// to lowercase ASCII letters, digits and underscores.
    pub fn validate(&self) -> Result<()> {
        let prefix = &self.scripts.table_prefix;
        if prefix.is_empty()
            || !prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(CastroError::Validation(format!(
                "table_prefix '{prefix}' must match [a-z0-9_]+"
            )));
        }
        if self.database.max_connections == 0 {
            return Err(CastroError::Validation(
                "database.max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.database.url, "sqlite://data/castro.db");
        assert_eq!(config.database.max_connections, 5);

        assert_eq!(config.scripts.pages_dir, "pages");
        assert_eq!(config.scripts.widgets_dir, "widgets");
        assert_eq!(config.scripts.extensions_dir, "extensions");
        assert_eq!(config.scripts.table_prefix, "castro");

        assert_eq!(config.pool.max_idle_per_path, 0);
        assert_eq!(config.pool.idle_timeout_secs, 0);

        assert_eq!(config.limits.max_instructions, 0);
        assert_eq!(config.limits.max_memory, 0);

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.file, "logs/castro.log");

        assert!(config.world.vocations.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[database]
url = "sqlite::memory:"
max_connections = 1

[scripts]
pages_dir = "/srv/site/pages"
table_prefix = "myot"

[pool]
max_idle_per_path = 8
idle_timeout_secs = 600

[logging]
level = "debug"

[[world.vocations]]
id = 1
name = "Sorcerer"
description = "a sorcerer"

[[world.towns]]
id = 2
name = "Thais"
"#;

        let config = Config::parse(toml).unwrap();

        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.database.max_connections, 1);
        assert_eq!(config.scripts.pages_dir, "/srv/site/pages");
        assert_eq!(config.scripts.widgets_dir, "widgets");
        assert_eq!(config.scripts.table_prefix, "myot");
        assert_eq!(config.pool.max_idle_per_path, 8);
        assert_eq!(config.pool.idle_timeout_secs, 600);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.world.vocations.len(), 1);
        assert_eq!(config.world.vocations[0].name, "Sorcerer");
        assert_eq!(config.world.towns[0].id, 2);
    }

    #[test]
    fn test_parse_invalid_toml() {
        let result = Config::parse("this is not [valid toml");
        assert!(matches!(result, Err(CastroError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_prefix() {
        let mut config = Config::default();
        config.scripts.table_prefix = "castro; DROP TABLE players".to_string();
        assert!(config.validate().is_err());

        config.scripts.table_prefix = String::new();
        assert!(config.validate().is_err());

        config.scripts.table_prefix = "ot_2".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_pool() {
        let mut config = Config::default();
        config.database.max_connections = 0;
        assert!(config.validate().is_err());
    }
}
