//! Runtime configuration, persisted as TOML.
//!
//! Resolution order: built-in defaults, then an optional TOML file, then the
//! `KG_MEMORY_DATABASE_URL` environment variable, then the command line.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::graph::MissingEndpointPolicy;

/// Environment variable overriding `database_url`.
pub const DATABASE_URL_ENV: &str = "KG_MEMORY_DATABASE_URL";

const REDB_SCHEME: &str = "redb://";
const MEMORY_URL: &str = ":memory:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Connection string, see [`DatabaseLocation::parse`].
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Bound on waiting for the writer slot or a locked database file.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// How relation creation treats missing endpoints.
    #[serde(default)]
    pub missing_endpoint: MissingEndpointPolicy,
    /// Serve reads from the in-memory graph cache.
    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,
}

fn default_database_url() -> String {
    "redb://kg-memory.redb".into()
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_cache_enabled() -> bool {
    true
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            busy_timeout_ms: default_busy_timeout_ms(),
            missing_endpoint: MissingEndpointPolicy::default(),
            cache_enabled: default_cache_enabled(),
        }
    }
}

impl MemoryConfig {
    /// Load from a TOML file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml(&content, &path.display().to_string())
    }

    fn from_toml(content: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })
    }

    /// Apply environment overrides. `lookup` is usually `std::env::var`.
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        if let Ok(url) = lookup(DATABASE_URL_ENV) {
            let url = url.trim();
            if !url.is_empty() {
                tracing::debug!(url, "database url from environment");
                self.database_url = url.to_string();
            }
        }
        self
    }

    /// Apply a command-line override, if given.
    pub fn with_database_url(mut self, url: Option<String>) -> Self {
        if let Some(url) = url {
            self.database_url = url;
        }
        self
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Parsed form of `database_url`.
    pub fn location(&self) -> Result<DatabaseLocation, ConfigError> {
        DatabaseLocation::parse(&self.database_url)
    }
}

/// Where the graph database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    File(PathBuf),
    Memory,
}

impl DatabaseLocation {
    /// Parse a connection string.
    ///
    /// Accepts `redb:///absolute/path`, `redb://relative/path`, a bare file
    /// path, or `:memory:` (also `redb://:memory:`).
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let invalid = |message: &str| ConfigError::InvalidDatabaseUrl {
            url: url.to_string(),
            message: message.to_string(),
        };

        let trimmed = url.trim();
        if trimmed.is_empty() {
            return Err(invalid("connection string is empty"));
        }

        let path = match trimmed.strip_prefix(REDB_SCHEME) {
            Some(rest) => rest,
            None if trimmed.contains("://") => {
                return Err(invalid("unsupported scheme, expected redb://"));
            }
            None => trimmed,
        };

        match path {
            "" => Err(invalid("missing database path")),
            MEMORY_URL => Ok(DatabaseLocation::Memory),
            _ if path.ends_with('/') => Err(invalid("path names a directory, not a file")),
            _ => Ok(DatabaseLocation::File(PathBuf::from(path))),
        }
    }
}

impl std::fmt::Display for DatabaseLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseLocation::File(path) => write!(f, "{}", path.display()),
            DatabaseLocation::Memory => write!(f, "{MEMORY_URL}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_connection_strings() {
        assert_eq!(
            DatabaseLocation::parse("redb:///var/lib/kg.redb").unwrap(),
            DatabaseLocation::File(PathBuf::from("/var/lib/kg.redb"))
        );
        assert_eq!(
            DatabaseLocation::parse("redb://data/kg.redb").unwrap(),
            DatabaseLocation::File(PathBuf::from("data/kg.redb"))
        );
        assert_eq!(
            DatabaseLocation::parse("kg.redb").unwrap(),
            DatabaseLocation::File(PathBuf::from("kg.redb"))
        );
        assert_eq!(DatabaseLocation::parse(":memory:").unwrap(), DatabaseLocation::Memory);
        assert_eq!(
            DatabaseLocation::parse("redb://:memory:").unwrap(),
            DatabaseLocation::Memory
        );
    }

    #[test]
    fn rejects_bad_connection_strings() {
        for url in ["", "  ", "redb://", "sqlite:///tmp/x.db", "redb://data/"] {
            assert!(
                matches!(
                    DatabaseLocation::parse(url),
                    Err(ConfigError::InvalidDatabaseUrl { .. })
                ),
                "{url:?} should be rejected"
            );
        }
    }

    #[test]
    fn toml_fills_missing_keys_with_defaults() {
        let config = MemoryConfig::from_toml(
            "database_url = \":memory:\"\nmissing_endpoint = \"reject\"\n",
            "inline",
        )
        .unwrap();
        assert_eq!(config.database_url, ":memory:");
        assert_eq!(config.missing_endpoint, MissingEndpointPolicy::Reject);
        assert_eq!(config.busy_timeout(), Duration::from_secs(5));
        assert!(config.cache_enabled);
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kg.toml");
        std::fs::write(&path, "busy_timeout_ms = \"soon\"").unwrap();
        let err = MemoryConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { ref path, .. } if path.ends_with("kg.toml")));
    }

    #[test]
    fn overrides_apply_in_order() {
        let config = MemoryConfig::default()
            .with_env(|key| {
                assert_eq!(key, DATABASE_URL_ENV);
                Ok("redb://from-env.redb".into())
            })
            .with_database_url(None);
        assert_eq!(config.database_url, "redb://from-env.redb");

        let config = config.with_database_url(Some(":memory:".into()));
        assert_eq!(config.location().unwrap(), DatabaseLocation::Memory);

        let untouched =
            MemoryConfig::default().with_env(|_| Err(std::env::VarError::NotPresent));
        assert_eq!(untouched, MemoryConfig::default());
    }
}
