// ABOUTME: Optional TOML configuration for database, batching, and replication settings
// ABOUTME: File values fill in whatever the command line leaves unset

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::changeset::DEFAULT_BATCH_SIZE;

pub const DEFAULT_BASE_URL: &str = "https://planet.osm.org/replication/changesets/";
pub const DEFAULT_STATE_FILE: &str = "state.yaml";
pub const DEFAULT_DELTA_EXTENSION: &str = ".osm.gz";
/// Advisory lock key guarding the state row ("osmcs" in ASCII).
pub const DEFAULT_LOCK_KEY: i64 = 0x6f73_6d63_73;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// PostgreSQL connection string
    pub database_url: Option<String>,
    /// Changesets per committed transaction
    pub batch_size: usize,
    /// Populate the PostGIS geometry column on insert
    pub geometry: bool,
    pub replication: ReplicationSettings,
}

/// Where and how replication diffs are fetched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ReplicationSettings {
    pub base_url: String,
    pub state_file: String,
    pub delta_extension: String,
    pub lock_key: i64,
    /// Stop after this many diffs in one run (unset = catch up fully)
    pub max_sequences_per_run: Option<u64>,
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            batch_size: DEFAULT_BATCH_SIZE,
            geometry: false,
            replication: ReplicationSettings::default(),
        }
    }
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            state_file: DEFAULT_STATE_FILE.to_string(),
            delta_extension: DEFAULT_DELTA_EXTENSION.to_string(),
            lock_key: DEFAULT_LOCK_KEY,
            max_sequences_per_run: None,
            request_timeout_secs: 60,
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, the default location is used
    /// if present, otherwise built-in defaults apply.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        tracing::debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// `<config dir>/changeset-replicator/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("changeset-replicator").join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.batch_size, 10_000);
        assert!(!config.geometry);
        assert!(config.database_url.is_none());
        assert_eq!(
            config.replication.base_url,
            "https://planet.osm.org/replication/changesets/"
        );
        assert_eq!(config.replication.delta_extension, ".osm.gz");
        assert!(config.replication.max_sequences_per_run.is_none());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
batch_size = 50000

[replication]
base_url = "https://mirror.example.org/changesets/"
max_sequences_per_run = 100
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.batch_size, 50_000);
        assert_eq!(
            config.replication.base_url,
            "https://mirror.example.org/changesets/"
        );
        assert_eq!(config.replication.max_sequences_per_run, Some(100));
        assert_eq!(config.replication.state_file, "state.yaml");
        assert_eq!(config.replication.lock_key, DEFAULT_LOCK_KEY);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "batchsize = 5\n").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/config.toml"))).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to read config file"));
    }
}
