//! Configuration file
//!
//! Optional TOML file; every value can also be given on the command line,
//! which takes precedence.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0"
//! port = 8000
//! cors = true
//! max_body_size_mb = 1
//!
//! [storage]
//! log_path = "process_log.json"
//! counter_path = "id_counts.json"
//!
//! [allocation]
//! total_slots = 115
//! ```

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub server: ServerSection,
    pub storage: StorageSection,
    pub allocation: AllocationSection,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub cors: Option<bool>,
    pub max_body_size_mb: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSection {
    pub log_path: Option<PathBuf>,
    pub counter_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct AllocationSection {
    pub total_slots: Option<usize>,
}

impl FileConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::parse(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.allocation.total_slots == Some(0) {
            return Err(Error::Config("allocation.total_slots must be positive".to_string()));
        }
        if self.server.max_body_size_mb == Some(0) {
            return Err(Error::Config("server.max_body_size_mb must be positive".to_string()));
        }
        Ok(())
    }
}

/// Where the two persisted files live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    pub log_path: PathBuf,
    pub counter_path: PathBuf,
}

impl Default for StoragePaths {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("process_log.json"),
            counter_path: PathBuf::from("id_counts.json"),
        }
    }
}

impl StoragePaths {
    /// Command line first, then file, then defaults
    pub fn resolve(
        log_path: Option<PathBuf>,
        counter_path: Option<PathBuf>,
        file: &StorageSection,
    ) -> Self {
        let defaults = Self::default();
        Self {
            log_path: log_path
                .or_else(|| file.log_path.clone())
                .unwrap_or(defaults.log_path),
            counter_path: counter_path
                .or_else(|| file.counter_path.clone())
                .unwrap_or(defaults.counter_path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_file() -> Result<()> {
        let config = FileConfig::parse(
            r#"
            [server]
            bind = "0.0.0.0"
            port = 8000

            [storage]
            counter_path = "/var/lib/slotkeeper/id_counts.json"

            [allocation]
            total_slots = 115
            "#,
        )?;

        assert_eq!(config.server.bind.as_deref(), Some("0.0.0.0"));
        assert_eq!(config.server.port, Some(8000));
        assert_eq!(config.server.cors, None);
        assert_eq!(config.allocation.total_slots, Some(115));

        let paths = StoragePaths::resolve(None, None, &config.storage);
        assert_eq!(paths.log_path, PathBuf::from("process_log.json"));
        assert_eq!(
            paths.counter_path,
            PathBuf::from("/var/lib/slotkeeper/id_counts.json")
        );
        Ok(())
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = StorageSection {
            log_path: Some(PathBuf::from("from_file.json")),
            counter_path: None,
        };
        let paths = StoragePaths::resolve(Some(PathBuf::from("from_cli.json")), None, &file);
        assert_eq!(paths.log_path, PathBuf::from("from_cli.json"));
        assert_eq!(paths.counter_path, PathBuf::from("id_counts.json"));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            FileConfig::parse("[allocation]\ntotal_slots = 0"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            FileConfig::parse("[server]\nprot = 1"),
            Err(Error::Config(_))
        ));
        assert_eq!(FileConfig::parse("").unwrap(), FileConfig::default());
    }
}
