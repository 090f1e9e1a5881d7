//! Configuration management for the coordinator.
//!
//! The snapshot tunables (`model`, `rpc`, `executor`, `timeouts`,
//! `databases`, `san`, `nas`, `lvm`, `default_set`) sit at the top level of
//! the file next to the sections only the command line needs.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use snapset_core::Settings;

use crate::cli::Args;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/snapset/snapset.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(flatten)]
    pub snapshot: Settings,
    pub metadata: MetadataConfig,
    pub decrypter: DecrypterConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file. A missing file yields the
    /// defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }

        if let Some(ref format) = args.log_format {
            self.logging.format = format.clone();
        }

        if let Some(ref url) = args.model_url {
            self.snapshot.model.url = url.clone();
        }

        if let Some(ref dir) = args.metadata_dir {
            self.metadata.dir = dir.clone();
        }

        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.snapshot.model.url.is_empty() {
            bail!("model.url must be set");
        }
        if self.snapshot.rpc.port == 0 {
            bail!("rpc.port must not be 0");
        }
        if self.snapshot.executor.max_attempts == 0 {
            bail!("executor.max_attempts must be at least 1");
        }
        if self.metadata.dir.as_os_str().is_empty() {
            bail!("metadata.dir must be set");
        }
        if self.decrypter.program.is_empty() {
            bail!("decrypter.program must be set");
        }
        Ok(())
    }
}

/// Where set metadata records are kept.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub dir: PathBuf,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/snapset"),
        }
    }
}

/// Local program that turns a credentials key into a password.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DecrypterConfig {
    /// Invoked as `<program> <key> <user>`.
    pub program: String,
}

impl Default for DecrypterConfig {
    fn default() -> Self {
        Self {
            program: "/usr/libexec/snapset/decrypt".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `text` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.metadata.dir, PathBuf::from("/var/lib/snapset"));
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.snapshot.rpc.port, 8740);
        config.validate().unwrap();
    }

    #[test]
    fn test_sections_at_top_level() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
model:
  url: https://ms1:9999
  attempts: 5
rpc:
  port: 9000
metadata:
  dir: /srv/snapset
default_set: snapshot
logging:
  format: json
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.snapshot.model.url, "https://ms1:9999");
        assert_eq!(config.snapshot.model.attempts, 5);
        assert_eq!(config.snapshot.rpc.port, 9000);
        assert!(config.snapshot.is_default_set("snapshot"));
        assert_eq!(config.metadata.dir, PathBuf::from("/srv/snapset"));
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_bad_yaml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "rpc: [not, a, map]").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args::try_parse_from([
            "snapset",
            "--log-level",
            "debug",
            "--metadata-dir",
            "/tmp/sets",
            "--model-url",
            "https://ms2:9999",
            "list",
        ])
        .unwrap();

        let config = Config::default().with_cli_overrides(&args);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "text");
        assert_eq!(config.metadata.dir, PathBuf::from("/tmp/sets"));
        assert_eq!(config.snapshot.model.url, "https://ms2:9999");
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let mut config = Config::default();
        config.snapshot.rpc.port = 0;
        assert!(config.validate().is_err());
    }
}
