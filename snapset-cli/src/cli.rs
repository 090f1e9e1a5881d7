//! Command-line argument parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use snapset_core::{SetName, SetSelector};

use crate::config::DEFAULT_CONFIG_PATH;

/// snapset - coordinated snapshot sets across SAN, NAS and local volumes
#[derive(Parser, Debug)]
#[command(name = "snapset")]
#[command(about = "snapset - coordinated snapshot sets across SAN, NAS and local volumes")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (defaults used if not found)
    #[arg(short, long, env = "SNAPSET_CONFIG", default_value = DEFAULT_CONFIG_PATH, global = true)]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "SNAPSET_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Log format (text or json)
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    /// Deployment model base URL
    #[arg(long, env = "SNAPSET_MODEL_URL", global = true)]
    pub model_url: Option<String>,

    /// Directory holding the per-set metadata records
    #[arg(long, global = true)]
    pub metadata_dir: Option<PathBuf>,

    /// How results are printed on stdout
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table, global = true)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Take a snapshot set, quiescing databases around their LUNs
    Create {
        /// Snapshot set name
        #[arg(value_parser = parse_set_name)]
        set: SetName,

        /// Leave already created snapshots in place when a step fails
        #[arg(long)]
        keep_on_failure: bool,
    },

    /// Remove every snapshot of a set, and the rollback caches it was last to use
    Remove {
        #[arg(value_parser = parse_set_name)]
        set: SetName,

        /// Proceed when the set has no metadata record
        #[arg(short, long)]
        force: bool,
    },

    /// Roll every member of a set back to its snapshot
    Restore {
        #[arg(value_parser = parse_set_name)]
        set: SetName,

        /// Skip the deployment-model and database state guards
        #[arg(short, long)]
        force: bool,
    },

    /// Print expected and actual snapshots of one set, or of every set with '*'
    List {
        #[arg(value_parser = parse_selector, default_value = "*")]
        set: SetSelector,

        /// One row per snapshot instead of one per set
        #[arg(short, long)]
        detailed: bool,
    },

    /// Check that a set is complete and usable for restore
    Validate {
        #[arg(value_parser = parse_set_name)]
        set: SetName,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Remove { .. } => "remove",
            Self::Restore { .. } => "restore",
            Self::List { .. } => "list",
            Self::Validate { .. } => "validate",
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

fn parse_set_name(s: &str) -> Result<SetName, String> {
    s.parse().map_err(|e: snapset_core::Error| e.to_string())
}

fn parse_selector(s: &str) -> Result<SetSelector, String> {
    s.parse().map_err(|e: snapset_core::Error| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("snapset").chain(args.iter().copied()))
    }

    #[test]
    fn test_create() {
        let args = parse(&["create", "nightly", "--keep-on-failure"]).unwrap();
        assert_eq!(
            args.command,
            Command::Create {
                set: SetName::new("nightly").unwrap(),
                keep_on_failure: true,
            }
        );
        assert_eq!(args.output, OutputFormat::Table);
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn test_list_defaults_to_every_set() {
        let args = parse(&["list"]).unwrap();
        assert_eq!(
            args.command,
            Command::List {
                set: SetSelector::All,
                detailed: false,
            }
        );
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = parse(&["remove", "s1", "--force", "-o", "json", "--log-level", "debug"]).unwrap();
        assert_eq!(args.output, OutputFormat::Json);
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert_eq!(args.command.name(), "remove");
    }

    #[test]
    fn test_wildcard_only_for_list() {
        assert!(parse(&["list", "*", "--detailed"]).is_ok());

        let err = parse(&["validate", "*"]).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(parse(&["create", "bad-name"]).is_err());
    }
}
