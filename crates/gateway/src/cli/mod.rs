pub mod config;
pub mod egress;

use clap::{Parser, Subcommand};

/// LaneAgent: per-session lanes in front of a chat agent.
#[derive(Debug, Parser)]
#[command(name = "laneagent", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the gateway server (default when no subcommand is given).
    Serve,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Egress marker maintenance.
    #[command(subcommand)]
    Egress(EgressCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

#[derive(Debug, Subcommand)]
pub enum EgressCommand {
    /// Delete delivery markers older than the retention window.
    Prune {
        /// Override `egress.retention_hours`.
        #[arg(long)]
        older_than_hours: Option<u64>,
        /// Only count what would be removed.
        #[arg(long)]
        dry_run: bool,
    },
}

// ── Config loading helper ─────────────────────────────────────────────

/// Load the configuration from the path specified by `LA_CONFIG` (or
/// `config.toml` by default).  Returns the parsed [`Config`] and the
/// path that was used.  A missing file yields the defaults.
///
/// [`Config`]: la_domain::config::Config
pub fn load_config() -> anyhow::Result<(la_domain::config::Config, String)> {
    let config_path = std::env::var("LA_CONFIG").unwrap_or_else(|_| "config.toml".into());
    let config = load_config_from(&config_path)?;
    Ok((config, config_path))
}

pub fn load_config_from(config_path: &str) -> anyhow::Result<la_domain::config::Config> {
    if !std::path::Path::new(config_path).exists() {
        return Ok(la_domain::config::Config::default());
    }
    let raw = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("reading {config_path}: {e}"))?;
    toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {config_path}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let cfg = load_config_from(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.lanes.max_concurrency, 4);
    }

    #[test]
    fn partial_file_is_merged_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[lanes]\nmax_concurrency = 2\n\n[[outbound]]\nchannel = \"telegram\"\nwebhook_url = \"http://relay/send\"\n",
        )
        .unwrap();
        let cfg = load_config_from(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.lanes.max_concurrency, 2);
        assert_eq!(cfg.lanes.correction_max_rounds, 2);
        assert_eq!(cfg.outbound.len(), 1);
        assert_eq!(cfg.outbound[0].timeout_secs, 30);
    }

    #[test]
    fn broken_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[lanes\n").unwrap();
        let err = load_config_from(path.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("parsing"));
    }

    #[test]
    fn cli_parses_prune_flags() {
        let cli = Cli::parse_from(["laneagent", "egress", "prune", "--older-than-hours", "12"]);
        match cli.command {
            Some(Command::Egress(EgressCommand::Prune {
                older_than_hours,
                dry_run,
            })) => {
                assert_eq!(older_than_hours, Some(12));
                assert!(!dry_run);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
