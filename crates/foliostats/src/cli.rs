//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use foliostats_service::config::Config;
use foliostats_service::{caching, metrics};

use crate::logging;

/// Foliostats commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Clean the local response cache.
    Cleanup {
        /// Only log what would be removed without deleting anything.
        #[arg(long)]
        dry_run: bool,
    },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(bin_name = "foliostats", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short = 'c', global(true), value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    // SAFETY: We are in a single-threaded context at this point, so
    // modifying the environment is sound.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            match hostname::get().ok().and_then(|s| s.into_string().ok()) {
                Some(hostname) => {
                    tags.insert(tag, hostname);
                }
                None => tracing::warn!("Unable to read host name for statsd tag \"{tag}\""),
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)
            .context("failed to configure statsd")?;
    }

    match cli.command {
        Command::Cleanup { dry_run } => {
            caching::cleanup(config, dry_run).context("failed to clean up the cache")?
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_cleanup() {
        let cli = Cli::parse_from(["foliostats", "cleanup", "--dry-run", "-c", "/etc/f.yml"]);
        assert_eq!(cli.config(), Some(Path::new("/etc/f.yml")));
        assert!(matches!(cli.command, Command::Cleanup { dry_run: true }));
    }
}
