pub mod config;
pub mod demo;

use clap::{Parser, Subcommand};

/// SessionGrid: session lifecycle with secondary-index consistency.
#[derive(Debug, Parser)]
#[command(name = "sessiongrid", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Walk a session through create, index, save, lookup and delete
    /// against the in-memory store (default when no subcommand is given).
    Demo {
        /// Principal name stored in the indexed attribute.
        #[arg(long, default_value = "alice")]
        principal: String,
        /// Print the final report as JSON instead of plain text.
        #[arg(long)]
        json: bool,
    },
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
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

// ── Config loading helper ─────────────────────────────────────────────

/// Load the configuration from the path specified by `SG_CONFIG` (or
/// `config.toml` by default).  Returns the parsed [`Config`] and the
/// path that was used.  A missing file yields the defaults.
///
/// [`Config`]: sg_domain::config::Config
pub fn load_config() -> anyhow::Result<(sg_domain::config::Config, String)> {
    let config_path = std::env::var("SG_CONFIG").unwrap_or_else(|_| "config.toml".into());

    let config = if std::path::Path::new(&config_path).exists() {
        let raw = std::fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("reading {config_path}: {e}"))?;
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {config_path}: {e}"))?
    } else {
        sg_domain::config::Config::default()
    };

    Ok((config, config_path))
}
