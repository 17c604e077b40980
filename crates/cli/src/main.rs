use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use sg_cli::cli::{Cli, Command, ConfigCommand};
use sg_domain::config::ObservabilityConfig;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None => {
            let (config, _) = sg_cli::cli::load_config()?;
            init_tracing(&config.observability);
            sg_cli::cli::demo::run(&config, "alice", false)
        }
        Some(Command::Demo { principal, json }) => {
            let (config, _) = sg_cli::cli::load_config()?;
            init_tracing(&config.observability);
            sg_cli::cli::demo::run(&config, &principal, json)
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, config_path) = sg_cli::cli::load_config()?;
            let valid = sg_cli::cli::config::validate(&config, &config_path);
            if !valid {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _config_path) = sg_cli::cli::load_config()?;
            sg_cli::cli::config::show(&config)
        }
        Some(Command::Version) => {
            println!("sessiongrid {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Initialize stderr tracing.  `RUST_LOG` overrides the configured
/// default filter; `log_format = "json"` switches to structured output.
fn init_tracing(obs: &ObservabilityConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&obs.default_filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    if obs.is_json() {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    }
}
