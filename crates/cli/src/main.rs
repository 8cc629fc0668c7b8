mod config_commands;
mod plugin_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    lokus_config::PluginHostConfig,
    tracing::{debug, info},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use crate::{config_commands::ConfigAction, plugin_commands::PluginAction};

#[derive(Parser)]
#[command(name = "lokus-host", about = "Inspect Lokus plugin packages and the host's view of them")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Plugin host config file (overrides discovery of lokus-plugins.toml).
    #[arg(long, global = true, env = "LOKUS_PLUGINS_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Plugin(PluginAction),
    /// Host configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Print the documented default config file.
    ConfigTemplate,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so command output stays pipeable.
    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn load_host_config(path: Option<&PathBuf>) -> anyhow::Result<PluginHostConfig> {
    match path {
        Some(path) => {
            debug!(path = %path.display(), "loading explicit config");
            let mut config = lokus_config::load_config(path)?;
            lokus_config::apply_env_overrides(&mut config);
            Ok(config)
        },
        None => Ok(lokus_config::discover_and_load()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "lokus-host starting");

    match cli.command {
        Commands::Plugin(action) => {
            let config = load_host_config(cli.config.as_ref())?;
            plugin_commands::handle_plugin(action, &config).await
        },
        Commands::Config { action } => {
            config_commands::handle_config(action, cli.config.as_deref())
        },
        Commands::ConfigTemplate => {
            print!("{}", lokus_config::default_config_template());
            Ok(())
        },
    }
}
