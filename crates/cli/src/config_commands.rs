use std::path::Path;

use {
    anyhow::Result, clap::Subcommand, lokus_config::PluginHostConfig,
    lokus_plugins::ManagerOptions,
};

use crate::plugin_commands::{BOLD, RED, RESET, YELLOW};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Check that the config file loads and the host can start with it.
    Check,
    /// Print the effective config after env overrides, as JSON.
    Show,
    /// Print the config file path that would be used.
    Path,
    /// Write the documented default config to the user config path.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

pub fn handle_config(action: ConfigAction, explicit: Option<&Path>) -> Result<()> {
    match action {
        ConfigAction::Check => check(explicit),
        ConfigAction::Show => {
            let config = load(explicit)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        },
        ConfigAction::Path => {
            let path = explicit
                .map(Path::to_path_buf)
                .unwrap_or_else(lokus_config::find_or_default_config_path);
            println!("{}", path.display());
            Ok(())
        },
        ConfigAction::Init { force } => init(explicit, force),
    }
}

fn load(explicit: Option<&Path>) -> Result<PluginHostConfig> {
    match explicit {
        Some(path) => {
            let mut config = lokus_config::load_config(path)?;
            lokus_config::apply_env_overrides(&mut config);
            Ok(config)
        },
        None => Ok(lokus_config::discover_and_load()),
    }
}

fn check(explicit: Option<&Path>) -> Result<()> {
    let path = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(lokus_config::find_or_default_config_path);
    if path.exists() {
        eprintln!("Checking {}\n", path.display());
    } else {
        eprintln!("No config file found; checking defaults.\n");
    }

    let config = match load(explicit) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("  {BOLD}{RED}error{RESET} {e:#}");
            std::process::exit(1);
        },
    };

    let mut errors = 0;
    let mut warnings = 0;

    if let Err(e) = ManagerOptions::from_config(&config) {
        eprintln!("  {BOLD}{RED}error{RESET} {e}");
        errors += 1;
    }
    for dir in config.discovery.resolved_plugin_dirs() {
        if !dir.is_dir() {
            eprintln!(
                "  {BOLD}{YELLOW}warning{RESET} discovery.plugin_dirs: {} does not exist",
                dir.display()
            );
            warnings += 1;
        }
    }

    for (id, granted) in &config.plugins.permissions {
        for permission in granted {
            if !lokus_manifest::is_known_permission(permission) {
                eprintln!(
                    "  {BOLD}{YELLOW}warning{RESET} plugins.permissions.{id}: '{permission}' is not a recognized permission"
                );
                warnings += 1;
            }
        }
    }

    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("\n{errors} error(s), {warnings} warning(s)");
    }

    if errors > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn init(explicit: Option<&Path>, force: bool) -> Result<()> {
    let path = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(lokus_config::find_or_default_config_path);
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, lokus_config::default_config_template())?;
    eprintln!("Wrote {}", path.display());
    Ok(())
}
