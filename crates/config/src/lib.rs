//! Plugin host configuration: schema, discovery, env substitution, defaults.
//!
//! Config files: `lokus-plugins.toml`, `lokus-plugins.yaml` or
//! `lokus-plugins.json`, searched in `./` then the user config directory.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod template;

pub use {
    loader::{
        apply_env_overrides, config_dir, discover_and_load, find_or_default_config_path,
        load_config, save_config,
    },
    schema::{ActivationConfig, DiscoveryConfig, HostConfig, PluginHostConfig, PluginsConfig},
    template::default_config_template,
};
