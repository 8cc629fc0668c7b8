//! Default configuration template with all options documented.
//!
//! Written by `lokus-host config-template` so users can see every knob even
//! when they keep the defaults.

use crate::schema::{
    DEFAULT_ACTIVATION_TIMEOUT_MS, DEFAULT_DEACTIVATION_TIMEOUT_MS, DEFAULT_HOST_VERSION,
    DEFAULT_MANIFEST_FILE,
};

/// Render the documented default config as TOML.
pub fn default_config_template() -> String {
    format!(
        r##"# Lokus Plugin Host Configuration
# ===============================
# Every option is listed with its default value.
#
# Environment variable substitution is supported: ${{ENV_VAR}}
# Example: plugin_dirs = ["${{HOME}}/dev/lokus-plugins"]
#
# Overrides: LOKUS_HOST_VERSION, LOKUS_PLUGIN_DIRS, LOKUS_ACTIVATION_TIMEOUT_MS

# ══════════════════════════════════════════════════════════════════════════════
# HOST
# ══════════════════════════════════════════════════════════════════════════════

[host]
version = "{host_version}"              # Host semver, matched against each manifest's engines.host

# ══════════════════════════════════════════════════════════════════════════════
# DISCOVERY
# ══════════════════════════════════════════════════════════════════════════════

[discovery]
plugin_dirs = ["~/.lokus/plugins"]   # Roots scanned for plugin packages (one subdirectory each)
manifest_file = "{manifest_file}"      # Manifest file name inside each package
auto_migrate = true                  # Upgrade v1 manifests to v2 at discovery
                                     # false = v1 manifests are recorded as errors

# ══════════════════════════════════════════════════════════════════════════════
# ACTIVATION
# ══════════════════════════════════════════════════════════════════════════════

[activation]
timeout_ms = {timeout_ms}                   # activate() deadline; the plugin is marked failed on expiry
deactivation_timeout_ms = {deactivation_timeout_ms}       # deactivate() deadline; the plugin returns to loaded regardless

# ══════════════════════════════════════════════════════════════════════════════
# PLUGINS
# ══════════════════════════════════════════════════════════════════════════════

[plugins]
disabled = []                        # Plugin ids that are discovered but never loaded

[plugins.permissions]                # Permissions granted per plugin id
# "lokus.word-count" = ["read:files", "ui:statusbar"]
"##,
        host_version = DEFAULT_HOST_VERSION,
        manifest_file = DEFAULT_MANIFEST_FILE,
        timeout_ms = DEFAULT_ACTIVATION_TIMEOUT_MS,
        deactivation_timeout_ms = DEFAULT_DEACTIVATION_TIMEOUT_MS,
    )
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::schema::PluginHostConfig};

    #[test]
    fn template_parses_to_defaults() {
        let config: PluginHostConfig = toml::from_str(&default_config_template()).unwrap();
        assert_eq!(config, PluginHostConfig::default());
    }

    #[test]
    fn template_keeps_env_placeholder_example() {
        assert!(default_config_template().contains("${HOME}"));
    }
}
