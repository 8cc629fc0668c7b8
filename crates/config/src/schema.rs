//! Config schema for the plugin host runtime.

use std::{collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_HOST_VERSION: &str = "1.0.0";
pub const DEFAULT_MANIFEST_FILE: &str = "plugin.json";
pub const DEFAULT_ACTIVATION_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_DEACTIVATION_TIMEOUT_MS: u64 = 5_000;

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginHostConfig {
    pub host: HostConfig,
    pub discovery: DiscoveryConfig,
    pub activation: ActivationConfig,
    pub plugins: PluginsConfig,
}

/// Identity of the running host, matched against each manifest's
/// `engines.host` range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub version: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_HOST_VERSION.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Roots whose immediate subdirectories are plugin packages.
    /// A leading `~/` expands to the home directory.
    pub plugin_dirs: Vec<PathBuf>,
    /// Manifest file name inside each package.
    pub manifest_file: String,
    /// Migrate v1 manifests during discovery. When off, v1 manifests are
    /// recorded as errors.
    pub auto_migrate: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            plugin_dirs: vec![PathBuf::from("~/.lokus/plugins")],
            manifest_file: DEFAULT_MANIFEST_FILE.into(),
            auto_migrate: true,
        }
    }
}

impl DiscoveryConfig {
    /// Plugin roots with `~/` expanded.
    pub fn resolved_plugin_dirs(&self) -> Vec<PathBuf> {
        let home = directories::BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf());
        self.plugin_dirs
            .iter()
            .map(|dir| match (dir.strip_prefix("~"), &home) {
                (Ok(rest), Some(home)) => home.join(rest),
                _ => dir.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivationConfig {
    /// Upper bound for a plugin's `activate()` before it is marked failed.
    pub timeout_ms: u64,
    /// Upper bound for a plugin's `deactivate()`.
    pub deactivation_timeout_ms: u64,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_ACTIVATION_TIMEOUT_MS,
            deactivation_timeout_ms: DEFAULT_DEACTIVATION_TIMEOUT_MS,
        }
    }
}

/// Per-plugin switches kept by the host rather than the package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Plugin ids that are discovered but never loaded or activated.
    pub disabled: Vec<String>,
    /// Permissions granted to each plugin id.
    pub permissions: BTreeMap<String, Vec<String>>,
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: PluginHostConfig = toml::from_str("").unwrap();
        assert_eq!(config, PluginHostConfig::default());
        assert_eq!(config.discovery.manifest_file, "plugin.json");
        assert!(config.discovery.auto_migrate);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: PluginHostConfig = toml::from_str(
            r#"
[host]
version = "2.1.0"

[activation]
timeout_ms = 250
"#,
        )
        .unwrap();
        assert_eq!(config.host.version, "2.1.0");
        assert_eq!(config.activation.timeout_ms, 250);
        assert_eq!(
            config.activation.deactivation_timeout_ms,
            DEFAULT_DEACTIVATION_TIMEOUT_MS
        );
    }

    #[test]
    fn plugin_switches_parse() {
        let config: PluginHostConfig = toml::from_str(
            r#"
[plugins]
disabled = ["noisy"]

[plugins.permissions]
"lokus.word-count" = ["read:files", "ui:statusbar"]
"#,
        )
        .unwrap();
        assert_eq!(config.plugins.disabled, vec!["noisy"]);
        assert_eq!(
            config.plugins.permissions["lokus.word-count"],
            vec!["read:files", "ui:statusbar"]
        );
        assert_eq!(config.activation, ActivationConfig::default());
    }

    #[test]
    fn absolute_plugin_dirs_are_untouched() {
        let discovery = DiscoveryConfig {
            plugin_dirs: vec![PathBuf::from("/srv/plugins")],
            ..DiscoveryConfig::default()
        };
        assert_eq!(
            discovery.resolved_plugin_dirs(),
            vec![PathBuf::from("/srv/plugins")]
        );
    }

    #[test]
    fn tilde_expands_to_home() {
        let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) else {
            return;
        };
        let resolved = DiscoveryConfig::default().resolved_plugin_dirs();
        assert_eq!(resolved, vec![home.join(".lokus/plugins")]);
    }
}
