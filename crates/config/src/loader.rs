use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::PluginHostConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "lokus-plugins.toml",
    "lokus-plugins.yaml",
    "lokus-plugins.yml",
    "lokus-plugins.json",
];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<PluginHostConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations, then apply env
/// overrides.
///
/// Search order:
/// 1. `./lokus-plugins.{toml,yaml,yml,json}` (project-local)
/// 2. `<user config dir>/lokus/lokus-plugins.{toml,yaml,yml,json}`
///
/// Falls back to `PluginHostConfig::default()` if nothing is found or the
/// file fails to parse.
pub fn discover_and_load() -> PluginHostConfig {
    let mut config = match find_config_file() {
        Some(path) => {
            debug!(path = %path.display(), "loading plugin host config");
            load_config(&path).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                PluginHostConfig::default()
            })
        },
        None => {
            debug!("no plugin host config found, using defaults");
            PluginHostConfig::default()
        },
    };
    apply_env_overrides(&mut config);
    config
}

/// Apply `LOKUS_*` environment overrides on top of a loaded config.
pub fn apply_env_overrides(config: &mut PluginHostConfig) {
    apply_env_overrides_with(config, |name| std::env::var(name).ok());
}

fn apply_env_overrides_with(config: &mut PluginHostConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(version) = lookup("LOKUS_HOST_VERSION").filter(|v| !v.trim().is_empty()) {
        config.host.version = version.trim().to_string();
    }

    if let Some(dirs) = lookup("LOKUS_PLUGIN_DIRS").filter(|v| !v.trim().is_empty()) {
        config.discovery.plugin_dirs = std::env::split_paths(&dirs).collect();
    }

    if let Some(raw) = lookup("LOKUS_ACTIVATION_TIMEOUT_MS") {
        match raw.trim().parse::<u64>() {
            Ok(ms) => config.activation.timeout_ms = ms,
            Err(e) => warn!(value = %raw, error = %e, "ignoring invalid LOKUS_ACTIVATION_TIMEOUT_MS"),
        }
    }
}

fn find_config_file() -> Option<PathBuf> {
    let local = CONFIG_FILENAMES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists());
    if local.is_some() {
        return local;
    }

    let dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the user-global config directory (`~/.config/lokus/` on Linux).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "lokus").map(|d| d.config_dir().to_path_buf())
}

/// Returns the path of an existing config file, or the default TOML path.
pub fn find_or_default_config_path() -> PathBuf {
    if let Some(path) = find_config_file() {
        return path;
    }
    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_FILENAMES[0])
}

/// Serialize `config` to TOML at `path`, creating parent directories.
pub fn save_config(config: &PluginHostConfig, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str =
        toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("serialize config: {e}"))?;
    std::fs::write(path, toml_str)?;
    debug!(path = %path.display(), "saved plugin host config");
    Ok(())
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<PluginHostConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_each_supported_format() {
        let tmp = tempfile::tempdir().unwrap();

        let toml_path = tmp.path().join("lokus-plugins.toml");
        std::fs::write(&toml_path, "[activation]\ntimeout_ms = 42\n").unwrap();
        assert_eq!(load_config(&toml_path).unwrap().activation.timeout_ms, 42);

        let yaml_path = tmp.path().join("lokus-plugins.yaml");
        std::fs::write(&yaml_path, "host:\n  version: 3.0.0\n").unwrap();
        assert_eq!(load_config(&yaml_path).unwrap().host.version, "3.0.0");

        let json_path = tmp.path().join("lokus-plugins.json");
        std::fs::write(&json_path, r#"{"discovery":{"auto_migrate":false}}"#).unwrap();
        assert!(!load_config(&json_path).unwrap().discovery.auto_migrate);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("lokus-plugins.ini");
        std::fs::write(&path, "").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported config format"));
    }

    #[test]
    fn save_then_load_preserves_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/lokus-plugins.toml");
        let mut config = PluginHostConfig::default();
        config.activation.timeout_ms = 1234;
        config.discovery.plugin_dirs = vec![PathBuf::from("/srv/plugins")];

        save_config(&config, &path).unwrap();
        assert_eq!(load_config(&path).unwrap(), config);
    }

    #[test]
    fn env_overrides_replace_fields() {
        let mut config = PluginHostConfig::default();
        let joined = std::env::join_paths(["/a", "/b"]).unwrap();
        let joined = joined.to_string_lossy().into_owned();
        apply_env_overrides_with(&mut config, |name| match name {
            "LOKUS_HOST_VERSION" => Some(" 1.4.2 ".into()),
            "LOKUS_PLUGIN_DIRS" => Some(joined.clone()),
            "LOKUS_ACTIVATION_TIMEOUT_MS" => Some("75".into()),
            _ => None,
        });

        assert_eq!(config.host.version, "1.4.2");
        assert_eq!(
            config.discovery.plugin_dirs,
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
        );
        assert_eq!(config.activation.timeout_ms, 75);
    }

    #[test]
    fn invalid_timeout_override_is_ignored() {
        let mut config = PluginHostConfig::default();
        apply_env_overrides_with(&mut config, |name| {
            (name == "LOKUS_ACTIVATION_TIMEOUT_MS").then(|| "soon".to_string())
        });
        assert_eq!(config, PluginHostConfig::default());
    }
}
