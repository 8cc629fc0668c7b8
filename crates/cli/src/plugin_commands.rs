//! CLI commands for inspecting plugin packages.
//!
//! Nothing here executes plugin code: discovery runs against a loader that
//! refuses to instantiate modules.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    anyhow::{Context, Result},
    async_trait::async_trait,
    clap::Subcommand,
    lokus_config::PluginHostConfig,
    lokus_manifest::{Manifest, ManifestV2, ValidationReport},
    lokus_plugins::{
        FsManifestSource, PluginInstance, PluginLoader, PluginManager, PluginSnapshot,
        PluginStatus,
    },
    serde_json::Value,
};

/// ANSI color codes.
pub const RED: &str = "\x1b[31m";
pub const YELLOW: &str = "\x1b[33m";
pub const GREEN: &str = "\x1b[32m";
pub const BOLD: &str = "\x1b[1m";
pub const RESET: &str = "\x1b[0m";

#[derive(Subcommand)]
pub enum PluginAction {
    /// Validate a plugin manifest and report errors and warnings.
    Validate {
        /// Manifest file, or a package directory containing one.
        manifest: PathBuf,
        /// Output the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Upgrade a v1 manifest to v2 and print the result.
    Migrate {
        /// Manifest file, or a package directory containing one.
        manifest: PathBuf,
        /// Write the migrated manifest here instead of stdout.
        #[arg(long)]
        write: Option<PathBuf>,
    },
    /// List plugins found in the configured plugin directories.
    List {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print the dependency load order of the configured plugins.
    Order,
}

pub async fn handle_plugin(action: PluginAction, config: &PluginHostConfig) -> Result<()> {
    match action {
        PluginAction::Validate { manifest, json } => {
            validate(&manifest_path(&manifest, config), json)
        },
        PluginAction::Migrate { manifest, write } => {
            migrate(&manifest_path(&manifest, config), write.as_deref())
        },
        PluginAction::List { json } => list(config, json).await,
        PluginAction::Order => order(config).await,
    }
}

fn manifest_path(path: &Path, config: &PluginHostConfig) -> PathBuf {
    if path.is_dir() {
        path.join(&config.discovery.manifest_file)
    } else {
        path.to_path_buf()
    }
}

fn read_document(path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("{} is not valid JSON", path.display()))
}

// ── validate ────────────────────────────────────────────────────────────────

fn validate(path: &Path, json: bool) -> Result<()> {
    let document = read_document(path)?;
    let report = lokus_manifest::validate(&document);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(path, &report);
    }

    if !report.valid {
        std::process::exit(1);
    }
    Ok(())
}

fn print_report(path: &Path, report: &ValidationReport) {
    let schema = report
        .schema_version
        .map_or_else(|| "unknown".to_string(), |v| v.to_string());
    eprintln!("Checking {} (schema {schema})\n", path.display());

    for d in &report.errors {
        eprintln!("  {BOLD}{RED}error{RESET} {d}");
    }
    for d in &report.warnings {
        eprintln!("  {BOLD}{YELLOW}warning{RESET} {d}");
    }
    if !report.errors.is_empty() || !report.warnings.is_empty() {
        eprintln!();
    }

    if report.valid {
        eprintln!(
            "{GREEN}valid{RESET}, {} warning(s)",
            report.warnings.len()
        );
    } else {
        eprintln!(
            "{} error(s), {} warning(s)",
            report.errors.len(),
            report.warnings.len()
        );
    }
}

// ── migrate ─────────────────────────────────────────────────────────────────

fn migrate(path: &Path, write: Option<&Path>) -> Result<()> {
    let document = read_document(path)?;
    let manifest = Manifest::from_value(document)?;

    let v2 = match manifest {
        Manifest::V2(v2) => {
            eprintln!("{} is already a v2 manifest.", path.display());
            v2
        },
        Manifest::V1(v1) => {
            let upgrade = lokus_manifest::can_migrate(&v1);
            if !upgrade.upgradeable {
                for reason in &upgrade.reasons {
                    eprintln!("  {BOLD}{RED}error{RESET} {reason}");
                }
                std::process::exit(1);
            }
            let outcome = lokus_manifest::migrate(&v1)?;
            for step in &outcome.log {
                eprintln!("  {} {}", step.field, step.message);
            }
            outcome.manifest
        },
    };

    let rendered = render(&v2)?;
    match write {
        Some(out) => {
            std::fs::write(out, format!("{rendered}\n"))
                .with_context(|| format!("failed to write {}", out.display()))?;
            eprintln!("Wrote {}", out.display());
        },
        None => println!("{rendered}"),
    }
    Ok(())
}

fn render(manifest: &ManifestV2) -> Result<String> {
    Ok(serde_json::to_string_pretty(&manifest.to_value()?)?)
}

// ── list / order ────────────────────────────────────────────────────────────

/// Loader for inspection runs; discovery never asks it for anything.
struct InspectOnly;

#[async_trait]
impl PluginLoader for InspectOnly {
    async fn load_module(
        &self,
        manifest: &ManifestV2,
        _path: &Path,
    ) -> Result<Arc<dyn PluginInstance>> {
        anyhow::bail!(
            "lokus-host does not execute plugin code (asked to load '{}')",
            manifest.id
        )
    }
}

async fn discover(config: &PluginHostConfig) -> Result<(PluginManager, Vec<PluginSnapshot>)> {
    let manager = PluginManager::new(
        Arc::new(InspectOnly),
        Arc::new(FsManifestSource::new(config.discovery.manifest_file.clone())),
        lokus_plugins::ManagerOptions::from_config(config)?,
    );
    let snapshots = manager
        .scan(&config.discovery.resolved_plugin_dirs())
        .await;
    Ok((manager, snapshots))
}

async fn list(config: &PluginHostConfig, json: bool) -> Result<()> {
    let (_, snapshots) = discover(config).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
        return Ok(());
    }

    if snapshots.is_empty() {
        println!("No plugins found.");
        for dir in config.discovery.resolved_plugin_dirs() {
            println!(
                "Place packages in {}/<name>/{}",
                dir.display(),
                config.discovery.manifest_file
            );
        }
        return Ok(());
    }

    for s in &snapshots {
        let mark = if s.status == PluginStatus::Error {
            format!("{RED}✗{RESET}")
        } else {
            format!("{GREEN}✓{RESET}")
        };
        println!(
            "  {mark} {id} {version} [{schema}]",
            id = s.id,
            version = s.version.as_deref().unwrap_or("?"),
            schema = s
                .original_schema
                .map_or_else(|| "-".to_string(), |v| v.to_string()),
        );
        if !s.enabled {
            println!("    ↳ disabled");
        }
        if let Some(error) = &s.error {
            println!("    ↳ {error}");
        }
        if !s.dependencies.is_empty() {
            println!("    ↳ depends on: {}", s.dependencies.join(", "));
        }
    }
    Ok(())
}

async fn order(config: &PluginHostConfig) -> Result<()> {
    let (manager, _) = discover(config).await?;
    let plan = manager.load_plan();

    for (i, id) in plan.order.iter().enumerate() {
        println!("{:>3}. {id}", i + 1);
    }
    for cycle in &plan.cycles {
        println!("  {BOLD}{RED}cycle{RESET} {}", cycle.join(" -> "));
    }
    for id in &plan.blocked {
        println!("  {BOLD}{YELLOW}blocked{RESET} {id} (depends on a cycle)");
    }
    for (id, missing) in &plan.missing {
        println!("  {BOLD}{YELLOW}missing{RESET} {id} requires '{missing}'");
    }
    Ok(())
}
