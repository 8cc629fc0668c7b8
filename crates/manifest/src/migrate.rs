//! v1 to v2 manifest migration.
//!
//! Migration is a pure function of the v1 document: the input is never
//! touched and every transformation is recorded in the returned log.

use std::collections::HashSet;

use {serde::Serialize, tracing::debug};

use crate::{
    activation::{ActivationEvent, ActivationKind},
    error::{Error, Result},
    schema::{Capabilities, Engines, MANIFEST_V2_TAG, ManifestV1, ManifestV2},
    validate::{is_known_permission, validate},
};

/// Permissions that make a plugin unsafe to run in an untrusted workspace.
const SENSITIVE_PREFIXES: &[&str] = &[
    "write:",
    "execute:",
    "network:",
    "filesystem:",
    "files:",
    "clipboard:",
];

/// Permissions that need a real local filesystem.
const LOCAL_ONLY_PREFIXES: &[&str] = &["filesystem:", "files:", "execute:"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Upgradeability {
    pub upgradeable: bool,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStep {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationOutcome {
    pub manifest: ManifestV2,
    pub log: Vec<MigrationStep>,
}

/// A v1 manifest can be upgraded when it has `id`, `name`, `version` and
/// `main`.
pub fn can_migrate(v1: &ManifestV1) -> Upgradeability {
    let reasons: Vec<String> = [
        ("id", &v1.id),
        ("name", &v1.name),
        ("version", &v1.version),
        ("main", &v1.main),
    ]
    .into_iter()
    .filter(|(_, value)| value.trim().is_empty())
    .map(|(field, _)| format!("missing required v1 field '{field}'"))
    .collect();

    Upgradeability {
        upgradeable: reasons.is_empty(),
        reasons,
    }
}

/// Produce a new v2 manifest from `v1`. The result is validated before it
/// is returned.
pub fn migrate(v1: &ManifestV1) -> Result<MigrationOutcome> {
    let check = can_migrate(v1);
    if !check.upgradeable {
        return Err(Error::Migration {
            reasons: check.reasons,
        });
    }

    let mut log = Vec::new();
    let mut step = |field: &str, message: String| {
        log.push(MigrationStep {
            field: field.to_string(),
            message,
        });
    };

    let host = match v1.lokus_version.as_deref().map(str::trim) {
        Some(range) if !range.is_empty() => {
            step("engines.host", format!("copied from lokusVersion '{range}'"));
            range.to_string()
        },
        _ => {
            step("engines.host", "no lokusVersion declared, set to '*'".into());
            "*".to_string()
        },
    };

    let activation_events = migrate_activation_events(&v1.activation_events, &mut step);
    let capabilities = migrate_permissions(&v1.permissions, &mut step);

    let publisher = v1.author.trim().to_string();
    if publisher.is_empty() {
        step("publisher", "no author declared, publisher left empty".into());
    } else {
        step("publisher", format!("copied from author '{publisher}'"));
    }
    step("manifest", format!("tagged as schema {MANIFEST_V2_TAG}"));

    let manifest = ManifestV2 {
        manifest: MANIFEST_V2_TAG.to_string(),
        id: v1.id.clone(),
        name: v1.name.clone(),
        version: v1.version.clone(),
        publisher,
        description: v1.description.clone(),
        main: Some(v1.main.clone()),
        engines: Engines { host },
        activation_events,
        categories: v1.categories.clone(),
        capabilities,
        dependencies: v1.dependencies.clone(),
        contributes: v1.contributes.clone(),
        metadata: v1.metadata.clone(),
    };

    let report = validate(&manifest.to_value()?);
    if !report.valid {
        return Err(Error::Migration {
            reasons: report.error_messages(),
        });
    }

    debug!(plugin = %manifest.id, steps = log.len(), "migrated v1 manifest to v2");
    Ok(MigrationOutcome { manifest, log })
}

fn migrate_activation_events(
    events: &[ActivationEvent],
    step: &mut impl FnMut(&str, String),
) -> Vec<ActivationEvent> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(events.len());

    for event in events {
        let mapped = if event.recognized_kind() == Some(ActivationKind::Startup) {
            step(
                "activationEvents",
                "rewrote legacy 'onStartup' to 'onStartupFinished'".into(),
            );
            ActivationEvent::of(ActivationKind::StartupFinished, None)
        } else {
            event.clone()
        };

        if seen.insert(mapped.clone()) {
            out.push(mapped);
        } else {
            step("activationEvents", format!("dropped duplicate '{mapped}'"));
        }
    }
    out
}

fn migrate_permissions(permissions: &[String], step: &mut impl FnMut(&str, String)) -> Capabilities {
    let has_prefix = |p: &str, prefixes: &[&str]| prefixes.iter().any(|pre| p.starts_with(pre));

    let mut recognized = Vec::new();
    let mut denied = false;
    for permission in permissions {
        if is_known_permission(permission) {
            recognized.push(permission.clone());
        } else {
            denied = true;
            step(
                "capabilities",
                format!("permission '{permission}' is not recognized and was dropped"),
            );
        }
    }

    let sensitive = recognized.iter().any(|p| has_prefix(p, SENSITIVE_PREFIXES));
    let untrusted_workspaces = !denied && !sensitive;
    let virtual_workspaces = !recognized.iter().any(|p| has_prefix(p, LOCAL_ONLY_PREFIXES));

    step(
        "capabilities.untrustedWorkspaces",
        format!("set to {untrusted_workspaces}"),
    );
    step(
        "capabilities.virtualWorkspaces",
        format!("set to {virtual_workspaces}"),
    );
    if !recognized.is_empty() {
        step(
            "capabilities.permissions",
            format!("carried over {} permission(s)", recognized.len()),
        );
    }

    Capabilities {
        untrusted_workspaces,
        virtual_workspaces,
        permissions: recognized,
        other: Default::default(),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn legacy(permissions: &[&str]) -> ManifestV1 {
        ManifestV1 {
            id: "lokus.tasks".into(),
            name: "Tasks".into(),
            version: "0.4.1".into(),
            main: "dist/index.js".into(),
            description: "Task lists".into(),
            author: "Lokus Team".into(),
            lokus_version: Some("^1.0.0".into()),
            activation_events: vec![
                "onStartup".parse().unwrap(),
                "onCommand:tasks.toggle".parse().unwrap(),
            ],
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            ..ManifestV1::default()
        }
    }

    #[test]
    fn maps_engines_events_and_publisher() {
        let v1 = legacy(&["read:files"]);
        let before = v1.clone();
        let outcome = migrate(&v1).unwrap();
        let v2 = outcome.manifest;

        assert_eq!(v1, before, "input must not change");
        assert_eq!(v2.manifest, "2.0");
        assert_eq!(v2.engines.host, "^1.0.0");
        assert_eq!(v2.publisher, "Lokus Team");
        assert_eq!(v2.main.as_deref(), Some("dist/index.js"));
        assert_eq!(
            v2.activation_events,
            vec![
                "onStartupFinished".parse::<ActivationEvent>().unwrap(),
                "onCommand:tasks.toggle".parse().unwrap(),
            ]
        );
        assert!(outcome.log.iter().any(|s| s.message.contains("onStartupFinished")));
    }

    #[rstest]
    #[case(&[], true, true)]
    #[case(&["read:files", "ui:panel"], true, true)]
    #[case(&["network:fetch"], false, true)]
    #[case(&["filesystem:read"], false, false)]
    #[case(&["read:files", "launch:rockets"], false, true)]
    fn permissions_map_to_capabilities(
        #[case] permissions: &[&str],
        #[case] untrusted: bool,
        #[case] virtual_ws: bool,
    ) {
        let caps = migrate(&legacy(permissions)).unwrap().manifest.capabilities;
        assert_eq!(caps.untrusted_workspaces, untrusted);
        assert_eq!(caps.virtual_workspaces, virtual_ws);
        assert!(caps.permissions.iter().all(|p| is_known_permission(p)));
    }

    #[test]
    fn missing_lokus_version_becomes_wildcard() {
        let mut v1 = legacy(&[]);
        v1.lokus_version = None;
        let outcome = migrate(&v1).unwrap();
        assert_eq!(outcome.manifest.engines.host, "*");
        assert!(outcome.log.iter().any(|s| s.field == "engines.host"));
    }

    #[test]
    fn duplicate_startup_events_collapse() {
        let mut v1 = legacy(&[]);
        v1.activation_events = vec![
            "onStartup".parse().unwrap(),
            "onStartupFinished".parse().unwrap(),
        ];
        let v2 = migrate(&v1).unwrap().manifest;
        assert_eq!(v2.activation_events.len(), 1);
    }

    #[test]
    fn incomplete_v1_is_not_upgradeable() {
        let mut v1 = legacy(&[]);
        v1.main.clear();
        v1.id.clear();

        let check = can_migrate(&v1);
        assert!(!check.upgradeable);
        assert_eq!(check.reasons.len(), 2);

        let err = migrate(&v1).unwrap_err();
        assert!(matches!(err, Error::Migration { reasons } if reasons.len() == 2));
    }

    #[test]
    fn invalid_result_is_rejected() {
        let mut v1 = legacy(&[]);
        v1.version = "not-semver".into();
        assert!(matches!(migrate(&v1), Err(Error::Migration { .. })));
    }
}
