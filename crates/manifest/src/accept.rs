//! One-stop intake used by discovery: validate, parse, migrate.

use {serde::Serialize, serde_json::Value};

use crate::{
    error::{Error, Result},
    migrate::{MigrationStep, migrate},
    schema::{Manifest, ManifestV2, SchemaVersion},
    validate::{Diagnostic, validate},
};

/// A manifest admitted into the runtime. Always v2.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcceptedManifest {
    pub manifest: ManifestV2,
    pub original_schema: SchemaVersion,
    pub warnings: Vec<Diagnostic>,
    /// Empty unless the document was migrated from v1.
    pub migration_log: Vec<MigrationStep>,
}

/// Validate `document` against its declared schema and bring it to v2.
///
/// With `allow_migration` off, a valid v1 document is refused with
/// [`Error::Migration`].
pub fn accept(document: &Value, allow_migration: bool) -> Result<AcceptedManifest> {
    let report = validate(document);
    if !report.valid {
        return Err(Error::Invalid {
            errors: report.error_messages(),
        });
    }

    match Manifest::from_value(document.clone())? {
        Manifest::V2(manifest) => Ok(AcceptedManifest {
            manifest,
            original_schema: SchemaVersion::V2,
            warnings: report.warnings,
            migration_log: Vec::new(),
        }),
        Manifest::V1(_) if !allow_migration => Err(Error::Migration {
            reasons: vec!["v1 manifest found and automatic migration is disabled".into()],
        }),
        Manifest::V1(v1) => {
            let outcome = migrate(&v1)?;
            Ok(AcceptedManifest {
                manifest: outcome.manifest,
                original_schema: SchemaVersion::V1,
                warnings: report.warnings,
                migration_log: outcome.log,
            })
        },
    }
}

/// [`accept`] for raw `plugin.json` text.
pub fn accept_str(raw: &str, allow_migration: bool) -> Result<AcceptedManifest> {
    let document: Value = serde_json::from_str(raw)?;
    accept(&document, allow_migration)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    const V1: &str = r#"{
        "id": "lokus.legacy",
        "name": "Legacy",
        "version": "1.0.0",
        "main": "index.js",
        "description": "Old plugin",
        "author": "lokus",
        "lokusVersion": "^1.0.0",
        "activationEvents": ["onStartup"]
    }"#;

    #[test]
    fn v1_is_migrated_when_allowed() {
        let accepted = accept_str(V1, true).unwrap();
        assert_eq!(accepted.original_schema, SchemaVersion::V1);
        assert_eq!(accepted.manifest.engines.host, "^1.0.0");
        assert!(!accepted.migration_log.is_empty());
    }

    #[test]
    fn v1_is_refused_without_migration() {
        assert!(matches!(accept_str(V1, false), Err(Error::Migration { .. })));
    }

    #[test]
    fn syntax_errors_surface_as_json() {
        assert!(matches!(accept_str("{ not json", true), Err(Error::Json(_))));
    }

    #[test]
    fn invalid_documents_list_their_errors() {
        let err = accept_str(r#"{"manifest": "2.0", "id": "x"}"#, true).unwrap_err();
        let Error::Invalid { errors } = &err else {
            panic!("expected Invalid, got {err:?}");
        };
        assert!(errors.iter().any(|e| e.starts_with("engines")));
        assert!(errors.iter().any(|e| e.starts_with("name")));
    }
}
