//! Plugin manifest documents: the tagged v1/v2 schema, activation event
//! grammar, validation, v1 to v2 migration and v2 templates.
//!
//! ```text
//! plugin.json ──► detect_schema_version ──► validate ──► Manifest::{V1,V2}
//!                                                          │
//!                                             V1 ──► migrate ──► ManifestV2
//! ```

pub mod accept;
pub mod activation;
pub mod error;
pub mod migrate;
pub mod schema;
pub mod template;
pub mod validate;

pub use {
    accept::{AcceptedManifest, accept, accept_str},
    activation::{ActivationEvent, ActivationKind, ParseActivationEventError},
    error::{Error, Result},
    migrate::{MigrationOutcome, MigrationStep, Upgradeability, can_migrate, migrate},
    schema::{
        Capabilities, Dependencies, Engines, MANIFEST_FILE_NAME, MANIFEST_V2_TAG, Manifest,
        ManifestV1, ManifestV2, PackageMetadata, SchemaVersion, detect_schema_version,
        parse_manifest,
    },
    template::{TemplateOptions, create_template},
    validate::{Diagnostic, ValidationReport, is_known_permission, is_valid_plugin_id, validate},
};
