//! Manifest validation.
//!
//! Validation runs on the raw JSON value rather than the typed structs so it
//! can report every problem at once, including fields serde would reject.
//! Unknown activation events, categories, permissions and capability keys
//! are warnings; structural problems are errors.

use std::{collections::HashSet, fmt};

use {
    serde::Serialize,
    serde_json::{Map, Value},
};

use crate::{
    activation::{ActivationEvent, ActivationKind},
    schema::{SchemaVersion, detect_schema_version},
};

/// Permission prefixes a v1 manifest may request.
pub const PERMISSION_PREFIXES: &[&str] = &[
    "read:",
    "write:",
    "execute:",
    "network:",
    "ui:",
    "storage:",
    "clipboard:",
    "filesystem:",
    "files:",
    "workspace:",
    "editor:",
    "commands:",
    "events:",
    "notifications:",
    "settings:",
    "themes:",
    "sidebar:",
    "toolbar:",
    "statusbar:",
];

pub const KNOWN_CATEGORIES: &[&str] = &[
    "AI",
    "Editor",
    "Export",
    "Formatters",
    "Import",
    "Integration",
    "Keymaps",
    "Linters",
    "Markdown",
    "Notes",
    "Other",
    "Productivity",
    "Programming Languages",
    "Snippets",
    "Sync",
    "Templates",
    "Testing",
    "Themes",
    "Utilities",
    "Visualization",
];

const KNOWN_CAPABILITY_KEYS: &[&str] = &["untrustedWorkspaces", "virtualWorkspaces", "permissions"];

pub fn is_known_permission(permission: &str) -> bool {
    PERMISSION_PREFIXES
        .iter()
        .any(|prefix| permission.starts_with(prefix))
}

/// Plugin ids are ASCII alphanumerics plus `.`, `-`, `_`, and can never
/// name a path outside the plugin root.
pub fn is_valid_plugin_id(id: &str) -> bool {
    !id.is_empty()
        && !id.contains("..")
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

// ── Report ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub field: String,
    pub message: String,
}

impl Diagnostic {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    /// `None` when the schema tag itself could not be determined.
    pub schema_version: Option<SchemaVersion>,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
}

impl ValidationReport {
    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }
}

#[derive(Default)]
struct Collector {
    errors: Vec<Diagnostic>,
    warnings: Vec<Diagnostic>,
}

impl Collector {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(Diagnostic::new(field, message));
    }

    fn warn(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(Diagnostic::new(field, message));
    }

    fn finish(self, schema_version: Option<SchemaVersion>) -> ValidationReport {
        ValidationReport {
            valid: self.errors.is_empty(),
            schema_version,
            errors: self.errors,
            warnings: self.warnings,
        }
    }
}

// ── Entry point ─────────────────────────────────────────────────────────────

/// Validate a raw manifest document against the schema its tag declares.
pub fn validate(document: &Value) -> ValidationReport {
    let mut out = Collector::default();

    let version = match detect_schema_version(document) {
        Ok(version) => version,
        Err(e) => {
            out.error("manifest", e.to_string());
            return out.finish(None);
        },
    };
    let Some(object) = document.as_object() else {
        out.error("manifest", "manifest must be a JSON object");
        return out.finish(None);
    };

    let id = check_identity(object, &mut out);
    check_activation_events(object, version, &mut out);
    check_categories(object, &mut out);
    check_dependencies(object, id.as_deref(), &mut out);

    match version {
        SchemaVersion::V1 => check_v1(object, &mut out),
        SchemaVersion::V2 => check_v2(object, &mut out),
    }

    out.finish(Some(version))
}

// ── Shared rules ────────────────────────────────────────────────────────────

fn required_string<'a>(object: &'a Map<String, Value>, field: &str, out: &mut Collector) -> Option<&'a str> {
    match object.get(field) {
        None | Some(Value::Null) => {
            out.error(field, "required field is missing");
            None
        },
        Some(Value::String(s)) if s.trim().is_empty() => {
            out.error(field, "must not be empty");
            None
        },
        Some(Value::String(s)) => Some(s.as_str()),
        Some(_) => {
            out.error(field, "must be a string");
            None
        },
    }
}

fn optional_string<'a>(object: &'a Map<String, Value>, field: &str, out: &mut Collector) -> Option<&'a str> {
    match object.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.as_str()),
        Some(_) => {
            out.error(field, "must be a string");
            None
        },
    }
}

fn string_list<'a>(object: &'a Map<String, Value>, field: &str, out: &mut Collector) -> Vec<(usize, &'a str)> {
    match object.get(field) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| match item {
                Value::String(s) => Some((i, s.as_str())),
                _ => {
                    out.error(format!("{field}[{i}]"), "must be a string");
                    None
                },
            })
            .collect(),
        Some(_) => {
            out.error(field, "must be an array of strings");
            Vec::new()
        },
    }
}

fn check_identity(object: &Map<String, Value>, out: &mut Collector) -> Option<String> {
    let id = required_string(object, "id", out).map(str::to_string);
    if let Some(id) = &id
        && !is_valid_plugin_id(id)
    {
        out.error(
            "id",
            format!("'{id}' may only contain letters, digits, '.', '-' and '_'"),
        );
    }

    required_string(object, "name", out);

    if let Some(version) = required_string(object, "version", out)
        && let Err(e) = semver::Version::parse(version.trim())
    {
        out.error("version", format!("'{version}' is not a semantic version: {e}"));
    }

    if optional_string(object, "description", out).is_none_or(|d| d.trim().is_empty()) {
        out.warn("description", "no description provided");
    }

    id
}

fn check_activation_events(object: &Map<String, Value>, version: SchemaVersion, out: &mut Collector) {
    let mut seen = HashSet::new();
    for (i, raw) in string_list(object, "activationEvents", out) {
        let field = format!("activationEvents[{i}]");
        let event = match raw.parse::<ActivationEvent>() {
            Ok(event) => event,
            Err(e) => {
                out.error(field, e.to_string());
                continue;
            },
        };

        if !seen.insert(event.clone()) {
            out.warn(field, format!("duplicate activation event '{event}'"));
            continue;
        }

        match (event.recognized_kind(), ActivationKind::from_event_name(event.kind())) {
            (Some(ActivationKind::Startup), _) if version == SchemaVersion::V2 => out.warn(
                field,
                "'onStartup' is a v1 event; use 'onStartupFinished'",
            ),
            (Some(_), _) => {},
            // Known kind with the wrong shape can never fire.
            (None, Some(kind)) if kind.takes_subject() => {
                let name = kind.event_name();
                out.error(field, format!("'{name}' requires a subject, e.g. '{name}:<id>'"));
            },
            (None, Some(kind)) => out.error(
                field,
                format!("'{}' does not take a subject", kind.event_name()),
            ),
            (None, None) => out.warn(field, format!("unrecognized activation event '{event}'")),
        }
    }
}

fn check_categories(object: &Map<String, Value>, out: &mut Collector) {
    for (i, category) in string_list(object, "categories", out) {
        if !KNOWN_CATEGORIES.contains(&category) {
            out.warn(
                format!("categories[{i}]"),
                format!("unrecognized category '{category}'"),
            );
        }
    }
}

fn check_dependencies(object: &Map<String, Value>, own_id: Option<&str>, out: &mut Collector) {
    let entries: Vec<(String, Option<&str>)> = match object.get("dependencies") {
        None | Some(Value::Null) => return,
        Some(Value::Array(_)) => string_list(object, "dependencies", out)
            .into_iter()
            .map(|(_, id)| (id.to_string(), None))
            .collect(),
        Some(Value::Object(map)) => map
            .iter()
            .filter_map(|(id, range)| match range {
                Value::String(range) => Some((id.clone(), Some(range.as_str()))),
                _ => {
                    out.error(format!("dependencies.{id}"), "version range must be a string");
                    None
                },
            })
            .collect(),
        Some(_) => {
            out.error("dependencies", "must be a list of plugin ids or an {id: range} map");
            return;
        },
    };

    for (id, range) in entries {
        let field = format!("dependencies.{id}");
        if !is_valid_plugin_id(&id) {
            out.error(field.clone(), format!("'{id}' is not a valid plugin id"));
        }
        if own_id == Some(id.as_str()) {
            out.error(field.clone(), "a plugin cannot depend on itself");
        }
        if let Some(range) = range
            && let Err(e) = semver::VersionReq::parse(range.trim())
        {
            out.error(field, format!("'{range}' is not a version range: {e}"));
        }
    }
}

// ── Per-schema rules ────────────────────────────────────────────────────────

fn check_v1(object: &Map<String, Value>, out: &mut Collector) {
    required_string(object, "main", out);

    if optional_string(object, "author", out).is_none_or(|a| a.trim().is_empty()) {
        out.warn("author", "no author provided");
    }

    match optional_string(object, "lokusVersion", out) {
        Some(range) => {
            if let Err(e) = semver::VersionReq::parse(range.trim()) {
                out.error("lokusVersion", format!("'{range}' is not a version range: {e}"));
            }
        },
        None => out.warn("lokusVersion", "no host range declared; any host version is accepted"),
    }

    for (i, permission) in string_list(object, "permissions", out) {
        if !is_known_permission(permission) {
            out.warn(
                format!("permissions[{i}]"),
                format!("unrecognized permission '{permission}'"),
            );
        }
    }
}

fn check_v2(object: &Map<String, Value>, out: &mut Collector) {
    match object.get("engines") {
        None | Some(Value::Null) => out.error("engines", "required field is missing"),
        Some(Value::Object(engines)) => match engines.get("host") {
            Some(Value::String(range)) => {
                if let Err(e) = semver::VersionReq::parse(range.trim()) {
                    out.error("engines.host", format!("'{range}' is not a version range: {e}"));
                }
            },
            Some(_) => out.error("engines.host", "must be a string"),
            None => out.error("engines.host", "required field is missing"),
        },
        Some(_) => out.error("engines", "must be an object"),
    }

    if optional_string(object, "publisher", out).is_none_or(|p| p.trim().is_empty()) {
        out.warn("publisher", "no publisher provided");
    }
    optional_string(object, "main", out);

    match object.get("capabilities") {
        None | Some(Value::Null) => {},
        Some(Value::Object(capabilities)) => check_capabilities(capabilities, out),
        Some(_) => out.error("capabilities", "must be an object"),
    }
}

fn check_capabilities(capabilities: &Map<String, Value>, out: &mut Collector) {
    for key in ["untrustedWorkspaces", "virtualWorkspaces"] {
        if let Some(value) = capabilities.get(key)
            && !value.is_boolean()
        {
            out.error(format!("capabilities.{key}"), "must be a boolean");
        }
    }

    for (i, permission) in string_list(capabilities, "permissions", out) {
        if !is_known_permission(permission) {
            out.warn(
                format!("capabilities.permissions[{i}]"),
                format!("unrecognized permission '{permission}'"),
            );
        }
    }

    for key in capabilities.keys() {
        if !KNOWN_CAPABILITY_KEYS.contains(&key.as_str()) {
            out.warn(
                format!("capabilities.{key}"),
                format!("unrecognized capability '{key}'"),
            );
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest, serde_json::json};

    fn v2(events: Value) -> Value {
        json!({
            "manifest": "2.0",
            "id": "lokus.word-count",
            "name": "Word Count",
            "version": "1.2.0",
            "publisher": "lokus",
            "description": "Counts words",
            "engines": {"host": "^1.0.0"},
            "activationEvents": events,
            "categories": ["Productivity"],
        })
    }

    #[test]
    fn clean_v2_has_no_diagnostics() {
        let report = validate(&v2(json!(["onStartupFinished", "onCommand:wc.count"])));
        assert!(report.valid, "{:?}", report.errors);
        assert!(report.errors.is_empty());
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert_eq!(report.schema_version, Some(SchemaVersion::V2));
    }

    #[test]
    fn unknown_event_is_a_single_warning() {
        let report = validate(&v2(json!(["onFooBar:x"])));
        assert!(report.valid);
        assert!(report.errors.is_empty());
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].field, "activationEvents[0]");
    }

    #[rstest]
    #[case("engines")]
    #[case("id")]
    #[case("name")]
    fn missing_required_v2_field_is_an_error(#[case] field: &str) {
        let mut doc = v2(json!([]));
        doc.as_object_mut().unwrap().remove(field);
        let report = validate(&doc);
        assert!(!report.valid);
        assert!(report.errors.iter().any(|d| d.field == field), "{:?}", report.errors);
    }

    #[test]
    fn bad_versions_and_ids_are_errors() {
        let mut doc = v2(json!([]));
        let obj = doc.as_object_mut().unwrap();
        obj.insert("version".into(), json!("one"));
        obj.insert("id".into(), json!("../escape"));
        obj.insert("engines".into(), json!({"host": ">>1"}));

        let fields: Vec<_> = validate(&doc).errors.into_iter().map(|d| d.field).collect();
        assert!(fields.contains(&"version".to_string()));
        assert!(fields.contains(&"id".to_string()));
        assert!(fields.contains(&"engines.host".to_string()));
    }

    #[test]
    fn unknown_category_and_capability_warn() {
        let mut doc = v2(json!([]));
        let obj = doc.as_object_mut().unwrap();
        obj.insert("categories".into(), json!(["Astrology"]));
        obj.insert("capabilities".into(), json!({"untrustedWorkspaces": true, "telemetry": true}));

        let report = validate(&doc);
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 2);
    }

    #[test]
    fn non_boolean_capability_is_an_error() {
        let mut doc = v2(json!([]));
        doc.as_object_mut()
            .unwrap()
            .insert("capabilities".into(), json!({"virtualWorkspaces": "yes"}));
        assert!(!validate(&doc).valid);
    }

    #[test]
    fn self_dependency_is_rejected() {
        let mut doc = v2(json!([]));
        doc.as_object_mut()
            .unwrap()
            .insert("dependencies".into(), json!(["lokus.word-count"]));
        let report = validate(&doc);
        assert!(!report.valid);
        assert_eq!(report.errors[0].field, "dependencies.lokus.word-count");
    }

    #[test]
    fn dependency_map_ranges_are_checked() {
        let mut doc = v2(json!([]));
        doc.as_object_mut()
            .unwrap()
            .insert("dependencies".into(), json!({"core": "^1", "ui": "not a range"}));
        let report = validate(&doc);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].field, "dependencies.ui");
    }

    #[rstest]
    #[case("onCommand")]
    #[case("onView")]
    #[case("onStartupFinished:x")]
    #[case("onUri:somewhere")]
    fn known_event_with_wrong_subject_is_an_error(#[case] event: &str) {
        let report = validate(&v2(json!([event])));
        assert!(!report.valid, "{event} should be rejected");
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].field, "activationEvents[0]");
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    }

    #[rstest]
    #[case("read:", true)]
    #[case("read:files", true)]
    #[case("statusbar:", true)]
    #[case("read", false)]
    #[case("teleport:anywhere", false)]
    fn permission_prefixes(#[case] permission: &str, #[case] known: bool) {
        assert_eq!(is_known_permission(permission), known);
    }

    #[test]
    fn legacy_startup_in_v2_warns() {
        let report = validate(&v2(json!(["onStartup"])));
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn v1_requires_main_and_checks_permissions() {
        let report = validate(&json!({
            "id": "legacy",
            "name": "Legacy",
            "version": "0.1.0",
            "description": "Old",
            "author": "someone",
            "lokusVersion": "^1.0.0",
            "permissions": ["read:files", "teleport:anywhere"],
        }));
        assert_eq!(report.schema_version, Some(SchemaVersion::V1));
        assert!(!report.valid);
        assert_eq!(report.errors[0].field, "main");
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].field, "permissions[1]");
    }

    #[test]
    fn unsupported_tag_is_reported_not_panicked() {
        let report = validate(&json!({"manifest": "9"}));
        assert!(!report.valid);
        assert_eq!(report.schema_version, None);
    }

    #[rstest]
    #[case("lokus.outline", true)]
    #[case("my_plugin-2", true)]
    #[case("", false)]
    #[case("a..b", false)]
    #[case("a/b", false)]
    #[case("a\\b", false)]
    #[case("has space", false)]
    fn plugin_id_charset(#[case] id: &str, #[case] ok: bool) {
        assert_eq!(is_valid_plugin_id(id), ok);
    }
}
