//! Tagged manifest documents.
//!
//! A `plugin.json` is either a v1 document (untagged or `"manifest": "1.0"`)
//! or a v2 document (`"manifest": "2.0"`). Each tag has its own struct; the
//! two are never mixed.

use std::{collections::BTreeMap, fmt};

use {
    serde::{Deserialize, Deserializer, Serialize},
    serde_json::{Map, Value},
};

use crate::{
    activation::ActivationEvent,
    error::{Error, Result},
};

/// Manifest file name inside each plugin package.
pub const MANIFEST_FILE_NAME: &str = "plugin.json";

/// Schema tag written into every v2 document.
pub const MANIFEST_V2_TAG: &str = "2.0";

// ── Schema version ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaVersion {
    V1,
    V2,
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::V1 => "v1",
            Self::V2 => "v2",
        })
    }
}

/// Determine which schema a raw document claims.
///
/// A document with no tag is v1, unless it already uses the v2-only
/// `engines` block without v1's `lokusVersion`, in which case it is
/// rejected as ambiguous.
pub fn detect_schema_version(value: &Value) -> Result<SchemaVersion> {
    let object = value.as_object().ok_or(Error::NotAnObject)?;

    let Some(tag) = object.get("manifest") else {
        if object.contains_key("engines") && !object.contains_key("lokusVersion") {
            return Err(Error::UntaggedDocument);
        }
        return Ok(SchemaVersion::V1);
    };

    let tag = match tag {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };
    match tag.as_str() {
        "2" | "2.0" => Ok(SchemaVersion::V2),
        "1" | "1.0" => Ok(SchemaVersion::V1),
        _ => Err(Error::UnsupportedSchema { tag }),
    }
}

// ── Dependencies ────────────────────────────────────────────────────────────

/// Declared plugin dependencies, keyed by plugin id with a semver range.
///
/// Accepts either a list of ids (each meaning `*`) or an `{id: range}` map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Dependencies(BTreeMap<String, String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum DependenciesRepr {
    List(Vec<String>),
    Map(BTreeMap<String, String>),
}

impl<'de> Deserialize<'de> for Dependencies {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(match Option::<DependenciesRepr>::deserialize(deserializer)? {
            None => Self::default(),
            Some(DependenciesRepr::List(ids)) => ids.into_iter().map(|id| (id, "*".into())).collect(),
            Some(DependenciesRepr::Map(map)) => Self(map),
        })
    }
}

impl Dependencies {
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(id, range)| (id.as_str(), range.as_str()))
    }

    pub fn range_for(&self, id: &str) -> Option<&str> {
        self.0.get(id).map(String::as_str)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }

    pub fn insert(&mut self, id: impl Into<String>, range: impl Into<String>) {
        self.0.insert(id.into(), range.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for Dependencies {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ── v1 ──────────────────────────────────────────────────────────────────────

/// Legacy manifest with a flat permission list.
///
/// Every field is optional at the serde level so an incomplete v1 document
/// can still be inspected by [`crate::can_migrate`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ManifestV1 {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<String>,
    pub id: String,
    pub name: String,
    pub version: String,
    pub main: String,
    pub description: String,
    pub author: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lokus_version: Option<String>,
    pub activation_events: Vec<ActivationEvent>,
    pub categories: Vec<String>,
    pub permissions: Vec<String>,
    #[serde(skip_serializing_if = "Dependencies::is_empty")]
    pub dependencies: Dependencies,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contributes: Option<Value>,
    #[serde(flatten)]
    pub metadata: PackageMetadata,
}

// ── v2 ──────────────────────────────────────────────────────────────────────

/// Host compatibility block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Engines {
    /// Semver range the running host must satisfy.
    pub host: String,
}

/// v2 replacement for the flat permission list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Capabilities {
    pub untrusted_workspaces: bool,
    pub virtual_workspaces: bool,
    /// Fine-grained permissions carried over from v1.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// Descriptive package fields shared by both schemas.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageMetadata {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestV2 {
    pub manifest: String,
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub publisher: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
    pub engines: Engines,
    #[serde(default)]
    pub activation_events: Vec<ActivationEvent>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default, skip_serializing_if = "Dependencies::is_empty")]
    pub dependencies: Dependencies,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contributes: Option<Value>,
    #[serde(flatten)]
    pub metadata: PackageMetadata,
}

impl ManifestV2 {
    /// Whether `host` satisfies `engines.host`. An unparsable range is
    /// treated as incompatible.
    pub fn supports_host(&self, host: &semver::Version) -> bool {
        semver::VersionReq::parse(self.engines.host.trim()).is_ok_and(|req| req.matches(host))
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

// ── Tagged document ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Manifest {
    V1(ManifestV1),
    V2(ManifestV2),
}

impl Manifest {
    /// Parse a raw document into its tagged shape. This checks structure
    /// only; run [`crate::validate`] for the full rule set.
    pub fn from_value(mut value: Value) -> Result<Self> {
        let version = detect_schema_version(&value)?;

        // Numeric tags are accepted by detection; store the canonical string.
        if let Some(tag) = value.get_mut("manifest") {
            *tag = Value::String(
                match version {
                    SchemaVersion::V1 => "1.0",
                    SchemaVersion::V2 => MANIFEST_V2_TAG,
                }
                .into(),
            );
        }

        match version {
            SchemaVersion::V1 => Ok(Self::V1(serde_json::from_value(value)?)),
            SchemaVersion::V2 => Ok(Self::V2(serde_json::from_value(value)?)),
        }
    }

    pub fn schema_version(&self) -> SchemaVersion {
        match self {
            Self::V1(_) => SchemaVersion::V1,
            Self::V2(_) => SchemaVersion::V2,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::V1(m) => &m.id,
            Self::V2(m) => &m.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::V1(m) => &m.name,
            Self::V2(m) => &m.name,
        }
    }

    pub fn version(&self) -> &str {
        match self {
            Self::V1(m) => &m.version,
            Self::V2(m) => &m.version,
        }
    }

    pub fn activation_events(&self) -> &[ActivationEvent] {
        match self {
            Self::V1(m) => &m.activation_events,
            Self::V2(m) => &m.activation_events,
        }
    }

    pub fn dependencies(&self) -> &Dependencies {
        match self {
            Self::V1(m) => &m.dependencies,
            Self::V2(m) => &m.dependencies,
        }
    }
}

/// Parse `plugin.json` text into a tagged manifest.
pub fn parse_manifest(raw: &str) -> Result<Manifest> {
    Manifest::from_value(serde_json::from_str(raw)?)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest, serde_json::json};

    #[rstest]
    #[case(json!({"manifest": "2.0"}), SchemaVersion::V2)]
    #[case(json!({"manifest": "2"}), SchemaVersion::V2)]
    #[case(json!({"manifest": 2.0}), SchemaVersion::V2)]
    #[case(json!({"manifest": "1.0"}), SchemaVersion::V1)]
    #[case(json!({"id": "a", "main": "index.js"}), SchemaVersion::V1)]
    #[case(json!({"engines": {"host": "^1"}, "lokusVersion": "^1"}), SchemaVersion::V1)]
    fn detects_schema(#[case] doc: Value, #[case] expected: SchemaVersion) {
        assert_eq!(detect_schema_version(&doc).unwrap(), expected);
    }

    #[test]
    fn rejects_unknown_tag() {
        let err = detect_schema_version(&json!({"manifest": "3.0"})).unwrap_err();
        assert!(matches!(err, Error::UnsupportedSchema { tag } if tag == "3.0"));
    }

    #[test]
    fn rejects_untagged_v2_shape() {
        let err = detect_schema_version(&json!({"id": "a", "engines": {"host": "^1"}})).unwrap_err();
        assert!(matches!(err, Error::UntaggedDocument));
    }

    #[test]
    fn rejects_non_object() {
        assert!(matches!(detect_schema_version(&json!([1, 2])), Err(Error::NotAnObject)));
    }

    #[test]
    fn dependencies_accept_list_map_and_null() {
        let list: Dependencies = serde_json::from_value(json!(["core", "ui"])).unwrap();
        assert_eq!(list.range_for("core"), Some("*"));
        assert_eq!(list.len(), 2);

        let map: Dependencies = serde_json::from_value(json!({"core": "^1.2"})).unwrap();
        assert_eq!(map.range_for("core"), Some("^1.2"));

        let none: Dependencies = serde_json::from_value(Value::Null).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn parses_v2_with_extra_capabilities() {
        let manifest = parse_manifest(
            r#"{
                "manifest": "2.0",
                "id": "lokus.outline",
                "name": "Outline",
                "version": "1.0.0",
                "publisher": "lokus",
                "engines": {"host": "^1.0.0"},
                "activationEvents": ["onView:outline"],
                "capabilities": {"untrustedWorkspaces": true, "telemetry": false},
                "license": "MIT"
            }"#,
        )
        .unwrap();

        let Manifest::V2(v2) = manifest else {
            panic!("expected v2");
        };
        assert!(v2.capabilities.untrusted_workspaces);
        assert_eq!(v2.capabilities.other.get("telemetry"), Some(&json!(false)));
        assert_eq!(v2.metadata.license.as_deref(), Some("MIT"));
        assert!(v2.supports_host(&semver::Version::new(1, 4, 0)));
        assert!(!v2.supports_host(&semver::Version::new(2, 0, 0)));
    }

    #[test]
    fn parses_partial_v1() {
        let manifest = parse_manifest(r#"{"name": "Only a name"}"#).unwrap();
        assert_eq!(manifest.schema_version(), SchemaVersion::V1);
        assert_eq!(manifest.name(), "Only a name");
        assert!(manifest.id().is_empty());
    }
}
