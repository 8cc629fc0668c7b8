//! Minimal v2 manifest skeletons.

use serde_json::Value;

use crate::{
    activation::{ActivationEvent, ActivationKind},
    error::{Error, Result},
    schema::{Capabilities, Dependencies, Engines, MANIFEST_V2_TAG, ManifestV2, PackageMetadata},
    validate::validate,
};

#[derive(Debug, Clone)]
pub struct TemplateOptions {
    pub id: String,
    pub name: String,
    pub publisher: String,
    pub version: String,
    pub host_range: String,
    pub description: Option<String>,
    /// Defaults to `onStartupFinished` when empty.
    pub activation_events: Vec<ActivationEvent>,
    pub categories: Vec<String>,
    /// Merged onto the skeleton with JSON merge-patch rules: objects merge
    /// recursively, `null` removes a key, anything else replaces.
    pub overrides: Option<Value>,
}

impl TemplateOptions {
    pub fn new(id: impl Into<String>, name: impl Into<String>, publisher: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            publisher: publisher.into(),
            version: "0.1.0".into(),
            host_range: "*".into(),
            description: None,
            activation_events: Vec::new(),
            categories: Vec::new(),
            overrides: None,
        }
    }
}

/// Build a valid v2 manifest from `opts`.
pub fn create_template(opts: TemplateOptions) -> Result<ManifestV2> {
    let activation_events = if opts.activation_events.is_empty() {
        vec![ActivationEvent::of(ActivationKind::StartupFinished, None)]
    } else {
        opts.activation_events
    };

    let skeleton = ManifestV2 {
        manifest: MANIFEST_V2_TAG.to_string(),
        description: opts
            .description
            .unwrap_or_else(|| format!("{} plugin", opts.name)),
        id: opts.id,
        name: opts.name,
        version: opts.version,
        publisher: opts.publisher,
        main: Some("index.js".into()),
        engines: Engines {
            host: opts.host_range,
        },
        activation_events,
        categories: opts.categories,
        capabilities: Capabilities::default(),
        dependencies: Dependencies::default(),
        contributes: None,
        metadata: PackageMetadata::default(),
    };

    let mut document = skeleton.to_value()?;
    if let Some(overrides) = opts.overrides {
        merge_patch(&mut document, overrides);
    }
    // The schema tag is not overridable.
    if let Some(object) = document.as_object_mut() {
        object.insert("manifest".into(), Value::String(MANIFEST_V2_TAG.into()));
    }

    let report = validate(&document);
    if !report.valid {
        return Err(Error::Invalid {
            errors: report.error_messages(),
        });
    }
    Ok(serde_json::from_value(document)?)
}

fn merge_patch(target: &mut Value, patch: Value) {
    let Value::Object(patch) = patch else {
        *target = patch;
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    let Some(target) = target.as_object_mut() else {
        return;
    };

    for (key, value) in patch {
        if value.is_null() {
            target.remove(&key);
        } else {
            merge_patch(target.entry(key).or_insert(Value::Null), value);
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn default_template_is_valid_and_warning_free() {
        let manifest = create_template(TemplateOptions::new("acme.hello", "Hello", "acme")).unwrap();
        assert_eq!(manifest.manifest, "2.0");
        assert_eq!(manifest.engines.host, "*");
        assert_eq!(manifest.activation_events[0].kind(), "onStartupFinished");

        let report = validate(&manifest.to_value().unwrap());
        assert!(report.valid);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    }

    #[test]
    fn overrides_deep_merge() {
        let mut opts = TemplateOptions::new("acme.hello", "Hello", "acme");
        opts.overrides = Some(json!({
            "capabilities": {"virtualWorkspaces": true},
            "contributes": {"commands": [{"command": "hello.say"}]},
            "main": null,
            "manifest": "1.0",
        }));

        let manifest = create_template(opts).unwrap();
        assert!(manifest.capabilities.virtual_workspaces);
        assert!(!manifest.capabilities.untrusted_workspaces);
        assert!(manifest.contributes.is_some());
        assert_eq!(manifest.main, None);
        assert_eq!(manifest.manifest, "2.0");
    }

    #[test]
    fn invalid_override_is_rejected() {
        let mut opts = TemplateOptions::new("acme.hello", "Hello", "acme");
        opts.overrides = Some(json!({"engines": {"host": "not a range"}}));
        assert!(matches!(create_template(opts), Err(Error::Invalid { .. })));
    }

    #[test]
    fn merge_patch_replaces_scalars_and_arrays() {
        let mut doc = json!({"a": {"b": 1, "c": [1, 2]}, "d": true});
        merge_patch(&mut doc, json!({"a": {"c": [3]}, "d": null}));
        assert_eq!(doc, json!({"a": {"b": 1, "c": [3]}}));
    }
}
