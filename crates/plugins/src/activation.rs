//! Activation event index.
//!
//! A plain multi-map from exact event key to the plugins that declared it.
//! No pattern matching happens here; the manager builds the exact key for
//! each fired event and looks up its bucket.

use std::{collections::HashMap, time::Duration};

use {
    lokus_manifest::{ActivationEvent, ManifestV2},
    serde::Serialize,
};

use crate::{error::RecordedError, registry::PluginStatus};

#[derive(Debug, Clone, Default)]
pub struct ActivationIndex {
    buckets: HashMap<ActivationEvent, Vec<String>>,
    by_plugin: HashMap<String, Vec<ActivationEvent>>,
}

impl ActivationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `plugin_id` to the bucket of each event. Pairs already present
    /// are ignored. Returns how many new pairs were added.
    pub fn register_plugin<I>(&mut self, plugin_id: &str, events: I) -> usize
    where
        I: IntoIterator<Item = ActivationEvent>,
    {
        let mut added = 0;
        for event in events {
            let bucket = self.buckets.entry(event.clone()).or_default();
            if bucket.iter().any(|id| id == plugin_id) {
                continue;
            }
            bucket.push(plugin_id.to_string());
            self.by_plugin
                .entry(plugin_id.to_string())
                .or_default()
                .push(event);
            added += 1;
        }
        added
    }

    pub fn register_manifest(&mut self, manifest: &ManifestV2) -> usize {
        self.register_plugin(&manifest.id, manifest.activation_events.iter().cloned())
    }

    pub fn unregister_plugin(&mut self, plugin_id: &str) -> usize {
        let Some(events) = self.by_plugin.remove(plugin_id) else {
            return 0;
        };
        for event in &events {
            if let Some(bucket) = self.buckets.get_mut(event) {
                bucket.retain(|id| id != plugin_id);
                if bucket.is_empty() {
                    self.buckets.remove(event);
                }
            }
        }
        events.len()
    }

    /// Plugins interested in exactly `event`, in registration order.
    pub fn plugins_for(&self, event: &ActivationEvent) -> &[String] {
        self.buckets
            .get(event)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn events_for(&self, plugin_id: &str) -> &[ActivationEvent] {
        self.by_plugin
            .get(plugin_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Number of distinct event keys.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

// ── Context & outcome ───────────────────────────────────────────────────────

/// Why a plugin is being activated, handed to `PluginInstance::activate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivationContext {
    /// Trigger tag such as `command` or `language`, or `explicit`.
    pub kind: String,
    pub subject: Option<String>,
}

impl ActivationContext {
    pub const EXPLICIT: &'static str = "explicit";

    /// Activation requested directly by the host rather than by an event.
    pub fn explicit() -> Self {
        Self {
            kind: Self::EXPLICIT.into(),
            subject: None,
        }
    }

    pub fn from_event(event: &ActivationEvent) -> Self {
        let kind = event
            .recognized_kind()
            .map_or_else(|| event.kind().to_string(), |k| k.trigger_name().to_string());
        Self {
            kind,
            subject: event.subject().map(str::to_string),
        }
    }
}

/// Result of one activation request. Never carries a panic or an error out
/// of the runtime; failures are described here and on the plugin record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivationOutcome {
    pub plugin_id: String,
    pub status: PluginStatus,
    /// Whether the plugin is active after the request.
    pub activated: bool,
    /// Set when the plugin was already active and `activate()` was not
    /// called again.
    pub already_active: bool,
    pub error: Option<RecordedError>,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

impl ActivationOutcome {
    pub(crate) fn already_active(plugin_id: &str) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            status: PluginStatus::Active,
            activated: true,
            already_active: true,
            error: None,
            elapsed: Duration::ZERO,
        }
    }

    pub(crate) fn failed(plugin_id: &str, status: PluginStatus, error: RecordedError) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            status,
            activated: false,
            already_active: false,
            error: Some(error),
            elapsed: Duration::ZERO,
        }
    }
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn ev(raw: &str) -> ActivationEvent {
        raw.parse().unwrap()
    }

    #[test]
    fn registration_is_idempotent() {
        let mut index = ActivationIndex::new();
        assert_eq!(index.register_plugin("p", [ev("onCommand:test.command")]), 1);
        assert_eq!(index.register_plugin("p", [ev("onCommand:test.command")]), 0);
        assert_eq!(index.plugins_for(&ev("onCommand:test.command")), ["p"]);
        assert_eq!(index.events_for("p").len(), 1);
    }

    #[test]
    fn buckets_keep_registration_order() {
        let mut index = ActivationIndex::new();
        index.register_plugin("b", [ev("onLanguage:markdown")]);
        index.register_plugin("a", [ev("onLanguage:markdown")]);
        assert_eq!(index.plugins_for(&ev("onLanguage:markdown")), ["b", "a"]);
    }

    #[test]
    fn lookup_is_exact() {
        let mut index = ActivationIndex::new();
        index.register_plugin("p", [ev("onCommand:test.command")]);
        assert!(index.plugins_for(&ev("onCommand:test")).is_empty());
        assert!(index.plugins_for(&ev("onCommand")).is_empty());
    }

    #[test]
    fn unregister_empties_buckets() {
        let mut index = ActivationIndex::new();
        index.register_plugin("p", [ev("onStartupFinished"), ev("onView:outline")]);
        index.register_plugin("q", [ev("onStartupFinished")]);

        assert_eq!(index.unregister_plugin("p"), 2);
        assert_eq!(index.plugins_for(&ev("onStartupFinished")), ["q"]);
        assert!(index.plugins_for(&ev("onView:outline")).is_empty());
        assert_eq!(index.len(), 1);
        assert_eq!(index.unregister_plugin("p"), 0);
    }

    #[test]
    fn context_uses_trigger_names() {
        let ctx = ActivationContext::from_event(&ev("onCommand:test.command"));
        assert_eq!(ctx.kind, "command");
        assert_eq!(ctx.subject.as_deref(), Some("test.command"));

        let unknown = ActivationContext::from_event(&ev("onFooBar:x"));
        assert_eq!(unknown.kind, "onFooBar");
        assert_eq!(ActivationContext::explicit().kind, "explicit");
    }

    #[test]
    fn outcome_serializes_elapsed_as_millis() {
        let mut outcome = ActivationOutcome::already_active("p");
        outcome.elapsed = Duration::from_millis(42);
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["elapsed_ms"], 42);
        assert_eq!(json["status"], "active");
    }
}
