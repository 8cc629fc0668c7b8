//! Plugin records and the registry that owns them.
//!
//! The registry is owned by one manager. Outside code only ever sees
//! [`PluginSnapshot`]s, which are detached copies.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::PathBuf,
    sync::Arc,
};

use {
    chrono::{DateTime, Utc},
    lokus_manifest::{ManifestV2, SchemaVersion},
    serde::{Deserialize, Serialize},
};

use crate::{
    error::{Error, RecordedError},
    loader::PluginInstance,
    resolver::DependencyGraph,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Discovered,
    Loaded,
    Active,
    Error,
    Unloaded,
}

impl PluginStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Loaded => "loaded",
            Self::Active => "active",
            Self::Error => "error",
            Self::Unloaded => "unloaded",
        }
    }

    /// An instance exists for the plugin.
    pub const fn is_loaded(self) -> bool {
        matches!(self, Self::Loaded | Self::Active)
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Record ──────────────────────────────────────────────────────────────────

pub struct PluginRecord {
    pub id: String,
    /// `None` when the manifest could not be accepted.
    pub manifest: Option<ManifestV2>,
    pub original_schema: Option<SchemaVersion>,
    pub path: PathBuf,
    pub status: PluginStatus,
    pub(crate) instance: Option<Arc<dyn PluginInstance>>,
    pub error: Option<RecordedError>,
    pub load_order_index: Option<usize>,
    pub warnings: Vec<String>,
    pub discovered_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    /// Changes whenever the record is replaced, so late async results for an
    /// older incarnation can be recognized and dropped.
    pub(crate) generation: u64,
}

impl PluginRecord {
    pub(crate) fn new(id: impl Into<String>, path: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            manifest: None,
            original_schema: None,
            path,
            status: PluginStatus::Discovered,
            instance: None,
            error: None,
            load_order_index: None,
            warnings: Vec::new(),
            discovered_at: now,
            last_updated: now,
            generation: 0,
        }
    }

    pub(crate) fn set_status(&mut self, status: PluginStatus) {
        self.status = status;
        self.last_updated = Utc::now();
    }

    /// Move to `error` and remember why.
    pub(crate) fn fail(&mut self, err: &Error) -> RecordedError {
        let recorded = RecordedError::from(err);
        self.error = Some(recorded.clone());
        self.set_status(PluginStatus::Error);
        recorded
    }

    pub fn has_instance(&self) -> bool {
        self.instance.is_some()
    }
}

impl fmt::Debug for PluginRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRecord")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("has_instance", &self.instance.is_some())
            .field("error", &self.error)
            .field("load_order_index", &self.load_order_index)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

// ── Registry ────────────────────────────────────────────────────────────────

/// Arena of records keyed by discovery slot, with an id lookup on top.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    slots: BTreeMap<usize, PluginRecord>,
    by_id: HashMap<String, usize>,
    next_slot: usize,
    next_generation: u64,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new record. Fails with the record handed back if the id is
    /// already registered.
    pub fn insert(&mut self, mut record: PluginRecord) -> Result<(), PluginRecord> {
        if self.by_id.contains_key(&record.id) {
            return Err(record);
        }
        self.next_generation += 1;
        record.generation = self.next_generation;

        let slot = self.next_slot;
        self.next_slot += 1;
        self.by_id.insert(record.id.clone(), slot);
        self.slots.insert(slot, record);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Option<PluginRecord> {
        let slot = self.by_id.remove(id)?;
        self.slots.remove(&slot)
    }

    pub fn get(&self, id: &str) -> Option<&PluginRecord> {
        self.by_id.get(id).and_then(|slot| self.slots.get(slot))
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut PluginRecord> {
        let slot = self.by_id.get(id)?;
        self.slots.get_mut(slot)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Records in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = &PluginRecord> {
        self.slots.values()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn stats(&self) -> PluginStats {
        let mut stats = PluginStats {
            total: self.len(),
            ..PluginStats::default()
        };
        for record in self.iter() {
            match record.status {
                PluginStatus::Discovered => stats.discovered += 1,
                PluginStatus::Loaded => stats.loaded += 1,
                PluginStatus::Active => {
                    stats.loaded += 1;
                    stats.active += 1;
                },
                PluginStatus::Error => {
                    if let Some(error) = &record.error {
                        stats.errors.push(PluginErrorEntry {
                            plugin_id: record.id.clone(),
                            error: error.clone(),
                        });
                    }
                },
                PluginStatus::Unloaded => {},
            }
        }
        stats
    }
}

// ── Read-only views ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PluginStats {
    pub total: usize,
    pub discovered: usize,
    /// Plugins with a live instance, active ones included.
    pub loaded: usize,
    pub active: usize,
    /// One entry per plugin currently in `error`.
    pub errors: Vec<PluginErrorEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginErrorEntry {
    pub plugin_id: String,
    pub error: RecordedError,
}

/// Detached view of a record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginSnapshot {
    pub id: String,
    pub name: Option<String>,
    pub version: Option<String>,
    pub status: PluginStatus,
    pub activating: bool,
    /// False while the host keeps the plugin disabled.
    pub enabled: bool,
    pub error: Option<RecordedError>,
    pub load_order_index: Option<usize>,
    pub original_schema: Option<SchemaVersion>,
    pub path: PathBuf,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
    pub warnings: Vec<String>,
    pub discovered_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl PluginSnapshot {
    pub(crate) fn capture(record: &PluginRecord, graph: &DependencyGraph, activating: bool) -> Self {
        Self {
            id: record.id.clone(),
            name: record.manifest.as_ref().map(|m| m.name.clone()),
            version: record.manifest.as_ref().map(|m| m.version.clone()),
            status: record.status,
            activating,
            enabled: true,
            error: record.error.clone(),
            load_order_index: record.load_order_index,
            original_schema: record.original_schema,
            path: record.path.clone(),
            dependencies: graph.dependencies_of(&record.id).to_vec(),
            dependents: graph.dependents_of(&record.id).to_vec(),
            warnings: record.warnings.clone(),
            discovered_at: record.discovered_at,
            last_updated: record.last_updated,
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn record(id: &str) -> PluginRecord {
        PluginRecord::new(id, PathBuf::from(format!("/plugins/{id}")))
    }

    #[rstest]
    #[case(PluginStatus::Discovered, false)]
    #[case(PluginStatus::Loaded, true)]
    #[case(PluginStatus::Active, true)]
    #[case(PluginStatus::Error, false)]
    #[case(PluginStatus::Unloaded, false)]
    fn only_instantiated_states_count_as_loaded(#[case] status: PluginStatus, #[case] loaded: bool) {
        assert_eq!(status.is_loaded(), loaded);
        assert_eq!(serde_json::to_value(status).unwrap(), status.as_str());
    }

    #[test]
    fn duplicate_ids_are_refused() {
        let mut registry = PluginRegistry::new();
        registry.insert(record("a")).unwrap();
        let rejected = registry.insert(record("a")).unwrap_err();
        assert_eq!(rejected.id, "a");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn iteration_follows_insertion_order_after_removal() {
        let mut registry = PluginRegistry::new();
        for id in ["c", "a", "b"] {
            registry.insert(record(id)).unwrap();
        }
        registry.remove("a").unwrap();
        registry.insert(record("a")).unwrap();

        let ids: Vec<_> = registry.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn reinsertion_gets_a_new_generation() {
        let mut registry = PluginRegistry::new();
        registry.insert(record("a")).unwrap();
        let first = registry.get("a").unwrap().generation;
        registry.remove("a");
        registry.insert(record("a")).unwrap();
        assert_ne!(registry.get("a").unwrap().generation, first);
    }

    #[test]
    fn stats_count_by_status() {
        let mut registry = PluginRegistry::new();
        for id in ["d", "l", "a", "e"] {
            registry.insert(record(id)).unwrap();
        }
        registry.get_mut("l").unwrap().set_status(PluginStatus::Loaded);
        registry.get_mut("a").unwrap().set_status(PluginStatus::Active);
        registry.get_mut("e").unwrap().fail(&Error::LoadFailed {
            plugin_id: "e".into(),
            reason: "boom".into(),
        });

        let stats = registry.stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.discovered, 1);
        assert_eq!(stats.loaded, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.errors.len(), 1);
        assert_eq!(stats.errors[0].plugin_id, "e");
    }

    #[test]
    fn snapshot_includes_graph_relations() {
        let mut registry = PluginRegistry::new();
        registry.insert(record("a")).unwrap();
        let mut graph = DependencyGraph::new();
        graph.add_plugin("a", ["core"]);
        graph.add_plugin("b", ["a"]);

        let snapshot = PluginSnapshot::capture(registry.get("a").unwrap(), &graph, false);
        assert_eq!(snapshot.dependencies, vec!["core"]);
        assert_eq!(snapshot.dependents, vec!["b"]);
        assert_eq!(snapshot.status, PluginStatus::Discovered);
    }
}
