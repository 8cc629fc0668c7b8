//! The plugin manager: discovery, dependency-aware loading, event-driven
//! activation, deactivation and unload.
//!
//! One manager owns the registry, the dependency graph and the activation
//! index. All three live behind a single std mutex that is never held across
//! an `.await`; lifecycle events are emitted after the lock is released.
//!
//! Concurrency rules:
//! - load and unload are serialized through an async gate, so a module is
//!   never instantiated twice and dependencies settle before dependents;
//! - every activation runs as its own task and is published in an in-flight
//!   map, so concurrent triggers for the same plugin share one `activate()`;
//! - deactivations are published the same way, and an activation that
//!   arrives mid-deactivation waits for it to finish;
//! - each record carries a generation, and an async result is only applied
//!   if the record it started on is still the current one.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use {
    futures::{
        FutureExt,
        future::{BoxFuture, Shared, join_all},
    },
    lokus_common::{EventBus, Subscription},
    lokus_config::{
        PluginHostConfig,
        schema::{DEFAULT_ACTIVATION_TIMEOUT_MS, DEFAULT_DEACTIVATION_TIMEOUT_MS},
    },
    lokus_manifest::{AcceptedManifest, ActivationEvent, ActivationKind, is_known_permission},
    serde::Serialize,
    tracing::{debug, info, warn},
};

use crate::{
    activation::{ActivationContext, ActivationIndex, ActivationOutcome},
    discovery::{FsManifestSource, ManifestSource, fallback_plugin_id},
    error::{Context, Error, RecordedError, Result},
    events::{LifecycleEvent, LifecycleEventKind},
    loader::{PluginInstance, PluginLoader},
    registry::{
        PluginErrorEntry, PluginRecord, PluginRegistry, PluginSnapshot, PluginStats, PluginStatus,
    },
    resolver::{DependencyGraph, LoadPlan},
};

const MIN_TIMEOUT: Duration = Duration::from_millis(10);

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ── Options & reports ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Checked against each manifest's `engines.host` at discovery.
    pub host_version: semver::Version,
    pub activation_timeout: Duration,
    pub deactivation_timeout: Duration,
    /// Upgrade v1 manifests at discovery instead of rejecting them.
    pub auto_migrate: bool,
    /// Plugin ids kept out of loading and activation at startup.
    pub disabled: HashSet<String>,
    /// Permissions granted at startup, per plugin id.
    pub permissions: HashMap<String, BTreeSet<String>>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            host_version: semver::Version::new(1, 0, 0),
            activation_timeout: Duration::from_millis(DEFAULT_ACTIVATION_TIMEOUT_MS),
            deactivation_timeout: Duration::from_millis(DEFAULT_DEACTIVATION_TIMEOUT_MS),
            auto_migrate: true,
            disabled: HashSet::new(),
            permissions: HashMap::new(),
        }
    }
}

impl ManagerOptions {
    pub fn from_config(config: &PluginHostConfig) -> Result<Self> {
        let host_version = semver::Version::parse(config.host.version.trim())
            .with_context(|| format!("invalid host.version '{}'", config.host.version))?;
        Ok(Self {
            host_version,
            activation_timeout: Duration::from_millis(config.activation.timeout_ms).max(MIN_TIMEOUT),
            deactivation_timeout: Duration::from_millis(config.activation.deactivation_timeout_ms)
                .max(MIN_TIMEOUT),
            auto_migrate: config.discovery.auto_migrate,
            disabled: config.plugins.disabled.iter().cloned().collect(),
            permissions: config
                .plugins
                .permissions
                .iter()
                .map(|(id, granted)| (id.clone(), known_permissions(id, granted)))
                .collect(),
        })
    }
}

fn known_permissions(id: &str, granted: &[String]) -> BTreeSet<String> {
    granted
        .iter()
        .filter(|permission| {
            let known = is_known_permission(permission);
            if !known {
                warn!(plugin = %id, %permission, "ignoring unrecognized permission grant");
            }
            known
        })
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnloadOptions {
    /// Unload dependents first instead of refusing.
    pub force: bool,
}

impl UnloadOptions {
    pub fn forced() -> Self {
        Self { force: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedPlugin {
    pub plugin_id: String,
    pub reason: String,
}

/// What a [`PluginManager::load_all`] pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub failed: Vec<PluginErrorEntry>,
    /// Left in `discovered` because the plugin is disabled, or a dependency
    /// is missing, failed or sits on a cycle.
    pub skipped: Vec<SkippedPlugin>,
    /// Quarantined cycles, members marked `error`.
    pub cycles: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitializeReport {
    pub discovered: Vec<PluginSnapshot>,
    pub load: LoadReport,
    pub startup: Vec<ActivationOutcome>,
}

// ── State ───────────────────────────────────────────────────────────────────

type InFlight = Shared<BoxFuture<'static, ActivationOutcome>>;
type Settled = Shared<BoxFuture<'static, ()>>;

#[derive(Default)]
struct RuntimeState {
    registry: PluginRegistry,
    graph: DependencyGraph,
    index: ActivationIndex,
    /// Pending activations keyed by plugin id, tagged with the generation
    /// they were started for.
    in_flight: HashMap<String, (u64, InFlight)>,
    /// Pending deactivations. Activation waits for these to settle.
    deactivating: HashMap<String, (u64, Settled)>,
    disabled: HashSet<String>,
    grants: HashMap<String, BTreeSet<String>>,
}

impl RuntimeState {
    fn snapshot(&self, id: &str) -> Option<PluginSnapshot> {
        let record = self.registry.get(id)?;
        Some(self.capture(record))
    }

    fn capture(&self, record: &PluginRecord) -> PluginSnapshot {
        PluginSnapshot {
            enabled: !self.disabled.contains(&record.id),
            ..PluginSnapshot::capture(record, &self.graph, self.in_flight.contains_key(&record.id))
        }
    }

    fn status_of(&self, id: &str) -> PluginStatus {
        self.registry
            .get(id)
            .map_or(PluginStatus::Unloaded, |r| r.status)
    }

    /// Insert a freshly read package. Failed intake still produces a record.
    fn register(
        &mut self,
        id: String,
        dir: &Path,
        intake: Result<AcceptedManifest>,
    ) -> Option<(PluginSnapshot, Option<LifecycleEvent>)> {
        if let Some(existing) = self.registry.get(&id) {
            // A package rejected before its manifest was accepted only holds
            // the id; a valid package claiming it takes its place.
            let rejected = existing.status == PluginStatus::Error && existing.manifest.is_none();
            if !rejected || intake.is_err() {
                warn!(plugin = %id, path = %dir.display(), "duplicate plugin id, skipping package");
                return None;
            }
            warn!(
                plugin = %id,
                path = %dir.display(),
                rejected = %existing.path.display(),
                "valid package replaces a rejected one with the same id"
            );
            self.registry.remove(&id);
            self.graph.remove_plugin(&id);
            self.index.unregister_plugin(&id);
        }

        let mut record = PluginRecord::new(id.clone(), dir.to_path_buf());
        let mut event = None;
        let dependencies: Vec<String> = match intake {
            Ok(accepted) => {
                if !accepted.migration_log.is_empty() {
                    info!(
                        plugin = %id,
                        steps = accepted.migration_log.len(),
                        "migrated v1 manifest"
                    );
                }
                for warning in &accepted.warnings {
                    debug!(plugin = %id, %warning, "manifest warning");
                }
                record.original_schema = Some(accepted.original_schema);
                record.warnings = accepted.warnings.iter().map(ToString::to_string).collect();
                self.index.register_manifest(&accepted.manifest);
                let deps = accepted.manifest.dependencies.ids().map(str::to_string).collect();
                record.manifest = Some(accepted.manifest);
                deps
            },
            Err(err) => {
                warn!(plugin = %id, path = %dir.display(), error = %err, "plugin rejected at discovery");
                let error = record.fail(&err);
                event = Some(LifecycleEvent::PluginError {
                    plugin_id: id.clone(),
                    error,
                });
                Vec::new()
            },
        };

        self.graph.add_plugin(id.clone(), dependencies);
        if self.registry.insert(record).is_err() {
            return None;
        }
        Some((self.snapshot(&id)?, event))
    }
}

struct Inner {
    state: Mutex<RuntimeState>,
    loader: Arc<dyn PluginLoader>,
    source: Arc<dyn ManifestSource>,
    events: EventBus<LifecycleEvent>,
    options: ManagerOptions,
    load_gate: tokio::sync::Mutex<()>,
}

enum ActivationStep {
    Join(InFlight),
    AwaitDeactivation(Settled),
    Done(ActivationOutcome),
}

enum DeactivationStep {
    Wait(InFlight),
    Settle(Settled),
    Idle,
}

// ── Manager ─────────────────────────────────────────────────────────────────

/// Owns every plugin record. Cheap to clone; clones share the same runtime.
#[derive(Clone)]
pub struct PluginManager {
    inner: Arc<Inner>,
}

impl PluginManager {
    pub fn new(
        loader: Arc<dyn PluginLoader>,
        source: Arc<dyn ManifestSource>,
        options: ManagerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(RuntimeState {
                    disabled: options.disabled.clone(),
                    grants: options.permissions.clone(),
                    ..RuntimeState::default()
                }),
                loader,
                source,
                events: EventBus::new(),
                options,
                load_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Build a manager reading packages from disk as described by `config`.
    pub fn from_config(loader: Arc<dyn PluginLoader>, config: &PluginHostConfig) -> Result<Self> {
        let options = ManagerOptions::from_config(config)?;
        let source = Arc::new(FsManifestSource::new(config.discovery.manifest_file.clone()));
        Ok(Self::new(loader, source, options))
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.inner.options
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut RuntimeState) -> R) -> R {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    fn emit(&self, event: LifecycleEvent) {
        self.inner.events.emit(&event);
    }

    // ── Observers ───────────────────────────────────────────────────────────

    /// Observe every lifecycle event until the handle is dropped.
    pub fn subscribe(&self, handler: impl Fn(&LifecycleEvent) + Send + Sync + 'static) -> Subscription {
        self.inner.events.subscribe(handler)
    }

    /// Observe one kind of lifecycle event.
    pub fn on(
        &self,
        kind: LifecycleEventKind,
        handler: impl Fn(&LifecycleEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner
            .events
            .subscribe_filtered(move |event| event.kind() == kind, handler)
    }

    // ── Read-only views ─────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Option<PluginSnapshot> {
        self.with_state(|state| state.snapshot(id))
    }

    /// All records in discovery order.
    pub fn list(&self) -> Vec<PluginSnapshot> {
        self.with_state(|state| state.registry.iter().map(|r| state.capture(r)).collect())
    }

    pub fn get_stats(&self) -> PluginStats {
        self.with_state(|state| state.registry.stats())
    }

    pub fn load_plan(&self) -> LoadPlan {
        self.with_state(|state| state.graph.resolve())
    }

    /// Topological order of every registered plugin.
    pub fn compute_load_order(&self) -> Result<Vec<String>> {
        self.with_state(|state| state.graph.compute_load_order())
    }

    // ── Discovery ───────────────────────────────────────────────────────────

    /// Read, validate and register the package at each directory.
    ///
    /// A package whose manifest cannot be read, validated, migrated or whose
    /// host range excludes this host is still registered, in `error`.
    /// Packages whose id is already registered are skipped, unless the
    /// registered one was rejected at intake and the new one is valid.
    pub async fn discover(&self, plugin_dirs: &[PathBuf]) -> Vec<PluginSnapshot> {
        let mut snapshots = Vec::with_capacity(plugin_dirs.len());
        for dir in plugin_dirs {
            let (id, intake) = self.intake(dir).await;
            let Some((snapshot, event)) = self.with_state(|state| state.register(id, dir, intake))
            else {
                continue;
            };
            if let Some(event) = event {
                self.emit(event);
            }
            snapshots.retain(|s: &PluginSnapshot| s.id != snapshot.id);
            snapshots.push(snapshot);
        }

        let failed = snapshots
            .iter()
            .filter(|s| s.status == PluginStatus::Error)
            .count();
        info!(discovered = snapshots.len(), failed, "plugin discovery finished");
        snapshots
    }

    /// List package directories under each root, then discover them.
    pub async fn scan(&self, roots: &[PathBuf]) -> Vec<PluginSnapshot> {
        let mut dirs = Vec::new();
        for root in roots {
            match self.inner.source.list_plugin_dirs(root).await {
                Ok(mut found) => {
                    debug!(root = %root.display(), packages = found.len(), "scanned plugin root");
                    dirs.append(&mut found);
                },
                Err(e) => warn!(root = %root.display(), error = %e, "failed to scan plugin root"),
            }
        }
        self.discover(&dirs).await
    }

    async fn intake(&self, dir: &Path) -> (String, Result<AcceptedManifest>) {
        let raw = match self.inner.source.read_manifest(dir).await {
            Ok(raw) => raw,
            Err(e) => {
                let id = fallback_plugin_id("", dir);
                let err = Error::ManifestValidation {
                    plugin_id: id.clone(),
                    reason: format!("cannot read manifest: {e}"),
                };
                return (id, Err(err));
            },
        };

        let fallback = fallback_plugin_id(&raw, dir);
        let accepted = lokus_manifest::accept_str(&raw, self.inner.options.auto_migrate)
            .map_err(|e| Error::from_manifest(fallback.clone(), e))
            .and_then(|accepted| self.check_host(accepted));
        let id = accepted
            .as_ref()
            .map_or(fallback, |accepted| accepted.manifest.id.clone());
        (id, accepted)
    }

    fn check_host(&self, accepted: AcceptedManifest) -> Result<AcceptedManifest> {
        let host = &self.inner.options.host_version;
        if accepted.manifest.supports_host(host) {
            return Ok(accepted);
        }
        Err(Error::IncompatibleHost {
            plugin_id: accepted.manifest.id,
            required: accepted.manifest.engines.host,
            host: host.to_string(),
        })
    }

    // ── Loading ─────────────────────────────────────────────────────────────

    /// Load `id`, loading its dependencies first in resolver order.
    ///
    /// Cycles and missing dependencies are returned to the caller without
    /// touching any record. A dependency that fails to load is recorded on
    /// that dependency and reported here as [`Error::DependencyFailed`].
    pub async fn load_plugin(&self, id: &str) -> Result<PluginSnapshot> {
        let _gate = self.inner.load_gate.lock().await;
        self.load_with_dependencies(id).await?;
        self.get(id).ok_or_else(|| Error::not_found(id))
    }

    async fn load_with_dependencies(&self, id: &str) -> Result<()> {
        let order = self.with_state(|state| -> Result<Vec<(usize, String)>> {
            let record = state.registry.get(id).ok_or_else(|| Error::not_found(id))?;
            match record.status {
                status if status.is_loaded() => return Ok(Vec::new()),
                PluginStatus::Discovered => {},
                status => return Err(Error::invalid_state(id, status, "load")),
            }

            let mut closure = state.graph.transitive_dependencies(id);
            closure.push(id.to_string());

            let plan = state.graph.resolve();
            for member in &closure {
                if state.disabled.contains(member) {
                    return Err(Error::Disabled {
                        plugin_id: member.clone(),
                    });
                }
                if let Some(cycle) = plan.cycle_containing(member) {
                    return Err(Error::DependencyCycle {
                        members: cycle.to_vec(),
                    });
                }
                if let Some(missing) = state
                    .graph
                    .dependencies_of(member)
                    .iter()
                    .find(|dep| !state.registry.contains(dep))
                {
                    return Err(Error::MissingDependency {
                        plugin_id: member.clone(),
                        missing: missing.clone(),
                    });
                }
            }

            Ok(plan
                .order
                .into_iter()
                .enumerate()
                .filter(|(_, pid)| closure.contains(pid))
                .collect())
        })?;

        for (position, pid) in order {
            match self.with_state(|state| state.status_of(&pid)) {
                status if status.is_loaded() => continue,
                PluginStatus::Discovered => {},
                _ => {
                    return Err(Error::DependencyFailed {
                        plugin_id: id.to_string(),
                        dependency: pid,
                    });
                },
            }

            if let Err(err) = self.instantiate(&pid, position).await {
                return Err(if pid == id {
                    err
                } else {
                    Error::DependencyFailed {
                        plugin_id: id.to_string(),
                        dependency: pid,
                    }
                });
            }
        }
        Ok(())
    }

    /// Load every `discovered` plugin in resolver order.
    ///
    /// Cycle members are marked `error`. Plugins whose dependencies are
    /// missing, failed or cyclic stay `discovered` and are reported as
    /// skipped.
    pub async fn load_all(&self) -> LoadReport {
        let _gate = self.inner.load_gate.lock().await;

        let (plan, quarantined) = self.with_state(|state| {
            let plan = state.graph.resolve();
            let mut events = Vec::new();
            for members in &plan.cycles {
                let err = Error::DependencyCycle {
                    members: members.clone(),
                };
                warn!(members = ?members, "quarantining dependency cycle");
                for id in members {
                    if let Some(record) = state
                        .registry
                        .get_mut(id)
                        .filter(|r| r.status == PluginStatus::Discovered)
                    {
                        let error = record.fail(&err);
                        events.push(LifecycleEvent::PluginError {
                            plugin_id: id.clone(),
                            error,
                        });
                    }
                }
            }
            (plan, events)
        });
        for event in quarantined {
            self.emit(event);
        }

        let mut report = LoadReport {
            cycles: plan.cycles.clone(),
            ..LoadReport::default()
        };

        for id in &plan.blocked {
            if self.with_state(|state| state.status_of(id)) == PluginStatus::Discovered {
                report.skipped.push(SkippedPlugin {
                    plugin_id: id.clone(),
                    reason: "depends on a plugin in a dependency cycle".into(),
                });
            }
        }

        for (position, id) in plan.order.iter().enumerate() {
            let ready = self.with_state(|state| -> Option<std::result::Result<(), Error>> {
                if state.status_of(id) != PluginStatus::Discovered {
                    return None;
                }
                if state.disabled.contains(id) {
                    return Some(Err(Error::Disabled {
                        plugin_id: id.clone(),
                    }));
                }
                for dep in state.graph.dependencies_of(id) {
                    let blocked = match state.registry.get(dep).map(|r| r.status) {
                        None => Error::MissingDependency {
                            plugin_id: id.clone(),
                            missing: dep.clone(),
                        },
                        Some(status) if status.is_loaded() => continue,
                        Some(_) => Error::DependencyFailed {
                            plugin_id: id.clone(),
                            dependency: dep.clone(),
                        },
                    };
                    return Some(Err(blocked));
                }
                Some(Ok(()))
            });

            match ready {
                None => {},
                Some(Err(err)) => {
                    debug!(plugin = %id, reason = %err, "skipping plugin");
                    report.skipped.push(SkippedPlugin {
                        plugin_id: id.clone(),
                        reason: err.to_string(),
                    });
                },
                Some(Ok(())) => match self.instantiate(id, position).await {
                    Ok(()) => report.loaded.push(id.clone()),
                    Err(err) => report.failed.push(PluginErrorEntry {
                        plugin_id: id.clone(),
                        error: RecordedError::from(&err),
                    }),
                },
            }
        }

        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            cycles = report.cycles.len(),
            "plugin load pass finished"
        );
        report
    }

    /// Instantiate one plugin whose dependencies are already loaded.
    async fn instantiate(&self, id: &str, position: usize) -> Result<()> {
        let (manifest, path, generation) = self.with_state(|state| {
            let record = state.registry.get(id).ok_or_else(|| Error::not_found(id))?;
            let manifest = record
                .manifest
                .clone()
                .ok_or_else(|| Error::invalid_state(id, record.status, "load"))?;
            Ok::<_, Error>((manifest, record.path.clone(), record.generation))
        })?;

        debug!(plugin = %id, path = %path.display(), "loading plugin module");
        let loaded = self.inner.loader.load_module(&manifest, &path).await;

        let (event, result) = self.with_state(|state| {
            let Some(record) = state
                .registry
                .get_mut(id)
                .filter(|r| r.generation == generation)
            else {
                return (None, Err(Error::not_found(id)));
            };
            match loaded {
                Ok(instance) => {
                    record.instance = Some(instance);
                    record.load_order_index = Some(position);
                    record.error = None;
                    record.set_status(PluginStatus::Loaded);
                    (
                        Some(LifecycleEvent::PluginLoaded {
                            plugin_id: id.to_string(),
                        }),
                        Ok(()),
                    )
                },
                Err(e) => {
                    let err = Error::LoadFailed {
                        plugin_id: id.to_string(),
                        reason: format!("{e:#}"),
                    };
                    let error = record.fail(&err);
                    (
                        Some(LifecycleEvent::PluginError {
                            plugin_id: id.to_string(),
                            error,
                        }),
                        Err(err),
                    )
                },
            }
        });

        match &result {
            Ok(()) => info!(plugin = %id, load_order = position, "plugin loaded"),
            Err(err) => warn!(plugin = %id, error = %err, "plugin failed to load"),
        }
        if let Some(event) = event {
            self.emit(event);
        }
        result
    }

    // ── Activation ──────────────────────────────────────────────────────────

    /// Activate a loaded plugin.
    ///
    /// Errors cover unknown, disabled or not-yet-loaded plugins; a failing
    /// or timed-out `activate()` is reported in the outcome and on the
    /// record. Concurrent calls for the same plugin share one `activate()`,
    /// and a deactivation still in progress is waited out first.
    pub async fn activate_plugin(
        &self,
        id: &str,
        context: ActivationContext,
    ) -> Result<ActivationOutcome> {
        loop {
            let step = self.with_state(|state| -> Result<ActivationStep> {
                if let Some((_, pending)) = state.in_flight.get(id) {
                    debug!(plugin = %id, "joining in-flight activation");
                    return Ok(ActivationStep::Join(pending.clone()));
                }
                if let Some((_, settled)) = state.deactivating.get(id) {
                    debug!(plugin = %id, "waiting for deactivation before activating");
                    return Ok(ActivationStep::AwaitDeactivation(settled.clone()));
                }

                let record = state.registry.get(id).ok_or_else(|| Error::not_found(id))?;
                if state.disabled.contains(id) {
                    return Err(Error::Disabled {
                        plugin_id: id.to_string(),
                    });
                }
                match record.status {
                    PluginStatus::Active => return Ok(ActivationStep::Done(ActivationOutcome::already_active(id))),
                    PluginStatus::Loaded => {},
                    status => return Err(Error::invalid_state(id, status, "activate")),
                }
                let instance = record
                    .instance
                    .clone()
                    .ok_or_else(|| Error::invalid_state(id, record.status, "activate"))?;
                let generation = record.generation;

                let plugin_id = id.to_string();
                let task = tokio::spawn(self.clone().run_activation(
                    plugin_id.clone(),
                    generation,
                    instance,
                    context.clone(),
                ));
                let pending: InFlight = async move {
                    task.await.unwrap_or_else(|e| {
                        let err = Error::ActivationFailed {
                            plugin_id: plugin_id.clone(),
                            reason: format!("activation task ended abnormally: {e}"),
                        };
                        ActivationOutcome::failed(&plugin_id, PluginStatus::Error, RecordedError::from(&err))
                    })
                }
                .boxed()
                .shared();

                state
                    .in_flight
                    .insert(id.to_string(), (generation, pending.clone()));
                Ok(ActivationStep::Join(pending))
            })?;

            match step {
                ActivationStep::Join(pending) => return Ok(pending.await),
                ActivationStep::AwaitDeactivation(settled) => settled.await,
                ActivationStep::Done(outcome) => return Ok(outcome),
            }
        }
    }

    async fn run_activation(
        self,
        id: String,
        generation: u64,
        instance: Arc<dyn PluginInstance>,
        context: ActivationContext,
    ) -> ActivationOutcome {
        let timeout = self.inner.options.activation_timeout;
        let started = Instant::now();
        debug!(plugin = %id, trigger = %context.kind, subject = ?context.subject, "activating plugin");

        // Spawned so a timeout leaves the plugin's own future running.
        let activation = tokio::spawn({
            let context = context.clone();
            async move { instance.activate(context).await }
        });
        let result = match tokio::time::timeout(timeout, activation).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(Error::ActivationFailed {
                plugin_id: id.clone(),
                reason: format!("{e:#}"),
            }),
            Ok(Err(e)) => Err(Error::ActivationFailed {
                plugin_id: id.clone(),
                reason: format!("activate() panicked: {e}"),
            }),
            Err(_) => Err(Error::ActivationTimeout {
                plugin_id: id.clone(),
                timeout_ms: millis(timeout),
            }),
        };
        let elapsed = started.elapsed();

        let (outcome, event) = self.with_state(|state| {
            if state
                .in_flight
                .get(&id)
                .is_some_and(|(g, _)| *g == generation)
            {
                state.in_flight.remove(&id);
            }

            let Some(record) = state
                .registry
                .get_mut(&id)
                .filter(|r| r.generation == generation)
            else {
                debug!(plugin = %id, "dropping activation result for a replaced plugin");
                let outcome = ActivationOutcome {
                    plugin_id: id.clone(),
                    status: PluginStatus::Unloaded,
                    activated: false,
                    already_active: false,
                    error: result.as_ref().err().map(RecordedError::from),
                    elapsed,
                };
                return (outcome, None);
            };

            match result {
                Ok(()) => {
                    record.error = None;
                    record.set_status(PluginStatus::Active);
                    let outcome = ActivationOutcome {
                        plugin_id: id.clone(),
                        status: PluginStatus::Active,
                        activated: true,
                        already_active: false,
                        error: None,
                        elapsed,
                    };
                    let event = LifecycleEvent::PluginActivated {
                        plugin_id: id.clone(),
                        context,
                    };
                    (outcome, Some(event))
                },
                Err(err) => {
                    let error = record.fail(&err);
                    let outcome = ActivationOutcome {
                        elapsed,
                        ..ActivationOutcome::failed(&id, PluginStatus::Error, error.clone())
                    };
                    let event = LifecycleEvent::ActivationFailed {
                        plugin_id: id.clone(),
                        error,
                    };
                    (outcome, Some(event))
                },
            }
        });

        match &outcome.error {
            None => info!(plugin = %id, elapsed_ms = millis(elapsed), "plugin activated"),
            Some(error) => warn!(plugin = %id, error = %error, "plugin activation failed"),
        }
        if let Some(event) = event {
            self.emit(event);
        }
        outcome
    }

    // ── Deactivation & unload ───────────────────────────────────────────────

    /// Return an active plugin to `loaded`.
    ///
    /// A failing or hanging `deactivate()` is logged and stored on the
    /// record, but the plugin still ends up `loaded`.
    pub async fn deactivate_plugin(&self, id: &str) -> Result<PluginSnapshot> {
        self.deactivate_inner(id).await?;
        self.get(id).ok_or_else(|| Error::not_found(id))
    }

    async fn deactivate_inner(&self, id: &str) -> Result<()> {
        loop {
            let step = self.with_state(|state| -> Result<DeactivationStep> {
                if let Some((_, pending)) = state.in_flight.get(id) {
                    return Ok(DeactivationStep::Wait(pending.clone()));
                }
                if let Some((_, settled)) = state.deactivating.get(id) {
                    return Ok(DeactivationStep::Settle(settled.clone()));
                }
                let record = state.registry.get(id).ok_or_else(|| Error::not_found(id))?;
                match record.status {
                    PluginStatus::Active => {},
                    PluginStatus::Loaded => return Ok(DeactivationStep::Idle),
                    status => return Err(Error::invalid_state(id, status, "deactivate")),
                }
                let instance = record
                    .instance
                    .clone()
                    .ok_or_else(|| Error::invalid_state(id, record.status, "deactivate"))?;
                let generation = record.generation;

                // The record stays active until deactivate() returns; callers
                // that arrive meanwhile wait on the published future.
                let plugin_id = id.to_string();
                let manager = self.clone();
                let task = tokio::spawn(self.clone().run_deactivation(
                    plugin_id.clone(),
                    instance,
                    generation,
                ));
                let settled: Settled = async move {
                    if let Err(e) = task.await {
                        warn!(plugin = %plugin_id, error = %e, "deactivation task ended abnormally");
                    }
                    manager.with_state(|state| {
                        if state
                            .deactivating
                            .get(&plugin_id)
                            .is_some_and(|(g, _)| *g == generation)
                        {
                            state.deactivating.remove(&plugin_id);
                        }
                    });
                }
                .boxed()
                .shared();

                state
                    .deactivating
                    .insert(id.to_string(), (generation, settled.clone()));
                Ok(DeactivationStep::Settle(settled))
            })?;

            match step {
                DeactivationStep::Wait(pending) => {
                    pending.await;
                },
                DeactivationStep::Settle(settled) => {
                    settled.await;
                    return Ok(());
                },
                DeactivationStep::Idle => return Ok(()),
            }
        }
    }

    async fn run_deactivation(self, id: String, instance: Arc<dyn PluginInstance>, generation: u64) {
        let timeout = self.inner.options.deactivation_timeout;
        let handle = tokio::spawn(async move { instance.deactivate().await });
        let failure = match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => Some(format!("{e:#}")),
            Ok(Err(e)) => Some(format!("deactivate() panicked: {e}")),
            Err(_) => Some(format!(
                "deactivate() did not finish within {} ms",
                millis(timeout)
            )),
        };

        // Only an unchanged active record of the same generation goes back
        // to loaded.
        let applied = self.with_state(|state| {
            if state
                .deactivating
                .get(&id)
                .is_some_and(|(g, _)| *g == generation)
            {
                state.deactivating.remove(&id);
            }

            let Some(record) = state
                .registry
                .get_mut(&id)
                .filter(|r| r.generation == generation && r.status == PluginStatus::Active)
            else {
                return false;
            };
            if let Some(reason) = &failure {
                let err = Error::DeactivationFailed {
                    plugin_id: id.clone(),
                    reason: reason.clone(),
                };
                record.error = Some(RecordedError::from(&err));
            }
            record.set_status(PluginStatus::Loaded);
            true
        });

        if !applied {
            debug!(plugin = %id, "dropping deactivation result for a changed plugin");
            return;
        }
        match &failure {
            None => info!(plugin = %id, "plugin deactivated"),
            Some(reason) => warn!(plugin = %id, %reason, "plugin deactivate() failed, marked loaded"),
        }
        self.emit(LifecycleEvent::PluginDeactivated { plugin_id: id });
    }

    /// Dispose a plugin and remove its record.
    ///
    /// Refused with [`Error::UnloadBlocked`] while other registered plugins
    /// depend on it, unless `force` is set, in which case the dependents are
    /// unloaded first, deepest first. Returns the unloaded plugins in the
    /// order they were removed.
    pub async fn unload_plugin(&self, id: &str, options: UnloadOptions) -> Result<Vec<PluginSnapshot>> {
        let _gate = self.inner.load_gate.lock().await;

        let order = self.with_state(|state| -> Result<Vec<String>> {
            if !state.registry.contains(id) {
                return Err(Error::not_found(id));
            }
            let dependents: Vec<String> = state
                .graph
                .dependents_of(id)
                .iter()
                .filter(|d| state.registry.contains(d))
                .cloned()
                .collect();
            if dependents.is_empty() {
                return Ok(vec![id.to_string()]);
            }
            if !options.force {
                return Err(Error::UnloadBlocked {
                    plugin_id: id.to_string(),
                    dependents,
                });
            }

            let mut order = state.graph.transitive_dependents(id);
            order.retain(|d| state.registry.contains(d));
            order.push(id.to_string());
            Ok(order)
        })?;

        if order.len() > 1 {
            info!(plugin = %id, cascade = ?&order[..order.len() - 1], "unloading dependents first");
        }

        let mut unloaded = Vec::with_capacity(order.len());
        for pid in &order {
            if let Some(snapshot) = self.unload_one(pid).await {
                unloaded.push(snapshot);
            }
        }
        Ok(unloaded)
    }

    async fn unload_one(&self, id: &str) -> Option<PluginSnapshot> {
        match self.deactivate_inner(id).await {
            Ok(()) | Err(Error::InvalidState { .. }) => {},
            Err(Error::NotFound { .. }) => return None,
            Err(err) => warn!(plugin = %id, error = %err, "deactivation before unload failed"),
        }

        let (snapshot, instance) = self.with_state(|state| {
            let mut record = state.registry.remove(id)?;
            state.in_flight.remove(id);
            state.deactivating.remove(id);
            let instance = record.instance.take();
            record.set_status(PluginStatus::Unloaded);
            let snapshot = PluginSnapshot {
                enabled: !state.disabled.contains(id),
                ..PluginSnapshot::capture(&record, &state.graph, false)
            };
            state.graph.remove_plugin(id);
            state.index.unregister_plugin(id);
            Some((snapshot, instance))
        })?;

        if let Some(instance) = instance
            && tokio::time::timeout(self.inner.options.deactivation_timeout, instance.dispose())
                .await
                .is_err()
        {
            warn!(plugin = %id, "plugin dispose() timed out");
        }

        info!(plugin = %id, "plugin unloaded");
        self.emit(LifecycleEvent::PluginUnloaded {
            plugin_id: id.to_string(),
        });
        Some(snapshot)
    }

    // ── Enablement & permissions ────────────────────────────────────────────

    pub fn is_enabled(&self, id: &str) -> bool {
        self.with_state(|state| !state.disabled.contains(id))
    }

    /// Registered plugins that are not disabled, in discovery order.
    pub fn enabled_plugins(&self) -> Vec<String> {
        self.with_state(|state| {
            state
                .registry
                .iter()
                .filter(|r| !state.disabled.contains(&r.id))
                .map(|r| r.id.clone())
                .collect()
        })
    }

    /// Every disabled id, registered or not, sorted.
    pub fn disabled_plugins(&self) -> Vec<String> {
        self.with_state(|state| {
            let mut ids: Vec<String> = state.disabled.iter().cloned().collect();
            ids.sort();
            ids
        })
    }

    /// Let `id` load and activate again. Returns whether it was disabled.
    pub fn enable_plugin(&self, id: &str) -> bool {
        let changed = self.with_state(|state| state.disabled.remove(id));
        if changed {
            info!(plugin = %id, "plugin enabled");
        }
        changed
    }

    /// Keep `id` out of loading and activation. An active plugin is
    /// deactivated; a loaded one keeps its module until unloaded. Ids that
    /// are not registered yet are remembered for later discovery.
    pub async fn disable_plugin(&self, id: &str) -> bool {
        let changed = self.with_state(|state| state.disabled.insert(id.to_string()));
        if !changed {
            return false;
        }
        info!(plugin = %id, "plugin disabled");
        match self.deactivate_inner(id).await {
            Ok(()) | Err(Error::NotFound { .. } | Error::InvalidState { .. }) => {},
            Err(err) => warn!(plugin = %id, error = %err, "deactivation after disable failed"),
        }
        true
    }

    /// Granted permissions of `id`, sorted.
    pub fn plugin_permissions(&self, id: &str) -> Vec<String> {
        self.with_state(|state| {
            state
                .grants
                .get(id)
                .map(|granted| granted.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    pub fn has_permission(&self, id: &str, permission: &str) -> bool {
        self.with_state(|state| {
            state
                .grants
                .get(id)
                .is_some_and(|granted| granted.contains(permission))
        })
    }

    /// Replace every grant of `id`. Nothing changes if one of the
    /// permissions is unrecognized.
    pub fn set_plugin_permissions<I, S>(&self, id: &str, permissions: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let permissions: BTreeSet<String> = permissions.into_iter().map(Into::into).collect();
        if let Some(unknown) = permissions.iter().find(|p| !is_known_permission(p)) {
            return Err(Error::UnknownPermission {
                plugin_id: id.to_string(),
                permission: unknown.clone(),
            });
        }
        debug!(plugin = %id, permissions = ?permissions, "replacing permission grants");
        self.with_state(|state| {
            if permissions.is_empty() {
                state.grants.remove(id);
            } else {
                state.grants.insert(id.to_string(), permissions);
            }
        });
        Ok(())
    }

    /// Returns whether the grant is new.
    pub fn grant_permission(&self, id: &str, permission: &str) -> Result<bool> {
        if !is_known_permission(permission) {
            return Err(Error::UnknownPermission {
                plugin_id: id.to_string(),
                permission: permission.to_string(),
            });
        }
        Ok(self.with_state(|state| {
            state
                .grants
                .entry(id.to_string())
                .or_default()
                .insert(permission.to_string())
        }))
    }

    /// Returns whether the permission had been granted.
    pub fn revoke_permission(&self, id: &str, permission: &str) -> bool {
        self.with_state(|state| {
            let Some(granted) = state.grants.get_mut(id) else {
                return false;
            };
            let removed = granted.remove(permission);
            if granted.is_empty() {
                state.grants.remove(id);
            }
            removed
        })
    }

    /// Permissions the manifest of `id` asks for that are not granted.
    pub fn missing_permissions(&self, id: &str) -> Result<Vec<String>> {
        self.with_state(|state| {
            let record = state.registry.get(id).ok_or_else(|| Error::not_found(id))?;
            let granted = state.grants.get(id);
            Ok(record
                .manifest
                .iter()
                .flat_map(|m| m.capabilities.permissions.iter())
                .filter(|p| granted.is_none_or(|g| !g.contains(*p)))
                .cloned()
                .collect())
        })
    }

    // ── Activation events ───────────────────────────────────────────────────

    /// Activate every plugin registered for exactly `event`. Plugins still
    /// `discovered` are loaded first. Matched plugins activate concurrently.
    pub async fn fire(&self, event: &ActivationEvent) -> Vec<ActivationOutcome> {
        self.fire_all(std::slice::from_ref(event)).await
    }

    async fn fire_all(&self, events: &[ActivationEvent]) -> Vec<ActivationOutcome> {
        let targets = self.with_state(|state| {
            let mut seen = HashSet::new();
            let mut targets = Vec::new();
            for event in events {
                for id in state.index.plugins_for(event) {
                    if state.disabled.contains(id) {
                        continue;
                    }
                    if seen.insert(id.clone()) {
                        targets.push((id.clone(), ActivationContext::from_event(event)));
                    }
                }
            }
            targets
        });

        if targets.is_empty() {
            debug!(events = ?events.iter().map(ToString::to_string).collect::<Vec<_>>(), "no plugins registered for event");
            return Vec::new();
        }
        debug!(plugins = targets.len(), "firing activation event");

        join_all(
            targets
                .into_iter()
                .map(|(id, context)| async move { self.activate_for_event(&id, context).await }),
        )
        .await
    }

    async fn activate_for_event(&self, id: &str, context: ActivationContext) -> ActivationOutcome {
        let failed = |err: &Error| {
            let status = self.with_state(|state| state.status_of(id));
            ActivationOutcome::failed(id, status, RecordedError::from(err))
        };

        if self.with_state(|state| state.status_of(id)) == PluginStatus::Discovered
            && let Err(err) = self.load_plugin(id).await
        {
            return failed(&err);
        }

        match self.activate_plugin(id, context).await {
            Ok(outcome) => outcome,
            Err(err) => failed(&err),
        }
    }

    pub async fn on_startup_finished(&self) -> Vec<ActivationOutcome> {
        self.fire_all(&[
            ActivationEvent::of(ActivationKind::StartupFinished, None),
            ActivationEvent::of(ActivationKind::Startup, None),
        ])
        .await
    }

    pub async fn on_command(&self, command: &str) -> Vec<ActivationOutcome> {
        self.fire(&ActivationEvent::of(ActivationKind::Command, Some(command)))
            .await
    }

    pub async fn on_language(&self, language: &str) -> Vec<ActivationOutcome> {
        self.fire(&ActivationEvent::of(ActivationKind::Language, Some(language)))
            .await
    }

    pub async fn on_view(&self, view: &str) -> Vec<ActivationOutcome> {
        self.fire(&ActivationEvent::of(ActivationKind::View, Some(view)))
            .await
    }

    pub async fn on_uri(&self) -> Vec<ActivationOutcome> {
        self.fire(&ActivationEvent::of(ActivationKind::Uri, None)).await
    }

    pub async fn on_file_system(&self, scheme: &str) -> Vec<ActivationOutcome> {
        self.fire(&ActivationEvent::of(ActivationKind::FileSystem, Some(scheme)))
            .await
    }

    /// Fires for a workspace containing `pattern`, matched verbatim against
    /// the declared glob.
    pub async fn on_workspace_contains(&self, pattern: &str) -> Vec<ActivationOutcome> {
        self.fire(&ActivationEvent::of(
            ActivationKind::WorkspaceContains,
            Some(pattern),
        ))
        .await
    }

    pub async fn on_custom_editor(&self, view_type: &str) -> Vec<ActivationOutcome> {
        self.fire(&ActivationEvent::of(ActivationKind::CustomEditor, Some(view_type)))
            .await
    }

    pub async fn on_webview_panel(&self, view_type: &str) -> Vec<ActivationOutcome> {
        self.fire(&ActivationEvent::of(ActivationKind::WebviewPanel, Some(view_type)))
            .await
    }

    // ── Startup ─────────────────────────────────────────────────────────────

    /// Scan `roots`, load everything loadable, announce `initialized`, then
    /// fire `onStartupFinished`.
    pub async fn initialize(&self, roots: &[PathBuf]) -> InitializeReport {
        let discovered = self.scan(roots).await;
        let load = self.load_all().await;

        let plugin_count = self.with_state(|state| state.registry.len());
        info!(plugins = plugin_count, "plugin host initialized");
        self.emit(LifecycleEvent::Initialized { plugin_count });

        let startup = self.on_startup_finished().await;
        InitializeReport {
            discovered,
            load,
            startup,
        }
    }
}
