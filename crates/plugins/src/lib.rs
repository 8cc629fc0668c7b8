//! Plugin runtime: discovery, dependency-ordered loading and event-driven
//! activation.
//!
//! Packages are found on disk (or any [`ManifestSource`]), their manifests
//! accepted through `lokus-manifest`, and the resulting records driven
//! through `discovered -> loaded -> active` by a [`PluginManager`]. Executing
//! plugin code is delegated to a host-supplied [`PluginLoader`].

pub mod activation;
pub mod discovery;
pub mod error;
pub mod events;
pub mod loader;
pub mod manager;
pub mod registry;
pub mod resolver;

pub use {
    activation::{ActivationContext, ActivationIndex, ActivationOutcome},
    discovery::{FsManifestSource, ManifestSource, read_package},
    error::{Error, ErrorKind, RecordedError, Result},
    events::{LifecycleEvent, LifecycleEventKind},
    loader::{PluginInstance, PluginLoader},
    manager::{
        InitializeReport, LoadReport, ManagerOptions, PluginManager, SkippedPlugin, UnloadOptions,
    },
    registry::{PluginErrorEntry, PluginSnapshot, PluginStats, PluginStatus},
    resolver::{DependencyGraph, LoadPlan},
};
