//! Capabilities the host injects to run plugin code.
//!
//! The runtime never resolves or executes modules itself. A host wires in a
//! [`PluginLoader`] (sandbox, script engine, native registry, ...) and gets
//! back [`PluginInstance`]s whose lifecycle the manager drives.

use std::{path::Path, sync::Arc};

use {async_trait::async_trait, lokus_manifest::ManifestV2};

use crate::activation::ActivationContext;

/// A live plugin instance.
///
/// Errors returned here are isolated to the plugin: they are stored on its
/// record and reported through lifecycle events, never propagated.
#[async_trait]
pub trait PluginInstance: Send + Sync {
    async fn activate(&self, context: ActivationContext) -> anyhow::Result<()>;

    async fn deactivate(&self) -> anyhow::Result<()>;

    /// Release resources before the instance is dropped on unload.
    async fn dispose(&self) {}
}

/// Instantiates plugin modules.
#[async_trait]
pub trait PluginLoader: Send + Sync {
    /// Build an instance for `manifest`, whose package lives at `path`.
    async fn load_module(
        &self,
        manifest: &ManifestV2,
        path: &Path,
    ) -> anyhow::Result<Arc<dyn PluginInstance>>;
}
