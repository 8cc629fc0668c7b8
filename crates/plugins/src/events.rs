//! Lifecycle events published by the manager.

use std::fmt;

use serde::Serialize;

use crate::{activation::ActivationContext, error::RecordedError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Initialized {
        plugin_count: usize,
    },
    PluginLoaded {
        plugin_id: String,
    },
    PluginActivated {
        plugin_id: String,
        context: ActivationContext,
    },
    ActivationFailed {
        plugin_id: String,
        error: RecordedError,
    },
    PluginDeactivated {
        plugin_id: String,
    },
    PluginUnloaded {
        plugin_id: String,
    },
    /// Discovery or load failure.
    PluginError {
        plugin_id: String,
        error: RecordedError,
    },
}

impl LifecycleEvent {
    pub fn kind(&self) -> LifecycleEventKind {
        match self {
            Self::Initialized { .. } => LifecycleEventKind::Initialized,
            Self::PluginLoaded { .. } => LifecycleEventKind::PluginLoaded,
            Self::PluginActivated { .. } => LifecycleEventKind::PluginActivated,
            Self::ActivationFailed { .. } => LifecycleEventKind::ActivationFailed,
            Self::PluginDeactivated { .. } => LifecycleEventKind::PluginDeactivated,
            Self::PluginUnloaded { .. } => LifecycleEventKind::PluginUnloaded,
            Self::PluginError { .. } => LifecycleEventKind::PluginError,
        }
    }

    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            Self::Initialized { .. } => None,
            Self::PluginLoaded { plugin_id }
            | Self::PluginActivated { plugin_id, .. }
            | Self::ActivationFailed { plugin_id, .. }
            | Self::PluginDeactivated { plugin_id }
            | Self::PluginUnloaded { plugin_id }
            | Self::PluginError { plugin_id, .. } => Some(plugin_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventKind {
    Initialized,
    PluginLoaded,
    PluginActivated,
    ActivationFailed,
    PluginDeactivated,
    PluginUnloaded,
    PluginError,
}

impl LifecycleEventKind {
    pub const ALL: &'static [Self] = &[
        Self::Initialized,
        Self::PluginLoaded,
        Self::PluginActivated,
        Self::ActivationFailed,
        Self::PluginDeactivated,
        Self::PluginUnloaded,
        Self::PluginError,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::PluginLoaded => "plugin_loaded",
            Self::PluginActivated => "plugin_activated",
            Self::ActivationFailed => "activation_failed",
            Self::PluginDeactivated => "plugin_deactivated",
            Self::PluginUnloaded => "plugin_unloaded",
            Self::PluginError => "plugin_error",
        }
    }
}

impl fmt::Display for LifecycleEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
