use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    thiserror::Error,
};

use crate::registry::PluginStatus;

#[derive(Debug, Error)]
pub enum Error {
    #[error("manifest for '{plugin_id}' is invalid: {reason}")]
    ManifestValidation { plugin_id: String, reason: String },

    #[error("manifest for '{plugin_id}' could not be migrated: {reason}")]
    ManifestMigration { plugin_id: String, reason: String },

    #[error("dependency cycle between {}", members.join(" -> "))]
    DependencyCycle { members: Vec<String> },

    #[error("plugin '{plugin_id}' depends on '{missing}', which is not installed")]
    MissingDependency { plugin_id: String, missing: String },

    #[error("plugin '{plugin_id}' did not activate within {timeout_ms} ms")]
    ActivationTimeout { plugin_id: String, timeout_ms: u64 },

    #[error("plugin '{plugin_id}' failed to activate: {reason}")]
    ActivationFailed { plugin_id: String, reason: String },

    #[error("plugin '{plugin_id}' failed to deactivate: {reason}")]
    DeactivationFailed { plugin_id: String, reason: String },

    #[error("cannot unload '{plugin_id}': required by {}", dependents.join(", "))]
    UnloadBlocked {
        plugin_id: String,
        dependents: Vec<String>,
    },

    #[error("plugin '{plugin_id}' is not registered")]
    NotFound { plugin_id: String },

    #[error("cannot {operation} plugin '{plugin_id}' while it is {status}")]
    InvalidState {
        plugin_id: String,
        status: PluginStatus,
        operation: &'static str,
    },

    #[error("plugin '{plugin_id}' failed to load: {reason}")]
    LoadFailed { plugin_id: String, reason: String },

    #[error("plugin '{plugin_id}' cannot load because dependency '{dependency}' failed")]
    DependencyFailed {
        plugin_id: String,
        dependency: String,
    },

    #[error("plugin '{plugin_id}' requires host {required}, running {host}")]
    IncompatibleHost {
        plugin_id: String,
        required: String,
        host: String,
    },

    #[error("plugin '{plugin_id}' is disabled")]
    Disabled { plugin_id: String },

    #[error("'{permission}' is not a recognized permission (granting to '{plugin_id}')")]
    UnknownPermission {
        plugin_id: String,
        permission: String,
    },

    #[error(transparent)]
    Manifest(#[from] lokus_manifest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn not_found(plugin_id: impl Into<String>) -> Self {
        Self::NotFound {
            plugin_id: plugin_id.into(),
        }
    }

    #[must_use]
    pub fn invalid_state(
        plugin_id: impl Into<String>,
        status: PluginStatus,
        operation: &'static str,
    ) -> Self {
        Self::InvalidState {
            plugin_id: plugin_id.into(),
            status,
            operation,
        }
    }

    /// Classify a manifest intake failure for `plugin_id`.
    #[must_use]
    pub fn from_manifest(plugin_id: impl Into<String>, err: lokus_manifest::Error) -> Self {
        let plugin_id = plugin_id.into();
        match err {
            lokus_manifest::Error::Migration { reasons } => Self::ManifestMigration {
                plugin_id,
                reason: reasons.join("; "),
            },
            other => Self::ManifestValidation {
                plugin_id,
                reason: other.to_string(),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ManifestValidation { .. } | Self::Manifest(_) => ErrorKind::ManifestValidation,
            Self::ManifestMigration { .. } => ErrorKind::ManifestMigration,
            Self::DependencyCycle { .. } => ErrorKind::DependencyCycle,
            Self::MissingDependency { .. } => ErrorKind::MissingDependency,
            Self::ActivationTimeout { .. } => ErrorKind::ActivationTimeout,
            Self::ActivationFailed { .. } => ErrorKind::ActivationFailed,
            Self::DeactivationFailed { .. } => ErrorKind::DeactivationFailed,
            Self::UnloadBlocked { .. } => ErrorKind::UnloadBlocked,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::LoadFailed { .. } => ErrorKind::LoadFailed,
            Self::DependencyFailed { .. } => ErrorKind::DependencyFailed,
            Self::IncompatibleHost { .. } => ErrorKind::IncompatibleHost,
            Self::Disabled { .. } => ErrorKind::Disabled,
            Self::UnknownPermission { .. } => ErrorKind::UnknownPermission,
            Self::Io(_) => ErrorKind::Io,
            Self::Message { .. } => ErrorKind::Other,
        }
    }
}

impl lokus_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

lokus_common::impl_context!();

// ── Recorded errors ─────────────────────────────────────────────────────────

/// Stable classification of an [`Error`], safe to store and serialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ManifestValidation,
    ManifestMigration,
    DependencyCycle,
    MissingDependency,
    ActivationTimeout,
    ActivationFailed,
    DeactivationFailed,
    UnloadBlocked,
    NotFound,
    InvalidState,
    LoadFailed,
    DependencyFailed,
    IncompatibleHost,
    Disabled,
    UnknownPermission,
    Io,
    Other,
}

impl ErrorKind {
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::ManifestValidation => "manifest_validation",
            Self::ManifestMigration => "manifest_migration",
            Self::DependencyCycle => "dependency_cycle",
            Self::MissingDependency => "missing_dependency",
            Self::ActivationTimeout => "activation_timeout",
            Self::ActivationFailed => "activation_failed",
            Self::DeactivationFailed => "deactivation_failed",
            Self::UnloadBlocked => "unload_blocked",
            Self::NotFound => "not_found",
            Self::InvalidState => "invalid_state",
            Self::LoadFailed => "load_failed",
            Self::DependencyFailed => "dependency_failed",
            Self::IncompatibleHost => "incompatible_host",
            Self::Disabled => "disabled",
            Self::UnknownPermission => "unknown_permission",
            Self::Io => "io",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// An error as stored on a plugin record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedError {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl From<&Error> for RecordedError {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            at: Utc::now(),
        }
    }
}

impl std::fmt::Display for RecordedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_errors_are_classified() {
        let migration = Error::from_manifest(
            "p",
            lokus_manifest::Error::Migration {
                reasons: vec!["missing main".into()],
            },
        );
        assert_eq!(migration.kind(), ErrorKind::ManifestMigration);

        let invalid = Error::from_manifest("p", lokus_manifest::Error::NotAnObject);
        assert_eq!(invalid.kind(), ErrorKind::ManifestValidation);
    }

    #[test]
    fn recorded_error_keeps_kind_and_message() {
        let err = Error::DependencyCycle {
            members: vec!["a".into(), "b".into()],
        };
        let recorded = RecordedError::from(&err);
        assert_eq!(recorded.kind, ErrorKind::DependencyCycle);
        assert_eq!(recorded.message, "dependency cycle between a -> b");
        assert_eq!(
            serde_json::to_value(&recorded).unwrap()["kind"],
            "dependency_cycle"
        );
    }

    #[test]
    fn context_wraps_foreign_errors() {
        let parsed: std::result::Result<semver::Version, _> = semver::Version::parse("x");
        let err = parsed.context("invalid host.version").unwrap_err();
        assert!(matches!(err, Error::Message { .. }));
        assert!(err.to_string().starts_with("invalid host.version: "));
    }
}
