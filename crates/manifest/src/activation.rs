//! Activation event grammar.
//!
//! An activation event is either a bare global event (`onStartupFinished`)
//! or a namespaced `kind:subject` pair (`onCommand:notes.create`). Parsing
//! is permissive: any well-formed string becomes an [`ActivationEvent`], and
//! [`ActivationEvent::recognized_kind`] tells whether the runtime knows what
//! to do with it.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ── Known kinds ─────────────────────────────────────────────────────────────

/// Activation event kinds the runtime can fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivationKind {
    StartupFinished,
    /// Legacy v1 spelling, rewritten to `onStartupFinished` on migration.
    Startup,
    Command,
    Language,
    View,
    Uri,
    FileSystem,
    WorkspaceContains,
    CustomEditor,
    WebviewPanel,
}

impl ActivationKind {
    pub const ALL: &'static [Self] = &[
        Self::StartupFinished,
        Self::Startup,
        Self::Command,
        Self::Language,
        Self::View,
        Self::Uri,
        Self::FileSystem,
        Self::WorkspaceContains,
        Self::CustomEditor,
        Self::WebviewPanel,
    ];

    /// Spelling used inside manifests.
    pub const fn event_name(self) -> &'static str {
        match self {
            Self::StartupFinished => "onStartupFinished",
            Self::Startup => "onStartup",
            Self::Command => "onCommand",
            Self::Language => "onLanguage",
            Self::View => "onView",
            Self::Uri => "onUri",
            Self::FileSystem => "onFileSystem",
            Self::WorkspaceContains => "workspaceContains",
            Self::CustomEditor => "onCustomEditor",
            Self::WebviewPanel => "onWebviewPanel",
        }
    }

    /// Short tag handed to plugin code in its activation context.
    pub const fn trigger_name(self) -> &'static str {
        match self {
            Self::StartupFinished => "startup_finished",
            Self::Startup => "startup",
            Self::Command => "command",
            Self::Language => "language",
            Self::View => "view",
            Self::Uri => "uri",
            Self::FileSystem => "file_system",
            Self::WorkspaceContains => "workspace_contains",
            Self::CustomEditor => "custom_editor",
            Self::WebviewPanel => "webview_panel",
        }
    }

    /// Whether the event must carry a `:subject`.
    pub const fn takes_subject(self) -> bool {
        !matches!(self, Self::StartupFinished | Self::Startup | Self::Uri)
    }

    pub fn from_event_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.event_name() == name)
    }

    pub fn from_trigger_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.trigger_name() == name)
    }
}

impl fmt::Display for ActivationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}

// ── ActivationEvent ─────────────────────────────────────────────────────────

/// A parsed activation event key. Used as the bucket key of the activation
/// index, so equality is exact string equality of kind and subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActivationEvent {
    kind: String,
    subject: Option<String>,
}

impl ActivationEvent {
    /// A bare event such as `onStartupFinished`.
    pub fn global(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            subject: None,
        }
    }

    /// A namespaced event such as `onCommand:notes.create`.
    pub fn scoped(kind: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            subject: Some(subject.into()),
        }
    }

    pub fn of(kind: ActivationKind, subject: Option<&str>) -> Self {
        Self {
            kind: kind.event_name().to_string(),
            subject: subject.map(str::to_string),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// The known kind, if the kind is known and the subject presence matches
    /// what that kind expects.
    pub fn recognized_kind(&self) -> Option<ActivationKind> {
        ActivationKind::from_event_name(&self.kind)
            .filter(|k| k.takes_subject() == self.subject.is_some())
    }

    pub fn is_recognized(&self) -> bool {
        self.recognized_kind().is_some()
    }
}

impl fmt::Display for ActivationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subject {
            Some(subject) => write!(f, "{}:{subject}", self.kind),
            None => f.write_str(&self.kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed activation event '{0}'")]
pub struct ParseActivationEventError(pub String);

impl FromStr for ActivationEvent {
    type Err = ParseActivationEventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let malformed = || ParseActivationEventError(s.to_string());

        match trimmed.split_once(':') {
            Some((kind, subject)) => {
                let (kind, subject) = (kind.trim(), subject.trim());
                if kind.is_empty() || subject.is_empty() {
                    return Err(malformed());
                }
                Ok(Self::scoped(kind, subject))
            },
            None if trimmed.is_empty() => Err(malformed()),
            None => Ok(Self::global(trimmed)),
        }
    }
}

impl Serialize for ActivationEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ActivationEvent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("onStartupFinished", "onStartupFinished", None)]
    #[case("onCommand:test.command", "onCommand", Some("test.command"))]
    #[case("onLanguage:javascript", "onLanguage", Some("javascript"))]
    #[case("  workspaceContains:**/.lokus ", "workspaceContains", Some("**/.lokus"))]
    #[case("onView:notes:outline", "onView", Some("notes:outline"))]
    fn parses_event_strings(
        #[case] raw: &str,
        #[case] kind: &str,
        #[case] subject: Option<&str>,
    ) {
        let event: ActivationEvent = raw.parse().unwrap();
        assert_eq!(event.kind(), kind);
        assert_eq!(event.subject(), subject);
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case("onCommand:")]
    #[case(":orphan")]
    fn rejects_malformed(#[case] raw: &str) {
        assert!(raw.parse::<ActivationEvent>().is_err());
    }

    #[test]
    fn display_round_trips_through_the_index_key() {
        let event: ActivationEvent = "onCommand:test.command".parse().unwrap();
        assert_eq!(event.to_string(), "onCommand:test.command");
        assert_eq!(event, ActivationEvent::of(ActivationKind::Command, Some("test.command")));
    }

    #[rstest]
    #[case("onStartupFinished", true)]
    #[case("onCommand:x", true)]
    #[case("onCommand", false)]
    #[case("onStartupFinished:x", false)]
    #[case("onFooBar:x", false)]
    #[case("onUri", true)]
    fn recognition_checks_subject_shape(#[case] raw: &str, #[case] recognized: bool) {
        let event: ActivationEvent = raw.parse().unwrap();
        assert_eq!(event.is_recognized(), recognized);
    }

    #[test]
    fn trigger_names_are_unique() {
        for kind in ActivationKind::ALL {
            assert_eq!(ActivationKind::from_trigger_name(kind.trigger_name()), Some(*kind));
            assert_eq!(ActivationKind::from_event_name(kind.event_name()), Some(*kind));
        }
    }

    #[test]
    fn serde_uses_plain_strings() {
        let events: Vec<ActivationEvent> =
            serde_json::from_str(r#"["onStartupFinished","onLanguage:markdown"]"#).unwrap();
        assert_eq!(
            serde_json::to_string(&events).unwrap(),
            r#"["onStartupFinished","onLanguage:markdown"]"#
        );
    }
}
