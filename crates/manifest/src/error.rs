use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("manifest must be a JSON object")]
    NotAnObject,

    #[error("unsupported manifest schema tag '{tag}'")]
    UnsupportedSchema { tag: String },

    #[error("manifest declares `engines` without a schema tag; add \"manifest\": \"2.0\"")]
    UntaggedDocument,

    #[error("invalid manifest: {}", errors.join("; "))]
    Invalid { errors: Vec<String> },

    #[error("manifest cannot be migrated: {}", reasons.join("; "))]
    Migration { reasons: Vec<String> },

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
}

impl lokus_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

lokus_common::impl_context!();
