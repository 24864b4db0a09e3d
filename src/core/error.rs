use thiserror::Error;

/// Foundation error type shared by the record model and codecs.
///
/// Uses `thiserror` with `#[source]` annotations so the full error chain
/// survives into logs and bus events.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Serialization or deserialization through serde_json failed.
    #[error("serialization failed")]
    Serialization(#[source] serde_json::Error),

    /// A required field was absent from a stored record.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// A stored field could not be parsed into its typed form.
    #[error("invalid value for field {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },

    /// An unknown execution status string was encountered.
    #[error("invalid execution status: {0:?}")]
    InvalidStatus(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
