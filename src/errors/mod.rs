use thiserror::Error;

/// Error taxonomy for the control plane.
///
/// Synchronous calls return these directly. Background work never propagates
/// them past the task runner; failures there are captured into the owning
/// `Task` or `Migration` record instead.
#[derive(Error, Debug)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The pool for a hypervisor endpoint is exhausted or the endpoint is
    /// unreachable. Retryable.
    #[error("no connection available for {uri}")]
    ConnectionUnavailable { uri: String },

    #[error("no active host satisfies the placement request")]
    NoCandidate,

    #[error("driver error: {0}")]
    Driver(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("http error: {0}")]
    Http(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Whether the caller may retry the operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConnectionUnavailable { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Http(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
