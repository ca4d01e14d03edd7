use thiserror::Error;

/// Result type for Quire operations
pub type QuireResult<T> = Result<T, QuireError>;

/// Errors raised while transforming or applying an operation sequence
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("operation expects a text of length {expected}, found {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("revision {base} has been purged from history (oldest retained base is {oldest})")]
    RevisionPurged { base: u64, oldest: u64 },

    #[error("revision {base} is ahead of the current revision {current}")]
    RevisionInFuture { base: u64, current: u64 },

    #[error("offset {offset} does not fall on a UTF-16 character boundary")]
    InvalidOffset { offset: usize },

    #[error("malformed operation: {0}")]
    Malformed(String),
}

/// Errors that can occur in Quire operations
#[derive(Error, Debug)]
pub enum QuireError {
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("Client {client_id} is read-only and cannot submit edits")]
    PermissionViolation { client_id: u64 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Document not found: {id}")]
    DocumentNotFound { id: String },

    #[error("Session for document {id} is not accepting clients")]
    SessionUnavailable { id: String },

    #[error("Session manager is not running")]
    ManagerClosed,

    #[error("Gave up joining document {id} after {attempts} attempts")]
    JoinTimedOut { id: String, attempts: u32 },

    #[error("Admission refused: {0}")]
    Admission(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QuireError {
    /// Whether this error was caused by a misbehaving client rather than the server
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            QuireError::Protocol { .. }
                | QuireError::Transform(_)
                | QuireError::PermissionViolation { .. }
        )
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        QuireError::Protocol {
            message: message.into(),
        }
    }
}
