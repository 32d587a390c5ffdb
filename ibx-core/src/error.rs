use thiserror::Error;

#[derive(Error, Debug)]
pub enum IbxError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Format error: {0}")]
    Format(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("session expired")]
    SessionExpired,

    #[error("session unknown")]
    SessionUnknown,

    #[error("a live session is required for backup {0}")]
    SessionRequired(String),

    #[error("backup {0} is already being indexed")]
    AlreadyIndexing(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("backup {0} has not been decrypted")]
    NotDecrypted(String),

    #[error("group {group} of backup {backup} has not been extracted")]
    NotExtracted { backup: String, group: String },

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("artifacts failed: {}", .0.join(", "))]
    PartialArtifactFailure(Vec<String>),

    #[error("worker error: {0}")]
    Worker(String),
}

impl IbxError {
    /// The caller has to unlock the backup again before retrying.
    pub fn is_session_error(&self) -> bool {
        matches!(
            self,
            IbxError::SessionExpired | IbxError::SessionUnknown | IbxError::SessionRequired(_)
        )
    }

    /// Failures scoped to one file or artifact; never abort the surrounding operation.
    pub fn is_contained(&self) -> bool {
        matches!(
            self,
            IbxError::DecryptionFailed(_) | IbxError::PartialArtifactFailure(_)
        )
    }

    pub(crate) fn format(msg: impl Into<String>) -> Self {
        IbxError::Format(msg.into())
    }
}

// Convenient crate-wide result type
pub type Result<T> = std::result::Result<T, IbxError>;
