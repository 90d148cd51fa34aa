use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("unresolvable linked identifier: {0}")]
    Unresolvable(String),

    #[error("empty address")]
    EmptyAddress,
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("io error on {path}: {message}")]
    Io { path: String, message: String },

    #[error("save operation failed: {0}")]
    SaveFailed(String),

    #[error("credential save queue is closed")]
    QueueClosed,
}

impl CredentialError {
    pub(crate) fn io(path: &std::path::Path, error: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SleepError {
    #[error("wait cancelled")]
    Cancelled,
}
