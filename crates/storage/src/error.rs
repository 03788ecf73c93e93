use std::path::PathBuf;

/// All errors that can be returned by the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No task with this id in the store.
    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: String },

    /// No archived result under this id.
    #[error("archive not found: {archive_id}")]
    ArchiveNotFound { archive_id: String },

    /// Archive ids may only contain ASCII letters, digits, `_` and `-`.
    #[error("invalid archive id: {0}")]
    InvalidArchiveId(String),

    /// The archived file no longer matches the digest recorded at archive time.
    #[error("archive {archive_id} was modified after it was written")]
    Tampered { archive_id: String },

    #[error("sequence {0} is not in the catalog")]
    UnknownSequence(u32),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed JSON / catalog content.
    #[error("parse error: {0}")]
    Parse(String),

    /// A backend-specific error (HTTP failure, task join error, ...).
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}
