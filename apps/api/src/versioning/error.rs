use thiserror::Error;
use uuid::Uuid;

use crate::versioning::store::StoreError;

/// Failures of the version engine, as seen by its callers.
#[derive(Debug, Error)]
pub enum VersionError {
    /// Integrity fault: the document has no usable version chain.
    #[error("document {document_id} has a corrupt history: {reason}")]
    CorruptHistory { document_id: Uuid, reason: String },

    #[error("version {version} of document {document_id} not found")]
    VersionNotFound { document_id: Uuid, version: i32 },

    #[error("document {0} not found")]
    DocumentNotFound(Uuid),

    /// A stored diff does not reproduce its snapshot. The snapshot stays
    /// authoritative.
    #[error("stored diff of version {version} of document {document_id} does not apply: {reason}")]
    PatchMismatch {
        document_id: Uuid,
        version: i32,
        reason: String,
    },

    /// Lost a version-number race. Internal; the service retries once and
    /// then reports `ConcurrentEditConflict`.
    #[error("version {version} of document {document_id} was claimed by a concurrent writer")]
    VersionConflict { document_id: Uuid, version: i32 },

    #[error("document {document_id} was changed by someone else; reload and try again")]
    ConcurrentEditConflict { document_id: Uuid },

    #[error(transparent)]
    Store(StoreError),
}

impl VersionError {
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

impl From<StoreError> for VersionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict {
                document_id,
                version,
            } => Self::VersionConflict {
                document_id,
                version,
            },
            StoreError::DocumentNotFound(id) => Self::DocumentNotFound(id),
            other => Self::Store(other),
        }
    }
}
