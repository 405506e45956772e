//! Persistence seams for the version engine.
//!
//! [`ContentStore`] owns the current prompt rows; [`VersionLedger`] owns the
//! append-only history. Both are implemented by one backend because
//! [`VersionLedger::append`] must write a version row and advance its
//! document in a single transaction.
//!
//! `VersionControlService` holds an `Arc<dyn VersionStore>`; the Postgres
//! backend is used in production and an in-memory one in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::prompt::{ChangeKind, PromptDocument, VersionRecord};
use crate::versioning::patch::Patch;

#[derive(Debug, Error)]
pub enum StoreError {
    /// `(document_id, version)` is taken, or the document already moved past
    /// `version - 1`. Raised by the database constraint, never by a
    /// pre-insert check.
    #[error("version {version} of document {document_id} is already taken")]
    VersionConflict { document_id: Uuid, version: i32 },

    #[error("document {0} not found")]
    DocumentNotFound(Uuid),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored row could not be decoded: {0}")]
    Decode(String),
}

/// Natural key of a version row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionKey {
    pub document_id: Uuid,
    pub version: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: i64,
    pub offset: i64,
}

/// A version row about to be appended.
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub document_id: Uuid,
    pub version: i32,
    pub content: String,
    pub diff: Option<Patch>,
    pub change_kind: ChangeKind,
    pub message: String,
    pub created_by: Uuid,
}

impl NewVersion {
    pub fn key(&self) -> VersionKey {
        VersionKey {
            document_id: self.document_id,
            version: self.version,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewDocument {
    pub id: Uuid,
    pub name: String,
    pub content: String,
    pub created_by: Uuid,
}

/// The document together with its head version, read from one snapshot.
#[derive(Debug, Clone)]
pub struct DocumentHead {
    pub document: PromptDocument,
    pub latest: Option<VersionRecord>,
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn get_document(&self, document_id: Uuid) -> Result<Option<PromptDocument>, StoreError>;

    /// Reads the document and its highest version row consistently.
    async fn head(&self, document_id: Uuid) -> Result<Option<DocumentHead>, StoreError>;

    /// Inserts the document and its version-1 row atomically.
    async fn create_document(
        &self,
        document: NewDocument,
        initial: NewVersion,
    ) -> Result<(PromptDocument, VersionRecord), StoreError>;
}

#[async_trait]
pub trait VersionLedger: Send + Sync {
    /// Appends `record` and advances the document's `content`,
    /// `current_version` and `updated_by` in the same transaction.
    async fn append(&self, record: NewVersion) -> Result<(PromptDocument, VersionRecord), StoreError>;

    async fn latest(&self, document_id: Uuid) -> Result<Option<VersionRecord>, StoreError>;

    async fn get(&self, document_id: Uuid, version: i32) -> Result<Option<VersionRecord>, StoreError>;

    /// Newest first.
    async fn list_descending(
        &self,
        document_id: Uuid,
        page: PageRequest,
    ) -> Result<Vec<VersionRecord>, StoreError>;

    /// Oldest first: versions in `(after, through]`, at most `limit` rows.
    /// Rows up to a known head never change, so callers can walk them page by
    /// page with `after` set to the last version seen.
    async fn list_ascending(
        &self,
        document_id: Uuid,
        after: i32,
        through: i32,
        limit: i64,
    ) -> Result<Vec<VersionRecord>, StoreError>;

    /// Rows for the keys that exist; missing keys are simply absent.
    async fn get_many(&self, keys: &[VersionKey]) -> Result<Vec<VersionRecord>, StoreError>;

    async fn count_versions(&self, document_id: Uuid) -> Result<i64, StoreError>;
}

pub trait VersionStore: ContentStore + VersionLedger {}

impl<T: ContentStore + VersionLedger> VersionStore for T {}
