use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use tracing::debug;
use uuid::Uuid;

use crate::models::prompt::{ChangeKind, PromptDocument, VersionRecord};
use crate::versioning::patch::Patch;
use crate::versioning::store::{
    ContentStore, DocumentHead, NewDocument, NewVersion, PageRequest, StoreError, VersionKey,
    VersionLedger,
};

const DOCUMENT_COLUMNS: &str =
    "id, name, content, current_version, created_by, created_at, updated_by, updated_at";

const VERSION_COLUMNS: &str =
    "id, document_id, version, content, diff, change_kind, message, created_by, created_at";

/// Unique constraint guarding `(document_id, version)`.
const VERSION_UNIQUE_CONSTRAINT: &str = "uq_prompt_versions_document_version";

/// Raw `prompt_versions` row; `diff` and `change_kind` are decoded into
/// their typed forms by `TryFrom`.
#[derive(Debug, FromRow)]
struct VersionRow {
    id: Uuid,
    document_id: Uuid,
    version: i32,
    content: String,
    diff: Option<Value>,
    change_kind: String,
    message: String,
    created_by: Uuid,
    created_at: DateTime<Utc>,
}

impl TryFrom<VersionRow> for VersionRecord {
    type Error = StoreError;

    fn try_from(row: VersionRow) -> Result<Self, Self::Error> {
        let diff = row
            .diff
            .map(serde_json::from_value::<Patch>)
            .transpose()
            .map_err(|e| StoreError::Decode(format!("diff of version {}: {e}", row.version)))?;
        let change_kind = row
            .change_kind
            .parse::<ChangeKind>()
            .map_err(|e| StoreError::Decode(format!("{e}")))?;
        Ok(VersionRecord {
            id: row.id,
            document_id: row.document_id,
            version: row.version,
            content: row.content,
            diff,
            change_kind,
            message: row.message,
            created_by: row.created_by,
            created_at: row.created_at,
        })
    }
}

fn decode_all(rows: Vec<VersionRow>) -> Result<Vec<VersionRecord>, StoreError> {
    rows.into_iter().map(VersionRecord::try_from).collect()
}

/// Maps insert failures on `prompt_versions` into ledger errors.
///
/// - `23505` on the version constraint: a concurrent writer claimed the number.
/// - `23503`: the owning prompt row does not exist.
fn classify_insert_error(err: sqlx::Error, key: VersionKey) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        match db_err.code().as_deref() {
            Some("23505") if db_err.constraint() == Some(VERSION_UNIQUE_CONSTRAINT) => {
                debug!(
                    document_id = %key.document_id,
                    version = key.version,
                    "version unique constraint rejected insert"
                );
                return StoreError::VersionConflict {
                    document_id: key.document_id,
                    version: key.version,
                };
            }
            Some("23503") => return StoreError::DocumentNotFound(key.document_id),
            _ => {}
        }
    }
    StoreError::Database(err)
}

fn encode_diff(diff: Option<&Patch>) -> Result<Option<Value>, StoreError> {
    diff.map(serde_json::to_value)
        .transpose()
        .map_err(|e| StoreError::Decode(e.to_string()))
}

/// PostgreSQL-backed content store and version ledger.
#[derive(Clone)]
pub struct PgVersionStore {
    pool: PgPool,
}

impl PgVersionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_version<'c, E>(executor: E, record: &NewVersion) -> Result<VersionRecord, StoreError>
    where
        E: sqlx::Executor<'c, Database = sqlx::Postgres>,
    {
        let query = format!(
            "INSERT INTO prompt_versions
                (document_id, version, content, diff, change_kind, message, created_by)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {VERSION_COLUMNS}"
        );
        let row = sqlx::query_as::<_, VersionRow>(&query)
            .bind(record.document_id)
            .bind(record.version)
            .bind(&record.content)
            .bind(encode_diff(record.diff.as_ref())?)
            .bind(record.change_kind.as_str())
            .bind(&record.message)
            .bind(record.created_by)
            .fetch_one(executor)
            .await
            .map_err(|e| classify_insert_error(e, record.key()))?;
        VersionRecord::try_from(row)
    }
}

#[async_trait]
impl ContentStore for PgVersionStore {
    async fn get_document(&self, document_id: Uuid) -> Result<Option<PromptDocument>, StoreError> {
        let query = format!("SELECT {DOCUMENT_COLUMNS} FROM prompts WHERE id = $1");
        Ok(sqlx::query_as::<_, PromptDocument>(&query)
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn head(&self, document_id: Uuid) -> Result<Option<DocumentHead>, StoreError> {
        // Both reads must see the same snapshot, or a commit landing between
        // them would look like a document ahead of its ledger.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let query = format!("SELECT {DOCUMENT_COLUMNS} FROM prompts WHERE id = $1");
        let document = sqlx::query_as::<_, PromptDocument>(&query)
            .bind(document_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(document) = document else {
            tx.commit().await?;
            return Ok(None);
        };

        let query = format!(
            "SELECT {VERSION_COLUMNS} FROM prompt_versions
             WHERE document_id = $1
             ORDER BY version DESC
             LIMIT 1"
        );
        let latest = sqlx::query_as::<_, VersionRow>(&query)
            .bind(document_id)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(DocumentHead {
            document,
            latest: latest.map(VersionRecord::try_from).transpose()?,
        }))
    }

    async fn create_document(
        &self,
        document: NewDocument,
        initial: NewVersion,
    ) -> Result<(PromptDocument, VersionRecord), StoreError> {
        let mut tx = self.pool.begin().await?;

        let query = format!(
            "INSERT INTO prompts (id, name, content, current_version, created_by, updated_by)
             VALUES ($1, $2, $3, $4, $5, $5)
             RETURNING {DOCUMENT_COLUMNS}"
        );
        let created = sqlx::query_as::<_, PromptDocument>(&query)
            .bind(document.id)
            .bind(&document.name)
            .bind(&document.content)
            .bind(initial.version)
            .bind(document.created_by)
            .fetch_one(&mut *tx)
            .await?;

        let record = Self::insert_version(&mut *tx, &initial).await?;
        tx.commit().await?;

        Ok((created, record))
    }
}

#[async_trait]
impl VersionLedger for PgVersionStore {
    async fn append(&self, record: NewVersion) -> Result<(PromptDocument, VersionRecord), StoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = Self::insert_version(&mut *tx, &record).await?;

        // Only advance from exactly the predecessor; anything else means the
        // head moved under us.
        let query = format!(
            "UPDATE prompts
             SET content = $2, current_version = $3, updated_by = $4, updated_at = now()
             WHERE id = $1 AND current_version = $3 - 1
             RETURNING {DOCUMENT_COLUMNS}"
        );
        let document = sqlx::query_as::<_, PromptDocument>(&query)
            .bind(record.document_id)
            .bind(&record.content)
            .bind(record.version)
            .bind(record.created_by)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(document) = document else {
            tx.rollback().await?;
            return Err(StoreError::VersionConflict {
                document_id: record.document_id,
                version: record.version,
            });
        };

        tx.commit().await?;
        Ok((document, inserted))
    }

    async fn latest(&self, document_id: Uuid) -> Result<Option<VersionRecord>, StoreError> {
        let query = format!(
            "SELECT {VERSION_COLUMNS} FROM prompt_versions
             WHERE document_id = $1
             ORDER BY version DESC
             LIMIT 1"
        );
        sqlx::query_as::<_, VersionRow>(&query)
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?
            .map(VersionRecord::try_from)
            .transpose()
    }

    async fn get(&self, document_id: Uuid, version: i32) -> Result<Option<VersionRecord>, StoreError> {
        let query = format!(
            "SELECT {VERSION_COLUMNS} FROM prompt_versions
             WHERE document_id = $1 AND version = $2"
        );
        sqlx::query_as::<_, VersionRow>(&query)
            .bind(document_id)
            .bind(version)
            .fetch_optional(&self.pool)
            .await?
            .map(VersionRecord::try_from)
            .transpose()
    }

    async fn list_descending(
        &self,
        document_id: Uuid,
        page: PageRequest,
    ) -> Result<Vec<VersionRecord>, StoreError> {
        let query = format!(
            "SELECT {VERSION_COLUMNS} FROM prompt_versions
             WHERE document_id = $1
             ORDER BY version DESC
             LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query_as::<_, VersionRow>(&query)
            .bind(document_id)
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await?;
        decode_all(rows)
    }

    async fn list_ascending(
        &self,
        document_id: Uuid,
        after: i32,
        through: i32,
        limit: i64,
    ) -> Result<Vec<VersionRecord>, StoreError> {
        let query = format!(
            "SELECT {VERSION_COLUMNS} FROM prompt_versions
             WHERE document_id = $1 AND version > $2 AND version <= $3
             ORDER BY version ASC
             LIMIT $4"
        );
        let rows = sqlx::query_as::<_, VersionRow>(&query)
            .bind(document_id)
            .bind(after)
            .bind(through)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        decode_all(rows)
    }

    async fn get_many(&self, keys: &[VersionKey]) -> Result<Vec<VersionRecord>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let document_ids: Vec<Uuid> = keys.iter().map(|k| k.document_id).collect();
        let versions: Vec<i32> = keys.iter().map(|k| k.version).collect();

        let query = format!(
            "SELECT {VERSION_COLUMNS} FROM prompt_versions
             WHERE (document_id, version) IN (
                 SELECT * FROM UNNEST($1::uuid[], $2::int4[])
             )
             ORDER BY document_id, version"
        );
        let rows = sqlx::query_as::<_, VersionRow>(&query)
            .bind(&document_ids)
            .bind(&versions)
            .fetch_all(&self.pool)
            .await?;
        decode_all(rows)
    }

    async fn count_versions(&self, document_id: Uuid) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM prompt_versions WHERE document_id = $1")
            .bind(document_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sqlx::PgPool;

    use super::*;
    use crate::models::prompt::MAX_PROMPT_NAME_LEN;
    use crate::versioning::error::VersionError;
    use crate::versioning::patch::diff_content;
    use crate::versioning::service::VersionControlService;

    fn next_version(document_id: Uuid, version: i32, before: &str, content: &str) -> NewVersion {
        NewVersion {
            document_id,
            version,
            content: content.to_string(),
            diff: Some(diff_content(before, content)),
            change_kind: ChangeKind::Edit,
            message: format!("Version {version}"),
            created_by: Uuid::nil(),
        }
    }

    async fn seed(store: &PgVersionStore, content: &str) -> Uuid {
        let id = Uuid::new_v4();
        store
            .create_document(
                NewDocument {
                    id,
                    name: "Seed".to_string(),
                    content: content.to_string(),
                    created_by: Uuid::nil(),
                },
                NewVersion {
                    document_id: id,
                    version: 1,
                    content: content.to_string(),
                    diff: None,
                    change_kind: ChangeKind::Create,
                    message: "Initial version".to_string(),
                    created_by: Uuid::nil(),
                },
            )
            .await
            .unwrap();
        id
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_append_round_trips_diff_and_advances_head(pool: PgPool) {
        let store = PgVersionStore::new(pool);
        let id = seed(&store, "Hello").await;

        let (document, record) = store
            .append(next_version(id, 2, "Hello", "Hello world"))
            .await
            .unwrap();

        assert_eq!(document.current_version, 2);
        assert_eq!(document.content, "Hello world");
        assert_eq!(record.diff, Some(diff_content("Hello", "Hello world")));
        assert_eq!(record.change_kind, ChangeKind::Edit);

        let head = store.head(id).await.unwrap().unwrap();
        assert_eq!(head.document.current_version, 2);
        assert_eq!(head.latest.unwrap().version, 2);
        assert_eq!(store.latest(id).await.unwrap().unwrap().content, "Hello world");
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_duplicate_version_maps_unique_violation_to_conflict(pool: PgPool) {
        let store = PgVersionStore::new(pool);
        let id = seed(&store, "a").await;
        store.append(next_version(id, 2, "a", "b")).await.unwrap();

        let err = store
            .append(next_version(id, 2, "a", "c"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StoreError::VersionConflict { document_id, version: 2 } if document_id == id
        ));
        assert_eq!(store.get(id, 2).await.unwrap().unwrap().content, "b");
        assert_eq!(store.count_versions(id).await.unwrap(), 2);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_skipped_version_is_a_conflict_and_rolls_back(pool: PgPool) {
        let store = PgVersionStore::new(pool);
        let id = seed(&store, "a").await;

        let err = store
            .append(next_version(id, 3, "a", "skip"))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::VersionConflict { version: 3, .. }));
        assert!(store.get(id, 3).await.unwrap().is_none());
        assert_eq!(store.count_versions(id).await.unwrap(), 1);
        let document = store.get_document(id).await.unwrap().unwrap();
        assert_eq!(document.current_version, 1);
        assert_eq!(document.content, "a");
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_append_to_unknown_document(pool: PgPool) {
        let store = PgVersionStore::new(pool);
        let missing = Uuid::new_v4();

        let err = store
            .append(next_version(missing, 2, "a", "b"))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::DocumentNotFound(id) if id == missing));
        assert!(store.head(missing).await.unwrap().is_none());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_get_many_skips_missing_keys(pool: PgPool) {
        let store = PgVersionStore::new(pool);
        let id = seed(&store, "v1").await;
        store.append(next_version(id, 2, "v1", "v2")).await.unwrap();
        store.append(next_version(id, 3, "v2", "v3")).await.unwrap();

        let keys = [
            VersionKey {
                document_id: id,
                version: 3,
            },
            VersionKey {
                document_id: id,
                version: 9,
            },
            VersionKey {
                document_id: Uuid::new_v4(),
                version: 1,
            },
            VersionKey {
                document_id: id,
                version: 1,
            },
        ];
        let found = store.get_many(&keys).await.unwrap();

        let versions: Vec<i32> = found.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![1, 3]);
        assert!(store.get_many(&[]).await.unwrap().is_empty());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_list_pages_by_offset_and_keyset(pool: PgPool) {
        let store = PgVersionStore::new(pool);
        let id = seed(&store, "v1").await;
        for v in 2..=5 {
            let before = format!("v{}", v - 1);
            store
                .append(next_version(id, v, &before, &format!("v{v}")))
                .await
                .unwrap();
        }

        let page = store
            .list_descending(id, PageRequest { limit: 2, offset: 1 })
            .await
            .unwrap();
        let versions: Vec<i32> = page.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![4, 3]);

        let window = store.list_ascending(id, 2, 4, 10).await.unwrap();
        let versions: Vec<i32> = window.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![3, 4]);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_version_rows_reject_updates(pool: PgPool) {
        let store = PgVersionStore::new(pool.clone());
        let id = seed(&store, "original").await;

        let result =
            sqlx::query("UPDATE prompt_versions SET content = 'rewritten' WHERE document_id = $1")
                .bind(id)
                .execute(&pool)
                .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("immutable"));
        assert_eq!(store.get(id, 1).await.unwrap().unwrap().content, "original");
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_two_concurrent_edits_both_land(pool: PgPool) {
        let svc = VersionControlService::new(Arc::new(PgVersionStore::new(pool.clone())));
        let actor = Uuid::new_v4();
        let (doc, _) = svc.create_document("Greeting", "Hello", None, actor).await.unwrap();
        let doc_id = doc.id;
        svc.edit(doc_id, "Hello world", None, actor).await.unwrap();

        let first = tokio::spawn({
            let svc = svc.clone();
            async move { svc.edit(doc_id, "Hello there", None, Uuid::new_v4()).await }
        });
        let second = tokio::spawn({
            let svc = svc.clone();
            async move { svc.edit(doc_id, "Hi world", None, Uuid::new_v4()).await }
        });
        let mut landed = vec![
            first.await.unwrap().unwrap().version,
            second.await.unwrap().unwrap().version,
        ];
        landed.sort_unstable();

        assert_eq!(landed, vec![3, 4]);
        let store = PgVersionStore::new(pool);
        assert_eq!(store.count_versions(doc_id).await.unwrap(), 4);
        assert_eq!(svc.document(doc_id).await.unwrap().current_version, 4);
        assert!(svc.audit_history(doc_id).await.unwrap().consistent);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_many_concurrent_edits_stay_gapless(pool: PgPool) {
        let svc = VersionControlService::new(Arc::new(PgVersionStore::new(pool)));
        let actor = Uuid::new_v4();
        let (doc, _) = svc.create_document("Busy", "v0", None, actor).await.unwrap();

        let writers: Vec<_> = (0..8)
            .map(|n| {
                let svc = svc.clone();
                let doc_id = doc.id;
                tokio::spawn(async move { svc.edit(doc_id, &format!("writer {n}"), None, actor).await })
            })
            .collect();

        let mut committed = 0;
        for writer in writers {
            match writer.await.unwrap() {
                Ok(_) => committed += 1,
                Err(VersionError::ConcurrentEditConflict { document_id }) => assert_eq!(document_id, doc.id),
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert!(committed >= 1);
        let document = svc.document(doc.id).await.unwrap();
        assert_eq!(document.current_version, 1 + committed);
        let audit = svc.audit_history(doc.id).await.unwrap();
        assert!(audit.consistent);
        assert_eq!(audit.versions_checked, usize::try_from(document.current_version).unwrap());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_duplicate_of_longest_name_fits_column(pool: PgPool) {
        let svc = VersionControlService::new(Arc::new(PgVersionStore::new(pool)));
        let actor = Uuid::new_v4();
        let name = "n".repeat(MAX_PROMPT_NAME_LEN);
        let (doc, _) = svc.create_document(&name, "body", None, actor).await.unwrap();

        let (copy, record) = svc.duplicate(doc.id, None, actor).await.unwrap();

        assert_eq!(copy.name.chars().count(), MAX_PROMPT_NAME_LEN);
        assert_eq!(record.version, 1);
        assert_eq!(record.change_kind, ChangeKind::Create);
    }
}
