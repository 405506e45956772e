//! In-memory `VersionStore` used by the service and router tests.
//!
//! Enforces the same contract as the Postgres backend: the uniqueness of
//! `(document_id, version)` and the "advance only from the predecessor"
//! rule are checked under one lock, so the check and the write cannot be
//! separated by another writer.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::prompt::{PromptDocument, VersionRecord};
use crate::versioning::store::{
    ContentStore, DocumentHead, NewDocument, NewVersion, PageRequest, StoreError, VersionKey,
    VersionLedger,
};

#[derive(Default)]
struct Tables {
    documents: HashMap<Uuid, PromptDocument>,
    versions: HashMap<Uuid, BTreeMap<i32, VersionRecord>>,
}

#[derive(Default)]
pub struct InMemoryVersionStore {
    tables: Mutex<Tables>,
}

impl InMemoryVersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites a stored row in place. Only for simulating corrupted
    /// history; the ledger API itself never mutates rows.
    pub async fn tamper(&self, record: VersionRecord) {
        let mut tables = self.tables.lock().await;
        tables
            .versions
            .entry(record.document_id)
            .or_default()
            .insert(record.version, record);
    }

    /// Drops every version row of a document, leaving the document row.
    pub async fn drop_history(&self, document_id: Uuid) {
        self.tables.lock().await.versions.remove(&document_id);
    }

    pub async fn all_versions(&self, document_id: Uuid) -> Vec<VersionRecord> {
        self.tables
            .lock()
            .await
            .versions
            .get(&document_id)
            .map(|history| history.values().cloned().collect())
            .unwrap_or_default()
    }
}

fn materialize(record: NewVersion) -> VersionRecord {
    VersionRecord {
        id: Uuid::new_v4(),
        document_id: record.document_id,
        version: record.version,
        content: record.content,
        diff: record.diff,
        change_kind: record.change_kind,
        message: record.message,
        created_by: record.created_by,
        created_at: Utc::now(),
    }
}

#[async_trait]
impl ContentStore for InMemoryVersionStore {
    async fn get_document(&self, document_id: Uuid) -> Result<Option<PromptDocument>, StoreError> {
        Ok(self.tables.lock().await.documents.get(&document_id).cloned())
    }

    async fn head(&self, document_id: Uuid) -> Result<Option<DocumentHead>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.documents.get(&document_id).map(|document| DocumentHead {
            document: document.clone(),
            latest: tables
                .versions
                .get(&document_id)
                .and_then(|history| history.values().next_back().cloned()),
        }))
    }

    async fn create_document(
        &self,
        document: NewDocument,
        initial: NewVersion,
    ) -> Result<(PromptDocument, VersionRecord), StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.documents.contains_key(&document.id) {
            return Err(StoreError::VersionConflict {
                document_id: document.id,
                version: initial.version,
            });
        }
        let now = Utc::now();
        let created = PromptDocument {
            id: document.id,
            name: document.name,
            content: document.content,
            current_version: initial.version,
            created_by: document.created_by,
            created_at: now,
            updated_by: document.created_by,
            updated_at: now,
        };
        let record = materialize(initial);
        tables.documents.insert(created.id, created.clone());
        tables
            .versions
            .entry(created.id)
            .or_default()
            .insert(record.version, record.clone());
        Ok((created, record))
    }
}

#[async_trait]
impl VersionLedger for InMemoryVersionStore {
    async fn append(&self, record: NewVersion) -> Result<(PromptDocument, VersionRecord), StoreError> {
        let mut guard = self.tables.lock().await;
        let Tables {
            documents,
            versions,
        } = &mut *guard;

        let document = documents
            .get_mut(&record.document_id)
            .ok_or(StoreError::DocumentNotFound(record.document_id))?;
        let history = versions.entry(record.document_id).or_default();

        if history.contains_key(&record.version) || document.current_version != record.version - 1 {
            return Err(StoreError::VersionConflict {
                document_id: record.document_id,
                version: record.version,
            });
        }

        let record = materialize(record);
        document.content = record.content.clone();
        document.current_version = record.version;
        document.updated_by = record.created_by;
        document.updated_at = record.created_at;
        history.insert(record.version, record.clone());

        Ok((document.clone(), record))
    }

    async fn latest(&self, document_id: Uuid) -> Result<Option<VersionRecord>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .versions
            .get(&document_id)
            .and_then(|history| history.values().next_back().cloned()))
    }

    async fn get(&self, document_id: Uuid, version: i32) -> Result<Option<VersionRecord>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .versions
            .get(&document_id)
            .and_then(|history| history.get(&version).cloned()))
    }

    async fn list_descending(
        &self,
        document_id: Uuid,
        page: PageRequest,
    ) -> Result<Vec<VersionRecord>, StoreError> {
        let skip = usize::try_from(page.offset).unwrap_or(0);
        let take = usize::try_from(page.limit).unwrap_or(0);
        Ok(self
            .tables
            .lock()
            .await
            .versions
            .get(&document_id)
            .map(|history| history.values().rev().skip(skip).take(take).cloned().collect())
            .unwrap_or_default())
    }

    async fn list_ascending(
        &self,
        document_id: Uuid,
        after: i32,
        through: i32,
        limit: i64,
    ) -> Result<Vec<VersionRecord>, StoreError> {
        if after >= through {
            return Ok(Vec::new());
        }
        let take = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .tables
            .lock()
            .await
            .versions
            .get(&document_id)
            .map(|history| {
                history
                    .range(after + 1..=through)
                    .take(take)
                    .map(|(_, record)| record.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_many(&self, keys: &[VersionKey]) -> Result<Vec<VersionRecord>, StoreError> {
        let tables = self.tables.lock().await;
        let mut found: Vec<VersionRecord> = keys
            .iter()
            .filter_map(|key| {
                tables
                    .versions
                    .get(&key.document_id)
                    .and_then(|history| history.get(&key.version))
                    .cloned()
            })
            .collect();
        found.sort_by_key(|r| (r.document_id, r.version));
        found.dedup_by_key(|r| (r.document_id, r.version));
        Ok(found)
    }

    async fn count_versions(&self, document_id: Uuid) -> Result<i64, StoreError> {
        let count = self
            .tables
            .lock()
            .await
            .versions
            .get(&document_id)
            .map_or(0, BTreeMap::len);
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::prompt::ChangeKind;

    fn new_version(document_id: Uuid, version: i32, content: &str) -> NewVersion {
        NewVersion {
            document_id,
            version,
            content: content.to_string(),
            diff: None,
            change_kind: if version == 1 {
                ChangeKind::Create
            } else {
                ChangeKind::Edit
            },
            message: format!("Version {version}"),
            created_by: Uuid::nil(),
        }
    }

    async fn seeded() -> (InMemoryVersionStore, Uuid) {
        let store = InMemoryVersionStore::new();
        let id = Uuid::new_v4();
        store
            .create_document(
                NewDocument {
                    id,
                    name: "Seed".to_string(),
                    content: "a".to_string(),
                    created_by: Uuid::nil(),
                },
                new_version(id, 1, "a"),
            )
            .await
            .unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn test_append_advances_document_and_latest() {
        let (store, id) = seeded().await;
        let (document, record) = store.append(new_version(id, 2, "ab")).await.unwrap();
        assert_eq!(document.current_version, 2);
        assert_eq!(document.content, "ab");
        assert_eq!(record.version, 2);

        let latest = store.latest(id).await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(store.count_versions(id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_append_rejects_taken_or_skipped_versions() {
        let (store, id) = seeded().await;
        assert!(matches!(
            store.append(new_version(id, 1, "dup")).await,
            Err(StoreError::VersionConflict { version: 1, .. })
        ));
        assert!(matches!(
            store.append(new_version(id, 3, "gap")).await,
            Err(StoreError::VersionConflict { version: 3, .. })
        ));
        assert_eq!(store.count_versions(id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_append_to_unknown_document() {
        let store = InMemoryVersionStore::new();
        let missing = Uuid::new_v4();
        assert!(matches!(
            store.append(new_version(missing, 2, "x")).await,
            Err(StoreError::DocumentNotFound(id)) if id == missing
        ));
        assert!(store.latest(missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_descending_pages_and_get_many() {
        let (store, id) = seeded().await;
        for v in 2..=5 {
            store
                .append(new_version(id, v, &"a".repeat(v as usize)))
                .await
                .unwrap();
        }

        let page = store
            .list_descending(id, PageRequest { limit: 2, offset: 1 })
            .await
            .unwrap();
        let versions: Vec<i32> = page.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![4, 3]);

        let keys = [
            VersionKey {
                document_id: id,
                version: 5,
            },
            VersionKey {
                document_id: id,
                version: 2,
            },
            VersionKey {
                document_id: id,
                version: 9,
            },
        ];
        let window = store.list_ascending(id, 1, 4, 2).await.unwrap();
        let versions: Vec<i32> = window.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![2, 3]);
        assert!(store.list_ascending(id, 5, 5, 10).await.unwrap().is_empty());

        let found = store.get_many(&keys).await.unwrap();
        let versions: Vec<i32> = found.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![2, 5]);
    }
}
