//! Version control service: the only writer of prompt history.
//!
//! Every content change goes through [`VersionControlService::create_version`]:
//! one consistent read of the document head, a diff against that same head,
//! and one atomic append that claims `head + 1`. The database constraint on
//! `(document_id, version)` decides races; the loser re-reads and tries once
//! more, then gives up with `ConcurrentEditConflict`.
//!
//! Reverts and run promotions are ordinary forward versions, so history is
//! never rewritten and "undo a revert" is just another revert.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::prompt::{
    copy_name, default_version_message, ChangeKind, PromptDocument, VersionRecord,
};
use crate::versioning::error::VersionError;
use crate::versioning::patch::{apply_content, diff_content, text_changes, Patch, TextChangeSummary};
use crate::versioning::store::{NewDocument, NewVersion, PageRequest, VersionKey, VersionStore};

const INITIAL_VERSION: i32 = 1;
const INITIAL_MESSAGE: &str = "Initial version";

/// Page size used when the audit walks a full history.
const AUDIT_PAGE_SIZE: i64 = 200;

/// Parameters for one `create_version` transition.
#[derive(Debug, Clone, Copy)]
pub struct VersionParams<'a> {
    pub document_id: Uuid,
    pub content: &'a str,
    pub change_kind: ChangeKind,
    pub message: Option<&'a str>,
    pub actor: Uuid,
}

/// Result of comparing two versions. `version_a` is always the lower
/// version and `diff` always goes from `version_a` to `version_b`.
#[derive(Debug, Clone, Serialize)]
pub struct Comparison {
    pub version_a: VersionRecord,
    pub version_b: VersionRecord,
    pub diff: Patch,
    pub text_changes: TextChangeSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub document_id: Uuid,
    pub current_version: i32,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
    pub versions: Vec<VersionRecord>,
}

/// A version whose stored diff does not reproduce its snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryMismatch {
    pub version: i32,
    pub reason: String,
    /// Diff recomputed from the authoritative snapshots.
    pub recomputed_diff: Patch,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryAudit {
    pub document_id: Uuid,
    pub versions_checked: usize,
    pub consistent: bool,
    pub mismatches: Vec<HistoryMismatch>,
}

#[derive(Clone)]
pub struct VersionControlService {
    store: Arc<dyn VersionStore>,
}

impl VersionControlService {
    pub fn new(store: Arc<dyn VersionStore>) -> Self {
        Self { store }
    }

    pub async fn document(&self, document_id: Uuid) -> Result<PromptDocument, VersionError> {
        self.store
            .get_document(document_id)
            .await?
            .ok_or(VersionError::DocumentNotFound(document_id))
    }

    /// Creates a prompt at version 1 with a `create` record and no diff.
    pub async fn create_document(
        &self,
        name: &str,
        content: &str,
        message: Option<&str>,
        actor: Uuid,
    ) -> Result<(PromptDocument, VersionRecord), VersionError> {
        let document_id = Uuid::new_v4();
        let (document, record) = self
            .store
            .create_document(
                NewDocument {
                    id: document_id,
                    name: name.to_string(),
                    content: content.to_string(),
                    created_by: actor,
                },
                NewVersion {
                    document_id,
                    version: INITIAL_VERSION,
                    content: content.to_string(),
                    diff: None,
                    change_kind: ChangeKind::Create,
                    message: normalize_message(message)
                        .unwrap_or(INITIAL_MESSAGE)
                        .to_string(),
                    created_by: actor,
                },
            )
            .await?;

        info!(document_id = %document.id, actor = %actor, "prompt created at version 1");
        Ok((document, record))
    }

    /// Appends a new version holding `params.content`.
    ///
    /// Content identical to the head is a no-op returning the head. A lost
    /// version-number race is retried once against a fresh head; a second
    /// loss is reported as `ConcurrentEditConflict`.
    pub async fn create_version(&self, params: VersionParams<'_>) -> Result<VersionRecord, VersionError> {
        match self.try_create_version(&params).await {
            Err(err) if err.is_version_conflict() => {
                warn!(
                    document_id = %params.document_id,
                    error = %err,
                    "version number taken by a concurrent writer, retrying once"
                );
                match self.try_create_version(&params).await {
                    Err(err) if err.is_version_conflict() => {
                        warn!(
                            document_id = %params.document_id,
                            error = %err,
                            "retry lost the race again, surfacing conflict"
                        );
                        Err(VersionError::ConcurrentEditConflict {
                            document_id: params.document_id,
                        })
                    }
                    result => result,
                }
            }
            result => result,
        }
    }

    async fn try_create_version(&self, params: &VersionParams<'_>) -> Result<VersionRecord, VersionError> {
        // Diff base and version-number base come from this one read.
        let latest = self.load_head(params.document_id).await?;

        if latest.content == params.content {
            debug!(
                document_id = %params.document_id,
                version = latest.version,
                "content unchanged, keeping current version"
            );
            return Ok(latest);
        }

        let version = latest.version + 1;
        let diff = diff_content(&latest.content, params.content);
        let message = normalize_message(params.message)
            .map_or_else(|| default_version_message(version), str::to_string);

        let (_, record) = self
            .store
            .append(NewVersion {
                document_id: params.document_id,
                version,
                content: params.content.to_string(),
                diff: Some(diff),
                change_kind: params.change_kind,
                message,
                created_by: params.actor,
            })
            .await?;

        info!(
            document_id = %record.document_id,
            version = record.version,
            change_kind = %record.change_kind,
            ops = record.diff.as_ref().map_or(0, Patch::len),
            "version committed"
        );
        Ok(record)
    }

    /// Reads the head and checks `current_version` against the ledger.
    async fn load_head(&self, document_id: Uuid) -> Result<VersionRecord, VersionError> {
        let head = self
            .store
            .head(document_id)
            .await?
            .ok_or(VersionError::DocumentNotFound(document_id))?;

        let latest = head.latest.ok_or_else(|| VersionError::CorruptHistory {
            document_id,
            reason: "document has no version history".to_string(),
        })?;

        if latest.version != head.document.current_version {
            error!(
                document_id = %document_id,
                document_version = head.document.current_version,
                ledger_version = latest.version,
                "document and ledger head disagree"
            );
            return Err(VersionError::CorruptHistory {
                document_id,
                reason: format!(
                    "document is at version {} but the ledger head is version {}",
                    head.document.current_version, latest.version
                ),
            });
        }

        Ok(latest)
    }

    /// A direct user edit.
    pub async fn edit(
        &self,
        document_id: Uuid,
        content: &str,
        message: Option<&str>,
        actor: Uuid,
    ) -> Result<VersionRecord, VersionError> {
        self.create_version(VersionParams {
            document_id,
            content,
            change_kind: ChangeKind::Edit,
            message,
            actor,
        })
        .await
    }

    /// Writes a new forward version whose content equals `target_version`.
    pub async fn revert_to(
        &self,
        document_id: Uuid,
        target_version: i32,
        actor: Uuid,
    ) -> Result<VersionRecord, VersionError> {
        let target = self.get_version(document_id, target_version).await?;
        let message = format!("Reverted to version {target_version}");

        self.create_version(VersionParams {
            document_id,
            content: &target.content,
            change_kind: ChangeKind::Revert,
            message: Some(&message),
            actor,
        })
        .await
    }

    /// Promotes the prompt content used by a run to a new version.
    pub async fn promote_run(
        &self,
        document_id: Uuid,
        run_id: Uuid,
        content: &str,
        actor: Uuid,
    ) -> Result<VersionRecord, VersionError> {
        let message = format!("Applied content from run {run_id}");
        self.create_version(VersionParams {
            document_id,
            content,
            change_kind: ChangeKind::ApplyRun,
            message: Some(&message),
            actor,
        })
        .await
    }

    /// Copies a prompt's current content into a new prompt with its own
    /// history starting at version 1.
    pub async fn duplicate(
        &self,
        source_id: Uuid,
        name: Option<&str>,
        actor: Uuid,
    ) -> Result<(PromptDocument, VersionRecord), VersionError> {
        let source = self.document(source_id).await?;
        let name = normalize_message(name)
            .map_or_else(|| copy_name(&source.name), str::to_string);
        let message = format!("Duplicated from \"{}\"", source.name);

        self.create_document(&name, &source.content, Some(&message), actor)
            .await
    }

    pub async fn get_version(&self, document_id: Uuid, version: i32) -> Result<VersionRecord, VersionError> {
        self.store
            .get(document_id, version)
            .await?
            .ok_or(VersionError::VersionNotFound {
                document_id,
                version,
            })
    }

    /// Compares two versions. Argument order does not matter; the diff is
    /// always computed from the lower version to the higher one.
    pub async fn compare(
        &self,
        document_id: Uuid,
        version_a: i32,
        version_b: i32,
    ) -> Result<Comparison, VersionError> {
        let (low, high) = if version_a <= version_b {
            (version_a, version_b)
        } else {
            (version_b, version_a)
        };

        let records = self
            .store
            .get_many(&[
                VersionKey {
                    document_id,
                    version: low,
                },
                VersionKey {
                    document_id,
                    version: high,
                },
            ])
            .await?;

        let find = |version: i32| {
            records
                .iter()
                .find(|r| r.document_id == document_id && r.version == version)
                .cloned()
                .ok_or(VersionError::VersionNotFound {
                    document_id,
                    version,
                })
        };
        let lower = find(low)?;
        let higher = find(high)?;

        Ok(Comparison {
            diff: diff_content(&lower.content, &higher.content),
            text_changes: text_changes(&lower.content, &higher.content),
            version_a: lower,
            version_b: higher,
        })
    }

    /// One page of history, newest first.
    pub async fn history(&self, document_id: Uuid, page: PageRequest) -> Result<HistoryPage, VersionError> {
        let document = self.document(document_id).await?;
        let total = self.store.count_versions(document_id).await?;
        let versions = self.store.list_descending(document_id, page).await?;

        Ok(HistoryPage {
            document_id,
            current_version: document.current_version,
            total,
            limit: page.limit,
            offset: page.offset,
            versions,
        })
    }

    /// Replays every stored diff against its predecessor's snapshot.
    ///
    /// The audit covers history up to the head seen when it starts; versions
    /// committed while it runs are left for the next audit. Snapshots are
    /// never modified. Diffs that fail to apply or that disagree with their
    /// snapshot are reported with a recomputed diff.
    pub async fn audit_history(&self, document_id: Uuid) -> Result<HistoryAudit, VersionError> {
        let head = self.load_head(document_id).await?;
        let versions = self.history_through(document_id, head.version).await?;

        for (expected, record) in (INITIAL_VERSION..).zip(&versions) {
            if record.version != expected {
                return Err(VersionError::CorruptHistory {
                    document_id,
                    reason: format!("expected version {expected}, found {}", record.version),
                });
            }
        }
        if versions.last().map(|r| r.version) != Some(head.version) {
            return Err(VersionError::CorruptHistory {
                document_id,
                reason: format!(
                    "ledger holds {} rows but the head is version {}",
                    versions.len(),
                    head.version
                ),
            });
        }

        let mut mismatches = Vec::new();
        let mut previous: Option<&VersionRecord> = None;
        for record in &versions {
            match verify_link(previous, record) {
                Ok(()) => {}
                Err(VersionError::PatchMismatch { version, reason, .. }) => {
                    error!(
                        document_id = %document_id,
                        version,
                        reason = %reason,
                        "stored diff disagrees with snapshot"
                    );
                    mismatches.push(HistoryMismatch {
                        version,
                        reason,
                        recomputed_diff: previous
                            .map(|p| diff_content(&p.content, &record.content))
                            .unwrap_or_default(),
                    });
                }
                Err(other) => return Err(other),
            }
            previous = Some(record);
        }

        info!(
            document_id = %document_id,
            versions = versions.len(),
            mismatches = mismatches.len(),
            "history audit finished"
        );
        Ok(HistoryAudit {
            document_id,
            versions_checked: versions.len(),
            consistent: mismatches.is_empty(),
            mismatches,
        })
    }

    /// Every version from 1 through `through`, oldest first, fetched in
    /// keyset pages.
    async fn history_through(&self, document_id: Uuid, through: i32) -> Result<Vec<VersionRecord>, VersionError> {
        let mut versions: Vec<VersionRecord> = Vec::new();
        let mut after = 0;
        while after < through {
            let page = self
                .store
                .list_ascending(document_id, after, through, AUDIT_PAGE_SIZE)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            if last.version <= after {
                break;
            }
            after = last.version;
            versions.extend(page);
        }
        Ok(versions)
    }
}

/// Checks that `record.diff` rebuilds `record.content` from its predecessor.
fn verify_link(previous: Option<&VersionRecord>, record: &VersionRecord) -> Result<(), VersionError> {
    let mismatch = |reason: String| VersionError::PatchMismatch {
        document_id: record.document_id,
        version: record.version,
        reason,
    };

    match (previous, &record.diff) {
        (None, None) => Ok(()),
        (None, Some(_)) => Err(mismatch("initial version carries a diff".to_string())),
        (Some(_), None) => Err(mismatch("diff is missing".to_string())),
        (Some(previous), Some(diff)) => {
            let rebuilt = apply_content(&previous.content, diff).map_err(|e| mismatch(e.to_string()))?;
            if rebuilt == record.content {
                Ok(())
            } else {
                Err(mismatch("replayed diff diverges from the stored snapshot".to_string()))
            }
        }
    }
}

fn normalize_message(message: Option<&str>) -> Option<&str> {
    message.map(str::trim).filter(|m| !m.is_empty())
}
