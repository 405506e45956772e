use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

use crate::versioning::patch::Patch;

/// The mutable "current" record of a prompt. `current_version` always
/// matches the highest version row in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PromptDocument {
    pub id: Uuid,
    pub name: String,
    pub content: String,
    pub current_version: i32,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_by: Uuid,
    pub updated_at: DateTime<Utc>,
}

/// Why a version row was written. Display only; nothing branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    Create,
    Edit,
    Revert,
    ApplyRun,
}

impl ChangeKind {
    /// String representation used in the `change_kind` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Edit => "edit",
            Self::Revert => "revert",
            Self::ApplyRun => "apply-run",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown change kind '{0}'")]
pub struct UnknownChangeKind(pub String);

impl FromStr for ChangeKind {
    type Err = UnknownChangeKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "edit" => Ok(Self::Edit),
            "revert" => Ok(Self::Revert),
            "apply-run" => Ok(Self::ApplyRun),
            other => Err(UnknownChangeKind(other.to_string())),
        }
    }
}

/// One immutable entry of a prompt's history.
///
/// `content` is the full snapshot at this version and is authoritative.
/// `diff` is the patch from the previous snapshot (absent for version 1)
/// and is kept for audit and display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub id: Uuid,
    pub document_id: Uuid,
    pub version: i32,
    pub content: String,
    pub diff: Option<Patch>,
    pub change_kind: ChangeKind,
    pub message: String,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Width of `prompts.name`, counted in characters.
pub const MAX_PROMPT_NAME_LEN: usize = 255;

const COPY_SUFFIX: &str = " (Copy)";

/// Name given to a duplicate when the caller supplies none. The source name
/// is shortened so the result still fits `MAX_PROMPT_NAME_LEN`.
pub fn copy_name(source: &str) -> String {
    let budget = MAX_PROMPT_NAME_LEN - COPY_SUFFIX.chars().count();
    let base: String = source.chars().take(budget).collect();
    format!("{}{COPY_SUFFIX}", base.trim_end())
}

/// Default message for a version written without one.
pub fn default_version_message(version: i32) -> String {
    format!("Version {version}")
}
