//! Diff engine: structural patches over JSON values.
//!
//! Prompt content is wrapped as `{ "content": <text> }` so one generic
//! patch algorithm covers it. Patches are plain data (an RFC 6902 subset:
//! `add`, `remove`, `replace`, `test`) and are persisted verbatim in
//! `prompt_versions.diff`.
//!
//! Every `replace` and `remove` is preceded by a `test` carrying the old
//! value, so applying a patch to a base it was not computed from fails with
//! a [`PatchError`] instead of silently producing a different document.
//!
//! [`text_changes`] is a separate word-level view for display; it is never
//! stored and never applied.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use similar::{ChangeTag, TextDiff};
use thiserror::Error;

/// Key of the single member in the content envelope.
pub const CONTENT_KEY: &str = "content";

// ────────────────────────────────────────────────────────────────────────────
// Patch data model
// ────────────────────────────────────────────────────────────────────────────

/// A single patch operation. `path` is a JSON Pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
    Test { path: String, value: Value },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            Self::Add { path, .. }
            | Self::Remove { path }
            | Self::Replace { path, .. }
            | Self::Test { path, .. } => path,
        }
    }
}

/// An ordered list of operations. Serializes as a bare JSON array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch(Vec<PatchOp>);

impl Patch {
    pub fn new(ops: Vec<PatchOp>) -> Self {
        Self(ops)
    }

    pub fn ops(&self) -> &[PatchOp] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("path '{0}' does not exist in the base document")]
    MissingPath(String),

    #[error("test failed at '{0}': base value differs from the recorded one")]
    TestFailed(String),

    #[error("path '{0}' already exists in the base document")]
    AlreadyExists(String),

    #[error("invalid array index at '{0}'")]
    InvalidIndex(String),

    #[error("invalid JSON pointer '{0}'")]
    InvalidPointer(String),

    #[error("patched document has no string content member")]
    NotContent,
}

// ────────────────────────────────────────────────────────────────────────────
// diff
// ────────────────────────────────────────────────────────────────────────────

/// Computes the patch turning `before` into `after`.
///
/// Deterministic: object members are visited in key order (serde_json maps
/// are sorted), arrays index by index. Equal inputs produce an empty patch.
pub fn diff(before: &Value, after: &Value) -> Patch {
    let mut ops = Vec::new();
    diff_value(before, after, String::new(), &mut ops);
    Patch(ops)
}

fn diff_value(before: &Value, after: &Value, path: String, ops: &mut Vec<PatchOp>) {
    if before == after {
        return;
    }
    match (before, after) {
        (Value::Object(old), Value::Object(new)) => diff_object(old, new, &path, ops),
        (Value::Array(old), Value::Array(new)) => diff_array(old, new, &path, ops),
        _ => {
            ops.push(PatchOp::Test {
                path: path.clone(),
                value: before.clone(),
            });
            ops.push(PatchOp::Replace {
                path,
                value: after.clone(),
            });
        }
    }
}

fn diff_object(old: &Map<String, Value>, new: &Map<String, Value>, path: &str, ops: &mut Vec<PatchOp>) {
    for (key, old_value) in old {
        let child = format!("{path}/{}", escape_token(key));
        match new.get(key) {
            Some(new_value) => diff_value(old_value, new_value, child, ops),
            None => {
                ops.push(PatchOp::Test {
                    path: child.clone(),
                    value: old_value.clone(),
                });
                ops.push(PatchOp::Remove { path: child });
            }
        }
    }
    for (key, new_value) in new {
        if !old.contains_key(key) {
            ops.push(PatchOp::Add {
                path: format!("{path}/{}", escape_token(key)),
                value: new_value.clone(),
            });
        }
    }
}

fn diff_array(old: &[Value], new: &[Value], path: &str, ops: &mut Vec<PatchOp>) {
    let common = old.len().min(new.len());
    for (i, (old_value, new_value)) in old.iter().zip(new).enumerate() {
        diff_value(old_value, new_value, format!("{path}/{i}"), ops);
    }
    // Trailing removals go highest index first so earlier indices stay valid.
    for (i, old_value) in old.iter().enumerate().skip(common).rev() {
        let child = format!("{path}/{i}");
        ops.push(PatchOp::Test {
            path: child.clone(),
            value: old_value.clone(),
        });
        ops.push(PatchOp::Remove { path: child });
    }
    for (i, new_value) in new.iter().enumerate().skip(common) {
        ops.push(PatchOp::Add {
            path: format!("{path}/{i}"),
            value: new_value.clone(),
        });
    }
}

// ────────────────────────────────────────────────────────────────────────────
// apply
// ────────────────────────────────────────────────────────────────────────────

/// Applies `patch` to a copy of `before`. `apply(a, &diff(a, b)) == b`.
pub fn apply(before: &Value, patch: &Patch) -> Result<Value, PatchError> {
    let mut doc = before.clone();
    for op in patch.ops() {
        apply_op(&mut doc, op)?;
    }
    Ok(doc)
}

fn apply_op(doc: &mut Value, op: &PatchOp) -> Result<(), PatchError> {
    match op {
        PatchOp::Test { path, value } => {
            let current = doc
                .pointer(path)
                .ok_or_else(|| PatchError::MissingPath(path.clone()))?;
            if current != value {
                return Err(PatchError::TestFailed(path.clone()));
            }
        }
        PatchOp::Replace { path, value } => {
            let target = doc
                .pointer_mut(path)
                .ok_or_else(|| PatchError::MissingPath(path.clone()))?;
            *target = value.clone();
        }
        PatchOp::Remove { path } => {
            let (parent, token) = parent_of(doc, path)?;
            match parent {
                Value::Object(map) => {
                    map.remove(&token)
                        .ok_or_else(|| PatchError::MissingPath(path.clone()))?;
                }
                Value::Array(items) => {
                    let index = array_index(&token, path)?;
                    if index >= items.len() {
                        return Err(PatchError::MissingPath(path.clone()));
                    }
                    items.remove(index);
                }
                _ => return Err(PatchError::MissingPath(path.clone())),
            }
        }
        PatchOp::Add { path, value } => {
            if path.is_empty() {
                return Err(PatchError::AlreadyExists(path.clone()));
            }
            let (parent, token) = parent_of(doc, path)?;
            match parent {
                Value::Object(map) => {
                    if map.contains_key(&token) {
                        return Err(PatchError::AlreadyExists(path.clone()));
                    }
                    map.insert(token, value.clone());
                }
                Value::Array(items) => {
                    let index = if token == "-" {
                        items.len()
                    } else {
                        array_index(&token, path)?
                    };
                    if index > items.len() {
                        return Err(PatchError::InvalidIndex(path.clone()));
                    }
                    items.insert(index, value.clone());
                }
                _ => return Err(PatchError::MissingPath(path.clone())),
            }
        }
    }
    Ok(())
}

/// Resolves the container holding the last token of `path`.
fn parent_of<'a>(doc: &'a mut Value, path: &str) -> Result<(&'a mut Value, String), PatchError> {
    let (parent_path, raw) = path
        .rsplit_once('/')
        .ok_or_else(|| PatchError::InvalidPointer(path.to_string()))?;
    let parent = doc
        .pointer_mut(parent_path)
        .ok_or_else(|| PatchError::MissingPath(parent_path.to_string()))?;
    Ok((parent, unescape_token(raw)))
}

fn array_index(token: &str, path: &str) -> Result<usize, PatchError> {
    // RFC 6901: no leading zeros, digits only.
    if token.is_empty()
        || (token.len() > 1 && token.starts_with('0'))
        || !token.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(PatchError::InvalidIndex(path.to_string()));
    }
    token
        .parse()
        .map_err(|_| PatchError::InvalidIndex(path.to_string()))
}

fn escape_token(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

fn unescape_token(raw: &str) -> String {
    raw.replace("~1", "/").replace("~0", "~")
}

// ────────────────────────────────────────────────────────────────────────────
// Content envelope helpers
// ────────────────────────────────────────────────────────────────────────────

/// Wraps prompt text as `{ "content": text }`.
pub fn content_envelope(content: &str) -> Value {
    let mut map = Map::new();
    map.insert(CONTENT_KEY.to_string(), Value::String(content.to_string()));
    Value::Object(map)
}

/// Patch between two prompt texts.
pub fn diff_content(before: &str, after: &str) -> Patch {
    diff(&content_envelope(before), &content_envelope(after))
}

/// Reconstructs prompt text by applying a stored patch to its base text.
pub fn apply_content(before: &str, patch: &Patch) -> Result<String, PatchError> {
    let after = apply(&content_envelope(before), patch)?;
    after
        .get(CONTENT_KEY)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(PatchError::NotContent)
}

// ────────────────────────────────────────────────────────────────────────────
// Word-level text view
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextChangeTag {
    Equal,
    Insert,
    Delete,
}

/// A run of consecutive words sharing one tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChange {
    pub tag: TextChangeTag,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChangeSummary {
    pub changes: Vec<TextChange>,
    pub words_added: usize,
    pub words_removed: usize,
}

/// Word-level changes between two texts (patience algorithm), merged into
/// runs.
pub fn text_changes(before: &str, after: &str) -> TextChangeSummary {
    let diff = TextDiff::configure()
        .algorithm(similar::Algorithm::Patience)
        .diff_words(before, after);

    let mut summary = TextChangeSummary::default();
    for change in diff.iter_all_changes() {
        let tag = match change.tag() {
            ChangeTag::Equal => TextChangeTag::Equal,
            ChangeTag::Insert => TextChangeTag::Insert,
            ChangeTag::Delete => TextChangeTag::Delete,
        };
        let value = change.value();
        let is_word = !value.trim().is_empty();
        match tag {
            TextChangeTag::Insert if is_word => summary.words_added += 1,
            TextChangeTag::Delete if is_word => summary.words_removed += 1,
            _ => {}
        }
        match summary.changes.last_mut() {
            Some(last) if last.tag == tag => last.value.push_str(value),
            _ => summary.changes.push(TextChange {
                tag,
                value: value.to_string(),
            }),
        }
    }
    summary
}
