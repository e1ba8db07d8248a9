use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::definition::ModuleDefinition;
use super::ids::{ModuleId, OwnerId, WorldId};

/// Raw field values of a module, ordered by key so hashing is stable.
pub type FieldMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModuleStatus {
    Empty,
    InProgress,
    Ready,
    AwaitingGeneration,
    Generating,
    Completed,
    Failed,
}

impl ModuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "EMPTY",
            Self::InProgress => "IN_PROGRESS",
            Self::Ready => "READY",
            Self::AwaitingGeneration => "AWAITING_GENERATION",
            Self::Generating => "GENERATING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Holds exactly for `READY`, `AWAITING_GENERATION` and `COMPLETED`.
    pub fn is_ready_for_publish(&self) -> bool {
        matches!(
            self,
            Self::Ready | Self::AwaitingGeneration | Self::Completed
        )
    }

    /// Editing status implied by field completeness: `EMPTY` when nothing is
    /// filled in, `READY` when every required field passes, `IN_PROGRESS`
    /// otherwise.
    pub fn derive(definition: &ModuleDefinition, fields: &FieldMap) -> Self {
        if fields.values().all(|v| v.trim().is_empty()) {
            return Self::Empty;
        }
        let complete = definition
            .required_fields()
            .all(|f| f.violation(fields.get(&f.key).map(String::as_str)).is_none());
        if complete {
            Self::Ready
        } else {
            Self::InProgress
        }
    }
}

impl std::fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ModuleStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EMPTY" => Ok(Self::Empty),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "READY" => Ok(Self::Ready),
            "AWAITING_GENERATION" => Ok(Self::AwaitingGeneration),
            "GENERATING" => Ok(Self::Generating),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown module status: {other}")),
        }
    }
}

/// A named section of a world, keyed by `module_key` within it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldModule {
    pub id: ModuleId,
    pub world_id: WorldId,
    pub module_key: String,
    pub fields: FieldMap,
    pub status: ModuleStatus,
    /// Fingerprint of `fields` at the last successful generation.
    pub content_hash: Option<String>,
    pub full_content: Option<String>,
    pub last_editor: Option<OwnerId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorldModule {
    pub fn new(world_id: WorldId, module_key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ModuleId::new(),
            world_id,
            module_key: module_key.into(),
            fields: FieldMap::new(),
            status: ModuleStatus::Empty,
            content_hash: None,
            full_content: None,
            last_editor: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Whether the stored hash still describes the current fields.
    pub fn hash_matches(&self) -> bool {
        self.content_hash.as_deref() == Some(content_hash(&self.fields).as_str())
    }

    /// Completed and unchanged since: safe to reuse on publish.
    pub fn is_reusable(&self) -> bool {
        self.status == ModuleStatus::Completed && self.hash_matches()
    }

    pub fn touch(&mut self, editor: Option<&OwnerId>, now: DateTime<Utc>) {
        if let Some(editor) = editor {
            self.last_editor = Some(editor.clone());
        }
        self.updated_at = now;
    }
}

/// SHA-256 hex digest of a field map. Keys are ordered, so two maps with the
/// same entries always hash the same.
pub fn content_hash(fields: &FieldMap) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in fields {
        hasher.update(key.as_bytes());
        hasher.update([0x1f]);
        hasher.update(value.as_bytes());
        hasher.update([0x1e]);
    }
    hex::encode(hasher.finalize())
}
