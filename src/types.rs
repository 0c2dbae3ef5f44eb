//! Core types for Memvault

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Unique identifier for a memory
pub type MemoryId = String;

/// Context every memory and session falls back to
pub const DEFAULT_CONTEXT_ID: &str = "general";
pub const DEFAULT_CONTEXT_NAME: &str = "General";

/// Interchange format version written into exports and the registry
pub const FORMAT_VERSION: &str = "1.0";

/// Change note used for every item of a batch create
pub const BATCH_CHANGE_NOTE: &str = "Batch import";

/// One immutable snapshot of a memory's content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryVersion {
    /// Version number (1, 2, 3, ...)
    pub version_number: u32,
    /// Content at this version
    pub content: String,
    /// When this version was created
    pub created_at: DateTime<Utc>,
    /// Writer of this version
    pub created_by: String,
    /// Free-text annotation, may be empty
    #[serde(default)]
    pub change_note: String,
}

/// A memory record together with its full version history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryWithHistory {
    pub id: MemoryId,
    /// Always equals `versions.len()`
    pub current_version: u32,
    /// All versions in order, never empty once created
    pub versions: Vec<MemoryVersion>,
    /// Context of the latest write
    pub context: String,
    /// Active tags, normalized
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl MemoryWithHistory {
    /// An empty record for an unseen ID, `current_version = 0`
    pub fn empty(id: impl Into<MemoryId>, context: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            current_version: 0,
            versions: Vec::new(),
            context: context.into(),
            tags: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            metadata: BTreeMap::new(),
        }
    }

    /// Latest version, if any
    pub fn latest(&self) -> Option<&MemoryVersion> {
        self.versions.last()
    }

    /// The history's original author
    pub fn original_author(&self) -> Option<&str> {
        self.versions.first().map(|v| v.created_by.as_str())
    }

    /// Whether `current_version == len(versions)` and numbering has no gaps
    pub fn is_consistent(&self) -> bool {
        self.current_version as usize == self.versions.len()
            && self
                .versions
                .iter()
                .enumerate()
                .all(|(i, v)| v.version_number as usize == i + 1)
    }

    /// Case-insensitive tag membership
    pub fn has_tag(&self, tag: &str) -> bool {
        normalize_tag(tag).is_some_and(|t| self.tags.contains(&t))
    }

    /// Copy truncated to the latest version only, for export.
    ///
    /// The copy keeps `current_version` and the original version number so
    /// readers can tell how much history was dropped.
    pub fn compacted(&self) -> Self {
        let mut copy = self.clone();
        if let Some(last) = copy.versions.pop() {
            copy.versions = vec![last];
        }
        copy
    }

    /// Bring an imported record back to a storable shape: versions
    /// renumbered from 1, `current_version = len(versions)`, tags normalized.
    pub fn normalized(mut self) -> Self {
        for (i, version) in self.versions.iter_mut().enumerate() {
            version.version_number = i as u32 + 1;
        }
        self.current_version = self.versions.len() as u32;
        self.tags = normalize_tags(&self.tags);
        self
    }
}

/// Organizational bucket a memory belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub memory_count: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Categorical label applicable to any memory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Unique, case-folded
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Optional hex color for UI
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub memory_count: u64,
}

/// A client connected to the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSession {
    pub client_id: String,
    pub current_context: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Context IDs other clients shared with this one
    #[serde(default)]
    pub shared_with: Vec<String>,
}

/// Tag matching semantics for a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TagFilterMode {
    /// Every filter tag must be present (AND)
    All,
    /// At least one filter tag must be present (OR)
    #[default]
    Any,
}

impl TagFilterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagFilterMode::All => "all",
            TagFilterMode::Any => "any",
        }
    }

    /// Unrecognized or empty modes fall back to `Any`
    pub fn lenient(mode: Option<&str>) -> Self {
        mode.and_then(|m| m.parse().ok()).unwrap_or_default()
    }
}

impl std::str::FromStr for TagFilterMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(TagFilterMode::All),
            "any" => Ok(TagFilterMode::Any),
            _ => Err(format!("tag_filter_mode must be 'all' or 'any', got '{}'", s)),
        }
    }
}

/// Structured query over stored memory metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Raw mode as received; see [`SearchFilter::mode`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_filter_mode: Option<String>,
    /// Inclusive lower bound on a record's `created_at`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    /// Inclusive upper bound on a record's `updated_at`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    /// Matches the history's original author
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    /// 0 = unlimited. Truncation keeps a prefix in store order, not a top-k.
    #[serde(default)]
    pub max_results: usize,
}

impl SearchFilter {
    pub fn mode(&self) -> TagFilterMode {
        TagFilterMode::lenient(self.tag_filter_mode.as_deref())
    }

    pub fn with_context(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>, mode: TagFilterMode) -> Self {
        self.tags = tags;
        self.tag_filter_mode = Some(mode.as_str().to_string());
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }
}

/// Similarity reported for results that were not vector-ranked
pub const UNRANKED_SIMILARITY: f32 = 1.0;

/// Projection of a record's current version plus record-level fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: MemoryId,
    pub content: String,
    pub similarity: f32,
    pub context: String,
    pub tags: BTreeSet<String>,
    pub current_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
}

impl SearchResult {
    /// Project a record's latest version; `None` for an empty history
    pub fn from_history(history: &MemoryWithHistory) -> Option<Self> {
        let latest = history.latest()?;
        Some(Self {
            id: history.id.clone(),
            content: latest.content.clone(),
            similarity: UNRANKED_SIMILARITY,
            context: history.context.clone(),
            tags: history.tags.clone(),
            current_version: history.current_version,
            created_at: history.created_at,
            updated_at: history.updated_at,
            metadata: history.metadata.clone(),
        })
    }
}

/// Aggregate statistics for one context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextStats {
    pub context_id: String,
    pub memory_count: usize,
    pub unique_tags: BTreeSet<String>,
    pub oldest_memory: Option<DateTime<Utc>>,
    pub newest_memory: Option<DateTime<Utc>>,
    pub total_characters: usize,
}

/// Kind of batch run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOperationKind {
    Create,
    Delete,
    AddTags,
    RemoveTags,
}

impl BatchOperationKind {
    /// Tag written into `BatchOperationResult::operation_type`
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchOperationKind::Create => "batch_create",
            BatchOperationKind::Delete => "batch_delete",
            BatchOperationKind::AddTags => "batch_add_tags",
            BatchOperationKind::RemoveTags => "batch_remove_tags",
        }
    }
}

impl std::str::FromStr for BatchOperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(BatchOperationKind::Create),
            "delete" => Ok(BatchOperationKind::Delete),
            "add_tags" => Ok(BatchOperationKind::AddTags),
            "remove_tags" => Ok(BatchOperationKind::RemoveTags),
            _ => Err(format!("Unknown batch operation: {}", s)),
        }
    }
}

/// Per-item tally of a batch run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOperationResult {
    pub operation_type: String,
    pub operation_id: String,
    /// Fixed at batch start to the input size
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// One entry per failed item, plus one for a failed commit
    pub errors: Vec<String>,
}

impl BatchOperationResult {
    pub fn new(kind: BatchOperationKind, total: usize) -> Self {
        Self {
            operation_type: kind.as_str().to_string(),
            operation_id: uuid::Uuid::new_v4().to_string(),
            total,
            successful: 0,
            failed: 0,
            errors: Vec::new(),
        }
    }

    pub fn record_success(&mut self) {
        self.successful += 1;
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.failed += 1;
        self.errors.push(error.into());
    }

    /// Nothing in the batch was made durable
    pub fn mark_uncommitted(&mut self, reason: impl std::fmt::Display) {
        self.successful = 0;
        self.failed = self.total;
        self.errors.push(format!("Failed to save: {}", reason));
    }
}

/// One item of a batch create
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCreateItem {
    pub id: MemoryId,
    pub content: String,
    #[serde(default = "default_context")]
    pub context: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Writer of the version
    #[serde(alias = "client_id")]
    pub author: String,
}

fn default_context() -> String {
    DEFAULT_CONTEXT_ID.to_string()
}

/// Export/import interchange document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportData {
    pub exported_at: DateTime<Utc>,
    pub exported_by: String,
    pub memories: Vec<MemoryWithHistory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contexts: Option<HashMap<String, Context>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<HashMap<String, Tag>>,
    pub version: String,
}

/// Storage mode for SQLite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    #[default]
    Local,
    CloudSafe,
}

impl std::str::FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(StorageMode::Local),
            "cloud-safe" => Ok(StorageMode::CloudSafe),
            _ => Err(format!("Unknown storage mode: {}", s)),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Storage mode (local or cloud-safe)
    #[serde(default)]
    pub storage_mode: StorageMode,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            storage_mode: StorageMode::Local,
        }
    }
}

impl StorageConfig {
    pub fn in_memory() -> Self {
        Self {
            db_path: ":memory:".to_string(),
            storage_mode: StorageMode::Local,
        }
    }
}

/// Default database location under the user data directory
pub fn default_db_path() -> String {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("memvault")
        .join("memories.db")
        .to_string_lossy()
        .to_string()
}

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Upper bound on concurrently registered client sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_max_sessions() -> usize {
    100
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
        }
    }
}

/// Top-level configuration for a [`crate::MemoryService`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

/// Normalize a tag: trim and lower-case. Returns `None` for blank input.
pub fn normalize_tag(tag: &str) -> Option<String> {
    let normalized = tag.trim().to_lowercase();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Normalize and deduplicate a list of tags
pub fn normalize_tags<I, S>(tags: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .filter_map(|t| normalize_tag(t.as_ref()))
        .collect()
}
