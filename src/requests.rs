//! Typed requests for the tool-call boundary
//!
//! Each request deserializes from the transport's JSON arguments and is
//! checked with `validate()` before it reaches the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MemvaultError, Result};
use crate::types::*;

/// Result cap applied to advanced searches that do not set one
pub const DEFAULT_SEARCH_RESULTS: usize = 50;

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(MemvaultError::validation(format!("{} is required", field)));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddVersionRequest {
    pub memory_id: String,
    pub content: String,
    #[serde(alias = "client_id")]
    pub author: String,
    #[serde(default)]
    pub change_note: String,
    /// Falls back to the author's current session context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl AddVersionRequest {
    pub fn validate(&self) -> Result<()> {
        require("memory_id", &self.memory_id)?;
        require("author", &self.author)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreVersionRequest {
    pub memory_id: String,
    pub version_number: u32,
    #[serde(alias = "client_id")]
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_reason: Option<String>,
}

impl RestoreVersionRequest {
    pub fn validate(&self) -> Result<()> {
        require("memory_id", &self.memory_id)?;
        require("author", &self.author)?;
        if self.version_number == 0 {
            return Err(MemvaultError::validation("version_number must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchAdvancedRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_filter_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    /// Defaults to [`DEFAULT_SEARCH_RESULTS`]; 0 means unlimited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<usize>,
}

impl SearchAdvancedRequest {
    /// Checks that need no registry; the context is resolved by the engine
    pub fn validate(&self) -> Result<()> {
        if let Some(mode) = self.tag_filter_mode.as_deref().filter(|m| !m.is_empty()) {
            mode.parse::<TagFilterMode>()
                .map_err(MemvaultError::Validation)?;
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(MemvaultError::validation(
                    "start_date must not be after end_date",
                ));
            }
        }
        Ok(())
    }

    pub fn to_filter(&self) -> SearchFilter {
        SearchFilter {
            context_id: self.context_id.clone().filter(|c| !c.is_empty()),
            tags: self.tags.clone(),
            tag_filter_mode: Some(
                self.tag_filter_mode
                    .clone()
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| TagFilterMode::Any.as_str().to_string()),
            ),
            start_date: self.start_date,
            end_date: self.end_date,
            created_by: self.created_by.clone().filter(|c| !c.is_empty()),
            max_results: self.max_results.unwrap_or(DEFAULT_SEARCH_RESULTS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub operation: BatchOperationKind,
    /// Items for `create`
    #[serde(default)]
    pub memories: Vec<BatchCreateItem>,
    /// Targets for `delete`, `add_tags` and `remove_tags`
    #[serde(default)]
    pub memory_ids: Vec<String>,
    /// Tags for `add_tags` and `remove_tags`
    #[serde(default)]
    pub tags: Vec<String>,
}

impl BatchRequest {
    pub fn validate(&self) -> Result<()> {
        match self.operation {
            BatchOperationKind::Create => {
                if self.memories.is_empty() {
                    return Err(MemvaultError::validation("memories is required for create"));
                }
            }
            BatchOperationKind::Delete => {
                if self.memory_ids.is_empty() {
                    return Err(MemvaultError::validation("memory_ids is required for delete"));
                }
            }
            BatchOperationKind::AddTags | BatchOperationKind::RemoveTags => {
                if self.memory_ids.is_empty() {
                    return Err(MemvaultError::validation(format!(
                        "memory_ids is required for {}",
                        self.operation.as_str()
                    )));
                }
                if normalize_tags(&self.tags).is_empty() {
                    return Err(MemvaultError::validation(format!(
                        "tags is required for {}",
                        self.operation.as_str()
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRequest {
    /// Empty exports every memory
    #[serde(default)]
    pub memory_ids: Vec<String>,
    #[serde(default)]
    pub include_versions: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exported_by: Option<String>,
}

impl ExportRequest {
    pub fn validate(&self) -> Result<()> {
        if self.memory_ids.iter().any(|id| id.trim().is_empty()) {
            return Err(MemvaultError::validation("memory_ids must not contain blank ids"));
        }
        Ok(())
    }

    pub fn exported_by(&self) -> &str {
        self.exported_by.as_deref().unwrap_or("system")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRequest {
    /// Serialized [`ExportData`]
    pub json_data: String,
}

impl ImportRequest {
    pub fn validate(&self) -> Result<()> {
        require("json_data", &self.json_data)
    }

    pub fn parse(&self) -> Result<ExportData> {
        self.validate()?;
        serde_json::from_str(&self.json_data).map_err(|e| {
            MemvaultError::validation(format!("json_data is not a valid export: {}", e))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextStatsRequest {
    pub context_id: String,
}

impl ContextStatsRequest {
    pub fn validate(&self) -> Result<()> {
        require("context_id", &self.context_id)
    }
}
