//! Version store: an append-only history per memory
//!
//! The snapshot of every history lives behind one readers-writer lock.
//! Writers hold the write lock across the SQLite transaction and touch the
//! snapshot only after the commit succeeded, so a failed commit leaves no
//! visible mutation and readers never observe `current_version != len(versions)`.

use chrono::Utc;
use parking_lot::RwLock;
use rusqlite::Connection;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::error::{MemvaultError, Result};
use crate::storage::{queries, Storage};
use crate::types::*;

/// Outcome of appending a version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionWrite {
    pub version_number: u32,
    /// Context before the write, `None` when the record was just created
    pub previous_context: Option<String>,
    /// Tags present after the write that were absent before it
    pub added_tags: BTreeSet<String>,
}

impl VersionWrite {
    pub fn created(&self) -> bool {
        self.previous_context.is_none()
    }
}

/// Mutations staged inside one open transaction.
///
/// Reads see staged changes layered over the committed snapshot. Every
/// operation runs its SQL under a savepoint and records the new state only
/// when that SQL succeeded, so a failed item leaves neither the database nor
/// the staging area touched.
pub struct StagedWrite<'a> {
    conn: &'a Connection,
    base: &'a BTreeMap<MemoryId, MemoryWithHistory>,
    changes: BTreeMap<MemoryId, Option<MemoryWithHistory>>,
}

impl<'a> StagedWrite<'a> {
    fn new(conn: &'a Connection, base: &'a BTreeMap<MemoryId, MemoryWithHistory>) -> Self {
        Self {
            conn,
            base,
            changes: BTreeMap::new(),
        }
    }

    /// Current view of a record, including staged changes
    pub fn get(&self, id: &str) -> Option<&MemoryWithHistory> {
        match self.changes.get(id) {
            Some(staged) => staged.as_ref(),
            None => self.base.get(id),
        }
    }

    fn savepoint<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        self.conn.execute_batch("SAVEPOINT memvault_item")?;
        match f(self.conn) {
            Ok(value) => {
                self.conn.execute_batch("RELEASE memvault_item")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self
                    .conn
                    .execute_batch("ROLLBACK TO memvault_item; RELEASE memvault_item")
                {
                    warn!(error = %rollback, "Failed to roll back savepoint");
                }
                Err(e)
            }
        }
    }

    /// Append a version, creating the record for an unseen ID.
    ///
    /// `context` and `tags` replace the record-level values wholesale.
    pub fn append(
        &mut self,
        id: &str,
        content: &str,
        author: &str,
        change_note: &str,
        context: &str,
        tags: &[String],
    ) -> Result<VersionWrite> {
        let now = Utc::now();
        let existing = self.get(id);
        let previous_context = existing.map(|h| h.context.clone());
        let previous_tags = existing.map(|h| h.tags.clone()).unwrap_or_default();
        let mut record = existing
            .cloned()
            .unwrap_or_else(|| MemoryWithHistory::empty(id, context, now));

        // Version timestamps never go backwards, even if the clock does
        let created_at = record
            .latest()
            .map_or(now, |last| last.created_at.max(now));
        let version_number = record.versions.len() as u32 + 1;

        record.versions.push(MemoryVersion {
            version_number,
            content: content.to_string(),
            created_at,
            created_by: author.to_string(),
            change_note: change_note.to_string(),
        });
        record.current_version = version_number;
        if version_number == 1 {
            record.created_at = created_at;
        }
        record.updated_at = record.updated_at.max(created_at);
        record.context = context.to_string();
        record.tags = normalize_tags(tags);

        self.savepoint(|conn| queries::save_appended(conn, &record))?;

        let added_tags = record.tags.difference(&previous_tags).cloned().collect();
        self.changes.insert(id.to_string(), Some(record));

        Ok(VersionWrite {
            version_number,
            previous_context,
            added_tags,
        })
    }

    /// Remove a whole history, returning the removed record
    pub fn delete(&mut self, id: &str) -> Result<MemoryWithHistory> {
        let record = self
            .get(id)
            .cloned()
            .ok_or_else(|| MemvaultError::memory_not_found(id))?;
        self.savepoint(|conn| queries::delete_history(conn, id))?;
        self.changes.insert(id.to_string(), None);
        Ok(record)
    }

    /// Union `tags` into the record's tag set; returns the tags actually added
    pub fn add_tags(&mut self, id: &str, tags: &[String]) -> Result<BTreeSet<String>> {
        let wanted = normalize_tags(tags);
        self.modify(id, |record| {
            let added: BTreeSet<String> = wanted.difference(&record.tags).cloned().collect();
            record.tags.extend(added.iter().cloned());
            added
        })
    }

    /// Remove `tags` from the record's tag set; returns the tags actually removed
    pub fn remove_tags(&mut self, id: &str, tags: &[String]) -> Result<BTreeSet<String>> {
        let unwanted = normalize_tags(tags);
        self.modify(id, |record| {
            let removed: BTreeSet<String> =
                record.tags.intersection(&unwanted).cloned().collect();
            record.tags.retain(|t| !removed.contains(t));
            removed
        })
    }

    pub fn set_metadata(&mut self, id: &str, key: &str, value: &str) -> Result<()> {
        self.modify(id, |record| {
            record.metadata.insert(key.to_string(), value.to_string());
        })
    }

    /// Store an imported record, overwriting any record with the same ID
    pub fn import(&mut self, record: MemoryWithHistory) -> Result<()> {
        if record.id.trim().is_empty() {
            return Err(MemvaultError::validation("Imported memory has an empty id"));
        }
        if record.versions.is_empty() {
            return Err(MemvaultError::validation(format!(
                "Imported memory \"{}\" has no versions",
                record.id
            )));
        }
        let record = record.normalized();
        self.savepoint(|conn| queries::replace_history(conn, &record))?;
        self.changes.insert(record.id.clone(), Some(record));
        Ok(())
    }

    fn modify<T>(&mut self, id: &str, f: impl FnOnce(&mut MemoryWithHistory) -> T) -> Result<T> {
        let mut record = self
            .get(id)
            .cloned()
            .ok_or_else(|| MemvaultError::memory_not_found(id))?;
        let out = f(&mut record);
        record.updated_at = record.updated_at.max(Utc::now());
        self.savepoint(|conn| queries::upsert_record(conn, &record))?;
        self.changes.insert(id.to_string(), Some(record));
        Ok(out)
    }

    fn into_changes(self) -> BTreeMap<MemoryId, Option<MemoryWithHistory>> {
        self.changes
    }
}

fn apply_changes(
    histories: &mut BTreeMap<MemoryId, MemoryWithHistory>,
    changes: BTreeMap<MemoryId, Option<MemoryWithHistory>>,
) {
    for (id, change) in changes {
        match change {
            Some(record) => {
                histories.insert(id, record);
            }
            None => {
                histories.remove(&id);
            }
        }
    }
}

/// Durable, concurrency-safe history of every memory
pub struct VersionStore {
    storage: Storage,
    histories: RwLock<BTreeMap<MemoryId, MemoryWithHistory>>,
}

impl VersionStore {
    /// Load every persisted history from `storage`
    pub fn open(storage: Storage) -> Result<Self> {
        let histories = storage.with_connection(queries::load_histories)?;
        info!(memories = histories.len(), "Loaded version store");
        Ok(Self {
            storage,
            histories: RwLock::new(histories),
        })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Run `f` against a staging area inside one transaction, then publish
    /// the staged changes once the commit succeeded.
    pub fn write<T>(&self, f: impl FnOnce(&mut StagedWrite<'_>) -> Result<T>) -> Result<T> {
        let mut histories = self.histories.write();
        let (value, changes) = self.storage.with_transaction(|conn| {
            let mut stage = StagedWrite::new(conn, &histories);
            let value = f(&mut stage)?;
            Ok((value, stage.into_changes()))
        })?;
        apply_changes(&mut histories, changes);
        Ok(value)
    }

    /// Run a whole batch in one transaction.
    ///
    /// `f` records per-item outcomes in the report and never aborts. If the
    /// single commit fails, the tally flips to `failed = total` and the
    /// batch surfaces as [`MemvaultError::BatchAborted`].
    pub fn write_batch(
        &self,
        kind: BatchOperationKind,
        total: usize,
        f: impl FnOnce(&mut StagedWrite<'_>, &mut BatchOperationResult),
    ) -> Result<BatchOperationResult> {
        let mut report = BatchOperationResult::new(kind, total);
        let mut histories = self.histories.write();

        let outcome = self.storage.with_transaction(|conn| {
            let mut stage = StagedWrite::new(conn, &histories);
            f(&mut stage, &mut report);
            Ok(stage.into_changes())
        });

        match outcome {
            Ok(changes) => {
                apply_changes(&mut histories, changes);
                info!(
                    operation = report.operation_type.as_str(),
                    operation_id = report.operation_id.as_str(),
                    total = report.total,
                    successful = report.successful,
                    failed = report.failed,
                    "Batch committed"
                );
                Ok(report)
            }
            Err(e) => {
                warn!(
                    operation = report.operation_type.as_str(),
                    operation_id = report.operation_id.as_str(),
                    error = %e,
                    "Batch commit failed"
                );
                report.mark_uncommitted(&e);
                Err(MemvaultError::BatchAborted {
                    report: Box::new(report),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Borrow the committed snapshot under the read lock
    pub fn read<T>(&self, f: impl FnOnce(&BTreeMap<MemoryId, MemoryWithHistory>) -> T) -> T {
        let histories = self.histories.read();
        f(&histories)
    }

    /// Append a new version to `id`, creating the record if it is unseen
    pub fn add_version(
        &self,
        id: &str,
        content: &str,
        author: &str,
        change_note: &str,
        context: &str,
        tags: &[String],
    ) -> Result<VersionWrite> {
        let write = self
            .write(|stage| stage.append(id, content, author, change_note, context, tags))
            .map_err(|e| {
                warn!(memory_id = id, error = %e, "Failed to add version");
                e
            })?;
        info!(
            memory_id = id,
            version = write.version_number,
            context,
            "Added memory version"
        );
        Ok(write)
    }

    pub fn get_version(&self, id: &str, version_number: u32) -> Result<MemoryVersion> {
        debug!(memory_id = id, version = version_number, "Getting version");
        self.read(|histories| {
            let history = histories
                .get(id)
                .ok_or_else(|| MemvaultError::memory_not_found(id))?;
            if version_number == 0 || version_number > history.current_version {
                return Err(MemvaultError::not_found(format!(
                    "Version {} of memory \"{}\" not found (current version is {})",
                    version_number, id, history.current_version
                )));
            }
            Ok(history.versions[version_number as usize - 1].clone())
        })
    }

    pub fn get_history(&self, id: &str) -> Result<MemoryWithHistory> {
        debug!(memory_id = id, "Getting history");
        self.read(|histories| {
            histories
                .get(id)
                .cloned()
                .ok_or_else(|| MemvaultError::memory_not_found(id))
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read(|histories| histories.contains_key(id))
    }

    /// Irreversibly remove a history. Returns the removed record.
    pub fn delete_memory_history(&self, id: &str) -> Result<MemoryWithHistory> {
        let removed = self.write(|stage| stage.delete(id))?;
        info!(memory_id = id, versions = removed.versions.len(), "Deleted memory history");
        Ok(removed)
    }

    /// Independent copy of every record
    pub fn get_all_histories(&self) -> BTreeMap<MemoryId, MemoryWithHistory> {
        self.read(|histories| histories.clone())
    }

    /// Export the records named by `ids` (all records when empty).
    ///
    /// Unknown IDs are skipped. Without `include_versions` each record is
    /// compacted to its latest version; the stored record is untouched.
    pub fn export_memories(
        &self,
        ids: &[String],
        include_versions: bool,
        exported_by: &str,
    ) -> ExportData {
        let wanted: BTreeSet<&str> = ids.iter().map(String::as_str).collect();
        let memories: Vec<MemoryWithHistory> = self.read(|histories| {
            histories
                .values()
                .filter(|h| wanted.is_empty() || wanted.contains(h.id.as_str()))
                .map(|h| if include_versions { h.clone() } else { h.compacted() })
                .collect()
        });
        info!(
            memories = memories.len(),
            include_versions, "Exported memories"
        );
        ExportData {
            exported_at: Utc::now(),
            exported_by: exported_by.to_string(),
            memories,
            contexts: None,
            tags: None,
            version: FORMAT_VERSION.to_string(),
        }
    }

    /// Import every record of `data`, overwriting existing IDs wholesale.
    ///
    /// All records land in one transaction; one invalid record rejects the
    /// whole import.
    pub fn import_memories(&self, data: &ExportData) -> Result<usize> {
        if data.version != FORMAT_VERSION {
            warn!(
                version = data.version.as_str(),
                expected = FORMAT_VERSION,
                "Importing data with a different format version"
            );
        }
        let count = self.write(|stage| {
            for record in &data.memories {
                stage.import(record.clone())?;
            }
            Ok(data.memories.len())
        })?;
        info!(memories = count, exported_by = data.exported_by.as_str(), "Imported memories");
        Ok(count)
    }

    /// Append a new version whose content is that of `version_number`
    pub fn restore_version(
        &self,
        id: &str,
        version_number: u32,
        author: &str,
        reason: Option<&str>,
    ) -> Result<VersionWrite> {
        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or("Manual restoration");
        let note = format!("Restored from version {}: {}", version_number, reason);

        let write = self.write(|stage| {
            let record = stage
                .get(id)
                .ok_or_else(|| MemvaultError::memory_not_found(id))?;
            let source = version_number
                .checked_sub(1)
                .and_then(|i| record.versions.get(i as usize))
                .ok_or_else(|| {
                    MemvaultError::not_found(format!(
                        "Version {} of memory \"{}\" not found",
                        version_number, id
                    ))
                })?;
            let content = source.content.clone();
            let context = record.context.clone();
            let tags: Vec<String> = record.tags.iter().cloned().collect();
            stage.append(id, &content, author, &note, &context, &tags)
        })?;

        info!(
            memory_id = id,
            restored_from = version_number,
            version = write.version_number,
            "Restored memory version"
        );
        Ok(write)
    }

    pub fn add_tags(&self, id: &str, tags: &[String]) -> Result<BTreeSet<String>> {
        let added = self.write(|stage| stage.add_tags(id, tags))?;
        debug!(memory_id = id, added = added.len(), "Added tags");
        Ok(added)
    }

    pub fn remove_tags(&self, id: &str, tags: &[String]) -> Result<BTreeSet<String>> {
        let removed = self.write(|stage| stage.remove_tags(id, tags))?;
        debug!(memory_id = id, removed = removed.len(), "Removed tags");
        Ok(removed)
    }

    pub fn set_metadata(&self, id: &str, key: &str, value: &str) -> Result<()> {
        self.write(|stage| stage.set_metadata(id, key, value))
    }

    pub fn count(&self) -> usize {
        self.read(|histories| histories.len())
    }

    /// Latest content per memory, for handing to a vector index
    pub fn latest_contents(&self) -> BTreeMap<MemoryId, String> {
        self.read(|histories| {
            histories
                .values()
                .filter_map(|h| h.latest().map(|v| (h.id.clone(), v.content.clone())))
                .collect()
        })
    }
}
