//! Batch operations over many memory IDs
//!
//! One transaction per batch. Each item is applied independently; a failed
//! item is tallied and the batch moves on. Only a failed commit aborts the
//! batch, and then nothing in it is persisted.

use tracing::{info, warn};

use crate::error::{MemvaultError, Result};
use crate::registry::Registry;
use crate::types::*;
use crate::versions::{VersionStore, VersionWrite};

/// Report entry for a failed item; always names the memory ID
fn item_error(id: &str, err: &MemvaultError) -> String {
    match err {
        MemvaultError::NotFound(_) => err.to_string(),
        _ => format!("Memory \"{}\": {}", id, err),
    }
}

/// Applies one operation kind to many memories
pub struct BatchCoordinator<'a> {
    store: &'a VersionStore,
    registry: Option<&'a Registry>,
}

impl<'a> BatchCoordinator<'a> {
    pub fn new(store: &'a VersionStore) -> Self {
        Self {
            store,
            registry: None,
        }
    }

    /// Keep registry counters in step with committed batches
    pub fn with_registry(mut self, registry: &'a Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Append one version per item with change note [`BATCH_CHANGE_NOTE`]
    pub fn batch_create(&self, items: &[BatchCreateItem]) -> Result<BatchOperationResult> {
        info!(count = items.len(), "Starting batch create");
        let mut writes: Vec<(String, VersionWrite)> = Vec::new();

        let report = self
            .store
            .write_batch(BatchOperationKind::Create, items.len(), |stage, report| {
                for item in items {
                    if item.id.trim().is_empty() {
                        report.record_failure("Memory with an empty id skipped");
                        continue;
                    }
                    let context = if item.context.trim().is_empty() {
                        DEFAULT_CONTEXT_ID
                    } else {
                        item.context.as_str()
                    };
                    match stage.append(
                        &item.id,
                        &item.content,
                        &item.author,
                        BATCH_CHANGE_NOTE,
                        context,
                        &item.tags,
                    ) {
                        Ok(write) => {
                            report.record_success();
                            writes.push((context.to_string(), write));
                        }
                        Err(e) => report.record_failure(item_error(&item.id, &e)),
                    }
                }
            })?;

        if let Some(registry) = self.registry {
            for (context, write) in &writes {
                registry.record_write(context, write);
            }
        }
        Ok(report)
    }

    /// Delete every listed history
    pub fn batch_delete(&self, ids: &[String]) -> Result<BatchOperationResult> {
        info!(count = ids.len(), "Starting batch delete");
        let mut removed = Vec::new();

        let report = self
            .store
            .write_batch(BatchOperationKind::Delete, ids.len(), |stage, report| {
                for id in ids {
                    match stage.delete(id) {
                        Ok(record) => {
                            report.record_success();
                            removed.push(record);
                        }
                        Err(e) => report.record_failure(item_error(id, &e)),
                    }
                }
            })?;

        if let Some(registry) = self.registry {
            for record in &removed {
                registry.record_delete(record);
            }
        }
        Ok(report)
    }

    /// Union `tags` into each listed memory's tag set
    pub fn batch_add_tags(&self, ids: &[String], tags: &[String]) -> Result<BatchOperationResult> {
        info!(count = ids.len(), tags = tags.len(), "Starting batch add tags");
        let mut additions = Vec::new();

        let report = self
            .store
            .write_batch(BatchOperationKind::AddTags, ids.len(), |stage, report| {
                for id in ids {
                    match stage.add_tags(id, tags) {
                        Ok(new_tags) => {
                            report.record_success();
                            additions.push(new_tags);
                        }
                        Err(e) => report.record_failure(item_error(id, &e)),
                    }
                }
            })?;

        if let Some(registry) = self.registry {
            for new_tags in &additions {
                registry.record_tags_added(new_tags);
            }
        }
        Ok(report)
    }

    /// Remove `tags` from each listed memory's tag set
    pub fn batch_remove_tags(
        &self,
        ids: &[String],
        tags: &[String],
    ) -> Result<BatchOperationResult> {
        info!(count = ids.len(), tags = tags.len(), "Starting batch remove tags");
        self.store
            .write_batch(BatchOperationKind::RemoveTags, ids.len(), |stage, report| {
                for id in ids {
                    match stage.remove_tags(id, tags) {
                        Ok(_) => report.record_success(),
                        Err(e) => report.record_failure(item_error(id, &e)),
                    }
                }
            })
    }

    /// Dispatch a typed batch request
    pub fn run(&self, request: &crate::requests::BatchRequest) -> Result<BatchOperationResult> {
        let result = match request.operation {
            BatchOperationKind::Create => self.batch_create(&request.memories),
            BatchOperationKind::Delete => self.batch_delete(&request.memory_ids),
            BatchOperationKind::AddTags => self.batch_add_tags(&request.memory_ids, &request.tags),
            BatchOperationKind::RemoveTags => {
                self.batch_remove_tags(&request.memory_ids, &request.tags)
            }
        };
        if let Err(e) = &result {
            warn!(operation = request.operation.as_str(), error = %e, "Batch failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use pretty_assertions::assert_eq;

    fn store() -> VersionStore {
        VersionStore::open(Storage::open_in_memory().unwrap()).unwrap()
    }

    fn item(id: &str, content: &str) -> BatchCreateItem {
        BatchCreateItem {
            id: id.to_string(),
            content: content.to_string(),
            context: "ctx".to_string(),
            tags: vec!["Bulk".to_string()],
            author: "alice".to_string(),
        }
    }

    #[test]
    fn test_batch_delete_partial_failure() {
        let store = store();
        store.add_version("present", "x", "alice", "", "ctx", &[]).unwrap();

        let report = BatchCoordinator::new(&store)
            .batch_delete(&["present".to_string(), "missing".to_string()])
            .unwrap();

        assert_eq!(report.operation_type, "batch_delete");
        assert_eq!(report.total, 2);
        assert_eq!(report.successful, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.errors, vec!["Memory \"missing\" not found".to_string()]);
        assert!(!store.contains("present"));
    }

    #[test]
    fn test_batch_create_appends_versions() {
        let store = store();
        store.add_version("m1", "old", "bob", "", "ctx", &[]).unwrap();

        let report = BatchCoordinator::new(&store)
            .batch_create(&[item("m1", "new"), item("m2", "fresh"), item(" ", "skip")])
            .unwrap();
        assert_eq!((report.successful, report.failed), (2, 1));

        let m1 = store.get_history("m1").unwrap();
        assert_eq!(m1.current_version, 2);
        assert_eq!(m1.versions[1].change_note, BATCH_CHANGE_NOTE);
        assert_eq!(m1.tags, normalize_tags(["bulk"]));
        assert_eq!(store.get_history("m2").unwrap().current_version, 1);
    }

    #[test]
    fn test_batch_tags() {
        let store = store();
        store
            .add_version("m1", "x", "alice", "", "ctx", &["keep".to_string()])
            .unwrap();
        store.add_version("m2", "y", "alice", "", "ctx", &[]).unwrap();
        let batch = BatchCoordinator::new(&store);
        let ids = vec!["m1".to_string(), "m2".to_string(), "m3".to_string()];

        let added = batch.batch_add_tags(&ids, &["New".to_string()]).unwrap();
        assert_eq!((added.successful, added.failed), (2, 1));
        assert_eq!(store.get_history("m2").unwrap().tags, normalize_tags(["new"]));

        let removed = batch
            .batch_remove_tags(&ids[..2], &["NEW".to_string()])
            .unwrap();
        assert_eq!(removed.operation_type, "batch_remove_tags");
        assert_eq!((removed.successful, removed.failed), (2, 0));
        assert_eq!(store.get_history("m1").unwrap().tags, normalize_tags(["keep"]));
        assert_eq!(store.get_history("m1").unwrap().current_version, 1);
    }

    #[test]
    fn test_failed_item_does_not_poison_batch() {
        let store = store();
        store
            .storage()
            .with_connection(|conn| {
                // Rejects any version whose content is "poison"
                conn.execute_batch(
                    "CREATE TRIGGER reject_poison BEFORE INSERT ON memory_versions
                     WHEN NEW.content = 'poison'
                     BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
                )?;
                Ok(())
            })
            .unwrap();

        let report = BatchCoordinator::new(&store)
            .batch_create(&[item("a", "fine"), item("b", "poison"), item("c", "fine")])
            .unwrap();

        assert_eq!((report.successful, report.failed), (2, 1));
        assert!(report.errors[0].contains("\"b\""));
        assert!(store.contains("a"));
        assert!(!store.contains("b"));
        assert!(store.contains("c"));
    }

    #[test]
    fn test_commit_failure_flips_whole_tally() {
        let store = store();
        store
            .storage()
            .with_connection(|conn| {
                // A deferred foreign key violation only surfaces at COMMIT
                conn.execute_batch(
                    "CREATE TABLE parents (id TEXT PRIMARY KEY);
                     CREATE TABLE orphans (
                         parent TEXT REFERENCES parents(id) DEFERRABLE INITIALLY DEFERRED
                     );
                     CREATE TRIGGER orphan_on_version AFTER INSERT ON memory_versions
                     BEGIN INSERT INTO orphans (parent) VALUES ('missing'); END;",
                )?;
                Ok(())
            })
            .unwrap();

        let err = BatchCoordinator::new(&store)
            .batch_create(&[item("m1", "a"), item("m2", "b")])
            .unwrap_err();

        match err {
            MemvaultError::BatchAborted { report, .. } => {
                assert_eq!(report.operation_type, "batch_create");
                assert_eq!((report.successful, report.failed), (0, 2));
                assert!(report.errors.last().unwrap().starts_with("Failed to save:"));
            }
            other => panic!("expected BatchAborted, got {other:?}"),
        }
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn test_registry_counts_follow_batches() {
        let storage = Storage::open_in_memory().unwrap();
        let store = VersionStore::open(storage.clone()).unwrap();
        let registry = Registry::open(storage, RegistryConfig::default()).unwrap();
        registry.create_context("ctx", "Ctx", "").unwrap();
        let batch = BatchCoordinator::new(&store).with_registry(&registry);

        batch.batch_create(&[item("m1", "a"), item("m2", "b")]).unwrap();
        assert_eq!(registry.get_context("ctx").unwrap().memory_count, 2);
        assert_eq!(registry.get_tag("bulk").unwrap().memory_count, 2);

        batch.batch_delete(&["m1".to_string()]).unwrap();
        assert_eq!(registry.get_context("ctx").unwrap().memory_count, 1);
    }
}
