//! End-to-end scenarios over the public API
//!
//! Run with: cargo test --test scenario_tests

use std::sync::Arc;
use std::thread;

use memvault::requests::*;
use memvault::storage::Storage;
use memvault::types::*;
use memvault::{BatchCoordinator, MemoryService, MemvaultError, VersionStore};
use pretty_assertions::assert_eq;

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn service_with_context(context: &str) -> MemoryService {
    let service = MemoryService::open_in_memory().unwrap();
    service.registry().create_context(context, context, "").unwrap();
    service
}

fn add(service: &MemoryService, id: &str, content: &str, author: &str, note: &str, ctx: &str, tags: &[&str]) {
    service
        .add_version(&AddVersionRequest {
            memory_id: id.to_string(),
            content: content.to_string(),
            author: author.to_string(),
            change_note: note.to_string(),
            context_id: Some(ctx.to_string()),
            tags: strings(tags),
        })
        .unwrap();
}

#[test]
fn second_write_replaces_tags_and_appends() {
    let service = service_with_context("ctxA");
    add(&service, "m1", "hello", "alice", "init", "ctxA", &["x"]);
    add(&service, "m1", "world", "bob", "update", "ctxA", &["x", "y"]);

    let history = service.store().get_history("m1").unwrap();
    assert_eq!(history.current_version, 2);
    assert_eq!(history.versions[1].content, "world");
    assert_eq!(history.versions[1].created_by, "bob");
    assert_eq!(history.versions[0].change_note, "init");
    assert_eq!(history.tags, normalize_tags(["x", "y"]));

    add(&service, "m1", "again", "bob", "", "ctxA", &["z"]);
    assert_eq!(
        service.store().get_history("m1").unwrap().tags,
        normalize_tags(["z"])
    );
}

#[test]
fn context_filter_returns_latest_content() {
    let service = service_with_context("ctxA");
    service.registry().create_context("ctxB", "B", "").unwrap();
    add(&service, "m1", "hello", "alice", "init", "ctxA", &["x"]);
    add(&service, "m1", "world", "bob", "update", "ctxA", &["x", "y"]);
    add(&service, "m2", "elsewhere", "alice", "", "ctxB", &[]);

    let results = service
        .filter()
        .filter_memories(&SearchFilter::default().with_context("ctxA"));
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, "m1");
    assert_eq!(results[0].content, "world");
    assert_eq!(results[0].current_version, 2);
    assert_eq!(results[0].similarity, UNRANKED_SIMILARITY);
}

#[test]
fn deleted_memory_versions_are_gone() {
    let service = service_with_context("ctxA");
    add(&service, "m1", "hello", "alice", "init", "ctxA", &[]);
    service.delete_memory("m1").unwrap();

    assert!(matches!(
        service.store().get_version("m1", 1),
        Err(MemvaultError::NotFound(_))
    ));
    assert!(matches!(
        service.store().get_history("m1"),
        Err(MemvaultError::NotFound(_))
    ));
}

#[test]
fn repeated_reads_are_equal() {
    let service = service_with_context("ctxA");
    add(&service, "m1", "hello", "alice", "", "ctxA", &["x"]);

    let first = service.store().get_history("m1").unwrap();
    let second = service.store().get_history("m1").unwrap();
    assert_eq!(first, second);
}

#[test]
fn tag_filter_any_and_all() {
    let service = service_with_context("ctxA");
    add(&service, "m1", "tagged", "alice", "", "ctxA", &["a", "b"]);

    let any = SearchFilter::default().with_tags(strings(&["a", "c"]), TagFilterMode::Any);
    let all = SearchFilter::default().with_tags(strings(&["a", "c"]), TagFilterMode::All);

    assert_eq!(service.filter().filter_memories(&any).len(), 1);
    assert!(service.filter().filter_memories(&all).is_empty());
}

#[test]
fn batch_delete_reports_the_missing_id() {
    let service = service_with_context("ctxA");
    add(&service, "existing", "keep me", "alice", "", "ctxA", &[]);

    let report = service
        .run_batch(&BatchRequest {
            operation: BatchOperationKind::Delete,
            memories: Vec::new(),
            memory_ids: strings(&["existing", "missingID"]),
            tags: Vec::new(),
        })
        .unwrap();

    assert_eq!(report.total, 2);
    assert_eq!(report.successful, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("missingID"));
    assert!(!service.store().contains("existing"));
}

#[test]
fn concurrent_writers_keep_histories_consistent() {
    let store = Arc::new(VersionStore::open(Storage::open_in_memory().unwrap()).unwrap());
    let writers = 8;
    let writes_per_writer = 25;

    let handles: Vec<_> = (0..writers)
        .map(|w| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let id = format!("writer-{}", w);
                for n in 0..writes_per_writer {
                    let write = store
                        .add_version(&id, &format!("v{}", n), "thread", "", DEFAULT_CONTEXT_ID, &[])
                        .unwrap();
                    assert_eq!(write.version_number, n + 1);
                }
            })
        })
        .collect();

    // Readers scan while writers run
    for _ in 0..50 {
        for history in store.get_all_histories().values() {
            assert!(history.is_consistent());
        }
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let histories = store.get_all_histories();
    assert_eq!(histories.len(), writers);
    for history in histories.values() {
        assert!(history.is_consistent());
        assert_eq!(history.current_version, writes_per_writer);
    }
}

#[test]
fn full_export_reproduces_records() {
    let source = service_with_context("ctxA");
    add(&source, "m1", "one", "alice", "init", "ctxA", &["x"]);
    add(&source, "m1", "two", "bob", "edit", "ctxA", &["x", "y"]);
    add(&source, "m2", "other", "carol", "", "ctxA", &[]);
    source.store().set_metadata("m2", "origin", "scenario").unwrap();

    let data = source
        .export(&ExportRequest {
            memory_ids: strings(&["m1", "m2"]),
            include_versions: true,
            exported_by: Some("tester".to_string()),
        })
        .unwrap();
    assert_eq!(data.exported_by, "tester");
    assert_eq!(data.version, FORMAT_VERSION);

    let target = MemoryService::open_in_memory().unwrap();
    let summary = target
        .import(&ImportRequest {
            json_data: serde_json::to_string_pretty(&data).unwrap(),
        })
        .unwrap();
    assert_eq!(summary.memories, 2);

    for id in ["m1", "m2"] {
        assert_eq!(
            target.store().get_history(id).unwrap(),
            source.store().get_history(id).unwrap()
        );
    }
}

#[test]
fn restore_appends_copy_of_old_version() {
    let service = service_with_context("ctxA");
    add(&service, "m1", "first", "alice", "", "ctxA", &[]);
    add(&service, "m1", "second", "alice", "", "ctxA", &[]);

    service
        .restore_version(&RestoreVersionRequest {
            memory_id: "m1".to_string(),
            version_number: 1,
            author: "bob".to_string(),
            restore_reason: Some("revert".to_string()),
        })
        .unwrap();

    let history = service.store().get_history("m1").unwrap();
    assert_eq!(history.current_version, 3);
    assert_eq!(history.versions[2].content, "first");
    assert_eq!(history.versions[2].change_note, "Restored from version 1: revert");
    assert_eq!(history.versions[1].content, "second");
}

#[test]
fn failed_batch_commit_leaves_nothing_visible() {
    let store = VersionStore::open(Storage::open_in_memory().unwrap()).unwrap();
    store
        .storage()
        .with_connection(|conn| {
            conn.execute_batch(
                "CREATE TABLE guard (
                     memory_id TEXT REFERENCES memories(id) DEFERRABLE INITIALLY DEFERRED
                 );
                 CREATE TRIGGER guard_batch AFTER INSERT ON memories
                 WHEN NEW.id = 'b2'
                 BEGIN
                     INSERT INTO guard (memory_id) VALUES ('no-such-record');
                 END;",
            )?;
            Ok(())
        })
        .unwrap();

    let items: Vec<BatchCreateItem> = ["b1", "b2"]
        .iter()
        .map(|id| BatchCreateItem {
            id: id.to_string(),
            content: "content".to_string(),
            context: DEFAULT_CONTEXT_ID.to_string(),
            tags: Vec::new(),
            author: "batch".to_string(),
        })
        .collect();

    match BatchCoordinator::new(&store).batch_create(&items) {
        Err(MemvaultError::BatchAborted { report, .. }) => {
            assert_eq!((report.successful, report.failed), (0, 2));
            assert!(report.errors.last().unwrap().starts_with("Failed to save:"));
        }
        other => panic!("expected an aborted batch, got {:?}", other),
    }
    assert_eq!(store.count(), 0);
}

#[test]
fn invalid_filter_is_rejected_before_scanning() {
    let service = service_with_context("ctxA");
    add(&service, "m1", "hello", "alice", "", "ctxA", &[]);

    let inverted = SearchAdvancedRequest {
        start_date: Some(chrono::Utc::now()),
        end_date: Some(chrono::Utc::now() - chrono::Duration::days(1)),
        ..Default::default()
    };
    assert!(matches!(
        service.search(&inverted),
        Err(MemvaultError::Validation(_))
    ));

    let bad_mode = SearchAdvancedRequest {
        tags: strings(&["x"]),
        tag_filter_mode: Some("most".to_string()),
        ..Default::default()
    };
    assert!(matches!(
        service.search(&bad_mode),
        Err(MemvaultError::Validation(_))
    ));
}
