//! Structured filtering over the version store
//!
//! The engine holds no state: it borrows the version store's committed
//! snapshot for the duration of a scan and the registry for validation.
//! Results come out in memory-ID order, so identical store state always
//! yields identical result sequences.

use tracing::debug;

use crate::error::{MemvaultError, Result};
use crate::registry::Registry;
use crate::types::*;
use crate::versions::VersionStore;

/// Result cap of [`FilterEngine::search_by_context_and_tags`]
pub const CONTEXT_AND_TAGS_LIMIT: usize = 50;
/// Result cap of the date-range and tag helpers
pub const HELPER_LIMIT: usize = 100;

/// Whether `history` passes every predicate of `filter`
pub fn matches(filter: &SearchFilter, history: &MemoryWithHistory) -> bool {
    if let Some(context_id) = filter.context_id.as_deref().filter(|c| !c.is_empty()) {
        if history.context != context_id {
            return false;
        }
    }

    if filter.start_date.is_some_and(|start| history.created_at < start) {
        return false;
    }
    if filter.end_date.is_some_and(|end| history.updated_at > end) {
        return false;
    }

    if let Some(author) = filter.created_by.as_deref().filter(|a| !a.is_empty()) {
        if history.original_author() != Some(author) {
            return false;
        }
    }

    if !filter.tags.is_empty() {
        // A blank filter tag never matches anything
        let mut wanted = filter
            .tags
            .iter()
            .map(|t| normalize_tag(t).is_some_and(|t| history.tags.contains(&t)));
        let passes = match filter.mode() {
            TagFilterMode::All => wanted.all(|hit| hit),
            TagFilterMode::Any => wanted.any(|hit| hit),
        };
        if !passes {
            return false;
        }
    }

    true
}

/// Query layer over a [`VersionStore`] and a [`Registry`]
pub struct FilterEngine<'a> {
    store: &'a VersionStore,
    registry: &'a Registry,
}

impl<'a> FilterEngine<'a> {
    pub fn new(store: &'a VersionStore, registry: &'a Registry) -> Self {
        Self { store, registry }
    }

    /// Evaluate `filter` against every stored memory.
    ///
    /// Non-matching records are skipped, never reported. `max_results`
    /// keeps a prefix of the ID-ordered matches; it is a cutoff, not a
    /// similarity ranking, and every result carries
    /// [`UNRANKED_SIMILARITY`].
    pub fn filter_memories(&self, filter: &SearchFilter) -> Vec<SearchResult> {
        let results: Vec<SearchResult> = self.store.read(|histories| {
            let matching = histories
                .values()
                .filter(|h| matches(filter, h))
                .filter_map(SearchResult::from_history);
            if filter.max_results > 0 {
                matching.take(filter.max_results).collect()
            } else {
                matching.collect()
            }
        });

        debug!(
            context_id = filter.context_id.as_deref().unwrap_or(""),
            tags = filter.tags.len(),
            mode = filter.mode().as_str(),
            results = results.len(),
            "Filtered memories"
        );
        results
    }

    /// Validate `filter`, then run it
    pub fn search(&self, filter: &SearchFilter) -> Result<Vec<SearchResult>> {
        self.validate_filter(filter)?;
        Ok(self.filter_memories(filter))
    }

    pub fn search_by_context_and_tags(
        &self,
        context_id: &str,
        tags: &[String],
        mode: TagFilterMode,
    ) -> Vec<SearchResult> {
        self.filter_memories(
            &SearchFilter::default()
                .with_context(context_id)
                .with_tags(tags.to_vec(), mode)
                .with_max_results(CONTEXT_AND_TAGS_LIMIT),
        )
    }

    pub fn search_by_date_range(
        &self,
        start_date: Option<chrono::DateTime<chrono::Utc>>,
        end_date: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Vec<SearchResult> {
        self.filter_memories(&SearchFilter {
            start_date,
            end_date,
            max_results: HELPER_LIMIT,
            ..Default::default()
        })
    }

    pub fn search_by_context(&self, context_id: &str, max_results: usize) -> Vec<SearchResult> {
        self.filter_memories(
            &SearchFilter::default()
                .with_context(context_id)
                .with_max_results(max_results),
        )
    }

    pub fn memories_by_tag(&self, tag: &str) -> Vec<SearchResult> {
        self.filter_memories(
            &SearchFilter::default()
                .with_tags(vec![tag.to_string()], TagFilterMode::Any)
                .with_max_results(HELPER_LIMIT),
        )
    }

    pub fn memories_by_tags(&self, tags: &[String], match_all: bool) -> Vec<SearchResult> {
        let mode = if match_all {
            TagFilterMode::All
        } else {
            TagFilterMode::Any
        };
        self.filter_memories(
            &SearchFilter::default()
                .with_tags(tags.to_vec(), mode)
                .with_max_results(HELPER_LIMIT),
        )
    }

    /// Aggregate statistics over every memory in `context_id`.
    ///
    /// `total_characters` counts Unicode scalar values of each latest version.
    pub fn context_stats(&self, context_id: &str) -> ContextStats {
        let memories = self.search_by_context(context_id, 0);

        let mut stats = ContextStats {
            context_id: context_id.to_string(),
            memory_count: memories.len(),
            unique_tags: Default::default(),
            oldest_memory: None,
            newest_memory: None,
            total_characters: 0,
        };

        for memory in &memories {
            stats.unique_tags.extend(memory.tags.iter().cloned());
            stats.oldest_memory = Some(
                stats
                    .oldest_memory
                    .map_or(memory.created_at, |t| t.min(memory.created_at)),
            );
            stats.newest_memory = Some(
                stats
                    .newest_memory
                    .map_or(memory.updated_at, |t| t.max(memory.updated_at)),
            );
            stats.total_characters += memory.content.chars().count();
        }

        stats
    }

    /// Reject filters with an unknown context, an inverted date range or
    /// an unrecognized tag mode
    pub fn validate_filter(&self, filter: &SearchFilter) -> Result<()> {
        if let Some(context_id) = filter.context_id.as_deref().filter(|c| !c.is_empty()) {
            if !self.registry.context_exists(context_id) {
                return Err(MemvaultError::validation(format!(
                    "Unknown context \"{}\"",
                    context_id
                )));
            }
        }

        if let (Some(start), Some(end)) = (filter.start_date, filter.end_date) {
            if start > end {
                return Err(MemvaultError::validation(format!(
                    "start_date {} is after end_date {}",
                    start.to_rfc3339(),
                    end.to_rfc3339()
                )));
            }
        }

        if let Some(mode) = filter.tag_filter_mode.as_deref().filter(|m| !m.is_empty()) {
            mode.parse::<TagFilterMode>()
                .map_err(MemvaultError::Validation)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use chrono::{Duration, Utc};
    use pretty_assertions::assert_eq;

    struct Fixture {
        store: VersionStore,
        registry: Registry,
    }

    impl Fixture {
        fn new() -> Self {
            let storage = Storage::open_in_memory().unwrap();
            Self {
                store: VersionStore::open(storage.clone()).unwrap(),
                registry: Registry::open(storage, RegistryConfig::default()).unwrap(),
            }
        }

        fn engine(&self) -> FilterEngine<'_> {
            FilterEngine::new(&self.store, &self.registry)
        }

        fn add(&self, id: &str, content: &str, author: &str, context: &str, tags: &[&str]) {
            let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
            self.store
                .add_version(id, content, author, "", context, &tags)
                .unwrap();
        }
    }

    fn ids(results: &[SearchResult]) -> Vec<&str> {
        results.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn test_tag_modes() {
        let fx = Fixture::new();
        fx.add("m1", "hello", "alice", "ctx", &["a", "b"]);

        let any = SearchFilter::default().with_tags(vec!["A".into(), "c".into()], TagFilterMode::Any);
        let all = SearchFilter::default().with_tags(vec!["a".into(), "c".into()], TagFilterMode::All);
        assert_eq!(fx.engine().filter_memories(&any).len(), 1);
        assert!(fx.engine().filter_memories(&all).is_empty());
    }

    #[test]
    fn test_unknown_mode_behaves_as_any() {
        let fx = Fixture::new();
        fx.add("m1", "hello", "alice", "ctx", &["a"]);

        let filter = SearchFilter {
            tags: vec!["a".into(), "z".into()],
            tag_filter_mode: Some("both".into()),
            ..Default::default()
        };
        assert_eq!(fx.engine().filter_memories(&filter).len(), 1);
        assert!(fx.engine().validate_filter(&filter).is_err());
    }

    #[test]
    fn test_author_matches_original_writer() {
        let fx = Fixture::new();
        fx.add("m1", "first", "alice", "ctx", &[]);
        fx.add("m1", "second", "bob", "ctx", &[]);

        let by_bob = SearchFilter {
            created_by: Some("bob".into()),
            ..Default::default()
        };
        let by_alice = SearchFilter {
            created_by: Some("alice".into()),
            ..Default::default()
        };
        assert!(fx.engine().filter_memories(&by_bob).is_empty());

        let results = fx.engine().filter_memories(&by_alice);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "second");
        assert_eq!(results[0].similarity, UNRANKED_SIMILARITY);
    }

    #[test]
    fn test_context_match_is_case_sensitive() {
        let fx = Fixture::new();
        fx.add("m1", "hello", "alice", "ctxA", &[]);
        assert!(fx.engine().search_by_context("ctxa", 0).is_empty());
        assert_eq!(fx.engine().search_by_context("ctxA", 0).len(), 1);
    }

    #[test]
    fn test_date_bounds_are_inclusive() {
        let fx = Fixture::new();
        fx.add("m1", "hello", "alice", "ctx", &[]);
        let history = fx.store.get_history("m1").unwrap();

        let exact = fx
            .engine()
            .search_by_date_range(Some(history.created_at), Some(history.updated_at));
        assert_eq!(ids(&exact), vec!["m1"]);

        let later = fx
            .engine()
            .search_by_date_range(Some(history.created_at + Duration::seconds(1)), None);
        assert!(later.is_empty());

        let earlier = fx
            .engine()
            .search_by_date_range(None, Some(history.updated_at - Duration::seconds(1)));
        assert!(earlier.is_empty());
    }

    #[test]
    fn test_max_results_takes_prefix_in_id_order() {
        let fx = Fixture::new();
        for id in ["m3", "m1", "m2"] {
            fx.add(id, "x", "alice", "ctx", &[]);
        }

        let filter = SearchFilter::default().with_max_results(2);
        assert_eq!(ids(&fx.engine().filter_memories(&filter)), vec!["m1", "m2"]);
        assert_eq!(
            fx.engine().filter_memories(&filter),
            fx.engine().filter_memories(&filter)
        );
    }

    #[test]
    fn test_helper_queries() {
        let fx = Fixture::new();
        fx.add("m1", "x", "alice", "ctx", &["rust"]);
        fx.add("m2", "y", "alice", "other", &["rust", "mcp"]);

        assert_eq!(fx.engine().memories_by_tag("RUST").len(), 2);
        assert_eq!(
            ids(&fx.engine().memories_by_tags(&["rust".into(), "mcp".into()], true)),
            vec!["m2"]
        );
        assert_eq!(
            ids(&fx
                .engine()
                .search_by_context_and_tags("ctx", &["rust".into()], TagFilterMode::Any)),
            vec!["m1"]
        );
    }

    #[test]
    fn test_context_stats() {
        let fx = Fixture::new();
        fx.add("m1", "héllo", "alice", "ctx", &["a"]);
        fx.add("m2", "world", "alice", "ctx", &["b"]);
        fx.add("m3", "elsewhere", "alice", "other", &["c"]);

        let stats = fx.engine().context_stats("ctx");
        assert_eq!(stats.memory_count, 2);
        assert_eq!(stats.unique_tags, normalize_tags(["a", "b"]));
        assert_eq!(stats.total_characters, 10);
        assert!(stats.oldest_memory <= stats.newest_memory);

        let empty = fx.engine().context_stats("nowhere");
        assert_eq!(empty.memory_count, 0);
        assert!(empty.oldest_memory.is_none());
        assert!(empty.newest_memory.is_none());
    }

    #[test]
    fn test_validate_filter() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let now = Utc::now();

        assert!(engine
            .validate_filter(&SearchFilter::default().with_context(DEFAULT_CONTEXT_ID))
            .is_ok());
        assert!(matches!(
            engine.validate_filter(&SearchFilter::default().with_context("missing")),
            Err(MemvaultError::Validation(_))
        ));
        assert!(engine
            .validate_filter(&SearchFilter {
                start_date: Some(now),
                end_date: Some(now - Duration::hours(1)),
                ..Default::default()
            })
            .is_err());
        assert!(engine
            .validate_filter(&SearchFilter {
                start_date: Some(now),
                end_date: Some(now),
                tag_filter_mode: Some("all".into()),
                ..Default::default()
            })
            .is_ok());
        assert!(engine.search(&SearchFilter::default().with_context("missing")).is_err());
    }

    #[test]
    fn test_empty_tag_mode_is_any() {
        let fx = Fixture::new();
        fx.add("m1", "one", "alice", DEFAULT_CONTEXT_ID, &["a", "b"]);
        let filter = SearchFilter {
            tags: vec!["a".into(), "c".into()],
            tag_filter_mode: Some(String::new()),
            ..Default::default()
        };

        assert!(fx.engine().validate_filter(&filter).is_ok());
        assert_eq!(fx.engine().search(&filter).unwrap().len(), 1);
    }
}
