//! Seams toward the embedding provider and the vector index
//!
//! Neither an embedding model nor a nearest-neighbor algorithm lives in
//! this crate. [`IndexSync`] hands latest-version content to whatever
//! implementations the host wires in. Collaborator failures are reported
//! and never touch the version store.

use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use crate::error::{MemvaultError, Result};
use crate::types::*;
use crate::versions::VersionStore;

/// What an embedding will be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingTask {
    /// Content being stored
    Document,
    /// Text being searched for
    Query,
}

/// Trait for embedding generators
pub trait Embedder: Send + Sync {
    /// Generate a normalized embedding for a single text
    fn embed(&self, text: &str, task: EmbeddingTask) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts (batch)
    fn embed_batch(&self, texts: &[&str], task: EmbeddingTask) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t, task)).collect()
    }

    /// Get embedding dimensions
    fn dimensions(&self) -> usize;

    /// Get model name
    fn model_name(&self) -> &str;
}

/// One nearest-neighbor match
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub id: MemoryId,
    pub similarity: f32,
}

/// Trait for nearest-neighbor document stores
pub trait VectorIndex: Send + Sync {
    fn upsert(&self, id: &str, embedding: &[f32], metadata: &BTreeMap<String, String>)
        -> Result<()>;

    /// Returns whether the document existed
    fn delete(&self, id: &str) -> Result<bool>;

    fn clear(&self) -> Result<()>;

    fn count(&self) -> Result<usize>;

    /// Up to `top_k` hits, most similar first
    fn query(&self, embedding: &[f32], top_k: usize) -> Result<Vec<IndexHit>>;
}

/// Outcome of pushing memories into a vector index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub indexed: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// Keeps a [`VectorIndex`] in step with the version store
pub struct IndexSync<'a> {
    embedder: &'a dyn Embedder,
    index: &'a dyn VectorIndex,
}

impl<'a> IndexSync<'a> {
    pub fn new(embedder: &'a dyn Embedder, index: &'a dyn VectorIndex) -> Self {
        Self { embedder, index }
    }

    fn embed_checked(&self, text: &str, task: EmbeddingTask) -> Result<Vec<f32>> {
        let embedding = self.embedder.embed(text, task)?;
        if embedding.len() != self.embedder.dimensions() {
            return Err(MemvaultError::Collaborator(format!(
                "{} returned {} dimensions, expected {}",
                self.embedder.model_name(),
                embedding.len(),
                self.embedder.dimensions()
            )));
        }
        Ok(embedding)
    }

    fn index_metadata(history: &MemoryWithHistory) -> BTreeMap<String, String> {
        let mut metadata = history.metadata.clone();
        metadata.insert("context".to_string(), history.context.clone());
        metadata.insert(
            "version".to_string(),
            history.current_version.to_string(),
        );
        metadata
    }

    /// Index the latest version of one memory
    pub fn sync_memory(&self, store: &VersionStore, id: &str) -> Result<()> {
        let history = store.get_history(id)?;
        let latest = history
            .latest()
            .ok_or_else(|| MemvaultError::memory_not_found(id))?;
        let embedding = self.embed_checked(&latest.content, EmbeddingTask::Document)?;
        self.index
            .upsert(id, &embedding, &Self::index_metadata(&history))?;
        debug!(memory_id = id, version = history.current_version, "Indexed memory");
        Ok(())
    }

    /// Index the latest version of every memory; failures are tallied
    pub fn sync_all(&self, store: &VersionStore) -> SyncReport {
        let mut report = SyncReport::default();
        for history in store.get_all_histories().values() {
            let Some(latest) = history.latest() else {
                continue;
            };
            let outcome = self
                .embed_checked(&latest.content, EmbeddingTask::Document)
                .and_then(|embedding| {
                    self.index
                        .upsert(&history.id, &embedding, &Self::index_metadata(history))
                });
            match outcome {
                Ok(()) => report.indexed += 1,
                Err(e) => {
                    warn!(memory_id = history.id.as_str(), error = %e, "Failed to index memory");
                    report.failed += 1;
                    report.errors.push(format!("Memory \"{}\": {}", history.id, e));
                }
            }
        }
        info!(
            indexed = report.indexed,
            failed = report.failed,
            model = self.embedder.model_name(),
            "Synced vector index"
        );
        report
    }

    /// Drop a deleted memory from the index
    pub fn remove_memory(&self, id: &str) -> Result<bool> {
        self.index.delete(id)
    }

    /// Nearest memories to `query`, projected from the store's current state.
    ///
    /// Hits for memories no longer in the store are skipped.
    pub fn semantic_search(
        &self,
        store: &VersionStore,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        let embedding = self.embed_checked(query, EmbeddingTask::Query)?;
        let hits = self.index.query(&embedding, limit)?;
        Ok(store.read(|histories| {
            hits.iter()
                .filter_map(|hit| {
                    let mut result = SearchResult::from_history(histories.get(&hit.id)?)?;
                    result.similarity = hit.similarity;
                    Some(result)
                })
                .collect()
        }))
    }

    /// Re-rank filter results by vector similarity to `query`.
    ///
    /// Candidates the index does not know keep [`UNRANKED_SIMILARITY`] and
    /// go last, in their original order.
    pub fn rerank(&self, query: &str, candidates: Vec<SearchResult>) -> Result<Vec<SearchResult>> {
        if candidates.is_empty() {
            return Ok(candidates);
        }
        let embedding = self.embed_checked(query, EmbeddingTask::Query)?;
        let total = self.index.count()?;
        let scores: HashMap<MemoryId, f32> = self
            .index
            .query(&embedding, total)?
            .into_iter()
            .map(|hit| (hit.id, hit.similarity))
            .collect();

        let (mut ranked, unranked): (Vec<SearchResult>, Vec<SearchResult>) =
            candidates.into_iter().partition(|c| scores.contains_key(&c.id));
        for result in &mut ranked {
            if let Some(score) = scores.get(&result.id) {
                result.similarity = *score;
            }
        }
        ranked.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        ranked.extend(unranked);
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use parking_lot::Mutex;

    /// Letter-frequency embedding over a..z
    struct LetterEmbedder;

    impl Embedder for LetterEmbedder {
        fn embed(&self, text: &str, _task: EmbeddingTask) -> Result<Vec<f32>> {
            if text.contains("fail") {
                return Err(MemvaultError::Collaborator("provider unavailable".into()));
            }
            let mut v = vec![0.0f32; 26];
            for c in text.to_lowercase().chars().filter(|c| c.is_ascii_lowercase()) {
                v[(c as u8 - b'a') as usize] += 1.0;
            }
            let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(f32::EPSILON);
            Ok(v.into_iter().map(|x| x / norm).collect())
        }

        fn dimensions(&self) -> usize {
            26
        }

        fn model_name(&self) -> &str {
            "letters"
        }
    }

    #[derive(Default)]
    struct BruteForceIndex {
        docs: Mutex<BTreeMap<String, Vec<f32>>>,
    }

    impl VectorIndex for BruteForceIndex {
        fn upsert(&self, id: &str, embedding: &[f32], _: &BTreeMap<String, String>) -> Result<()> {
            self.docs.lock().insert(id.to_string(), embedding.to_vec());
            Ok(())
        }

        fn delete(&self, id: &str) -> Result<bool> {
            Ok(self.docs.lock().remove(id).is_some())
        }

        fn clear(&self) -> Result<()> {
            self.docs.lock().clear();
            Ok(())
        }

        fn count(&self) -> Result<usize> {
            Ok(self.docs.lock().len())
        }

        fn query(&self, embedding: &[f32], top_k: usize) -> Result<Vec<IndexHit>> {
            let mut hits: Vec<IndexHit> = self
                .docs
                .lock()
                .iter()
                .map(|(id, v)| IndexHit {
                    id: id.clone(),
                    similarity: v.iter().zip(embedding).map(|(a, b)| a * b).sum(),
                })
                .collect();
            hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
            hits.truncate(top_k);
            Ok(hits)
        }
    }

    fn store() -> VersionStore {
        let store = VersionStore::open(Storage::open_in_memory().unwrap()).unwrap();
        store.add_version("cats", "cats cats", "alice", "", "ctx", &[]).unwrap();
        store.add_version("dogs", "dogs dogs", "alice", "", "ctx", &[]).unwrap();
        store
    }

    #[test]
    fn test_sync_and_search() {
        let store = store();
        let (embedder, index) = (LetterEmbedder, BruteForceIndex::default());
        let sync = IndexSync::new(&embedder, &index);

        let report = sync.sync_all(&store);
        assert_eq!((report.indexed, report.failed), (2, 0));
        assert_eq!(index.count().unwrap(), 2);

        let results = sync.semantic_search(&store, "cat", 1).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "cats");
        assert!(results[0].similarity > 0.0);
    }

    #[test]
    fn test_failures_are_tallied_without_touching_store() {
        let store = store();
        store.add_version("bad", "fail here", "alice", "", "ctx", &[]).unwrap();
        let (embedder, index) = (LetterEmbedder, BruteForceIndex::default());
        let sync = IndexSync::new(&embedder, &index);

        let report = sync.sync_all(&store);
        assert_eq!((report.indexed, report.failed), (2, 1));
        assert!(report.errors[0].contains("\"bad\""));
        assert_eq!(store.count(), 3);
        assert!(sync.sync_memory(&store, "bad").is_err());
    }

    #[test]
    fn test_rerank_orders_by_similarity() {
        let store = store();
        let (embedder, index) = (LetterEmbedder, BruteForceIndex::default());
        let sync = IndexSync::new(&embedder, &index);
        sync.sync_memory(&store, "cats").unwrap();
        sync.sync_memory(&store, "dogs").unwrap();
        store.add_version("new", "unindexed", "alice", "", "ctx", &[]).unwrap();

        let candidates: Vec<SearchResult> = store
            .get_all_histories()
            .values()
            .filter_map(SearchResult::from_history)
            .collect();
        let ranked = sync.rerank("dog", candidates).unwrap();
        let ids: Vec<&str> = ranked.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["dogs", "cats", "new"]);
        assert_eq!(ranked[2].similarity, UNRANKED_SIMILARITY);

        assert!(sync.remove_memory("dogs").unwrap());
        assert!(!sync.remove_memory("dogs").unwrap());
    }
}
