//! Service façade over the version store and the registry
//!
//! The tool-call transport talks to [`MemoryService`] with typed requests.
//! The service validates them, drives the store, and keeps the registry's
//! counters in step.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::batch::BatchCoordinator;
use crate::error::Result;
use crate::filter::FilterEngine;
use crate::registry::Registry;
use crate::requests::*;
use crate::storage::Storage;
use crate::types::*;
use crate::versions::{VersionStore, VersionWrite};

/// Counts applied by an import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub memories: usize,
    pub contexts: usize,
    pub tags: usize,
}

/// One version store and one registry over a shared database
pub struct MemoryService {
    storage: Storage,
    store: VersionStore,
    registry: Registry,
}

impl MemoryService {
    /// Open (or create) the database named by `config`
    pub fn open(mut config: VaultConfig) -> Result<Self> {
        config.storage.db_path = shellexpand::tilde(&config.storage.db_path).into_owned();
        let storage = Storage::open(config.storage)?;
        if let Some(warning) = storage.storage_mode_warning() {
            warn!("{}", warning);
        }
        Self::with_storage(storage, config.registry)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_storage(Storage::open_in_memory()?, RegistryConfig::default())
    }

    fn with_storage(storage: Storage, registry_config: RegistryConfig) -> Result<Self> {
        let store = VersionStore::open(storage.clone())?;
        let registry = Registry::open(storage.clone(), registry_config)?;
        info!(
            db_path = storage.db_path(),
            mode = ?storage.storage_mode(),
            memories = store.count(),
            "Memory service ready"
        );
        Ok(Self {
            storage,
            store,
            registry,
        })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn store(&self) -> &VersionStore {
        &self.store
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn filter(&self) -> FilterEngine<'_> {
        FilterEngine::new(&self.store, &self.registry)
    }

    pub fn batch(&self) -> BatchCoordinator<'_> {
        BatchCoordinator::new(&self.store).with_registry(&self.registry)
    }

    /// Append a version. Without an explicit context the author's current
    /// session context is used.
    pub fn add_version(&self, request: &AddVersionRequest) -> Result<VersionWrite> {
        request.validate()?;
        let context = match request.context_id.as_deref().filter(|c| !c.is_empty()) {
            Some(context) => context.to_string(),
            None => match self.registry.client_context(&request.author) {
                Ok(context) => context,
                Err(e) => {
                    warn!(
                        client_id = request.author.as_str(),
                        error = %e,
                        "Could not resolve client context, using default"
                    );
                    DEFAULT_CONTEXT_ID.to_string()
                }
            },
        };

        let write = self.store.add_version(
            &request.memory_id,
            &request.content,
            &request.author,
            &request.change_note,
            &context,
            &request.tags,
        )?;

        self.registry.record_write(&context, &write);
        if let Err(e) = self.registry.touch_session(&request.author) {
            debug!(client_id = request.author.as_str(), error = %e, "Failed to touch session");
        }
        Ok(write)
    }

    pub fn restore_version(&self, request: &RestoreVersionRequest) -> Result<VersionWrite> {
        request.validate()?;
        self.store.restore_version(
            &request.memory_id,
            request.version_number,
            &request.author,
            request.restore_reason.as_deref(),
        )
    }

    pub fn delete_memory(&self, id: &str) -> Result<MemoryWithHistory> {
        let removed = self.store.delete_memory_history(id)?;
        self.registry.record_delete(&removed);
        Ok(removed)
    }

    /// Union tags into one memory, registering tags seen for the first time
    pub fn add_tags(&self, id: &str, tags: &[String]) -> Result<()> {
        let added = self.store.add_tags(id, tags)?;
        self.registry.record_tags_added(&added);
        Ok(())
    }

    pub fn remove_tags(&self, id: &str, tags: &[String]) -> Result<()> {
        self.store.remove_tags(id, tags).map(|_| ())
    }

    /// Validated filter query
    pub fn search(&self, request: &SearchAdvancedRequest) -> Result<Vec<SearchResult>> {
        request.validate()?;
        self.filter().search(&request.to_filter())
    }

    pub fn context_stats(&self, request: &ContextStatsRequest) -> Result<ContextStats> {
        request.validate()?;
        Ok(self.filter().context_stats(&request.context_id))
    }

    pub fn run_batch(&self, request: &BatchRequest) -> Result<BatchOperationResult> {
        request.validate()?;
        self.batch().run(request)
    }

    /// Export memories together with the registry's contexts and tags
    pub fn export(&self, request: &ExportRequest) -> Result<ExportData> {
        request.validate()?;
        let mut data = self.store.export_memories(
            &request.memory_ids,
            request.include_versions,
            request.exported_by(),
        );
        data.contexts = Some(
            self.registry
                .list_contexts()
                .into_iter()
                .map(|c| (c.id.clone(), c))
                .collect(),
        );
        data.tags = Some(
            self.registry
                .list_tags()
                .into_iter()
                .map(|t| (t.name.clone(), t))
                .collect(),
        );
        Ok(data)
    }

    /// Import an export document: memories first, then the taxonomy
    pub fn import(&self, request: &ImportRequest) -> Result<ImportSummary> {
        let data = request.parse()?;
        self.import_data(&data)
    }

    pub fn import_data(&self, data: &ExportData) -> Result<ImportSummary> {
        let memories = self.store.import_memories(data)?;
        let (contexts, tags) = self
            .registry
            .import_taxonomy(data.contexts.as_ref(), data.tags.as_ref())?;
        Ok(ImportSummary {
            memories,
            contexts,
            tags,
        })
    }
}
