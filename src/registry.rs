//! Context/tag registry with client sessions
//!
//! Name-to-metadata tables for contexts and tags, plus the per-client
//! session table used for multi-client context sharing. The default
//! context always exists.

use chrono::Utc;
use parking_lot::RwLock;
use rusqlite::Connection;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use crate::error::{MemvaultError, Result};
use crate::storage::{queries, Storage};
use crate::types::*;
use crate::versions::VersionWrite;

#[derive(Debug, Clone, Default)]
struct RegistryState {
    contexts: BTreeMap<String, Context>,
    tags: BTreeMap<String, Tag>,
    sessions: BTreeMap<String, ClientSession>,
}

fn default_context() -> Context {
    let now = Utc::now();
    Context {
        id: DEFAULT_CONTEXT_ID.to_string(),
        name: DEFAULT_CONTEXT_NAME.to_string(),
        description: "Default context for memories".to_string(),
        memory_count: 0,
        tags: Vec::new(),
        created_at: now,
        updated_at: now,
    }
}

fn context_not_found(id: &str) -> MemvaultError {
    MemvaultError::not_found(format!("Context \"{}\" not found", id))
}

fn tag_not_found(name: &str) -> MemvaultError {
    MemvaultError::not_found(format!("Tag \"{}\" not found", name))
}

fn session_not_found(client_id: &str) -> MemvaultError {
    MemvaultError::not_found(format!("Session \"{}\" not found", client_id))
}

fn new_session(client_id: &str) -> ClientSession {
    let now = Utc::now();
    ClientSession {
        client_id: client_id.to_string(),
        current_context: DEFAULT_CONTEXT_ID.to_string(),
        created_at: now,
        last_activity: now,
        shared_with: Vec::new(),
    }
}

/// Durable registry of contexts, tags and client sessions
pub struct Registry {
    storage: Storage,
    config: RegistryConfig,
    state: RwLock<RegistryState>,
}

impl Registry {
    /// Load the registry, creating the default context on first use
    pub fn open(storage: Storage, config: RegistryConfig) -> Result<Self> {
        let state = storage.with_connection(|conn| {
            if let Some(version) = queries::registry_meta(conn, "format_version")? {
                if version != FORMAT_VERSION {
                    warn!(
                        found = version.as_str(),
                        expected = FORMAT_VERSION,
                        "Registry written by a different format version"
                    );
                }
            }
            Ok(RegistryState {
                contexts: queries::load_contexts(conn)?,
                tags: queries::load_tags(conn)?,
                sessions: queries::load_sessions(conn)?,
            })
        })?;

        let registry = Self {
            storage,
            config,
            state: RwLock::new(state),
        };

        if !registry.context_exists(DEFAULT_CONTEXT_ID) {
            registry.commit(|state, conn| {
                let context = default_context();
                queries::upsert_context(conn, &context)?;
                state.contexts.insert(context.id.clone(), context);
                Ok(())
            })?;
        }

        {
            let state = registry.state.read();
            info!(
                contexts = state.contexts.len(),
                tags = state.tags.len(),
                sessions = state.sessions.len(),
                "Loaded registry"
            );
        }

        Ok(registry)
    }

    /// Apply `f` to a working copy inside one transaction; publish on commit
    fn commit<T>(&self, f: impl FnOnce(&mut RegistryState, &Connection) -> Result<T>) -> Result<T> {
        let mut state = self.state.write();
        let mut next = state.clone();
        let value = self.storage.with_transaction(|conn| f(&mut next, conn))?;
        *state = next;
        Ok(value)
    }

    // --- Contexts ---

    pub fn create_context(&self, id: &str, name: &str, description: &str) -> Result<Context> {
        let id = id.trim();
        if id.is_empty() {
            return Err(MemvaultError::validation("Context id cannot be empty"));
        }

        let context = self.commit(|state, conn| {
            if state.contexts.contains_key(id) {
                return Err(MemvaultError::AlreadyExists(format!(
                    "Context \"{}\" already exists",
                    id
                )));
            }
            let now = Utc::now();
            let context = Context {
                id: id.to_string(),
                name: (if name.trim().is_empty() { id } else { name }).to_string(),
                description: description.to_string(),
                memory_count: 0,
                tags: Vec::new(),
                created_at: now,
                updated_at: now,
            };
            queries::upsert_context(conn, &context)?;
            state.contexts.insert(context.id.clone(), context.clone());
            Ok(context)
        })?;

        info!(context_id = id, "Created context");
        Ok(context)
    }

    pub fn get_context(&self, id: &str) -> Result<Context> {
        self.state
            .read()
            .contexts
            .get(id)
            .cloned()
            .ok_or_else(|| context_not_found(id))
    }

    pub fn context_exists(&self, id: &str) -> bool {
        self.state.read().contexts.contains_key(id)
    }

    /// All contexts, sorted by id
    pub fn list_contexts(&self) -> Vec<Context> {
        self.state.read().contexts.values().cloned().collect()
    }

    pub fn delete_context(&self, id: &str) -> Result<()> {
        if id == DEFAULT_CONTEXT_ID {
            return Err(MemvaultError::validation("Cannot delete the default context"));
        }
        self.commit(|state, conn| {
            if state.contexts.remove(id).is_none() {
                return Err(context_not_found(id));
            }
            queries::delete_context(conn, id)?;
            Ok(())
        })?;
        info!(context_id = id, "Deleted context");
        Ok(())
    }

    pub fn increment_memory_count(&self, context_id: &str) -> Result<u64> {
        self.adjust_memory_count(context_id, |count| count.saturating_add(1))
    }

    /// Decrement a context's memory count, never below zero
    pub fn decrement_memory_count(&self, context_id: &str) -> Result<u64> {
        self.adjust_memory_count(context_id, |count| count.saturating_sub(1))
    }

    fn adjust_memory_count(&self, context_id: &str, f: impl FnOnce(u64) -> u64) -> Result<u64> {
        self.commit(|state, conn| {
            let context = state
                .contexts
                .get_mut(context_id)
                .ok_or_else(|| context_not_found(context_id))?;
            context.memory_count = f(context.memory_count);
            context.updated_at = Utc::now();
            queries::upsert_context(conn, context)?;
            Ok(context.memory_count)
        })
    }

    // --- Tags ---

    pub fn create_tag(&self, name: &str, description: &str, color: &str) -> Result<Tag> {
        let name =
            normalize_tag(name).ok_or_else(|| MemvaultError::validation("Tag name cannot be empty"))?;

        let tag = self.commit(|state, conn| {
            if state.tags.contains_key(&name) {
                return Err(MemvaultError::AlreadyExists(format!(
                    "Tag \"{}\" already exists",
                    name
                )));
            }
            let tag = Tag {
                name: name.clone(),
                description: description.to_string(),
                color: color.to_string(),
                memory_count: 0,
            };
            queries::upsert_tag(conn, &tag)?;
            state.tags.insert(name.clone(), tag.clone());
            Ok(tag)
        })?;

        info!(tag = tag.name.as_str(), "Created tag");
        Ok(tag)
    }

    /// Look up a tag, case-insensitively
    pub fn get_tag(&self, name: &str) -> Result<Tag> {
        let key = normalize_tag(name).ok_or_else(|| tag_not_found(name))?;
        self.state
            .read()
            .tags
            .get(&key)
            .cloned()
            .ok_or_else(|| tag_not_found(&key))
    }

    pub fn list_tags(&self) -> Vec<Tag> {
        self.state.read().tags.values().cloned().collect()
    }

    pub fn delete_tag(&self, name: &str) -> Result<()> {
        let key = normalize_tag(name).ok_or_else(|| tag_not_found(name))?;
        self.commit(|state, conn| {
            if state.tags.remove(&key).is_none() {
                return Err(tag_not_found(&key));
            }
            queries::delete_tag(conn, &key)?;
            Ok(())
        })?;
        info!(tag = key.as_str(), "Deleted tag");
        Ok(())
    }

    /// Create the tag if it does not exist yet; returns whether it was created
    pub fn ensure_tag(&self, name: &str) -> Result<bool> {
        match self.create_tag(name, "", "") {
            Ok(_) => Ok(true),
            Err(MemvaultError::AlreadyExists(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn increment_tag_count(&self, name: &str) -> Result<u64> {
        let key = normalize_tag(name).ok_or_else(|| tag_not_found(name))?;
        self.commit(|state, conn| {
            let tag = state.tags.get_mut(&key).ok_or_else(|| tag_not_found(&key))?;
            tag.memory_count = tag.memory_count.saturating_add(1);
            queries::upsert_tag(conn, tag)?;
            Ok(tag.memory_count)
        })
    }

    /// Upsert contexts and tags carried by an export
    pub fn import_taxonomy(
        &self,
        contexts: Option<&HashMap<String, Context>>,
        tags: Option<&HashMap<String, Tag>>,
    ) -> Result<(usize, usize)> {
        let counts = self.commit(|state, conn| {
            let mut imported_contexts = 0;
            for context in contexts.into_iter().flat_map(|c| c.values()) {
                if context.id.trim().is_empty() {
                    continue;
                }
                queries::upsert_context(conn, context)?;
                state.contexts.insert(context.id.clone(), context.clone());
                imported_contexts += 1;
            }

            let mut imported_tags = 0;
            for tag in tags.into_iter().flat_map(|t| t.values()) {
                let Some(name) = normalize_tag(&tag.name) else {
                    continue;
                };
                let tag = Tag {
                    name: name.clone(),
                    ..tag.clone()
                };
                queries::upsert_tag(conn, &tag)?;
                state.tags.insert(name, tag);
                imported_tags += 1;
            }
            Ok((imported_contexts, imported_tags))
        })?;

        info!(contexts = counts.0, tags = counts.1, "Imported taxonomy");
        Ok(counts)
    }

    // --- Sessions ---

    /// Register a client in the default context.
    ///
    /// Registering a known client keeps its session.
    pub fn register_session(&self, client_id: &str) -> Result<ClientSession> {
        let max_sessions = self.config.max_sessions;
        let session = self.commit(|state, conn| {
            if let Some(existing) = state.sessions.get(client_id) {
                return Ok(existing.clone());
            }
            if state.sessions.len() >= max_sessions {
                return Err(MemvaultError::LimitExceeded(format!(
                    "Maximum concurrent clients ({}) reached",
                    max_sessions
                )));
            }
            let session = new_session(client_id);
            queries::upsert_session(conn, &session)?;
            state.sessions.insert(client_id.to_string(), session.clone());
            Ok(session)
        })?;
        debug!(client_id, "Registered session");
        Ok(session)
    }

    pub fn unregister_session(&self, client_id: &str) -> Result<()> {
        self.commit(|state, conn| {
            if state.sessions.remove(client_id).is_none() {
                return Err(session_not_found(client_id));
            }
            queries::delete_session(conn, client_id)?;
            Ok(())
        })?;
        debug!(client_id, "Unregistered session");
        Ok(())
    }

    pub fn get_session(&self, client_id: &str) -> Result<ClientSession> {
        self.state
            .read()
            .sessions
            .get(client_id)
            .cloned()
            .ok_or_else(|| session_not_found(client_id))
    }

    pub fn switch_context(&self, client_id: &str, context_id: &str) -> Result<()> {
        self.commit(|state, conn| {
            if !state.contexts.contains_key(context_id) {
                return Err(context_not_found(context_id));
            }
            let session = state
                .sessions
                .get_mut(client_id)
                .ok_or_else(|| session_not_found(client_id))?;
            session.current_context = context_id.to_string();
            session.last_activity = Utc::now();
            queries::upsert_session(conn, session)?;
            Ok(())
        })?;
        info!(client_id, context_id, "Switched context");
        Ok(())
    }

    /// Current context of a client; an unseen client is registered on the fly
    pub fn client_context(&self, client_id: &str) -> Result<String> {
        if let Some(session) = self.state.read().sessions.get(client_id) {
            return Ok(session.current_context.clone());
        }
        Ok(self.register_session(client_id)?.current_context)
    }

    /// Grant `target_client_id` access to `context_id`
    pub fn share_context(
        &self,
        owner_client_id: &str,
        target_client_id: &str,
        context_id: &str,
    ) -> Result<()> {
        self.commit(|state, conn| {
            if !state.contexts.contains_key(context_id) {
                return Err(context_not_found(context_id));
            }
            let session = state
                .sessions
                .get_mut(target_client_id)
                .ok_or_else(|| session_not_found(target_client_id))?;
            if session.shared_with.iter().any(|id| id == context_id) {
                return Err(MemvaultError::AlreadyExists(format!(
                    "Context \"{}\" already shared with \"{}\"",
                    context_id, target_client_id
                )));
            }
            session.shared_with.push(context_id.to_string());
            queries::upsert_session(conn, session)?;
            Ok(())
        })?;
        info!(
            owner = owner_client_id,
            target = target_client_id,
            context_id,
            "Shared context"
        );
        Ok(())
    }

    // --- Counter bookkeeping ---
    //
    // Counters are advisory. Failures are logged and never undo the
    // memory write that triggered them.

    /// Keep context and tag counters in step with an appended version
    pub fn record_write(&self, context_id: &str, write: &VersionWrite) {
        match write.previous_context.as_deref() {
            None => self.bump_context(context_id, true),
            Some(previous) if previous != context_id => {
                self.bump_context(previous, false);
                self.bump_context(context_id, true);
            }
            Some(_) => {}
        }
        self.record_tags_added(&write.added_tags);
    }

    /// Keep counters in step with a deleted memory
    pub fn record_delete(&self, removed: &MemoryWithHistory) {
        self.bump_context(&removed.context, false);
    }

    /// Create unknown tags and count their first use on a memory
    pub fn record_tags_added<'t>(&self, tags: impl IntoIterator<Item = &'t String>) {
        for tag in tags {
            let counted = self
                .ensure_tag(tag)
                .and_then(|_| self.increment_tag_count(tag));
            if let Err(e) = counted {
                warn!(tag = tag.as_str(), error = %e, "Failed to update tag count");
            }
        }
    }

    fn bump_context(&self, context_id: &str, increment: bool) {
        if !self.context_exists(context_id) {
            debug!(context_id, "Context not registered; count not tracked");
            return;
        }
        let adjusted = if increment {
            self.increment_memory_count(context_id)
        } else {
            self.decrement_memory_count(context_id)
        };
        if let Err(e) = adjusted {
            warn!(context_id, error = %e, "Failed to update context count");
        }
    }

    /// Record activity for a known client; unknown clients are ignored
    pub fn touch_session(&self, client_id: &str) -> Result<()> {
        if !self.state.read().sessions.contains_key(client_id) {
            return Ok(());
        }
        self.commit(|state, conn| {
            if let Some(session) = state.sessions.get_mut(client_id) {
                session.last_activity = Utc::now();
                queries::upsert_session(conn, session)?;
            }
            Ok(())
        })
    }
}
