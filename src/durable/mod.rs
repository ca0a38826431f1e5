//! Durable Object Store Module
//!
//! A parallel, independently-generationed store for small serialized blobs,
//! using the same SortedFile mechanics as the primary store but cataloged
//! under its own kind. Objects are saved whole and loaded by id; versioning,
//! tombstones, and compaction behave exactly as in the primary store.

use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use crate::block::{BlockStore, CatalogKind};
use crate::config::Config;
use crate::error::Result;
use crate::memlayer::Update;
use crate::repo::RepoManager;

/// Store of durable serialized objects
pub struct DurableManager {
    repo: RepoManager,
}

impl DurableManager {
    /// Open the durable-object store over a shared block store. It can share
    /// the BlockStore (and its catalog) with a primary store as long as the
    /// two use distinct store ids.
    pub fn open(config: Config, store: Arc<dyn BlockStore>, store_id: Uuid) -> Result<Self> {
        let repo = RepoManager::open_with_store(config, store, store_id, CatalogKind::DurableFile)?;
        Ok(Self { repo })
    }

    /// Durably save an object. `deadline` and `ttl` combine into the release
    /// deadline: the version stays physically retained until the release
    /// watermark passes `deadline + ttl`.
    pub fn save(&self, id: Uuid, deadline: u64, ttl: u64, serialized_form: Bytes) -> Result<()> {
        self.repo
            .apply(Update::put(id, deadline.saturating_add(ttl), serialized_form))?;
        Ok(())
    }

    /// Remove an object (tombstone write)
    pub fn remove(&self, id: Uuid, deadline: u64) -> Result<()> {
        self.repo.apply(Update::delete(id, deadline))?;
        Ok(())
    }

    /// Newest serialized form of `id`, or None if absent or deleted
    pub fn try_load(&self, id: Uuid) -> Result<Option<Bytes>> {
        self.repo.new_view().load(&id)
    }

    /// Whether `id` currently resolves to a live object
    pub fn can_load(&self, id: Uuid) -> Result<bool> {
        Ok(self.try_load(id)?.is_some())
    }

    /// Set the watermark below which superseded object versions may be
    /// dropped by compaction
    pub fn set_release_watermark(&self, seq: u64) {
        self.repo.set_release_watermark(seq);
    }

    /// Access the underlying repo (explicit compaction stepping, views)
    pub fn repo(&self) -> &RepoManager {
        &self.repo
    }

    /// Stop background tasks, letting in-flight work complete
    pub fn shutdown(&mut self) {
        self.repo.shutdown();
    }
}
