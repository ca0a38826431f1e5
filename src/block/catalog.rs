//! File Catalog
//!
//! Persistent registry of on-disk generations, keyed by (store, generation).
//! The whole catalog is small (one record per live generation), so it is
//! rewritten and fsynced on every change: write to a temp file, fsync, rename
//! over the old catalog. A crash can therefore only ever observe the previous
//! or the next complete catalog, never a torn one.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{Result, StrataError};

use super::{CatalogEntry, CatalogKind};

/// Persistent (store, generation) → CatalogEntry registry
pub struct Catalog {
    path: PathBuf,
    entries: RwLock<HashMap<(Uuid, u64), CatalogEntry>>,
}

impl Catalog {
    /// Open or create the catalog file at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let entries = if path.exists() {
            let data = fs::read(path)?;
            let list: Vec<CatalogEntry> = bincode::deserialize(&data)
                .map_err(|e| StrataError::Catalog(format!("unreadable catalog: {}", e)))?;
            list.into_iter()
                .map(|e| ((e.store, e.generation), e))
                .collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            entries: RwLock::new(entries),
        })
    }

    /// Insert an entry; durable before return
    pub fn insert(&self, entry: CatalogEntry) -> Result<()> {
        let mut entries = self.entries.write();
        if entries
            .insert((entry.store, entry.generation), entry.clone())
            .is_some()
        {
            return Err(StrataError::Catalog(format!(
                "generation {} of store {} registered twice",
                entry.generation, entry.store
            )));
        }
        self.persist(&entries)
    }

    /// Remove an entry; durable before return
    pub fn remove(&self, store: Uuid, generation: u64) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.remove(&(store, generation)).is_none() {
            return Err(StrataError::GenerationNotFound(generation));
        }
        self.persist(&entries)
    }

    /// Look up one generation
    pub fn find(&self, store: Uuid, generation: u64) -> Result<CatalogEntry> {
        self.entries
            .read()
            .get(&(store, generation))
            .cloned()
            .ok_or(StrataError::GenerationNotFound(generation))
    }

    /// All generations of one kind for a store, ascending by generation id
    pub fn list(&self, store: Uuid, kind: CatalogKind) -> Result<Vec<CatalogEntry>> {
        let entries = self.entries.read();
        let mut list: Vec<CatalogEntry> = entries
            .values()
            .filter(|e| e.store == store && e.kind == kind)
            .cloned()
            .collect();
        list.sort_by_key(|e| e.generation);
        Ok(list)
    }

    /// Rewrite the catalog file: temp + fsync + rename
    fn persist(&self, entries: &HashMap<(Uuid, u64), CatalogEntry>) -> Result<()> {
        let list: Vec<&CatalogEntry> = entries.values().collect();
        let data = bincode::serialize(&list)
            .map_err(|e| StrataError::Serialization(e.to_string()))?;

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            tmp.write_all(&data)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        // Rename durability requires the directory entry itself be synced
        if let Some(dir) = self.path.parent() {
            File::open(dir)?.sync_all()?;
        }
        Ok(())
    }
}
