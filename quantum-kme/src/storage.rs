//! Storage backends: where key entries live.
//!
//! Each entry sits behind its own mutex. The map lock is only held long enough
//! to look up, insert or remove a slot, so updates to different keys never
//! contend with each other, and two updates to the same key are serialised.

use crate::error::KmeError;
use crate::types::{KeyEntry, KeyId};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

// ---------------------------------------------------------------------------
// Storage trait
// ---------------------------------------------------------------------------

/// Mutation applied to a single entry under its lock.
///
/// Returning an error aborts the update and leaves the stored entry untouched.
pub type EntryUpdate<'a> = &'a mut dyn FnMut(&mut KeyEntry) -> Result<(), KmeError>;

/// Backend for key entries.
///
/// Implement this for your infrastructure:
/// - InMemoryBackend (testing, single process)
/// - FileBackend (development)
/// - Your database (production, one transaction per `update`)
pub trait StorageBackend: Send + Sync {
    fn insert(&self, entry: KeyEntry) -> Result<(), KmeError>;
    fn get(&self, id: &KeyId) -> Result<Option<KeyEntry>, KmeError>;
    /// Atomically read-modify-write one entry. `Ok(None)` if it does not exist.
    fn update(&self, id: &KeyId, f: EntryUpdate<'_>) -> Result<Option<KeyEntry>, KmeError>;
    fn remove(&self, id: &KeyId) -> Result<(), KmeError>;
    fn list(&self) -> Result<Vec<KeyEntry>, KmeError>;
}

// ---------------------------------------------------------------------------
// Slot map shared by both backends
// ---------------------------------------------------------------------------

type Slot = Arc<Mutex<Option<KeyEntry>>>;

fn poisoned<T>(_: T) -> KmeError {
    KmeError::StorageError("lock poisoned".into())
}

#[derive(Default)]
struct SlotMap {
    slots: RwLock<HashMap<String, Slot>>,
}

impl SlotMap {
    fn slot(&self, id: &KeyId) -> Result<Option<Slot>, KmeError> {
        let slots = self.slots.read().map_err(poisoned)?;
        Ok(slots.get(id.as_str()).cloned())
    }

    fn insert(&self, entry: KeyEntry) -> Result<(), KmeError> {
        let mut slots = self.slots.write().map_err(poisoned)?;
        if slots.contains_key(entry.id.as_str()) {
            return Err(KmeError::StorageError(format!("duplicate key id: {}", entry.id)));
        }
        slots.insert(entry.id.as_str().to_string(), Arc::new(Mutex::new(Some(entry))));
        Ok(())
    }

    fn get(&self, id: &KeyId) -> Result<Option<KeyEntry>, KmeError> {
        match self.slot(id)? {
            Some(slot) => Ok(slot.lock().map_err(poisoned)?.clone()),
            None => Ok(None),
        }
    }

    fn update(
        &self,
        id: &KeyId,
        f: EntryUpdate<'_>,
        persist: &dyn Fn(&KeyEntry) -> Result<(), KmeError>,
    ) -> Result<Option<KeyEntry>, KmeError> {
        let Some(slot) = self.slot(id)? else {
            return Ok(None);
        };
        let mut guard = slot.lock().map_err(poisoned)?;
        let Some(current) = guard.as_ref() else {
            // Removed while we waited for the lock.
            return Ok(None);
        };

        let mut next = current.clone();
        f(&mut next)?;
        persist(&next)?;
        *guard = Some(next.clone());
        Ok(Some(next))
    }

    /// Detach the slot from the map, then empty it under its own lock so a
    /// waiting updater observes the removal.
    fn remove(&self, id: &KeyId) -> Result<bool, KmeError> {
        let slot = self.slots.write().map_err(poisoned)?.remove(id.as_str());
        match slot {
            Some(slot) => {
                *slot.lock().map_err(poisoned)? = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn list(&self) -> Result<Vec<KeyEntry>, KmeError> {
        let slots: Vec<Slot> = self.slots.read().map_err(poisoned)?.values().cloned().collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(entry) = slot.lock().map_err(poisoned)?.as_ref() {
                out.push(entry.clone());
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// In-memory storage (for testing and ephemeral use).
#[derive(Default)]
pub struct InMemoryBackend {
    map: SlotMap,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for InMemoryBackend {
    fn insert(&self, entry: KeyEntry) -> Result<(), KmeError> {
        self.map.insert(entry)
    }

    fn get(&self, id: &KeyId) -> Result<Option<KeyEntry>, KmeError> {
        self.map.get(id)
    }

    fn update(&self, id: &KeyId, f: EntryUpdate<'_>) -> Result<Option<KeyEntry>, KmeError> {
        self.map.update(id, f, &|_| Ok(()))
    }

    fn remove(&self, id: &KeyId) -> Result<(), KmeError> {
        self.map.remove(id).map(|_| ())
    }

    fn list(&self) -> Result<Vec<KeyEntry>, KmeError> {
        self.map.list()
    }
}

// ---------------------------------------------------------------------------
// File backend
// ---------------------------------------------------------------------------

/// File-based storage (one JSON file per key, written through on every change).
///
/// Directory layout:
/// ```text
/// keys/
///   {key_id}.json
/// ```
pub struct FileBackend {
    dir: PathBuf,
    map: SlotMap,
}

impl FileBackend {
    /// Open (or create) a key directory, loading every entry already in it.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, KmeError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| KmeError::StorageError(format!("create dir: {}", e)))?;

        let map = SlotMap::default();
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| KmeError::StorageError(format!("readdir: {}", e)))?;
        let mut loaded = 0usize;
        for entry in entries {
            let entry = entry.map_err(|e| KmeError::StorageError(format!("entry: {}", e)))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                map.insert(read_key_file(&path)?)?;
                loaded += 1;
            }
        }
        tracing::debug!(dir = %dir.display(), loaded, "opened file key store");

        Ok(Self { dir, map })
    }

    fn key_path(&self, id: &KeyId) -> PathBuf {
        self.dir.join(format!("{}.json", id.as_str()))
    }

    fn write_key_file(&self, entry: &KeyEntry) -> Result<(), KmeError> {
        let path = self.key_path(&entry.id);
        let json = serde_json::to_string_pretty(entry)?;
        // Atomic write: write to temp, then rename
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &json)
            .map_err(|e| KmeError::StorageError(format!("write: {}", e)))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| KmeError::StorageError(format!("rename: {}", e)))?;
        Ok(())
    }
}

fn read_key_file(path: &Path) -> Result<KeyEntry, KmeError> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| KmeError::StorageError(format!("read: {}", e)))?;
    Ok(serde_json::from_str(&data)?)
}

impl StorageBackend for FileBackend {
    fn insert(&self, entry: KeyEntry) -> Result<(), KmeError> {
        self.write_key_file(&entry)?;
        self.map.insert(entry)
    }

    fn get(&self, id: &KeyId) -> Result<Option<KeyEntry>, KmeError> {
        self.map.get(id)
    }

    fn update(&self, id: &KeyId, f: EntryUpdate<'_>) -> Result<Option<KeyEntry>, KmeError> {
        self.map.update(id, f, &|next| self.write_key_file(next))
    }

    fn remove(&self, id: &KeyId) -> Result<(), KmeError> {
        self.map.remove(id)?;
        let path = self.key_path(id);
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| KmeError::StorageError(format!("delete: {}", e)))?;
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<KeyEntry>, KmeError> {
        self.map.list()
    }
}
