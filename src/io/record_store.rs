use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::model::task::TaskRecord;

/// Error type for persistent-store operations
#[derive(Debug, thiserror::Error)]
pub enum RecordStoreError {
    #[error("could not read {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not write {path}: {source}")]
    WriteError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("serialize error: {0}")]
    SerializeError(#[from] serde_json::Error),
}

/// Durable mirror of the task map plus a small key/value area for view
/// state and the offline queue.
///
/// Written only through the task store's mutation entry points; UI code
/// never touches it directly. Implementations must be safe to call with
/// ids that are absent (deletes of unknown ids succeed).
pub trait RecordStore {
    fn get_all(&self) -> Result<Vec<TaskRecord>, RecordStoreError>;
    fn get_task(&self, id: &str) -> Result<Option<TaskRecord>, RecordStoreError>;
    fn save_task(&mut self, record: &TaskRecord) -> Result<(), RecordStoreError>;
    fn save_tasks(&mut self, records: &[TaskRecord]) -> Result<(), RecordStoreError>;
    fn delete_task(&mut self, id: &str) -> Result<(), RecordStoreError>;
    fn get_state(&self, key: &str) -> Result<Option<serde_json::Value>, RecordStoreError>;
    fn set_state(&mut self, key: &str, value: serde_json::Value) -> Result<(), RecordStoreError>;
}

// ---------------------------------------------------------------------------
// JSON file store
// ---------------------------------------------------------------------------

/// File-backed store: `tasks.json` (id → record) and `state.json`
/// (key → value) under one directory. Writes are atomic
/// (write-temp-then-rename) so a crash mid-write never corrupts the cache.
pub struct JsonFileStore {
    dir: PathBuf,
    tasks: HashMap<String, TaskRecord>,
    state: HashMap<String, serde_json::Value>,
}

impl JsonFileStore {
    /// Open the store in `dir`, creating the directory if needed and
    /// loading any existing files. Unreadable or malformed files are
    /// treated as empty rather than fatal: the cache is a mirror, the
    /// server remains the source of truth.
    pub fn open(dir: &Path) -> Result<Self, RecordStoreError> {
        fs::create_dir_all(dir).map_err(|e| RecordStoreError::WriteError {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let tasks = read_json_map(&dir.join("tasks.json")).unwrap_or_default();
        let state = read_json_map(&dir.join("state.json")).unwrap_or_default();
        Ok(JsonFileStore {
            dir: dir.to_path_buf(),
            tasks,
            state,
        })
    }

    fn flush_tasks(&self) -> Result<(), RecordStoreError> {
        write_json_atomic(&self.dir, "tasks.json", &self.tasks)
    }

    fn flush_state(&self) -> Result<(), RecordStoreError> {
        write_json_atomic(&self.dir, "state.json", &self.state)
    }
}

impl RecordStore for JsonFileStore {
    fn get_all(&self) -> Result<Vec<TaskRecord>, RecordStoreError> {
        Ok(self.tasks.values().cloned().collect())
    }

    fn get_task(&self, id: &str) -> Result<Option<TaskRecord>, RecordStoreError> {
        Ok(self.tasks.get(id).cloned())
    }

    fn save_task(&mut self, record: &TaskRecord) -> Result<(), RecordStoreError> {
        self.tasks.insert(record.id.clone(), record.clone());
        self.flush_tasks()
    }

    fn save_tasks(&mut self, records: &[TaskRecord]) -> Result<(), RecordStoreError> {
        for record in records {
            self.tasks.insert(record.id.clone(), record.clone());
        }
        self.flush_tasks()
    }

    fn delete_task(&mut self, id: &str) -> Result<(), RecordStoreError> {
        if self.tasks.remove(id).is_some() {
            self.flush_tasks()?;
        }
        Ok(())
    }

    fn get_state(&self, key: &str) -> Result<Option<serde_json::Value>, RecordStoreError> {
        Ok(self.state.get(key).cloned())
    }

    fn set_state(&mut self, key: &str, value: serde_json::Value) -> Result<(), RecordStoreError> {
        self.state.insert(key.to_string(), value);
        self.flush_state()
    }
}

fn read_json_map<T: serde::de::DeserializeOwned>(path: &Path) -> Option<HashMap<String, T>> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

fn write_json_atomic<T: serde::Serialize>(
    dir: &Path,
    name: &str,
    value: &T,
) -> Result<(), RecordStoreError> {
    let path = dir.join(name);
    let content = serde_json::to_string_pretty(value)?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| RecordStoreError::WriteError {
        path: path.clone(),
        source: e,
    })?;
    tmp.write_all(content.as_bytes())
        .map_err(|e| RecordStoreError::WriteError {
            path: path.clone(),
            source: e,
        })?;
    tmp.persist(&path).map_err(|e| RecordStoreError::WriteError {
        path,
        source: e.error,
    })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Volatile implementation for tests and for environments without durable
/// storage. Same contract as [`JsonFileStore`], nothing hits disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tasks: HashMap<String, TaskRecord>,
    state: HashMap<String, serde_json::Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Pre-seed with records, as if a previous session had written them.
    pub fn seeded(records: Vec<TaskRecord>) -> Self {
        let mut store = MemoryStore::new();
        for record in records {
            store.tasks.insert(record.id.clone(), record);
        }
        store
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

impl RecordStore for MemoryStore {
    fn get_all(&self) -> Result<Vec<TaskRecord>, RecordStoreError> {
        Ok(self.tasks.values().cloned().collect())
    }

    fn get_task(&self, id: &str) -> Result<Option<TaskRecord>, RecordStoreError> {
        Ok(self.tasks.get(id).cloned())
    }

    fn save_task(&mut self, record: &TaskRecord) -> Result<(), RecordStoreError> {
        self.tasks.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn save_tasks(&mut self, records: &[TaskRecord]) -> Result<(), RecordStoreError> {
        for record in records {
            self.tasks.insert(record.id.clone(), record.clone());
        }
        Ok(())
    }

    fn delete_task(&mut self, id: &str) -> Result<(), RecordStoreError> {
        self.tasks.remove(id);
        Ok(())
    }

    fn get_state(&self, key: &str) -> Result<Option<serde_json::Value>, RecordStoreError> {
        Ok(self.state.get(key).cloned())
    }

    fn set_state(&mut self, key: &str, value: serde_json::Value) -> Result<(), RecordStoreError> {
        self.state.insert(key.to_string(), value);
        Ok(())
    }
}
