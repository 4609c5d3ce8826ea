use crate::error::{DownloadError, Result};
use crate::models::{TaskRecord, TaskStatus};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Key-addressable storage for task records. One record per url.
pub trait TaskStore: Send + Sync {
    fn get_by_id(&self, id: u64) -> Result<Option<TaskRecord>>;
    fn get_by_url(&self, url: &str) -> Result<Option<TaskRecord>>;
    fn list_all(&self) -> Result<Vec<TaskRecord>>;
    /// Stores a new record and returns the id assigned to it.
    fn insert(&self, record: &TaskRecord) -> Result<u64>;
    /// Replaces the record with the same id. Unknown ids are ignored.
    fn update(&self, record: &TaskRecord) -> Result<()>;
    fn delete_by_id(&self, id: u64) -> Result<()>;
    fn delete_by_url(&self, url: &str) -> Result<()>;
    fn update_status(&self, status: TaskStatus, url: &str) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    next_id: u64,
    tasks: Vec<TaskRecord>,
}

/// JSON-file backed [`TaskStore`]. Every mutation rewrites the whole file.
pub struct StateManager {
    state_file: PathBuf,
    state: Mutex<StateFile>,
}

impl StateManager {
    pub fn open(state_file: impl AsRef<Path>) -> Result<Self> {
        let state_file = state_file.as_ref().to_path_buf();
        let state = Self::load_state(&state_file)?;
        debug!(
            "loaded {} task(s) from {}",
            state.tasks.len(),
            state_file.display()
        );

        Ok(Self {
            state_file,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.state_file
    }

    fn load_state(state_file: &Path) -> Result<StateFile> {
        if !state_file.exists() {
            return Ok(StateFile::default());
        }

        let content = fs::read_to_string(state_file)?;
        if content.trim().is_empty() {
            return Ok(StateFile::default());
        }

        Ok(serde_json::from_str(&content)?)
    }

    fn save_state(&self, state: &StateFile) -> Result<()> {
        if let Some(parent) = self.state_file.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let content = serde_json::to_string_pretty(state)?;
        fs::write(&self.state_file, content)?;

        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, StateFile> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mutate<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut StateFile) -> bool,
    {
        let mut state = self.lock();
        if f(&mut *state) {
            self.save_state(&state)?;
        }
        Ok(())
    }
}

impl TaskStore for StateManager {
    fn get_by_id(&self, id: u64) -> Result<Option<TaskRecord>> {
        Ok(self.lock().tasks.iter().find(|t| t.id == id).cloned())
    }

    fn get_by_url(&self, url: &str) -> Result<Option<TaskRecord>> {
        Ok(self.lock().tasks.iter().find(|t| t.url == url).cloned())
    }

    fn list_all(&self) -> Result<Vec<TaskRecord>> {
        Ok(self.lock().tasks.clone())
    }

    fn insert(&self, record: &TaskRecord) -> Result<u64> {
        let mut state = self.lock();
        if state.tasks.iter().any(|t| t.url == record.url) {
            return Err(DownloadError::Duplicate(record.url.clone()));
        }

        state.next_id = state.next_id.max(1);
        let id = state.next_id;
        state.next_id += 1;

        let mut record = record.clone();
        record.id = id;
        state.tasks.push(record);
        self.save_state(&state)?;

        Ok(id)
    }

    fn update(&self, record: &TaskRecord) -> Result<()> {
        self.mutate(|state| match state.tasks.iter_mut().find(|t| t.id == record.id) {
            Some(existing) => {
                *existing = record.clone();
                true
            }
            None => false,
        })
    }

    fn delete_by_id(&self, id: u64) -> Result<()> {
        self.mutate(|state| {
            let before = state.tasks.len();
            state.tasks.retain(|t| t.id != id);
            state.tasks.len() != before
        })
    }

    fn delete_by_url(&self, url: &str) -> Result<()> {
        self.mutate(|state| {
            let before = state.tasks.len();
            state.tasks.retain(|t| t.url != url);
            state.tasks.len() != before
        })
    }

    fn update_status(&self, status: TaskStatus, url: &str) -> Result<()> {
        self.mutate(|state| match state.tasks.iter_mut().find(|t| t.url == url) {
            Some(existing) => {
                existing.status = Some(status);
                true
            }
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(url: &str) -> TaskRecord {
        TaskRecord::new(url, "/tmp/out/file.bin", false)
    }

    #[test]
    fn missing_file_is_an_empty_store() {
        let dir = tempdir().unwrap();
        let store = StateManager::open(dir.path().join("state.json")).unwrap();
        assert!(store.list_all().unwrap().is_empty());
    }

    #[test]
    fn insert_assigns_increasing_ids_and_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let store = StateManager::open(&path).unwrap();
        let a = store.insert(&record("https://a.example/x")).unwrap();
        let b = store.insert(&record("https://b.example/x")).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);

        let reopened = StateManager::open(&path).unwrap();
        let found = reopened.get_by_url("https://b.example/x").unwrap().unwrap();
        assert_eq!(found.id, 2);
        assert_eq!(reopened.get_by_id(1).unwrap().unwrap().url, "https://a.example/x");

        // ids are never reused, even after a delete
        reopened.delete_by_id(2).unwrap();
        let c = reopened.insert(&record("https://c.example/x")).unwrap();
        assert_eq!(c, 3);
    }

    #[test]
    fn insert_rejects_second_record_for_same_url() {
        let dir = tempdir().unwrap();
        let store = StateManager::open(dir.path().join("state.json")).unwrap();
        store.insert(&record("https://a.example/x")).unwrap();

        let err = store.insert(&record("https://a.example/x")).unwrap_err();
        assert!(matches!(err, DownloadError::Duplicate(url) if url == "https://a.example/x"));
    }

    #[test]
    fn update_and_update_status_rewrite_matching_row() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateManager::open(&path).unwrap();
        let id = store.insert(&record("https://a.example/x")).unwrap();

        let mut rec = store.get_by_id(id).unwrap().unwrap();
        rec.total_size = 1000;
        rec.curr_size = 400;
        store.update(&rec).unwrap();
        store.update_status(TaskStatus::Paused, "https://a.example/x").unwrap();

        let reopened = StateManager::open(&path).unwrap();
        let rec = reopened.get_by_id(id).unwrap().unwrap();
        assert_eq!(rec.total_size, 1000);
        assert_eq!(rec.curr_size, 400);
        assert_eq!(rec.status, Some(TaskStatus::Paused));
    }

    #[test]
    fn delete_by_url_removes_only_that_record() {
        let dir = tempdir().unwrap();
        let store = StateManager::open(dir.path().join("state.json")).unwrap();
        store.insert(&record("https://a.example/x")).unwrap();
        store.insert(&record("https://b.example/x")).unwrap();

        store.delete_by_url("https://a.example/x").unwrap();
        store.delete_by_url("https://missing.example/x").unwrap();

        let all = store.list_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].url, "https://b.example/x");
    }

    #[test]
    fn corrupt_state_file_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            StateManager::open(&path),
            Err(DownloadError::State(_))
        ));
    }
}
