use crate::config::{AppConfig, Task};
use chrono::NaiveDate;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("failed to access config at {path:?}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to encode config: {0}")]
	Serialize(#[from] serde_json::Error),
	#[error("no task with id {0}")]
	NotFound(String),
}

/// Single owner of the persisted configuration. Every reader takes a snapshot
/// and every writer goes through the inner mutex, so UI edits and scheduler
/// fire-state updates cannot interleave into a torn write.
pub struct ConfigStore {
	path: PathBuf,
	inner: Mutex<AppConfig>,
}

impl ConfigStore {
	/// Open the store at `path`, falling back to an empty default config when
	/// the file is missing or unreadable. A corrupt file is left on disk
	/// untouched until the next successful save.
	pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
		let path = path.into();
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent).map_err(|source| StoreError::Io {
				path: parent.to_path_buf(),
				source,
			})?;
		}

		let config = load_or_default(&path);
		Ok(Self {
			path,
			inner: Mutex::new(config),
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Clone of the current config; readers never hold the lock across I/O.
	pub fn snapshot(&self) -> AppConfig {
		self.inner.lock().unwrap().clone()
	}

	/// Replace the whole config (the `update_config` boundary operation).
	pub fn replace(&self, new_config: AppConfig) -> Result<(), StoreError> {
		let mut guard = self.inner.lock().unwrap();
		*guard = new_config;
		self.persist(&guard)
	}

	pub fn get_task(&self, id: &str) -> Option<Task> {
		self.inner
			.lock()
			.unwrap()
			.tasks
			.iter()
			.find(|t| t.id == id)
			.cloned()
	}

	/// Insert or replace a task. An empty id gets a fresh one assigned.
	pub fn upsert_task(&self, mut task: Task) -> Result<Task, StoreError> {
		if task.id.is_empty() {
			task.id = uuid::Uuid::new_v4().to_string();
		}

		let mut guard = self.inner.lock().unwrap();
		match guard.tasks.iter_mut().find(|t| t.id == task.id) {
			Some(existing) => *existing = task.clone(),
			None => guard.tasks.push(task.clone()),
		}
		self.persist(&guard)?;
		Ok(task)
	}

	/// Update an existing task; unlike upsert, an unknown id is an error.
	pub fn update_task(&self, task: Task) -> Result<(), StoreError> {
		let mut guard = self.inner.lock().unwrap();
		let existing = guard
			.tasks
			.iter_mut()
			.find(|t| t.id == task.id)
			.ok_or_else(|| StoreError::NotFound(task.id.clone()))?;
		*existing = task;
		self.persist(&guard)
	}

	pub fn delete_task(&self, id: &str) -> Result<(), StoreError> {
		let mut guard = self.inner.lock().unwrap();
		let before = guard.tasks.len();
		guard.tasks.retain(|t| t.id != id);
		if guard.tasks.len() == before {
			return Err(StoreError::NotFound(id.to_string()));
		}
		self.persist(&guard)
	}

	/// Record that a task reached a definitive outcome today. A task deleted
	/// while its execution was in flight is silently skipped.
	pub fn mark_fired(&self, id: &str, date: NaiveDate) -> Result<(), StoreError> {
		let mut guard = self.inner.lock().unwrap();
		match guard.tasks.iter_mut().find(|t| t.id == id) {
			Some(task) => {
				task.last_fired = Some(date);
				self.persist(&guard)
			}
			None => {
				debug!(task_id = id, "task vanished before fire state update");
				Ok(())
			}
		}
	}

	/// Atomic save: write a sibling temp file, then rename over the target, so
	/// a concurrent load never observes a partially written document.
	fn persist(&self, config: &AppConfig) -> Result<(), StoreError> {
		let json = serde_json::to_string_pretty(config)?;
		let tmp = self.path.with_extension("json.tmp");
		fs::write(&tmp, &json).map_err(|source| StoreError::Io {
			path: tmp.clone(),
			source,
		})?;
		fs::rename(&tmp, &self.path).map_err(|source| StoreError::Io {
			path: self.path.clone(),
			source,
		})
	}
}

fn load_or_default(path: &Path) -> AppConfig {
	let content = match fs::read_to_string(path) {
		Ok(content) => content,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return AppConfig::default(),
		Err(e) => {
			warn!(path = %path.display(), error = %e, "config unreadable, starting from defaults");
			return AppConfig::default();
		}
	};

	match serde_json::from_str(&content) {
		Ok(config) => config,
		Err(e) => {
			warn!(path = %path.display(), error = %e, "config corrupt, starting from defaults");
			AppConfig::default()
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Location;
	use chrono::NaiveTime;
	use tempfile::TempDir;

	fn sample_task(name: &str) -> Task {
		Task {
			id: String::new(),
			name: name.to_string(),
			time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
			class_id: "40121".to_string(),
			cookie: "remember_token=abc".to_string(),
			location: Location {
				lat: "30.274085".to_string(),
				lng: "120.155070".to_string(),
				accuracy: 10.0,
			},
			enabled: true,
			last_fired: None,
		}
	}

	fn open_store(dir: &TempDir) -> ConfigStore {
		ConfigStore::open(dir.path().join("config.json")).unwrap()
	}

	#[test]
	fn test_open_missing_file_yields_default() {
		let dir = TempDir::new().unwrap();
		let store = open_store(&dir);
		assert!(store.snapshot().tasks.is_empty());
	}

	#[test]
	fn test_corrupt_file_falls_back_to_default() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("config.json");
		fs::write(&path, "{not json").unwrap();

		let store = ConfigStore::open(&path).unwrap();
		assert!(store.snapshot().tasks.is_empty());
		// The broken file is preserved until the next save.
		assert_eq!(fs::read_to_string(&path).unwrap(), "{not json");
	}

	#[test]
	fn test_upsert_assigns_id_and_persists() {
		let dir = TempDir::new().unwrap();
		let store = open_store(&dir);

		let task = store.upsert_task(sample_task("morning")).unwrap();
		assert!(!task.id.is_empty());

		// A fresh store sees the task after reopening from disk.
		let reopened = open_store(&dir);
		let loaded = reopened.get_task(&task.id).unwrap();
		assert_eq!(loaded.name, "morning");
		assert_eq!(loaded.location.lat, "30.274085");
	}

	#[test]
	fn test_upsert_replaces_existing() {
		let dir = TempDir::new().unwrap();
		let store = open_store(&dir);

		let mut task = store.upsert_task(sample_task("morning")).unwrap();
		task.name = "renamed".to_string();
		store.upsert_task(task.clone()).unwrap();

		assert_eq!(store.snapshot().tasks.len(), 1);
		assert_eq!(store.get_task(&task.id).unwrap().name, "renamed");
	}

	#[test]
	fn test_update_missing_task_is_error() {
		let dir = TempDir::new().unwrap();
		let store = open_store(&dir);

		let mut task = sample_task("ghost");
		task.id = "missing".to_string();
		assert!(matches!(
			store.update_task(task),
			Err(StoreError::NotFound(_))
		));
	}

	#[test]
	fn test_delete_task() {
		let dir = TempDir::new().unwrap();
		let store = open_store(&dir);

		let task = store.upsert_task(sample_task("morning")).unwrap();
		store.delete_task(&task.id).unwrap();
		assert!(store.get_task(&task.id).is_none());

		assert!(matches!(
			store.delete_task(&task.id),
			Err(StoreError::NotFound(_))
		));
	}

	#[test]
	fn test_mark_fired_sets_date() {
		let dir = TempDir::new().unwrap();
		let store = open_store(&dir);

		let task = store.upsert_task(sample_task("morning")).unwrap();
		let today = NaiveDate::from_ymd_opt(2025, 3, 14).unwrap();
		store.mark_fired(&task.id, today).unwrap();

		assert_eq!(store.get_task(&task.id).unwrap().last_fired, Some(today));

		// Marking a deleted task is a no-op, not an error.
		store.delete_task(&task.id).unwrap();
		store.mark_fired(&task.id, today).unwrap();
	}

	#[test]
	fn test_save_load_round_trip_is_idempotent() {
		let dir = TempDir::new().unwrap();
		let store = open_store(&dir);
		store.upsert_task(sample_task("morning")).unwrap();

		let first = fs::read_to_string(store.path()).unwrap();

		// Reload from disk and rewrite; the bytes must not change.
		let reopened = open_store(&dir);
		let snapshot = reopened.snapshot();
		reopened.replace(snapshot).unwrap();

		let second = fs::read_to_string(reopened.path()).unwrap();
		assert_eq!(first, second);
	}
}
