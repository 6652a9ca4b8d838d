use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;

/// Durable client-local key-value storage.
pub trait KeyValueStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
    fn remove(&self, key: &str) -> anyhow::Result<()>;
}

/// One file per key under `root`, named `<key>.json`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        let file: String = key
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                    ch
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(format!("{file}.json"))
    }
}

impl KeyValueStorage for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        std::fs::read_to_string(self.path_for(key)).ok()
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        // Staged write; the rename swaps the whole blob in one step.
        let staging = path.with_extension("json.tmp");
        std::fs::write(&staging, value)
            .with_context(|| format!("failed to write {}", staging.display()))?;
        std::fs::rename(&staging, &path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.entries
            .lock()
            .map_err(|_| anyhow::anyhow!("memory storage lock poisoned"))?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.entries
            .lock()
            .map_err(|_| anyhow::anyhow!("memory storage lock poisoned"))?
            .remove(key);
        Ok(())
    }
}

impl<T: KeyValueStorage + ?Sized> KeyValueStorage for std::sync::Arc<T> {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        (**self).remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::{FileStorage, KeyValueStorage, MemoryStorage};

    #[test]
    fn file_storage_round_trips_and_removes() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let storage = FileStorage::new(temp.path().join("nested").join("data"));
        assert_eq!(storage.get("vibepaper_history"), None);

        storage.set("vibepaper_history", "[1,2,3]")?;
        assert_eq!(storage.get("vibepaper_history").as_deref(), Some("[1,2,3]"));
        assert!(storage.path_for("vibepaper_history").ends_with("vibepaper_history.json"));

        storage.set("vibepaper_history", "[]")?;
        assert_eq!(storage.get("vibepaper_history").as_deref(), Some("[]"));

        storage.remove("vibepaper_history")?;
        assert_eq!(storage.get("vibepaper_history"), None);
        storage.remove("vibepaper_history")?;
        Ok(())
    }

    #[test]
    fn file_storage_sanitizes_keys() {
        let storage = FileStorage::new("/tmp/x");
        assert!(storage.path_for("../etc/passwd").ends_with("___etc_passwd.json"));
    }

    #[test]
    fn memory_storage_is_shared_through_arc() -> anyhow::Result<()> {
        let storage = std::sync::Arc::new(MemoryStorage::new());
        let handle = storage.clone();
        handle.set("k", "v")?;
        assert_eq!(storage.get("k").as_deref(), Some("v"));
        storage.remove("k")?;
        assert_eq!(handle.get("k"), None);
        Ok(())
    }
}
