//! JSON document store
//!
//! Every persistent document (outbounds, subscriptions, services,
//! devices, groups, settings) is one JSON file, rewritten whole on
//! every change. Writes go through a temp file in the same directory
//! followed by a rename, so a crash never leaves a half-written file.

use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{AppError, Result};

/// One on-disk JSON document. The mutex serializes read-modify-write
/// cycles per document; concurrent edits to different documents never
/// contend.
pub struct JsonStore<T> {
    path: PathBuf,
    lock: Mutex<()>,
    _marker: PhantomData<T>,
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> JsonStore<T> {
        JsonStore {
            path: path.into(),
            lock: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document, producing the default value when the file
    /// does not exist yet.
    pub fn load(&self) -> Result<T> {
        let _guard = self.lock.lock().map_err(poisoned)?;
        self.load_unlocked()
    }

    /// Overwrite the document.
    pub fn save(&self, value: &T) -> Result<()> {
        let _guard = self.lock.lock().map_err(poisoned)?;
        self.save_unlocked(value)
    }

    /// Read-modify-write under the document lock. The closure's return
    /// value is passed through.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        let _guard = self.lock.lock().map_err(poisoned)?;
        let mut value = self.load_unlocked()?;
        let out = f(&mut value)?;
        self.save_unlocked(&value)?;
        Ok(out)
    }

    fn load_unlocked(&self) -> Result<T> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} missing, using defaults", self.path.display());
                Ok(T::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn save_unlocked(&self, value: &T) -> Result<()> {
        let raw = serde_json::to_string_pretty(value)?;
        write_atomic(&self.path, &raw)
    }
}

/// Write `content` to `path` via temp file plus rename. The temp file
/// lives in the destination directory so the rename stays on one
/// filesystem.
pub fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| AppError::Store(format!("{} has no parent dir", path.display())))?;
    fs::create_dir_all(dir)?;

    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("document")
    ));
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Copy the current file aside before an overwrite, if it exists.
pub fn backup_existing(path: &Path) -> Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }
    let backup = path.with_extension("bak");
    fs::copy(path, &backup)?;
    Ok(Some(backup))
}

fn poisoned<G>(_: std::sync::PoisonError<G>) -> AppError {
    AppError::Store("document lock poisoned".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Doc {
        items: Vec<String>,
    }

    #[test]
    fn missing_file_yields_default() {
        let dir = tempdir().unwrap();
        let store: JsonStore<Doc> = JsonStore::new(dir.path().join("doc.json"));
        assert_eq!(store.load().unwrap(), Doc::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store: JsonStore<Doc> = JsonStore::new(dir.path().join("doc.json"));
        let doc = Doc {
            items: vec!["a".to_string(), "b".to_string()],
        };
        store.save(&doc).unwrap();
        assert_eq!(store.load().unwrap(), doc);
    }

    #[test]
    fn update_applies_mutation() {
        let dir = tempdir().unwrap();
        let store: JsonStore<Doc> = JsonStore::new(dir.path().join("doc.json"));
        store
            .update(|doc| {
                doc.items.push("x".to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(store.load().unwrap().items, vec!["x"]);
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        write_atomic(&path, "{}").unwrap();
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec!["doc.json"]);
    }

    #[test]
    fn backup_copies_previous_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        write_atomic(&path, "old").unwrap();
        let backup = backup_existing(&path).unwrap().unwrap();
        write_atomic(&path, "new").unwrap();
        assert_eq!(fs::read_to_string(backup).unwrap(), "old");
    }
}
