//! JSON-file key-value store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{KeyValueStore, ValueCipher};
use crate::error::{Error, ErrorKind, StorageErrorKind};

/// Stores all entries in one JSON object on disk.
///
/// Writes go to a sibling temp file that is then renamed over the original, so a
/// crash mid-write leaves the previous contents intact. With a cipher, each value
/// is encrypted individually and keys stay readable.
///
/// Unreadable contents are treated as absent: a file that does not parse is moved
/// aside to `<name>.corrupt`, and a value that does not decrypt is dropped.
pub struct FileStore {
    path: PathBuf,
    cipher: Option<ValueCipher>,
    entries: Mutex<Option<BTreeMap<String, String>>>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cipher: None,
            entries: Mutex::new(None),
        }
    }

    pub fn with_cipher(mut self, cipher: ValueCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, String>, Error> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        let stored: BTreeMap<String, String> = match serde_json::from_str(&raw) {
            Ok(stored) => stored,
            Err(e) => {
                let aside = self.path.with_extension("corrupt");
                warn!(
                    "Store {} is unreadable ({}), moving it to {} and starting empty",
                    self.path.display(),
                    e,
                    aside.display()
                );
                tokio::fs::rename(&self.path, &aside).await?;
                return Ok(BTreeMap::new());
            }
        };
        let Some(cipher) = &self.cipher else {
            return Ok(stored);
        };
        Ok(stored
            .into_iter()
            .filter_map(|(key, value)| match cipher.decrypt(&value) {
                Ok(plain) => Some((key, plain)),
                Err(e) => {
                    warn!("Dropping entry {} that no longer decrypts: {}", key, e);
                    None
                }
            })
            .collect())
    }

    async fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), Error> {
        let on_disk: BTreeMap<&str, String> = match &self.cipher {
            Some(cipher) => entries
                .iter()
                .map(|(key, value)| cipher.encrypt(value).map(|sealed| (key.as_str(), sealed)))
                .collect::<Result<_, _>>()?,
            None => entries
                .iter()
                .map(|(key, value)| (key.as_str(), value.clone()))
                .collect(),
        };
        let json = serde_json::to_string_pretty(&on_disk).map_err(|e| Error {
            source: Some(Box::new(e)),
            error_kind: ErrorKind::Storage(StorageErrorKind::Serialization),
        })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = self.path.with_extension("tmp");
        tokio::fs::write(&temp, json).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        debug!("Persisted {} entries to {}", entries.len(), self.path.display());
        Ok(())
    }

    /// Run `f` against the loaded entries, persisting afterwards when it reports a change.
    async fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, String>) -> (T, bool),
    ) -> Result<T, Error> {
        let mut guard = self.entries.lock().await;
        if guard.is_none() {
            *guard = Some(self.load().await?);
        }
        let entries = guard.get_or_insert_with(BTreeMap::new);
        let (result, changed) = f(entries);
        if changed {
            self.persist(entries).await?;
        }
        Ok(result)
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        self.with_entries(|entries| (entries.get(key).cloned(), false))
            .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.with_entries(|entries| {
            let previous = entries.insert(key.to_string(), value.to_string());
            ((), previous.as_deref() != Some(value))
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<(), Error> {
        self.with_entries(|entries| ((), entries.remove(key).is_some()))
            .await
    }

    async fn keys(&self) -> Result<Vec<String>, Error> {
        self.with_entries(|entries| (entries.keys().cloned().collect(), false))
            .await
    }
}
