//! Identifier-keyed JSON store.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use stevedore_common::{StevedoreError, StevedoreResult};

use crate::atomic::write_atomic;
use crate::envelope::Envelope;

/// Crash-safe store for one entity kind.
///
/// All operations are serialized by an internal mutex which is held across
/// both the in-memory mutation and the write, so concurrent `set`/`update`
/// calls never lose each other's changes.
#[derive(Debug)]
pub struct JsonStore<T> {
    name: String,
    path: PathBuf,
    envelope: Mutex<Option<Envelope<T>>>,
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    /// Create a store backed by `path`. Nothing is read until
    /// [`initialize`](Self::initialize).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_stem()
            .map_or_else(|| "store".to_string(), |s| s.to_string_lossy().into_owned());
        Self {
            name,
            path,
            envelope: Mutex::new(None),
        }
    }

    /// Store name (the file stem).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether [`initialize`](Self::initialize) has run.
    pub fn is_initialized(&self) -> bool {
        self.envelope.lock().is_some()
    }

    /// Load the envelope from disk.
    ///
    /// A missing file, or one that fails to decode or carries the wrong
    /// schema version, is replaced with a fresh empty envelope. Decode
    /// failures are logged and the bad file is kept next to the original
    /// with a `.corrupt` suffix.
    ///
    /// # Errors
    ///
    /// Only I/O failures (unreadable file, failed write of the fresh
    /// envelope) are returned.
    pub fn initialize(&self) -> StevedoreResult<()> {
        let mut guard = self.envelope.lock();

        let loaded = match fs::read_to_string(&self.path) {
            Ok(content) => match decode::<T>(&content) {
                Ok(envelope) => Some(envelope),
                Err(reason) => {
                    let corrupt = StevedoreError::StorageCorrupt {
                        path: self.path.display().to_string(),
                        reason,
                    };
                    tracing::warn!(store = %self.name, error = %corrupt, "Resetting corrupt store");
                    self.quarantine();
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let envelope = match loaded {
            Some(envelope) => {
                tracing::debug!(
                    store = %self.name,
                    items = envelope.items.len(),
                    "Loaded store"
                );
                envelope
            }
            None => {
                let fresh = Envelope::empty();
                write(&self.path, &fresh)?;
                tracing::debug!(store = %self.name, path = %self.path.display(), "Created empty store");
                fresh
            }
        };

        *guard = Some(envelope);
        Ok(())
    }

    /// Get one record.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::NotInitialized`] before `initialize`.
    pub fn get(&self, id: &str) -> StevedoreResult<Option<T>> {
        self.read(|env| env.items.get(id).cloned())
    }

    /// Get all records.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::NotInitialized`] before `initialize`.
    pub fn get_all(&self) -> StevedoreResult<BTreeMap<String, T>> {
        self.read(|env| env.items.clone())
    }

    /// Whether a record exists.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::NotInitialized`] before `initialize`.
    pub fn has(&self, id: &str) -> StevedoreResult<bool> {
        self.read(|env| env.items.contains_key(id))
    }

    /// Insert or replace a record.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::NotInitialized`] or the write error.
    pub fn set(&self, id: &str, item: T) -> StevedoreResult<()> {
        self.mutate(|env| {
            env.items.insert(id.to_string(), item);
            Ok(())
        })
    }

    /// Shallow-merge a JSON object into an existing record.
    ///
    /// Not an upsert: a missing `id` fails and the store is unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::NotFound`] for a missing record and
    /// [`StevedoreError::Validation`] when `partial` is not an object or the
    /// merged record no longer decodes.
    pub fn update(&self, id: &str, partial: Value) -> StevedoreResult<T> {
        self.mutate(|env| {
            let current = env.items.get(id).ok_or_else(|| not_found(id))?;

            let Value::Object(patch) = partial else {
                return Err(StevedoreError::validation("update expects a JSON object"));
            };
            let mut merged = serde_json::to_value(current)?;
            let Value::Object(fields) = &mut merged else {
                return Err(StevedoreError::validation(
                    "stored record is not a JSON object",
                ));
            };
            fields.extend(patch);

            let updated: T = serde_json::from_value(merged)
                .map_err(|e| StevedoreError::validation(format!("invalid update for {id}: {e}")))?;
            env.items.insert(id.to_string(), updated.clone());
            Ok(updated)
        })
    }

    /// Apply a typed edit to an existing record.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::NotFound`] for a missing record.
    pub fn modify(&self, id: &str, edit: impl FnOnce(&mut T)) -> StevedoreResult<T> {
        self.mutate(|env| {
            let item = env.items.get_mut(id).ok_or_else(|| not_found(id))?;
            edit(item);
            Ok(item.clone())
        })
    }

    /// Remove a record, returning it if it existed.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::NotInitialized`] or the write error.
    pub fn delete(&self, id: &str) -> StevedoreResult<Option<T>> {
        self.mutate(|env| Ok(env.items.remove(id)))
    }

    /// Remove every record.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::NotInitialized`] or the write error.
    pub fn clear(&self) -> StevedoreResult<()> {
        self.mutate(|env| {
            env.items.clear();
            Ok(())
        })
    }

    /// Write the current envelope to disk.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::NotInitialized`] or the write error.
    pub fn save(&self) -> StevedoreResult<()> {
        let guard = self.envelope.lock();
        let envelope = guard.as_ref().ok_or_else(|| self.not_initialized())?;
        write(&self.path, envelope)
    }

    /// Snapshot the full envelope for backup.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::NotInitialized`] before `initialize`.
    pub fn export_data(&self) -> StevedoreResult<Envelope<T>> {
        self.read(Envelope::clone)
    }

    /// Replace the envelope with a snapshot and persist it immediately.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::Validation`] if the snapshot has the wrong
    /// shape or schema version; the current envelope is kept in that case.
    pub fn import_data(&self, data: Value) -> StevedoreResult<()> {
        let imported: Envelope<T> = serde_json::from_value(data)
            .map_err(|e| StevedoreError::validation(format!("invalid snapshot: {e}")))?;
        imported.check_version().map_err(StevedoreError::validation)?;

        let mut guard = self.envelope.lock();
        if guard.is_none() {
            return Err(self.not_initialized());
        }
        write(&self.path, &imported)?;
        tracing::info!(store = %self.name, items = imported.items.len(), "Imported snapshot");
        *guard = Some(imported);
        Ok(())
    }

    fn read<R>(&self, f: impl FnOnce(&Envelope<T>) -> R) -> StevedoreResult<R> {
        let guard = self.envelope.lock();
        let envelope = guard.as_ref().ok_or_else(|| self.not_initialized())?;
        Ok(f(envelope))
    }

    /// Run `f` against a scratch copy, persist it, then publish it.
    ///
    /// The in-memory envelope only changes once the write succeeded.
    fn mutate<R>(&self, f: impl FnOnce(&mut Envelope<T>) -> StevedoreResult<R>) -> StevedoreResult<R> {
        let mut guard = self.envelope.lock();
        let current = guard.as_ref().ok_or_else(|| self.not_initialized())?;

        let mut next = current.clone();
        let out = f(&mut next)?;
        next.last_updated = Utc::now();
        write(&self.path, &next)?;

        *guard = Some(next);
        Ok(out)
    }

    fn quarantine(&self) {
        let mut aside = self.path.clone().into_os_string();
        aside.push(".corrupt");
        if let Err(e) = fs::rename(&self.path, &aside) {
            tracing::warn!(store = %self.name, error = %e, "Failed to move corrupt store aside");
        }
    }

    fn not_initialized(&self) -> StevedoreError {
        StevedoreError::NotInitialized {
            store: self.name.clone(),
        }
    }
}

fn decode<T: DeserializeOwned>(content: &str) -> Result<Envelope<T>, String> {
    let envelope: Envelope<T> = serde_json::from_str(content).map_err(|e| e.to_string())?;
    envelope.check_version()?;
    Ok(envelope)
}

fn write<T: Serialize>(path: &Path, envelope: &Envelope<T>) -> StevedoreResult<()> {
    let json = serde_json::to_vec_pretty(envelope)?;
    write_atomic(path, &json)?;
    Ok(())
}

fn not_found(id: &str) -> StevedoreError {
    StevedoreError::NotFound {
        kind: "Record",
        id: id.to_string(),
    }
}
