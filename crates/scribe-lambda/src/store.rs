//! Content-addressed object store backing the summary writer.
//!
//! Summaries are written under their content hash, so writes use a
//! does-not-exist precondition and duplicate delivery is a no-op. The
//! production backend is a git-like object store; the in-memory backend
//! here exists for tests.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Error, Result};

/// Precondition for conditional writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Write only if the object does not exist.
    DoesNotExist,
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
///
/// A failed precondition is a normal result, never an error: for
/// content-addressed keys it means an identical object is already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    /// The object was written.
    Success,
    /// The object already existed and the precondition held the write back.
    AlreadyExists,
}

/// Object store holding summary trees, keyed by handle.
#[async_trait]
pub trait SummaryStore: Send + Sync + 'static {
    /// Reads an object.
    ///
    /// # Errors
    ///
    /// Returns a transient storage error if the object is missing or the
    /// backend is unavailable.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Writes an object with an optional precondition.
    ///
    /// # Errors
    ///
    /// Returns a transient storage error if the backend is unavailable.
    /// A failed precondition is reported through [`WriteResult`], not as
    /// an error.
    async fn put(&self, key: &str, data: Bytes, precondition: WritePrecondition)
    -> Result<WriteResult>;

    /// Returns true if an object exists.
    ///
    /// # Errors
    ///
    /// Returns a transient storage error if the backend is unavailable.
    async fn exists(&self, key: &str) -> Result<bool>;
}

/// In-memory summary store for testing.
///
/// Thread-safe via `RwLock`. Not suitable for production.
#[derive(Debug, Default)]
pub struct MemorySummaryStore {
    objects: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl MemorySummaryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().expect("store lock poisoned").len()
    }

    /// Returns true if the store holds no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SummaryStore for MemorySummaryStore {
    async fn get(&self, key: &str) -> Result<Bytes> {
        let objects = self
            .objects
            .read()
            .map_err(|_| Error::transient("summary store lock poisoned"))?;
        objects
            .get(key)
            .cloned()
            .ok_or_else(|| Error::transient(format!("summary object not found: {key}")))
    }

    async fn put(
        &self,
        key: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self
            .objects
            .write()
            .map_err(|_| Error::transient("summary store lock poisoned"))?;

        if precondition == WritePrecondition::DoesNotExist && objects.contains_key(key) {
            return Ok(WriteResult::AlreadyExists);
        }
        objects.insert(key.to_string(), data);
        Ok(WriteResult::Success)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let objects = self
            .objects
            .read()
            .map_err(|_| Error::transient("summary store lock poisoned"))?;
        Ok(objects.contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = MemorySummaryStore::new();
        let data = Bytes::from("summary tree");

        let result = store
            .put("abc123", data.clone(), WritePrecondition::None)
            .await
            .expect("put");
        assert_eq!(result, WriteResult::Success);
        assert_eq!(store.get("abc123").await.expect("get"), data);
    }

    #[tokio::test]
    async fn does_not_exist_precondition_keeps_the_original() {
        let store = MemorySummaryStore::new();
        store
            .put("h", Bytes::from("first"), WritePrecondition::DoesNotExist)
            .await
            .expect("first put");

        let result = store
            .put("h", Bytes::from("second"), WritePrecondition::DoesNotExist)
            .await
            .expect("second put");
        assert_eq!(result, WriteResult::AlreadyExists);
        assert_eq!(store.get("h").await.expect("get"), Bytes::from("first"));
    }

    #[tokio::test]
    async fn missing_object_is_a_transient_error() {
        let store = MemorySummaryStore::new();
        assert!(!store.exists("ghost").await.expect("exists"));
        assert!(store.get("ghost").await.is_err());
    }
}
