//! The remote store contract and an in-memory implementation.
//!
//! The engine reaches the network only through [`RemoteStore`]. Writes carry
//! the version the client believes the remote holds; a remote that has moved
//! on answers with [`RemoteError::Precondition`] instead of overwriting.

use crate::{
    clock::Clock,
    record::{RemoteRecord, RemoteWrite},
    Error, RecordId, TableName, Timestamp, Version,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Errors a remote store can report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The remote holds a different version than the write expected
    #[error("version mismatch: expected {expected:?}, found {actual:?}")]
    Precondition {
        expected: Option<Version>,
        actual: Option<Version>,
    },

    /// Network or backend trouble; retry later
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    /// The remote refused this write; retrying the same write will not help
    #[error("remote rejected write: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn is_precondition(&self) -> bool {
        matches!(self, RemoteError::Precondition { .. })
    }
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Precondition { expected, actual } => Error::Precondition { expected, actual },
            other => Error::Remote(other.to_string()),
        }
    }
}

/// Remote relational backend as seen by the sync engine.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch one record, tombstones included.
    async fn fetch(&self, table: &str, id: &str) -> Result<Option<RemoteRecord>, RemoteError>;

    /// Records whose `updated_at` is strictly greater than `watermark`,
    /// ordered by `updated_at`.
    async fn fetch_changed_since(
        &self,
        table: &str,
        watermark: Timestamp,
    ) -> Result<Vec<RemoteRecord>, RemoteError>;

    /// Write a record if the remote still holds `write.expected_version`.
    async fn upsert(&self, table: &str, write: RemoteWrite) -> Result<RemoteRecord, RemoteError>;

    /// Delete a record. Deleting an absent record succeeds.
    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<(TableName, RecordId), RemoteRecord>,
    last_updated_at: Timestamp,
}

/// A remote store held in memory, for tests and local demos.
///
/// Update times are taken from the injected clock and forced to be strictly
/// increasing, so watermark pulls behave like a real change feed.
#[derive(Debug)]
pub struct MemoryRemote {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
    offline: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryRemote {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            clock,
            offline: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }

    /// Make every call fail with [`RemoteError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Accepted upserts and deletes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Current record, tombstones included.
    pub fn get(&self, table: &str, id: &str) -> Option<RemoteRecord> {
        self.lock()
            .ok()?
            .records
            .get(&(table.to_string(), id.to_string()))
            .cloned()
    }

    /// Write as another client would, bypassing preconditions.
    pub fn seed(&self, table: &str, id: &str, payload: serde_json::Value) -> Result<RemoteRecord, RemoteError> {
        let mut state = self.lock()?;
        let version = state
            .records
            .get(&(table.to_string(), id.to_string()))
            .map_or(1, |r| r.version + 1);
        Ok(self.store(&mut state, table, id, payload, version, false))
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, RemoteError> {
        self.state
            .lock()
            .map_err(|_| RemoteError::Unavailable("remote state poisoned".into()))
    }

    fn check_online(&self) -> Result<(), RemoteError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("offline".into()));
        }
        Ok(())
    }

    fn store(
        &self,
        state: &mut MemoryState,
        table: &str,
        id: &str,
        payload: serde_json::Value,
        version: Version,
        deleted: bool,
    ) -> RemoteRecord {
        let updated_at = self.clock.now_ms().max(state.last_updated_at + 1);
        state.last_updated_at = updated_at;
        let record = RemoteRecord {
            table: table.to_string(),
            id: id.to_string(),
            payload,
            version,
            updated_at,
            deleted,
        };
        state
            .records
            .insert((table.to_string(), id.to_string()), record.clone());
        record
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn fetch(&self, table: &str, id: &str) -> Result<Option<RemoteRecord>, RemoteError> {
        self.check_online()?;
        Ok(self
            .lock()?
            .records
            .get(&(table.to_string(), id.to_string()))
            .cloned())
    }

    async fn fetch_changed_since(
        &self,
        table: &str,
        watermark: Timestamp,
    ) -> Result<Vec<RemoteRecord>, RemoteError> {
        self.check_online()?;
        let state = self.lock()?;
        let mut changed: Vec<RemoteRecord> = state
            .records
            .values()
            .filter(|r| r.table == table && r.updated_at > watermark)
            .cloned()
            .collect();
        changed.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(changed)
    }

    async fn upsert(&self, table: &str, write: RemoteWrite) -> Result<RemoteRecord, RemoteError> {
        self.check_online()?;
        let mut state = self.lock()?;
        let actual = state
            .records
            .get(&(table.to_string(), write.id.clone()))
            .map(|r| r.version);
        if actual != write.expected_version {
            return Err(RemoteError::Precondition {
                expected: write.expected_version,
                actual,
            });
        }
        let version = actual.map_or(1, |v| v + 1);
        let record = self.store(&mut state, table, &write.id, write.payload, version, false);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(record)
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        self.check_online()?;
        let mut state = self.lock()?;
        let current = state
            .records
            .get(&(table.to_string(), id.to_string()))
            .filter(|r| !r.deleted)
            .map(|r| r.version);
        if let Some(version) = current {
            self.store(&mut state, table, id, serde_json::Value::Null, version + 1, true);
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn remote() -> MemoryRemote {
        MemoryRemote::new(Arc::new(ManualClock::new(100)))
    }

    fn write(id: &str, expected: Option<Version>) -> RemoteWrite {
        RemoteWrite {
            id: id.into(),
            payload: json!({"title": id}),
            expected_version: expected,
        }
    }

    #[tokio::test]
    async fn upsert_checks_expected_version() {
        let remote = remote();
        let created = remote.upsert("notes", write("n1", None)).await.unwrap();
        assert_eq!(created.version, 1);

        let err = remote.upsert("notes", write("n1", None)).await.unwrap_err();
        assert_eq!(
            err,
            RemoteError::Precondition {
                expected: None,
                actual: Some(1)
            }
        );

        let updated = remote.upsert("notes", write("n1", Some(1))).await.unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(remote.write_count(), 2);
    }

    #[tokio::test]
    async fn change_feed_is_strictly_after_watermark() {
        let remote = remote();
        let a = remote.seed("notes", "a", json!({})).unwrap();
        let b = remote.seed("notes", "b", json!({})).unwrap();
        assert!(b.updated_at > a.updated_at);

        let changed = remote.fetch_changed_since("notes", a.updated_at).await.unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].id, "b");
        assert!(remote.fetch_changed_since("other", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_leaves_tombstone() {
        let remote = remote();
        remote.seed("notes", "a", json!({"x": 1})).unwrap();
        remote.delete("notes", "a").await.unwrap();
        remote.delete("notes", "missing").await.unwrap();

        let tombstone = remote.fetch("notes", "a").await.unwrap().unwrap();
        assert!(tombstone.deleted);
        assert_eq!(tombstone.version, 2);
        assert_eq!(remote.write_count(), 1);
    }

    #[tokio::test]
    async fn offline_fails_transiently() {
        let remote = remote();
        remote.set_offline(true);
        let err = remote.fetch("notes", "a").await.unwrap_err();
        assert!(matches!(err, RemoteError::Unavailable(_)));
        assert!(!err.is_precondition());
    }

    #[test]
    fn precondition_converts_to_engine_error() {
        let err: Error = RemoteError::Precondition {
            expected: Some(1),
            actual: Some(3),
        }
        .into();
        assert!(matches!(
            err,
            Error::Precondition {
                expected: Some(1),
                actual: Some(3)
            }
        ));
    }
}
