//! Record types for cached and remote data.

use crate::{RecordId, TableName, Timestamp, Version};
use serde::{Deserialize, Serialize};

/// A record held in the local cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    /// Table this record belongs to
    pub table: TableName,
    /// Unique identifier within the table
    pub id: RecordId,
    /// The actual data payload, validated against the table schema
    pub payload: serde_json::Value,
    /// When the record was last written to the cache (ms since epoch)
    pub cached_at: Timestamp,
    /// When the record stops being served; `None` never expires
    pub ttl_expires_at: Option<Timestamp>,
    /// Local version, bumped once per accepted local write or remote pull
    pub version: Version,
    /// Time of the last accepted local write or remote pull
    pub updated_at: Timestamp,
    /// Last payload both sides agreed on
    pub base_payload: Option<serde_json::Value>,
    /// Remote version matching `base_payload`; `None` if never synced
    pub remote_version: Option<Version>,
    /// Remote update time matching `base_payload`
    pub remote_updated_at: Option<Timestamp>,
}

impl CacheRecord {
    /// Whether the record is past its TTL at `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.ttl_expires_at.is_some_and(|at| at <= now)
    }

    /// Whether the record has ever been acknowledged by the remote.
    pub fn is_synced(&self) -> bool {
        self.remote_version.is_some()
    }

    /// Whether the local payload differs from the last agreed base.
    pub fn has_local_changes(&self) -> bool {
        self.base_payload.as_ref() != Some(&self.payload)
    }
}

/// A record as the remote store reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub table: TableName,
    pub id: RecordId,
    /// Payload; `Null` for tombstones
    pub payload: serde_json::Value,
    /// Remote version, incremented by the remote on every accepted write
    pub version: Version,
    /// Remote update time (ms since epoch), used for watermarks
    pub updated_at: Timestamp,
    /// Tombstone flag so deletions travel through change feeds
    #[serde(default)]
    pub deleted: bool,
}

impl RemoteRecord {
    /// Payload as seen by conflict detection: `Null` for a tombstone.
    pub fn effective_payload(&self) -> serde_json::Value {
        if self.deleted {
            serde_json::Value::Null
        } else {
            self.payload.clone()
        }
    }
}

/// A write sent to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteWrite {
    pub id: RecordId,
    pub payload: serde_json::Value,
    /// Version the caller believes the remote holds; `None` for a new record
    pub expected_version: Option<Version>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> CacheRecord {
        CacheRecord {
            table: "users".into(),
            id: "user-1".into(),
            payload: json!({"name": "Alice"}),
            cached_at: 1_000,
            ttl_expires_at: Some(2_000),
            version: 1,
            updated_at: 1_000,
            base_payload: None,
            remote_version: None,
            remote_updated_at: None,
        }
    }

    #[test]
    fn expiry_is_inclusive() {
        let r = record();
        assert!(!r.is_expired(1_999));
        assert!(r.is_expired(2_000));

        let forever = CacheRecord {
            ttl_expires_at: None,
            ..record()
        };
        assert!(!forever.is_expired(u64::MAX));
    }

    #[test]
    fn local_changes_against_base() {
        let mut r = record();
        assert!(!r.is_synced());
        assert!(r.has_local_changes());

        r.base_payload = Some(json!({"name": "Alice"}));
        r.remote_version = Some(3);
        assert!(r.is_synced());
        assert!(!r.has_local_changes());
    }

    #[test]
    fn tombstone_payload_is_null() {
        let remote = RemoteRecord {
            table: "users".into(),
            id: "user-1".into(),
            payload: json!({"name": "Alice"}),
            version: 4,
            updated_at: 10,
            deleted: true,
        };
        assert_eq!(remote.effective_payload(), serde_json::Value::Null);
    }

    #[test]
    fn serialization_format() {
        let json = serde_json::to_string(&record()).unwrap();
        assert!(json.contains("ttlExpiresAt"));
        assert!(json.contains("cachedAt"));
    }
}
