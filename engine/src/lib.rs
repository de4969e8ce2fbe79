//! # Hoard Engine
//!
//! An offline-first cache and sync engine for client applications.
//!
//! Reads and writes always hit a local SQLite cache. Writes are recorded in
//! a durable sync queue in the same transaction, and a sync cycle later
//! pushes them to a remote relational store, pulls remote changes, and
//! settles conflicts between the two.
//!
//! ## Core Concepts
//!
//! ### Cache Store
//!
//! The [`CacheStore`] keeps one row per record with its payload, local
//! version, expiry and the last payload both sides agreed on (the *base*).
//! Budgets on record count and payload bytes are enforced by evicting the
//! oldest clean records, children before parents.
//!
//! ### Sync Queue
//!
//! The [`SyncQueue`] holds at most one entry per record. Successive writes
//! to the same record coalesce (`create` then `delete` cancels out). Failed
//! pushes back off on a fixed delay table before being retried.
//!
//! ### Conflict Resolution
//!
//! A true conflict exists when local and remote both moved away from the
//! base to different values. The [`ConflictResolver`] merges these with
//! pluggable [`MergeStrategy`] implementations:
//! - [`LastWriteWins`] - newer timestamp wins, ties go to the remote
//! - [`TextMerge`] - three-way line merge, conflict markers on overlap
//! - [`ArrayUnion`] - set union, local order first
//! - [`NumericMax`] - larger number wins
//! - [`DeepMerge`] - recursive object merge
//!
//! ### Sync Engine
//!
//! The [`SyncEngine`] runs one cycle at a time through its phases
//! (preparing, uploading, downloading, resolving, finalizing) and reports
//! progress as [`SyncEvent`]s.
//!
//! ## Quick Start
//!
//! ```rust
//! use hoard_engine::{
//!     FieldDef, FieldType, MemoryRemote, PutOptions, Schema, SyncEngine, SystemClock,
//!     TableSchema,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # tokio_test_block_on(async {
//! // 1. Define a schema
//! let schema = Schema::new(1).with_table(TableSchema::new(
//!     "notes",
//!     vec![
//!         FieldDef::required("title", FieldType::String),
//!         FieldDef::optional("tags", FieldType::List),
//!     ],
//! ));
//!
//! // 2. Build an engine against a remote
//! let remote = Arc::new(MemoryRemote::new(Arc::new(SystemClock)));
//! let engine = SyncEngine::builder(schema, remote).build().unwrap();
//!
//! // 3. Write locally, offline or not
//! engine
//!     .store()
//!     .put("notes", "n1", json!({"title": "groceries"}), PutOptions::default())
//!     .unwrap();
//!
//! // 4. Sync
//! let report = engine.sync_now().await.unwrap();
//! assert_eq!(report.uploaded, 1);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod conflict;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod operation;
pub mod queue;
pub mod record;
pub mod remote;
pub mod resolver;
pub mod scheduler;
pub mod schema;
pub mod store;
pub mod watermark;

// Re-export main types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use conflict::{
    ConflictLog, ConflictRecord, Divergence, Resolution, ResolutionKind, ResolvedBy, Severity,
};
pub use db::Database;
pub use engine::{EngineBuilder, SyncEngine, SyncItemError, SyncPhase, SyncReport};
pub use error::{Error, Result};
pub use events::{EventBus, SyncEvent};
pub use operation::Operation;
pub use queue::{
    NewEntry, Priority, QueueCounts, QueueStatus, RetryPolicy, SyncOutcome, SyncQueue,
    SyncQueueEntry,
};
pub use record::{CacheRecord, RemoteRecord, RemoteWrite};
pub use remote::{MemoryRemote, RemoteError, RemoteStore};
pub use resolver::{
    Applies, ArrayUnion, ConflictResolver, DeepMerge, LastWriteWins, MergeInput, MergeStrategy,
    NumericMax, Resolved, TextMerge, ValueKind,
};
pub use scheduler::{AutoSync, RetryScheduler};
pub use schema::{FieldDef, FieldType, ForeignKey, Schema, TableSchema};
pub use store::{CacheStats, CacheStore, EvictionReport, PutOptions, RemoteApply};
pub use watermark::Watermarks;

/// Type aliases for clarity
pub type TableName = String;
pub type RecordId = String;
pub type Version = u64;
pub type Timestamp = u64;
