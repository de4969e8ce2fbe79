//! Sync Engine - runs sync cycles between the cache and the remote.
//!
//! A cycle walks five phases in order:
//!
//! 1. **Preparing** - entries left `syncing` by an interrupted cycle go back
//!    to `pending`.
//! 2. **Uploading** - due queue entries are pushed in batches, each write
//!    guarded by the remote version the entry was based on.
//! 3. **Downloading** - every table is pulled past its watermark, parents
//!    before children.
//! 4. **Resolving** - open conflicts the resolver may settle on its own are
//!    resolved and pushed.
//! 5. **Finalizing** - watermarks advance, resolved conflicts and stale
//!    error entries are cleared, and the cache is swept.
//!
//! At most one cycle runs at a time. Further callers queue on a fair lock
//! and run after it in arrival order.

use crate::{
    clock::{Clock, SystemClock},
    config::SyncConfig,
    conflict::{
        classify, ConflictLog, ConflictRecord, Divergence, Resolution, ResolutionKind, ResolvedBy,
    },
    db::Database,
    error::Result,
    events::{EventBus, SyncEvent},
    operation::Operation,
    queue::{NewEntry, QueueStatus, RetryPolicy, SyncOutcome, SyncQueue, SyncQueueEntry},
    record::{RemoteRecord, RemoteWrite},
    remote::{RemoteError, RemoteStore},
    resolver::ConflictResolver,
    schema::Schema,
    store::{CacheStore, PutOptions, RemoteApply},
    watermark::Watermarks,
    Error, RecordId, TableName, Timestamp, Version,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

/// Phase of the sync cycle currently running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SyncPhase {
    #[default]
    Idle = 0,
    Preparing = 1,
    Uploading = 2,
    Downloading = 3,
    Resolving = 4,
    Finalizing = 5,
}

impl SyncPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SyncPhase::Preparing,
            2 => SyncPhase::Uploading,
            3 => SyncPhase::Downloading,
            4 => SyncPhase::Resolving,
            5 => SyncPhase::Finalizing,
            _ => SyncPhase::Idle,
        }
    }
}

/// A failure confined to one record or table. The cycle carries on.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncItemError {
    pub phase: SyncPhase,
    pub table: TableName,
    pub record_id: Option<RecordId>,
    pub message: String,
}

/// Summary of one sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Writes the remote accepted
    pub uploaded: usize,
    /// Remote changes applied to the cache
    pub downloaded: usize,
    /// Conflicts detected during the cycle
    pub conflicts: Vec<ConflictRecord>,
    /// Conflicts still open when the cycle ended
    pub unresolved: Vec<ConflictRecord>,
    pub errors: Vec<SyncItemError>,
    pub duration_ms: u64,
    /// `true` when no item failed
    pub success: bool,
    /// `true` when the cycle stopped early on request
    pub cancelled: bool,
}

/// Builder for [`SyncEngine`].
pub struct EngineBuilder {
    schema: Schema,
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    resolver: ConflictResolver,
    path: Option<PathBuf>,
    event_capacity: usize,
}

impl EngineBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Keep the cache in a database file instead of memory.
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<SyncEngine> {
        self.config.validate()?;
        let db = Arc::new(match &self.path {
            Some(path) => Database::open(path, &self.schema)?,
            None => Database::open_in_memory(&self.schema)?,
        });
        let schema = Arc::new(self.schema);
        let store = CacheStore::new(db.clone(), schema, self.config.clone(), self.clock.clone());
        let queue = SyncQueue::new(
            db.clone(),
            RetryPolicy::from_config(&self.config),
            self.clock.clone(),
        );
        let conflicts = ConflictLog::new(db.clone(), self.clock.clone());
        let watermarks = Watermarks::new(db);

        info!(
            tables = store.schema().tables.len(),
            persistent = self.path.is_some(),
            "sync engine ready"
        );

        Ok(SyncEngine {
            store,
            queue,
            conflicts,
            resolver: self.resolver,
            watermarks,
            remote: self.remote,
            config: self.config,
            clock: self.clock,
            events: EventBus::new(self.event_capacity),
            cycle: Mutex::new(()),
            phase: AtomicU8::new(SyncPhase::Idle as u8),
            cancelled: AtomicBool::new(false),
        })
    }
}

/// Offline-first sync engine over a local cache and a remote store.
pub struct SyncEngine {
    store: CacheStore,
    queue: SyncQueue,
    conflicts: ConflictLog,
    resolver: ConflictResolver,
    watermarks: Watermarks,
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    events: EventBus,
    /// Held for the whole cycle; tokio's mutex queues waiters in FIFO order
    cycle: Mutex<()>,
    phase: AtomicU8,
    cancelled: AtomicBool,
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("phase", &self.phase())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    pub fn builder(schema: Schema, remote: Arc<dyn RemoteStore>) -> EngineBuilder {
        EngineBuilder {
            schema,
            remote,
            config: SyncConfig::default(),
            clock: Arc::new(SystemClock),
            resolver: ConflictResolver::new(),
            path: None,
            event_capacity: 256,
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn conflicts(&self) -> &ConflictLog {
        &self.conflicts
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn phase(&self) -> SyncPhase {
        SyncPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Highest remote `updated_at` pulled for `table`.
    pub fn watermark(&self, table: &str) -> Result<Timestamp> {
        self.watermarks.get(table)
    }

    /// Ask the running cycle to stop after the current batch. Finalizing
    /// still runs so partial progress is kept.
    pub fn cancel(&self) {
        if self.phase() != SyncPhase::Idle {
            info!(phase = ?self.phase(), "sync cancellation requested");
        }
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Run one full sync cycle, waiting for any cycle already running.
    ///
    /// Per-record failures are collected in the report; the call only fails
    /// when the local database does.
    pub async fn sync_now(&self) -> Result<SyncReport> {
        let _cycle = self.cycle.lock().await;
        self.cancelled.store(false, Ordering::SeqCst);
        let started = Instant::now();
        info!("sync started");
        self.events.emit(SyncEvent::SyncStarted);

        let mut report = SyncReport::default();
        let outcome = self.run_cycle(&mut report).await;
        self.set_phase(SyncPhase::Idle);
        report.duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => {
                report.success = report.errors.is_empty();
                info!(
                    uploaded = report.uploaded,
                    downloaded = report.downloaded,
                    conflicts = report.conflicts.len(),
                    unresolved = report.unresolved.len(),
                    errors = report.errors.len(),
                    cancelled = report.cancelled,
                    duration_ms = report.duration_ms,
                    "sync finished"
                );
                self.events.emit(SyncEvent::SyncCompleted {
                    result: report.clone(),
                });
                Ok(report)
            }
            Err(err) => {
                error!(error = %err, "sync failed");
                self.events.emit(SyncEvent::SyncFailed {
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Resolve a conflict by hand and push the outcome.
    ///
    /// `Merge` uses `value` when given and the resolver's merge otherwise;
    /// `Custom` requires `value`. The chosen value must pass the table
    /// schema (a `null` value deletes the record).
    pub async fn resolve_manually(
        &self,
        conflict_id: &str,
        kind: ResolutionKind,
        value: Option<Value>,
        notes: Option<String>,
    ) -> Result<Resolution> {
        let _cycle = self.cycle.lock().await;
        let conflict = self
            .conflicts
            .get(conflict_id)?
            .ok_or_else(|| Error::ConflictNotFound(conflict_id.to_string()))?;
        if conflict.is_resolved() {
            return Err(Error::ConflictAlreadyResolved(conflict.id));
        }

        let (resolved_value, strategy_name) = match kind {
            ResolutionKind::Local => (conflict.local_value.clone(), None),
            ResolutionKind::Remote => (conflict.remote_value.clone(), None),
            ResolutionKind::Merge => match value {
                Some(value) => (value, None),
                None => {
                    let merged = self.resolver.resolve(&conflict);
                    (merged.value, Some(merged.strategy_name))
                }
            },
            ResolutionKind::Custom => (
                value.ok_or_else(|| {
                    Error::InvalidPayload("a custom resolution needs a value".into())
                })?,
                None,
            ),
        };
        self.check_value(&conflict.table, &resolved_value)?;

        let resolution = Resolution {
            conflict_id: conflict.id.clone(),
            kind,
            resolved_value,
            resolved_by: ResolvedBy::User,
            resolved_at: self.clock.now_ms(),
            strategy_name,
            notes,
        };
        let mut report = SyncReport::default();
        self.apply_resolution(&conflict, resolution.clone(), &mut report)
            .await?;
        for item in &report.errors {
            warn!(
                table = %item.table,
                error = %item.message,
                "resolution stored locally, push queued for retry"
            );
        }
        Ok(resolution)
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
        debug!(?phase, "sync phase");
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn progress(&self, phase: SyncPhase, current: usize, total: usize, table: Option<&str>) {
        self.events.emit(SyncEvent::SyncProgress {
            phase,
            current,
            total,
            table: table.map(str::to_string),
        });
    }

    async fn run_cycle(&self, report: &mut SyncReport) -> Result<()> {
        self.set_phase(SyncPhase::Preparing);
        let recovered = self.queue.recover_in_flight()?;
        if recovered > 0 {
            info!(recovered, "requeued entries from an interrupted cycle");
        }

        if !self.is_cancelled() {
            self.set_phase(SyncPhase::Uploading);
            self.upload(report).await?;
        }

        let mut pulled = BTreeMap::new();
        if !self.is_cancelled() {
            self.set_phase(SyncPhase::Downloading);
            self.download(report, &mut pulled).await?;
        }

        if !self.is_cancelled() {
            self.set_phase(SyncPhase::Resolving);
            self.resolve_open(report).await?;
        }

        self.set_phase(SyncPhase::Finalizing);
        self.finalize(report, pulled)?;
        report.cancelled = self.is_cancelled();
        Ok(())
    }

    async fn upload(&self, report: &mut SyncReport) -> Result<()> {
        let batch_size = self.config.batch_size;
        let pending = self.queue.counts()?.pending;
        // Entries rescheduled during this cycle wait for the next one.
        let rounds = pending.div_ceil(batch_size);
        let mut done = 0;

        for _ in 0..rounds {
            let batch = self.queue.dequeue_batch(batch_size)?;
            if batch.is_empty() {
                break;
            }
            for entry in batch {
                self.upload_entry(entry, report).await?;
                done += 1;
            }
            self.progress(SyncPhase::Uploading, done, pending, None);
            if self.is_cancelled() {
                info!(done, pending, "upload stopped early");
                break;
            }
        }
        Ok(())
    }

    async fn upload_entry(&self, entry: SyncQueueEntry, report: &mut SyncReport) -> Result<()> {
        let pushed = match entry.operation {
            Operation::Delete => self
                .remote
                .delete(&entry.table, &entry.record_id)
                .await
                .map(|()| None),
            Operation::Create | Operation::Update => self
                .remote
                .upsert(
                    &entry.table,
                    RemoteWrite {
                        id: entry.record_id.clone(),
                        payload: entry.payload.clone().unwrap_or(Value::Null),
                        expected_version: entry.remote_version,
                    },
                )
                .await
                .map(Some),
        };

        match pushed {
            Ok(accepted) => {
                let remote_version = match &accepted {
                    Some(remote) => {
                        self.store.mark_synced(remote)?;
                        remote.version
                    }
                    None => entry.remote_version.map_or(0, |v| v + 1),
                };
                self.queue.mark_result(
                    &entry.id,
                    SyncOutcome::Synced {
                        generation: entry.generation,
                        remote_version,
                    },
                )?;
                report.uploaded += 1;
                debug!(
                    table = %entry.table,
                    id = %entry.record_id,
                    op = %entry.operation,
                    remote_version,
                    "uploaded"
                );
            }
            Err(RemoteError::Precondition { expected, actual }) => {
                debug!(
                    table = %entry.table,
                    id = %entry.record_id,
                    ?expected,
                    ?actual,
                    "remote moved on, checking for conflict"
                );
                match self.remote.fetch(&entry.table, &entry.record_id).await {
                    Ok(current) => {
                        let settled = self.settle(&entry, current, report);
                        self.absorb(settled, SyncPhase::Uploading, &entry.table, &entry.record_id, report)?;
                    }
                    Err(err) => self.record_failure(&entry, err, report)?,
                }
            }
            Err(err) => self.record_failure(&entry, err, report)?,
        }
        Ok(())
    }

    fn record_failure(
        &self,
        entry: &SyncQueueEntry,
        err: RemoteError,
        report: &mut SyncReport,
    ) -> Result<()> {
        let outcome = match &err {
            RemoteError::Rejected(reason) => SyncOutcome::Rejected(reason.clone()),
            other => SyncOutcome::Failed(other.to_string()),
        };
        let status = self.queue.mark_result(&entry.id, outcome)?;
        warn!(
            table = %entry.table,
            id = %entry.record_id,
            error = %err,
            ?status,
            "upload failed"
        );
        report.errors.push(SyncItemError {
            phase: SyncPhase::Uploading,
            table: entry.table.clone(),
            record_id: Some(entry.record_id.clone()),
            message: err.to_string(),
        });
        Ok(())
    }

    /// Settle a queued mutation against what the remote currently holds.
    fn settle(
        &self,
        entry: &SyncQueueEntry,
        current: Option<RemoteRecord>,
        report: &mut SyncReport,
    ) -> Result<()> {
        let Some(remote) = current else {
            // Nothing on the remote at all.
            if entry.operation == Operation::Delete {
                self.queue.remove(&entry.table, &entry.record_id)?;
            } else {
                self.queue.rebase(&entry.id, None)?;
            }
            return Ok(());
        };

        let cached = self.store.peek(&entry.table, &entry.record_id)?;
        let local = entry.payload.clone().unwrap_or(Value::Null);
        let base = cached.as_ref().and_then(|r| r.base_payload.clone());
        let local_timestamp = cached.as_ref().map_or(entry.created_at, |r| r.updated_at);

        match divergence(&local, base.as_ref(), entry.remote_version, &remote) {
            Divergence::Converged => {
                self.store.apply_remote_discarding_local(&remote)?;
                self.close_settled_conflict(entry, &local, ResolutionKind::Local)?;
            }
            Divergence::LocalChanged => {
                self.queue.rebase(&entry.id, Some(remote.version))?;
                self.close_settled_conflict(entry, &local, ResolutionKind::Local)?;
            }
            Divergence::RemoteChanged => {
                self.store.apply_remote_discarding_local(&remote)?;
                report.downloaded += 1;
                self.close_settled_conflict(entry, &remote.effective_payload(), ResolutionKind::Remote)?;
            }
            Divergence::Conflict => {
                self.register_conflict(entry, &local, local_timestamp, base.as_ref(), &remote, report)?;
            }
        }
        Ok(())
    }

    /// A record that stopped conflicting no longer needs its open conflict.
    fn close_settled_conflict(
        &self,
        entry: &SyncQueueEntry,
        value: &Value,
        kind: ResolutionKind,
    ) -> Result<()> {
        let Some(open) = self.conflicts.open_for(&entry.table, &entry.record_id)? else {
            return Ok(());
        };
        let resolution = Resolution {
            conflict_id: open.id,
            kind,
            resolved_value: value.clone(),
            resolved_by: ResolvedBy::Auto,
            resolved_at: self.clock.now_ms(),
            strategy_name: None,
            notes: Some("settled by a later remote change".into()),
        };
        self.conflicts.resolve(&resolution)?;
        debug!(table = %entry.table, id = %entry.record_id, "stale conflict closed");
        self.events.emit(SyncEvent::ConflictResolved { resolution });
        Ok(())
    }

    fn register_conflict(
        &self,
        entry: &SyncQueueEntry,
        local: &Value,
        local_timestamp: Timestamp,
        base: Option<&Value>,
        remote: &RemoteRecord,
        report: &mut SyncReport,
    ) -> Result<()> {
        let mut conflict = ConflictRecord::new(
            &entry.table,
            &entry.record_id,
            local,
            local_timestamp,
            base,
            remote,
            self.clock.now_ms(),
        );
        if conflict.auto_resolvable {
            let suggestion = self.resolver.resolve(&conflict);
            conflict.suggested_resolution = Some(suggestion.value);
            conflict.strategy_name = Some(suggestion.strategy_name);
        }
        let conflict = self.conflicts.record(conflict)?;
        self.queue.mark_result(&entry.id, SyncOutcome::Conflict)?;
        info!(
            table = %conflict.table,
            id = %conflict.record_id,
            severity = ?conflict.severity,
            auto = conflict.auto_resolvable,
            "conflict detected"
        );
        self.events.emit(SyncEvent::ConflictDetected {
            conflict: conflict.clone(),
        });
        note_conflict(report, conflict);
        Ok(())
    }

    async fn download(
        &self,
        report: &mut SyncReport,
        pulled: &mut BTreeMap<TableName, Timestamp>,
    ) -> Result<()> {
        let tables: Vec<TableName> = self
            .store
            .schema()
            .eviction_order()?
            .into_iter()
            .rev()
            .map(|t| t.name.clone())
            .collect();
        let total = tables.len();

        for (i, table) in tables.iter().enumerate() {
            if self.is_cancelled() {
                info!(table = %table, "download stopped early");
                break;
            }
            let since = self.watermarks.get(table)?;
            let mut changed = match self.remote.fetch_changed_since(table, since).await {
                Ok(changed) => changed,
                Err(err) => {
                    warn!(table = %table, error = %err, "pull failed");
                    report.errors.push(SyncItemError {
                        phase: SyncPhase::Downloading,
                        table: table.clone(),
                        record_id: None,
                        message: err.to_string(),
                    });
                    continue;
                }
            };
            changed.sort_by_key(|r| r.updated_at);
            debug!(table = %table, since, changed = changed.len(), "pulled changes");

            // Records that fail to apply are parked, so the watermark still
            // moves past them.
            for remote in &changed {
                self.pull_record(remote, report)?;
            }
            if let Some(last) = changed.last() {
                pulled.insert(table.clone(), last.updated_at);
            }
            self.retry_parked(table, &changed, report).await?;
            self.progress(SyncPhase::Downloading, i + 1, total, Some(table));
        }
        Ok(())
    }

    /// Apply one pulled record, parking it when it fails to apply.
    fn pull_record(&self, remote: &RemoteRecord, report: &mut SyncReport) -> Result<()> {
        let failures = report.errors.len();
        self.download_record(remote, report)?;
        match report.errors.get(failures) {
            Some(failure) => {
                self.watermarks
                    .park(&remote.table, &remote.id, remote.updated_at, &failure.message)?;
            }
            None => {
                if self.watermarks.unpark(&remote.table, &remote.id)? {
                    debug!(table = %remote.table, id = %remote.id, "parked record applied");
                }
            }
        }
        Ok(())
    }

    /// Fetch records parked by earlier pulls that this pull did not bring.
    async fn retry_parked(
        &self,
        table: &str,
        changed: &[RemoteRecord],
        report: &mut SyncReport,
    ) -> Result<()> {
        for id in self.watermarks.parked(table)? {
            if self.is_cancelled() {
                break;
            }
            if changed.iter().any(|r| r.id == id) {
                continue;
            }
            match self.remote.fetch(table, &id).await {
                Ok(Some(remote)) => self.pull_record(&remote, report)?,
                Ok(None) => {
                    self.watermarks.unpark(table, &id)?;
                }
                Err(err) => {
                    warn!(table, id = %id, error = %err, "fetch of parked record failed");
                    report.errors.push(SyncItemError {
                        phase: SyncPhase::Downloading,
                        table: table.to_string(),
                        record_id: Some(id),
                        message: err.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn download_record(&self, remote: &RemoteRecord, report: &mut SyncReport) -> Result<()> {
        let applied = match self.queue.get(&remote.table, &remote.id)? {
            Some(entry) if entry.status == QueueStatus::Conflict && self.already_parked(remote)? => {
                Ok(())
            }
            None => self.store.apply_remote(remote).map(|applied| {
                if applied != RemoteApply::Unchanged {
                    report.downloaded += 1;
                }
            }),
            Some(entry) => self.settle(&entry, Some(remote.clone()), report),
        };
        self.absorb(applied, SyncPhase::Downloading, &remote.table, &remote.id, report)
    }

    /// Whether the open conflict for the record was raised against this
    /// very remote version.
    fn already_parked(&self, remote: &RemoteRecord) -> Result<bool> {
        Ok(self
            .conflicts
            .open_for(&remote.table, &remote.id)?
            .is_some_and(|open| open.remote_version == Some(remote.version)))
    }

    /// Turn a record-level validation failure into a report entry; anything
    /// else still aborts the cycle.
    fn absorb(
        &self,
        result: Result<()>,
        phase: SyncPhase,
        table: &str,
        id: &str,
        report: &mut SyncReport,
    ) -> Result<()> {
        match result {
            Err(err) if err.is_validation() => {
                warn!(table, id, error = %err, "remote record rejected by schema");
                report.errors.push(SyncItemError {
                    phase,
                    table: table.to_string(),
                    record_id: Some(id.to_string()),
                    message: err.to_string(),
                });
                Ok(())
            }
            other => other,
        }
    }

    async fn resolve_open(&self, report: &mut SyncReport) -> Result<()> {
        let candidates: Vec<ConflictRecord> = self
            .conflicts
            .open()?
            .into_iter()
            .filter(|c| c.auto_resolvable)
            .collect();
        let total = candidates.len();

        for (i, conflict) in candidates.iter().enumerate() {
            if self.is_cancelled() {
                info!(done = i, total, "resolving stopped early");
                break;
            }
            let resolved = self.resolver.resolve(conflict);
            if let Err(err) = self.check_value(&conflict.table, &resolved.value) {
                warn!(
                    table = %conflict.table,
                    id = %conflict.record_id,
                    error = %err,
                    "merged value fails the schema, leaving conflict open"
                );
                report.errors.push(SyncItemError {
                    phase: SyncPhase::Resolving,
                    table: conflict.table.clone(),
                    record_id: Some(conflict.record_id.clone()),
                    message: err.to_string(),
                });
                continue;
            }
            let resolution = Resolution {
                conflict_id: conflict.id.clone(),
                kind: resolved.kind,
                resolved_value: resolved.value,
                resolved_by: ResolvedBy::Auto,
                resolved_at: self.clock.now_ms(),
                strategy_name: Some(resolved.strategy_name),
                notes: None,
            };
            self.apply_resolution(conflict, resolution, report).await?;
            self.progress(SyncPhase::Resolving, i + 1, total, Some(&conflict.table));
        }
        Ok(())
    }

    fn check_value(&self, table: &str, value: &Value) -> Result<()> {
        if value.is_null() {
            self.store.schema().require_table(table).map(|_| ())
        } else {
            self.store.schema().validate(table, value)
        }
    }

    /// Persist a resolution, then make the cache and the remote agree on it.
    async fn apply_resolution(
        &self,
        conflict: &ConflictRecord,
        resolution: Resolution,
        report: &mut SyncReport,
    ) -> Result<()> {
        self.conflicts.resolve(&resolution)?;
        info!(
            table = %conflict.table,
            id = %conflict.record_id,
            kind = ?resolution.kind,
            by = ?resolution.resolved_by,
            strategy = resolution.strategy_name.as_deref().unwrap_or("-"),
            "conflict resolved"
        );
        self.events.emit(SyncEvent::ConflictResolved {
            resolution: resolution.clone(),
        });

        let (table, id) = (&conflict.table, &conflict.record_id);
        let value = resolution.resolved_value;

        if value == conflict.remote_value {
            self.store.apply_remote_discarding_local(&RemoteRecord {
                table: table.clone(),
                id: id.clone(),
                payload: value.clone(),
                version: conflict.remote_version.unwrap_or(0),
                updated_at: conflict.remote_timestamp,
                deleted: value.is_null(),
            })?;
            return Ok(());
        }

        if value.is_null() {
            self.store.forget(table, id)?;
        } else {
            self.store.put(table, id, value.clone(), PutOptions::skip_sync())?;
        }
        // Foreground writes during the push bump the entry generation.
        let seen = self.queue.get(table, id)?.map(|e| e.generation);

        let pushed = if value.is_null() {
            self.remote.delete(table, id).await.map(|()| None)
        } else {
            self.remote
                .upsert(
                    table,
                    RemoteWrite {
                        id: id.clone(),
                        payload: value.clone(),
                        expected_version: conflict.remote_version,
                    },
                )
                .await
                .map(Some)
        };

        match pushed {
            Ok(accepted) => {
                if let Some(remote) = &accepted {
                    self.store.mark_synced(remote)?;
                }
                let remote_version = match &accepted {
                    Some(remote) => Some(remote.version),
                    None => conflict.remote_version.map(|v| v + 1),
                };
                if self.queue.acknowledge(table, id, seen, remote_version)? {
                    debug!(table = %table, id = %id, "written during resolution push, kept queued");
                }
                report.uploaded += 1;
            }
            Err(err) if err.is_precondition() => match self.remote.fetch(table, id).await {
                Ok(Some(fresh)) => {
                    let reopened = self.conflicts.reopen(&conflict.id, &value, &fresh)?;
                    warn!(
                        table = %table,
                        id = %id,
                        remote_version = fresh.version,
                        "remote moved on while resolving, conflict reopened"
                    );
                    self.events.emit(SyncEvent::ConflictDetected {
                        conflict: reopened.clone(),
                    });
                    note_conflict(report, reopened);
                }
                Ok(None) => self.requeue_resolved(conflict, &value, None, seen)?,
                Err(err) => {
                    self.requeue_resolved(conflict, &value, conflict.remote_version, seen)?;
                    report.errors.push(resolution_error(conflict, &err));
                }
            },
            Err(err) => {
                self.requeue_resolved(conflict, &value, conflict.remote_version, seen)?;
                warn!(table = %table, id = %id, error = %err, "push of resolution failed, queued");
                report.errors.push(resolution_error(conflict, &err));
            }
        }
        Ok(())
    }

    /// Queue a resolved value for a later push in place of the parked entry.
    /// A mutation queued after generation `seen` wins over the resolved value.
    fn requeue_resolved(
        &self,
        conflict: &ConflictRecord,
        value: &Value,
        remote_version: Option<Version>,
        seen: Option<u64>,
    ) -> Result<()> {
        let priority = self.store.schema().require_table(&conflict.table)?.priority;
        let local_version = self
            .store
            .peek(&conflict.table, &conflict.record_id)?
            .map_or(0, |r| r.version);
        let operation = if value.is_null() {
            Operation::Delete
        } else if remote_version.is_some() {
            Operation::Update
        } else {
            Operation::Create
        };
        self.queue.replace_unless_newer(
            NewEntry {
                table: conflict.table.clone(),
                record_id: conflict.record_id.clone(),
                operation,
                payload: (!value.is_null()).then(|| value.clone()),
                local_version,
                remote_version,
                priority,
            },
            seen,
        )?;
        Ok(())
    }

    fn finalize(&self, report: &mut SyncReport, pulled: BTreeMap<TableName, Timestamp>) -> Result<()> {
        for (table, high) in &pulled {
            self.watermarks.advance(table, *high)?;
        }
        let cleared = self.conflicts.clear_resolved()?;
        let swept = self.queue.sweep_errors(self.config.error_retention())?;
        let evicted = self.store.sweep()?;
        report.unresolved = self.conflicts.open()?;
        debug!(
            tables = pulled.len(),
            cleared,
            swept,
            expired = evicted.expired,
            evicted = evicted.evicted,
            "finalized"
        );
        Ok(())
    }
}

/// A refreshed conflict replaces its earlier report entry.
fn note_conflict(report: &mut SyncReport, conflict: ConflictRecord) {
    match report.conflicts.iter_mut().find(|c| c.id == conflict.id) {
        Some(seen) => *seen = conflict,
        None => report.conflicts.push(conflict),
    }
}

fn resolution_error(conflict: &ConflictRecord, err: &RemoteError) -> SyncItemError {
    SyncItemError {
        phase: SyncPhase::Resolving,
        table: conflict.table.clone(),
        record_id: Some(conflict.record_id.clone()),
        message: err.to_string(),
    }
}

/// How a queued local value relates to the remote record.
///
/// With a known base this is a plain three-way comparison. Without one
/// (deleted rows, records never synced) the remote counts as unchanged only
/// if it still holds the version the entry was based on.
fn divergence(
    local: &Value,
    base: Option<&Value>,
    queued_version: Option<Version>,
    remote: &RemoteRecord,
) -> Divergence {
    let remote_value = remote.effective_payload();
    match base {
        Some(base) => classify(local, &remote_value, Some(base)),
        None if *local == remote_value => Divergence::Converged,
        None if queued_version == Some(remote.version) => Divergence::LocalChanged,
        None => Divergence::Conflict,
    }
}
