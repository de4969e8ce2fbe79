//! Background sync loop.
//!
//! [`AutoSync`] runs cycles on a fixed interval, when a queued entry's
//! backoff runs out, and whenever it is poked through its trigger. All
//! cycles still go through [`SyncEngine::sync_now`], so they never overlap
//! with cycles started elsewhere.

use crate::{engine::SyncEngine, Timestamp};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep, MissedTickBehavior};
use tracing::{debug, error, info};

/// Min-heap of queue entries keyed by the time they become due again.
#[derive(Debug, Default)]
pub struct RetryScheduler {
    heap: BinaryHeap<Reverse<(Timestamp, String)>>,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, entry_id: impl Into<String>, due: Timestamp) {
        self.heap.push(Reverse((due, entry_id.into())));
    }

    /// Earliest due time, if anything is scheduled.
    pub fn next_due(&self) -> Option<Timestamp> {
        self.heap.peek().map(|Reverse((due, _))| *due)
    }

    /// Remove and return every entry due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: Timestamp) -> Vec<String> {
        let mut due = Vec::new();
        while let Some(Reverse((at, _))) = self.heap.peek() {
            if *at > now {
                break;
            }
            if let Some(Reverse((_, id))) = self.heap.pop() {
                due.push(id);
            }
        }
        due
    }

    /// Replace the schedule wholesale.
    pub fn rebuild(&mut self, schedule: impl IntoIterator<Item = (String, Timestamp)>) {
        self.heap = schedule
            .into_iter()
            .map(|(id, due)| Reverse((due, id)))
            .collect();
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Drives [`SyncEngine`] cycles in the background.
#[derive(Debug)]
pub struct AutoSync {
    engine: Arc<SyncEngine>,
    trigger: Arc<Notify>,
    retries: RetryScheduler,
}

impl AutoSync {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self {
            engine,
            trigger: Arc::new(Notify::new()),
            retries: RetryScheduler::new(),
        }
    }

    /// Handle that starts a cycle when notified, e.g. on reconnect.
    pub fn trigger(&self) -> Arc<Notify> {
        self.trigger.clone()
    }

    /// Run until `shutdown` completes. A cycle in progress is finished first.
    ///
    /// With auto-sync disabled in the config only the trigger starts cycles.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let auto = self.engine.config().enable_auto_sync;
        // only polled when auto-sync is on, but `interval` rejects a zero period
        let period = self.engine.config().sync_interval().max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        info!(
            auto,
            interval_secs = self.engine.config().sync_interval_seconds,
            "auto-sync running"
        );

        loop {
            let retry_in = self.retries.next_due().map(|due| {
                Duration::from_millis(due.saturating_sub(self.engine.clock().now_ms()))
            });

            let reason = tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick(), if auto => "interval",
                _ = self.trigger.notified() => "trigger",
                _ = sleep(retry_in.unwrap_or_default()), if auto && retry_in.is_some() => "retry",
            };

            if reason == "retry" {
                let due = self.retries.pop_due(self.engine.clock().now_ms());
                debug!(due = due.len(), "backoff elapsed");
            }
            self.run_cycle(reason).await;
        }
        info!("auto-sync stopped");
    }

    async fn run_cycle(&mut self, reason: &str) {
        match self.engine.sync_now().await {
            Ok(report) => debug!(
                reason,
                uploaded = report.uploaded,
                downloaded = report.downloaded,
                unresolved = report.unresolved.len(),
                "auto-sync cycle done"
            ),
            Err(err) => error!(reason, error = %err, "auto-sync cycle failed"),
        }
        match self.engine.queue().retry_schedule() {
            Ok(schedule) => {
                // entries already due wait for the next trigger or tick
                let now = self.engine.clock().now_ms();
                self.retries
                    .rebuild(schedule.into_iter().filter(|(_, due)| *due > now));
                if !self.retries.is_empty() {
                    debug!(waiting = self.retries.len(), next = ?self.retries.next_due(), "retries scheduled");
                }
            }
            Err(err) => error!(error = %err, "could not read retry schedule"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::SyncEvent;
    use crate::remote::MemoryRemote;
    use crate::schema::Schema;
    use crate::SyncConfig;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    #[test]
    fn pops_in_due_order() {
        let mut retries = RetryScheduler::new();
        retries.schedule("b", 200);
        retries.schedule("a", 100);
        retries.schedule("c", 300);

        assert_eq!(retries.next_due(), Some(100));
        assert_eq!(retries.pop_due(250), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(retries.len(), 1);
        assert!(retries.pop_due(250).is_empty());
        assert_eq!(retries.next_due(), Some(300));
    }

    #[test]
    fn rebuild_replaces_schedule() {
        let mut retries = RetryScheduler::new();
        retries.schedule("old", 5);
        retries.rebuild(vec![("x".to_string(), 50), ("y".to_string(), 20)]);
        assert_eq!(retries.len(), 2);
        assert_eq!(retries.next_due(), Some(20));
    }

    #[tokio::test]
    async fn trigger_runs_cycle_and_shutdown_stops_loop() {
        let clock = Arc::new(ManualClock::new(1_000));
        let remote = Arc::new(MemoryRemote::new(clock.clone()));
        let config = SyncConfig {
            enable_auto_sync: false,
            ..SyncConfig::default()
        };
        let engine = Arc::new(
            SyncEngine::builder(Schema::new(1), remote)
                .clock(clock)
                .config(config)
                .build()
                .unwrap(),
        );
        let mut events = engine.subscribe();

        let auto = AutoSync::new(engine.clone());
        let trigger = auto.trigger();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(auto.run(async {
            let _ = stop_rx.await;
        }));

        trigger.notify_one();
        let completed = timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(SyncEvent::SyncCompleted { result }) = events.recv().await {
                    return result;
                }
            }
        })
        .await
        .unwrap();
        assert!(completed.success);

        stop_tx.send(()).unwrap();
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
