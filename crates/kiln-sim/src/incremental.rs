//! Background writer that appends finished task rows to a trace file while a run is
//! in progress.
//!
//! The output is a progress artifact only. Failures are logged and the loop keeps
//! going; the final trace returned by the harness never depends on it.
//!
//! # Windows
//!
//! Every tick the writer asks the store for instances whose end time falls in
//! `[checkpoint, now)`, appends them, and moves the checkpoint to `now` whether or not
//! the append succeeded. `now` comes from an injected [`Clock`]; the tick spacing is
//! always wall-clock time.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kiln_time::Clock;
use kiln_time::SystemClock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio::time::interval_at;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::trace::append_rows;
use crate::trace::to_rows;
use crate::traits::JobStore;

/// Settings for an [`IncrementalTraceWriter`].
#[derive(Clone)]
pub struct IncrementalTraceWriter {
    store: Arc<dyn JobStore>,
    path: PathBuf,
    period: Duration,
    clock: Arc<dyn Clock>,
}

impl IncrementalTraceWriter {
    /// Writer reading window bounds from the wall clock.
    pub fn new(store: Arc<dyn JobStore>, path: impl Into<PathBuf>, period_ms: u64) -> Self {
        Self {
            store,
            path: path.into(),
            period: Duration::from_millis(period_ms.max(1)),
            clock: Arc::new(SystemClock),
        }
    }

    /// Read window bounds from `clock` instead of the wall clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Output file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start the background loop.
    pub fn spawn(self) -> IncrementalWriterHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.run(cancel.clone()));
        IncrementalWriterHandle {
            cancel,
            task: Some(task),
        }
    }

    async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut checkpoint_ms = 0u64;

        info!(
            path = %self.path.display(),
            period_ms = self.period.as_millis() as u64,
            "incremental trace writer started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Flush what finished since the last tick before exiting.
                    self.write_window(&mut checkpoint_ms).await;
                    info!(path = %self.path.display(), "incremental trace writer stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.write_window(&mut checkpoint_ms).await;
                }
            }
        }
    }

    async fn write_window(&self, checkpoint_ms: &mut u64) {
        let now_ms = self.clock.now_ms();
        let start_ms = *checkpoint_ms;
        *checkpoint_ms = now_ms.max(start_ms);

        let records = match self.store.instances_ended_between(start_ms, now_ms).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, start_ms, end_ms = now_ms, "incremental trace query failed");
                return;
            }
        };

        match append_rows(&self.path, &to_rows(&records)) {
            Ok(written) => debug!(written, start_ms, end_ms = now_ms, "incremental trace appended"),
            Err(e) => warn!(error = %e, start_ms, end_ms = now_ms, "incremental trace append failed"),
        }
    }
}

/// Running writer. Dropping the handle cancels the loop without waiting for it.
pub struct IncrementalWriterHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl IncrementalWriterHandle {
    /// Cancel the loop and wait for its final flush.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "incremental trace writer task failed");
        }
    }
}

impl Drop for IncrementalWriterHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use async_trait::async_trait;
    use kiln_time::SimulatedClock;
    use tokio::sync::Mutex;

    use super::*;
    use crate::error::StoreError;
    use crate::trace::read_rows;
    use crate::types::InstanceStatus;
    use crate::types::Job;
    use crate::types::Resources;
    use crate::types::Share;
    use crate::types::TaskInstance;
    use crate::types::TaskRecord;

    /// Store that serves a fixed set of records and remembers every window queried.
    struct WindowStore {
        records: Vec<TaskRecord>,
        windows: Mutex<Vec<(u64, u64)>>,
        fail: bool,
    }

    fn record(job_id: &str, end_ms: u64) -> TaskRecord {
        TaskRecord {
            job: Job {
                id: job_id.into(),
                command: "true".into(),
                user: "u".into(),
                name: None,
                priority: 50,
                max_retries: 1,
                max_runtime_ms: 60_000,
                disable_mea_culpa_retries: false,
                resources: Resources::new(1.0, 64.0),
                submit_time_ms: 0,
                expected_runtime_ms: None,
                group: None,
                labels: Default::default(),
            },
            instance: TaskInstance {
                task_id: format!("{job_id}-t"),
                job_id: job_id.into(),
                hostname: "h".into(),
                slave_id: "s".into(),
                scheduled_at_ms: Some(1),
                start_time_ms: 1,
                end_time_ms: Some(end_ms),
                status: InstanceStatus::Success,
                reason: None,
            },
        }
    }

    #[async_trait]
    impl JobStore for WindowStore {
        async fn set_shares(&self, _: &[Share]) -> Result<(), StoreError> {
            Ok(())
        }
        async fn submit(&self, _: Job) -> Result<(), StoreError> {
            Ok(())
        }
        async fn submission_exists_at(&self, _: u64) -> Result<bool, StoreError> {
            Ok(true)
        }
        async fn running_task_ids(&self) -> Result<BTreeSet<String>, StoreError> {
            Ok(BTreeSet::new())
        }
        async fn running_instances(&self) -> Result<Vec<TaskInstance>, StoreError> {
            Ok(Vec::new())
        }
        async fn instances_ended_between(&self, start_ms: u64, end_ms: u64) -> Result<Vec<TaskRecord>, StoreError> {
            self.windows.lock().await.push((start_ms, end_ms));
            if self.fail {
                return Err(StoreError::Unavailable {
                    reason: "offline".into(),
                });
            }
            Ok(self
                .records
                .iter()
                .filter(|r| r.instance.end_time_ms.is_some_and(|t| t >= start_ms && t < end_ms))
                .cloned()
                .collect())
        }
        async fn has_unfinished_jobs(&self) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn task_records(&self) -> Result<Vec<TaskRecord>, StoreError> {
            Ok(self.records.clone())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn windows_are_contiguous_and_rows_land_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("incremental.csv");
        let store = Arc::new(WindowStore {
            records: vec![record("a", 5), record("b", 15), record("c", 25)],
            windows: Mutex::new(Vec::new()),
            fail: false,
        });
        let clock = SimulatedClock::new(0);

        let handle = IncrementalTraceWriter::new(store.clone(), &path, 100)
            .with_clock(Arc::new(clock.clone()))
            .spawn();

        clock.freeze(10);
        tokio::time::sleep(Duration::from_millis(150)).await;
        clock.freeze(20);
        tokio::time::sleep(Duration::from_millis(100)).await;
        clock.freeze(30);
        handle.shutdown().await;

        let windows = store.windows.lock().await.clone();
        assert_eq!(windows, vec![(0, 10), (10, 20), (20, 30)]);

        let ids: Vec<String> = read_rows(&path).unwrap().into_iter().map(|r| r.job_id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_advance_checkpoint_and_keep_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never.csv");
        let store = Arc::new(WindowStore {
            records: vec![record("a", 5)],
            windows: Mutex::new(Vec::new()),
            fail: true,
        });
        let clock = SimulatedClock::new(0);

        let handle = IncrementalTraceWriter::new(store.clone(), &path, 50)
            .with_clock(Arc::new(clock.clone()))
            .spawn();

        clock.freeze(10);
        tokio::time::sleep(Duration::from_millis(60)).await;
        clock.freeze(20);
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await;

        let windows = store.windows.lock().await.clone();
        assert_eq!(windows, vec![(0, 10), (10, 20), (20, 20)]);
        assert!(!path.exists());
    }
}
