//! Job registry for the backfill engine.
//!
//! At most one job per `(table, column)`. Control signals are forwarded
//! to the owning worker's queue; status is a snapshot read that never
//! touches the worker's hot path.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use quotient_shared::config::ConfigStore;
use quotient_shared::exception::{QuotientError, QuotientResult};
use quotient_shared::metrics::MetricsSink;
use quotient_shared::rounding::Engine;

use crate::progress::{Progress, ProgressSnapshot};
use crate::store::BackfillStore;
use crate::worker::{ControlSignal, JobSpec, Worker, WorkerSettings};

struct JobHandle {
    control: mpsc::Sender<ControlSignal>,
    progress: Arc<Progress>,
    task: JoinHandle<()>,
}

pub struct BackfillController {
    store: Arc<dyn BackfillStore>,
    config: Arc<ConfigStore>,
    settings: WorkerSettings,
    metrics: Arc<dyn MetricsSink>,
    jobs: Mutex<HashMap<(String, String), JobHandle>>,
}

impl BackfillController {
    pub fn new(
        store: Arc<dyn BackfillStore>,
        config: Arc<ConfigStore>,
        settings: WorkerSettings,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            store,
            config,
            settings,
            metrics,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Start a job for one `(table, column)` pair. The conversion
    /// parameters are resolved from the current snapshot at start time.
    pub async fn start(&self, table: &str, column: &str) -> QuotientResult<Arc<Progress>> {
        let snapshot = self.config.current();
        let rule = snapshot
            .table_rule(table)
            .ok_or_else(|| QuotientError::NotFound(format!("no rewrite rule for table {table}")))?;
        let column_rule = rule.column_rule(column).ok_or_else(|| {
            QuotientError::NotFound(format!("no rewrite rule for column {table}.{column}"))
        })?;

        let key = (table.to_ascii_lowercase(), column.to_ascii_lowercase());
        let mut jobs = self.jobs.lock().await;
        if let Some(existing) = jobs.get(&key) {
            if !existing.task.is_finished() {
                return Err(QuotientError::AlreadyRunning {
                    job: format!("{table}.{column}"),
                });
            }
        }

        let spec = JobSpec {
            table: key.0.clone(),
            source_column: key.1.clone(),
            target_column: column_rule.target_column.clone(),
            ratio: snapshot.ratio,
            engine: Engine::new(
                column_rule.effective_mode(&snapshot),
                column_rule.effective_precision(&snapshot),
            ),
        };
        let progress = Arc::new(Progress::new(&spec.table, &spec.source_column));
        let (control, control_rx) = mpsc::channel(8);
        let worker = Worker::new(
            Arc::clone(&self.store),
            spec,
            self.settings.clone(),
            Arc::clone(&progress),
            control_rx,
            Arc::clone(&self.metrics),
        );
        let task = tokio::spawn(async move {
            // Failures are recorded on the progress by the worker itself.
            let _ = worker.run().await;
        });

        info!(table = %key.0, "backfill job registered");
        jobs.insert(
            key,
            JobHandle {
                control,
                progress: Arc::clone(&progress),
                task,
            },
        );
        Ok(progress)
    }

    pub async fn pause(&self, table: &str, column: &str) -> QuotientResult<()> {
        self.signal(table, column, ControlSignal::Pause).await
    }

    pub async fn resume(&self, table: &str, column: &str) -> QuotientResult<()> {
        self.signal(table, column, ControlSignal::Resume).await
    }

    pub async fn stop(&self, table: &str, column: &str) -> QuotientResult<()> {
        self.signal(table, column, ControlSignal::Stop).await
    }

    async fn signal(&self, table: &str, column: &str, signal: ControlSignal) -> QuotientResult<()> {
        let key = (table.to_ascii_lowercase(), column.to_ascii_lowercase());
        let jobs = self.jobs.lock().await;
        let handle = jobs
            .get(&key)
            .ok_or_else(|| QuotientError::NotFound(format!("no backfill job for {table}.{column}")))?;
        handle.control.send(signal).await.map_err(|_| {
            QuotientError::NotFound(format!("backfill job for {table}.{column} is not running"))
        })
    }

    /// Snapshots for every known job, running or finished.
    pub async fn status(&self) -> Vec<ProgressSnapshot> {
        let jobs = self.jobs.lock().await;
        jobs.values()
            .map(|handle| handle.progress.snapshot())
            .collect()
    }

    /// Signal every running job to stop and wait for the workers to park.
    pub async fn stop_all(&self) {
        let mut jobs = self.jobs.lock().await;
        for ((table, column), handle) in jobs.iter() {
            if !handle.task.is_finished() && handle.control.send(ControlSignal::Stop).await.is_err()
            {
                warn!(table = %table, column = %column, "backfill job already gone");
            }
        }
        for handle in jobs.values_mut() {
            if let Err(error) = (&mut handle.task).await {
                if !error.is_cancelled() {
                    warn!(error = %error, "backfill task join failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::JobStatus;
    use crate::store::PendingRow;
    use async_trait::async_trait;
    use quotient_shared::config::{ColumnRule, ConversionSnapshot, TableRule};
    use quotient_shared::metrics::NoopSink;
    use quotient_shared::rounding::RoundingMode;
    use std::collections::{BTreeMap, HashMap as StdHashMap};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct SlowStore {
        rows: StdMutex<BTreeMap<i64, (i64, Option<String>)>>,
        delay: Duration,
    }

    #[async_trait]
    impl BackfillStore for SlowStore {
        async fn count_pending(&self, _table: &str, _target: &str) -> QuotientResult<u64> {
            let rows = self.rows.lock().unwrap();
            Ok(rows.values().filter(|(_, shadow)| shadow.is_none()).count() as u64)
        }

        async fn fetch_batch(
            &self,
            _table: &str,
            _id_column: &str,
            _source: &str,
            _target: &str,
            after_id: Option<i64>,
            limit: u32,
        ) -> QuotientResult<Vec<PendingRow>> {
            tokio::time::sleep(self.delay).await;
            let rows = self.rows.lock().unwrap();
            let floor = after_id.unwrap_or(i64::MIN);
            Ok(rows
                .iter()
                .filter(|(id, (_, shadow))| **id > floor && shadow.is_none())
                .take(limit as usize)
                .map(|(id, (value, _))| PendingRow {
                    id: *id,
                    value: *value,
                })
                .collect())
        }

        async fn write_shadow(
            &self,
            _table: &str,
            _id_column: &str,
            _target: &str,
            id: i64,
            value: &str,
        ) -> QuotientResult<()> {
            let mut rows = self.rows.lock().unwrap();
            if let Some(row) = rows.get_mut(&id) {
                row.1 = Some(value.to_string());
            }
            Ok(())
        }
    }

    fn config_store() -> Arc<ConfigStore> {
        let snapshot = ConversionSnapshot {
            ratio: 1000,
            precision: 4,
            rounding_mode: RoundingMode::Bankers,
            tables: StdHashMap::from([(
                "orders".to_string(),
                TableRule {
                    enabled: true,
                    columns: StdHashMap::from([(
                        "total_amount".to_string(),
                        ColumnRule {
                            target_column: "total_amount_idn".to_string(),
                            precision: None,
                            rounding_mode: None,
                        },
                    )]),
                },
            )]),
        };
        Arc::new(ConfigStore::new(snapshot).unwrap())
    }

    fn controller(store: Arc<SlowStore>) -> BackfillController {
        BackfillController::new(
            store,
            config_store(),
            WorkerSettings {
                batch_size: 10,
                sleep_interval: Duration::from_millis(1),
                retry_attempts: 1,
                retry_backoff: Duration::from_millis(1),
                id_column: "id".to_string(),
            },
            Arc::new(NoopSink),
        )
    }

    fn store_with_rows(count: i64, delay: Duration) -> Arc<SlowStore> {
        let store = SlowStore {
            rows: StdMutex::new(BTreeMap::new()),
            delay,
        };
        {
            let mut rows = store.rows.lock().unwrap();
            for id in 1..=count {
                rows.insert(id, (id * 1_000, None));
            }
        }
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_start_runs_job_to_completion() {
        let store = store_with_rows(5, Duration::ZERO);
        let controller = controller(store.clone());

        let progress = controller.start("orders", "total_amount").await.unwrap();
        for _ in 0..100 {
            if progress.status() == JobStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(progress.status(), JobStatus::Completed);
        assert_eq!(
            store.rows.lock().unwrap()[&1].1.as_deref(),
            Some("1.0000")
        );
    }

    #[tokio::test]
    async fn test_duplicate_start_is_rejected() {
        let store = store_with_rows(1_000, Duration::from_millis(20));
        let controller = controller(store);

        controller.start("orders", "total_amount").await.unwrap();
        let err = controller
            .start("orders", "TOTAL_AMOUNT")
            .await
            .unwrap_err();
        assert!(matches!(err, QuotientError::AlreadyRunning { .. }));

        controller.stop_all().await;
    }

    #[tokio::test]
    async fn test_finished_job_can_be_restarted() {
        let store = store_with_rows(2, Duration::ZERO);
        let controller = controller(store.clone());

        let progress = controller.start("orders", "total_amount").await.unwrap();
        for _ in 0..100 {
            if progress.status() == JobStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(progress.status(), JobStatus::Completed);

        // Nothing left to do, but starting again is legal once finished.
        let second = controller.start("orders", "total_amount").await.unwrap();
        for _ in 0..100 {
            if second.status() == JobStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(second.status(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_unknown_table_or_column_rejected() {
        let controller = controller(store_with_rows(0, Duration::ZERO));
        assert!(matches!(
            controller.start("missing", "total_amount").await,
            Err(QuotientError::NotFound(_))
        ));
        assert!(matches!(
            controller.start("orders", "missing").await,
            Err(QuotientError::NotFound(_))
        ));
        assert!(matches!(
            controller.pause("orders", "total_amount").await,
            Err(QuotientError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_pause_and_resume_via_controller() {
        let store = store_with_rows(1_000, Duration::from_millis(5));
        let controller = controller(store);

        let progress = controller.start("orders", "total_amount").await.unwrap();
        controller.pause("orders", "total_amount").await.unwrap();
        for _ in 0..100 {
            if progress.status() == JobStatus::Paused {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(progress.status(), JobStatus::Paused);

        controller.resume("orders", "total_amount").await.unwrap();
        for _ in 0..100 {
            if progress.status() == JobStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(progress.status(), JobStatus::Running);

        controller.stop("orders", "total_amount").await.unwrap();
        controller.stop_all().await;
        let statuses = controller.status().await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status, JobStatus::Paused);
    }
}
