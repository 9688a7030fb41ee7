//! The batch migration loop.
//!
//! One worker per `(table, column)` job. Control signals arrive on a
//! single queue and are honoured at batch boundaries; a row UPDATE is
//! never interrupted mid-flight. Row failures are retried with backoff
//! and then counted; only structural failures (count or batch queries)
//! fail the whole job.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use quotient_shared::config::BackfillSettings;
use quotient_shared::exception::{QuotientError, QuotientResult};
use quotient_shared::metrics::MetricsSink;
use quotient_shared::rounding::Engine;

use crate::progress::Progress;
use crate::store::{BackfillStore, PendingRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Pause,
    Resume,
    Stop,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub batch_size: u32,
    pub sleep_interval: Duration,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    pub id_column: String,
}

impl WorkerSettings {
    pub fn from_settings(settings: &BackfillSettings) -> Self {
        Self {
            batch_size: settings.batch_size,
            sleep_interval: settings.sleep_interval(),
            retry_attempts: settings.retry_attempts,
            retry_backoff: settings.retry_backoff(),
            id_column: settings.id_column.clone(),
        }
    }
}

/// Conversion parameters resolved from the configuration at job start.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub table: String,
    pub source_column: String,
    pub target_column: String,
    pub ratio: u32,
    pub engine: Engine,
}

enum Flow {
    Continue,
    Stop,
}

pub struct Worker {
    store: Arc<dyn BackfillStore>,
    spec: JobSpec,
    settings: WorkerSettings,
    progress: Arc<Progress>,
    control: mpsc::Receiver<ControlSignal>,
    metrics: Arc<dyn MetricsSink>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn BackfillStore>,
        spec: JobSpec,
        settings: WorkerSettings,
        progress: Arc<Progress>,
        control: mpsc::Receiver<ControlSignal>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            store,
            spec,
            settings,
            progress,
            control,
            metrics,
        }
    }

    pub async fn run(mut self) -> QuotientResult<()> {
        self.progress.start();
        info!(
            table = %self.spec.table,
            "backfill job started"
        );

        let total = match self
            .store
            .count_pending(&self.spec.table, &self.spec.target_column)
            .await
        {
            Ok(total) => total,
            Err(error) => return self.fail(error),
        };
        self.progress.set_total(total);
        if total == 0 {
            self.finish();
            return Ok(());
        }

        // Keyset cursor: advances past every visited row, so a row whose
        // migration permanently failed cannot stall the scan.
        let mut cursor: Option<i64> = None;
        loop {
            if let Flow::Stop = self.drain_control().await {
                info!(table = %self.spec.table, "backfill job stopped");
                return Ok(());
            }

            let batch = match self
                .store
                .fetch_batch(
                    &self.spec.table,
                    &self.settings.id_column,
                    &self.spec.source_column,
                    &self.spec.target_column,
                    cursor,
                    self.settings.batch_size,
                )
                .await
            {
                Ok(batch) => batch,
                Err(error) => return self.fail(error),
            };

            if batch.is_empty() {
                self.finish();
                return Ok(());
            }

            for row in batch {
                cursor = Some(cursor.unwrap_or(i64::MIN).max(row.id));
                self.migrate_row(row).await;
            }

            let snapshot = self.progress.snapshot();
            self.metrics
                .set_backfill_progress(&self.spec.table, snapshot.percentage);
            debug!(
                table = %self.spec.table,
                completed = snapshot.completed_rows,
                total = snapshot.total_rows,
                "backfill batch done"
            );

            tokio::time::sleep(self.settings.sleep_interval).await;
        }
    }

    /// Apply queued control signals. Pause parks the loop here until a
    /// Resume or Stop arrives; a dropped controller counts as Stop.
    async fn drain_control(&mut self) -> Flow {
        let mut paused = false;
        loop {
            match self.control.try_recv() {
                Ok(ControlSignal::Pause) => paused = true,
                Ok(ControlSignal::Resume) => paused = false,
                Ok(ControlSignal::Stop) => return self.stopped(),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => return self.stopped(),
            }
        }
        if !paused {
            return Flow::Continue;
        }

        self.progress.pause();
        info!(table = %self.spec.table, "backfill job paused");
        loop {
            match self.control.recv().await {
                Some(ControlSignal::Resume) => {
                    self.progress.resume();
                    info!(table = %self.spec.table, "backfill job resumed");
                    return Flow::Continue;
                }
                Some(ControlSignal::Pause) => {}
                Some(ControlSignal::Stop) | None => return self.stopped(),
            }
        }
    }

    fn stopped(&self) -> Flow {
        // A stopped job that has not finished reads as paused: it can be
        // restarted later and picks up where the NULL scan left off.
        self.progress.pause();
        Flow::Stop
    }

    async fn migrate_row(&self, row: PendingRow) {
        let literal = self
            .spec
            .engine
            .convert_to_literal(Decimal::from(row.value), self.spec.ratio);

        let mut attempt = 0;
        loop {
            match self
                .store
                .write_shadow(
                    &self.spec.table,
                    &self.settings.id_column,
                    &self.spec.target_column,
                    row.id,
                    &literal,
                )
                .await
            {
                Ok(()) => {
                    self.progress.add_completed(1);
                    self.metrics.record_backfill_rows(&self.spec.table, 1);
                    return;
                }
                Err(error) => {
                    attempt += 1;
                    if attempt > self.settings.retry_attempts {
                        warn!(
                            table = %self.spec.table,
                            error = %error,
                            "row migration failed after retries"
                        );
                        self.progress.add_error();
                        self.metrics.record_backfill_error(&self.spec.table);
                        return;
                    }
                    debug!(
                        table = %self.spec.table,
                        attempt,
                        "retrying row migration"
                    );
                    tokio::time::sleep(self.settings.retry_backoff).await;
                }
            }
        }
    }

    fn finish(&self) {
        self.progress.complete();
        self.metrics.set_backfill_progress(&self.spec.table, 100.0);
        info!(table = %self.spec.table, "backfill job completed");
    }

    fn fail(&self, error: QuotientError) -> QuotientResult<()> {
        self.progress.fail();
        self.metrics.record_backfill_error(&self.spec.table);
        warn!(
            table = %self.spec.table,
            error = %error,
            "backfill job failed"
        );
        Err(error)
    }
}
