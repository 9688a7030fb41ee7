//! Backfill progress accounting.
//!
//! One `Progress` per job, mutated only by its worker; readers take
//! point-in-time snapshots. Throughput is measured against active run
//! time, so paused stretches do not dilute the rate or the ETA.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

#[derive(Debug)]
struct Inner {
    table: String,
    column: String,
    total: u64,
    completed: u64,
    errors: u64,
    status: JobStatus,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    active: Duration,
    resumed_at: Option<Instant>,
}

impl Inner {
    fn active_time(&self) -> Duration {
        match self.resumed_at {
            Some(resumed_at) => self.active + resumed_at.elapsed(),
            None => self.active,
        }
    }

    fn stop_clock(&mut self) {
        if let Some(resumed_at) = self.resumed_at.take() {
            self.active += resumed_at.elapsed();
        }
    }
}

#[derive(Debug)]
pub struct Progress {
    inner: Mutex<Inner>,
}

impl Progress {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                table: table.into(),
                column: column.into(),
                total: 0,
                completed: 0,
                errors: 0,
                status: JobStatus::Pending,
                started_at: None,
                ended_at: None,
                active: Duration::ZERO,
                resumed_at: None,
            }),
        }
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> Option<R> {
        self.inner.lock().ok().map(|mut inner| f(&mut inner))
    }

    pub fn start(&self) {
        self.with_inner(|inner| {
            inner.status = JobStatus::Running;
            inner.started_at = Some(Utc::now());
            inner.resumed_at = Some(Instant::now());
        });
    }

    pub fn set_total(&self, total: u64) {
        self.with_inner(|inner| inner.total = total);
    }

    pub fn add_completed(&self, rows: u64) {
        self.with_inner(|inner| inner.completed += rows);
    }

    pub fn add_error(&self) {
        self.with_inner(|inner| inner.errors += 1);
    }

    pub fn pause(&self) {
        self.with_inner(|inner| {
            inner.stop_clock();
            inner.status = JobStatus::Paused;
        });
    }

    pub fn resume(&self) {
        self.with_inner(|inner| {
            inner.status = JobStatus::Running;
            inner.resumed_at = Some(Instant::now());
        });
    }

    pub fn complete(&self) {
        self.with_inner(|inner| {
            inner.stop_clock();
            inner.status = JobStatus::Completed;
            inner.ended_at = Some(Utc::now());
        });
    }

    pub fn fail(&self) {
        self.with_inner(|inner| {
            inner.stop_clock();
            inner.status = JobStatus::Failed;
            inner.ended_at = Some(Utc::now());
        });
    }

    pub fn status(&self) -> JobStatus {
        self.with_inner(|inner| inner.status)
            .unwrap_or(JobStatus::Failed)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.with_inner(|inner| {
            let percentage = if inner.total > 0 {
                (inner.completed as f64 / inner.total as f64) * 100.0
            } else if inner.status == JobStatus::Completed {
                100.0
            } else {
                0.0
            };
            let active_secs = inner.active_time().as_secs_f64();
            let rows_per_second = if active_secs > 0.0 {
                inner.completed as f64 / active_secs
            } else {
                0.0
            };
            let eta_seconds = if inner.status == JobStatus::Running && inner.completed > 0 {
                let remaining = inner.total.saturating_sub(inner.completed) as f64;
                Some(remaining / rows_per_second.max(f64::EPSILON))
            } else {
                None
            };
            ProgressSnapshot {
                table: inner.table.clone(),
                column: inner.column.clone(),
                status: inner.status,
                total_rows: inner.total,
                completed_rows: inner.completed,
                errors: inner.errors,
                percentage,
                rows_per_second,
                eta_seconds,
                started_at: inner.started_at,
                ended_at: inner.ended_at,
            }
        })
        .unwrap_or_else(|| ProgressSnapshot {
            table: String::new(),
            column: String::new(),
            status: JobStatus::Failed,
            total_rows: 0,
            completed_rows: 0,
            errors: 0,
            percentage: 0.0,
            rows_per_second: 0.0,
            eta_seconds: None,
            started_at: None,
            ended_at: None,
        })
    }
}

/// Point-in-time view of a job, exported to the management surface.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub table: String,
    pub column: String,
    pub status: JobStatus,
    pub total_rows: u64,
    pub completed_rows: u64,
    pub errors: u64,
    pub percentage: f64,
    pub rows_per_second: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_statuses() {
        let progress = Progress::new("orders", "total_amount");
        assert_eq!(progress.status(), JobStatus::Pending);

        progress.start();
        assert_eq!(progress.status(), JobStatus::Running);

        progress.pause();
        assert_eq!(progress.status(), JobStatus::Paused);

        progress.resume();
        progress.complete();
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.status, JobStatus::Completed);
        assert!(snapshot.ended_at.is_some());
    }

    #[test]
    fn test_percentage_and_counts() {
        let progress = Progress::new("orders", "total_amount");
        progress.start();
        progress.set_total(200);
        progress.add_completed(50);
        progress.add_error();

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.total_rows, 200);
        assert_eq!(snapshot.completed_rows, 50);
        assert_eq!(snapshot.errors, 1);
        assert!((snapshot.percentage - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rate_uses_active_time() {
        let progress = Progress::new("orders", "total_amount");
        progress.start();
        progress.set_total(10);
        std::thread::sleep(Duration::from_millis(20));
        progress.add_completed(5);

        let running = progress.snapshot();
        assert!(running.rows_per_second > 0.0);
        assert!(running.eta_seconds.is_some());

        // While paused, the clock stops and the ETA is withheld.
        progress.pause();
        let paused = progress.snapshot();
        assert!(paused.eta_seconds.is_none());
        let rate_at_pause = paused.rows_per_second;
        std::thread::sleep(Duration::from_millis(20));
        let later = progress.snapshot();
        assert!((later.rows_per_second - rate_at_pause).abs() < 1e-9);
    }

    #[test]
    fn test_empty_table_completion() {
        let progress = Progress::new("orders", "total_amount");
        progress.start();
        progress.set_total(0);
        progress.complete();
        let snapshot = progress.snapshot();
        assert!((snapshot.percentage - 100.0).abs() < f64::EPSILON);
    }
}
