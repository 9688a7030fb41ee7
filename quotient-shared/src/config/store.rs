//! Hot-reloadable configuration store.
//!
//! The store owns the canonical snapshot reference. Publication is
//! all-or-nothing: `install` validates, then atomically swaps the shared
//! `Arc` and wakes subscribers. Readers on the hot path call [`ConfigStore::current`]
//! and never observe a half-updated snapshot.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use super::ConversionSnapshot;
use crate::exception::QuotientResult;

pub struct ConfigStore {
    tx: watch::Sender<Arc<ConversionSnapshot>>,
}

impl ConfigStore {
    /// Create a store with a validated initial snapshot.
    pub fn new(initial: ConversionSnapshot) -> QuotientResult<Self> {
        initial.validate()?;
        let (tx, _rx) = watch::channel(Arc::new(initial.normalized()));
        Ok(Self { tx })
    }

    /// Current snapshot. Cheap; safe to call per statement.
    pub fn current(&self) -> Arc<ConversionSnapshot> {
        self.tx.borrow().clone()
    }

    /// Validate and atomically publish a new snapshot. Publishing a
    /// snapshot structurally equal to the current one is a no-op.
    pub fn install(&self, snapshot: ConversionSnapshot) -> QuotientResult<()> {
        snapshot.validate()?;
        let snapshot = Arc::new(snapshot.normalized());
        if **self.tx.borrow() == *snapshot {
            return Ok(());
        }
        info!(
            tables = snapshot.tables.len(),
            ratio = snapshot.ratio,
            precision = snapshot.precision,
            "installed new conversion configuration"
        );
        self.tx.send_replace(snapshot);
        Ok(())
    }

    /// Subscribe to snapshot updates. Slow subscribers are coalesced to the
    /// latest snapshot; delivery is monotonic per subscriber.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ConversionSnapshot>> {
        self.tx.subscribe()
    }
}
