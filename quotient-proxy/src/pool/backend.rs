//! Owned backend connection wrapper.
//!
//! A `BackendConn` is exclusively owned: by the pool's idle queue when
//! idle, by one session while leased. The pool capacity permit travels
//! inside the struct and is dropped when the connection is released or
//! closed.

use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;

#[derive(Debug)]
pub struct BackendConn {
    stream: TcpStream,
    conn_id: u64,
    created_at: Instant,
    last_used_at: Instant,
    in_transaction: bool,
    database: String,
    permit: Option<OwnedSemaphorePermit>,
}

impl BackendConn {
    pub fn new(stream: TcpStream, conn_id: u64, permit: OwnedSemaphorePermit) -> Self {
        let now = Instant::now();
        Self {
            stream,
            conn_id,
            created_at: now,
            last_used_at: now,
            in_transaction: false,
            database: String::new(),
            permit: Some(permit),
        }
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn set_in_transaction(&mut self, in_transaction: bool) {
        self.in_transaction = in_transaction;
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn set_database(&mut self, database: impl Into<String>) {
        self.database = database.into();
    }

    pub fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used_at.elapsed()
    }

    /// Attach the pool capacity permit for the lease duration.
    pub(super) fn attach_permit(&mut self, permit: OwnedSemaphorePermit) {
        self.permit = Some(permit);
    }

    /// Detach the permit when the connection moves to the idle queue.
    pub(super) fn detach_permit(&mut self) {
        self.permit = None;
    }

    /// Non-blocking liveness probe. An idle backend connection must have
    /// no pending bytes: readable data or EOF both mean it is unusable.
    pub fn is_live(&self) -> bool {
        let mut probe = [0u8; 1];
        match self.stream.try_read(&mut probe) {
            Ok(0) => false,
            Ok(_) => false,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }

    /// Reset session-scoped state before the connection re-enters the idle
    /// queue. Fails when the socket no longer passes the liveness probe.
    pub fn reset(&mut self) -> bool {
        if !self.is_live() {
            return false;
        }
        self.in_transaction = false;
        self.database.clear();
        self.touch();
        true
    }
}
