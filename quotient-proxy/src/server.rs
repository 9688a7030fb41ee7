//! TCP listener and session spawner.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info};

use quotient_shared::config::ConfigStore;
use quotient_shared::exception::QuotientResult;
use quotient_shared::metrics::MetricsSink;

use crate::pool::BackendPool;
use crate::session::Session;

pub struct ProxyServer {
    listener: TcpListener,
    pool: Arc<BackendPool>,
    store: Arc<ConfigStore>,
    metrics: Arc<dyn MetricsSink>,
    session_slots: Arc<Semaphore>,
    session_seq: AtomicU64,
    shutdown: watch::Receiver<bool>,
}

impl ProxyServer {
    pub async fn bind(
        listen_addr: &str,
        max_sessions: usize,
        pool: Arc<BackendPool>,
        store: Arc<ConfigStore>,
        metrics: Arc<dyn MetricsSink>,
        shutdown: watch::Receiver<bool>,
    ) -> QuotientResult<Self> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!(address = %listener.local_addr()?, "proxy server listening");
        Ok(Self {
            listener,
            pool,
            store,
            metrics,
            session_slots: Arc::new(Semaphore::new(max_sessions)),
            session_seq: AtomicU64::new(0),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> QuotientResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until the shutdown signal flips. Each session runs
    /// as its own task holding a session slot permit.
    pub async fn run(mut self) -> QuotientResult<()> {
        loop {
            let permit = tokio::select! {
                permit = self.session_slots.clone().acquire_owned() => {
                    match permit {
                        Ok(permit) => permit,
                        Err(_) => return Ok(()),
                    }
                }
                _ = self.shutdown.changed() => {
                    info!("shutdown requested; no longer accepting connections");
                    return Ok(());
                }
            };

            let (socket, peer) = tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!(error = %e, "accept failed");
                            continue;
                        }
                    }
                }
                _ = self.shutdown.changed() => {
                    info!("shutdown requested; no longer accepting connections");
                    return Ok(());
                }
            };

            if let Err(e) = socket.set_nodelay(true) {
                debug!(error = %e, "could not set TCP_NODELAY on client socket");
            }

            let conn_id = self.session_seq.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(conn_id, peer = %peer, "client connected");

            let session = Session::new(
                conn_id,
                Arc::clone(&self.pool),
                Arc::clone(&self.store),
                Arc::clone(&self.metrics),
            );
            tokio::spawn(async move {
                session.run(socket).await;
                drop(permit);
            });
        }
    }
}
