//! Transparent MySQL dual-write proxy.
//!
//! Sessions relay the wire protocol between a client and a pooled backend
//! connection, rewriting INSERT/UPDATE statements that touch configured
//! currency columns so the converted decimal value is written in the same
//! statement.

pub mod pool;
pub mod server;
pub mod session;
pub mod sql;

pub use pool::{BackendPool, PoolConfig};
pub use server::ProxyServer;
