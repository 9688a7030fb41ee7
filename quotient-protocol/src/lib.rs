//! MySQL client/server wire protocol layer.
//!
//! Everything here is capability-agnostic byte plumbing: length-prefixed
//! packet framing, the command byte catalogue, and payload discriminators
//! for OK/ERR/EOF and the authentication exchange. Nothing in this crate
//! interprets result-set rows.

pub mod commands;
pub mod error;
pub mod packet;
pub mod payload;

pub use error::{ProtocolError, ProtocolResult};
pub use packet::{read_packet, write_packet, Packet, MAX_PAYLOAD};
