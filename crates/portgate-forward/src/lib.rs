//! TCP forwarding engine
//!
//! Owns the life cycle of each active forwarding rule: binds the local listener,
//! runs the accept loop, relays bytes to the remote endpoint and tears everything
//! down cooperatively on stop. Rule metadata lives in the registry; this crate
//! only ever refers to rules by id.

pub mod engine;
pub mod relay;

pub use engine::{ForwardError, TunnelEngine};
