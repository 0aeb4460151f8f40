//! PortGate Protocol Definitions
//!
//! This crate defines the value types shared by the scanner, the rule registry and
//! the forwarding engine: ports, protocols, remote endpoints and forwarding rules.

pub mod address;
pub mod ports;
pub mod rules;

pub use address::{AddressError, RemoteAddress};
pub use ports::{PortInfo, Protocol};
pub use rules::{ForwardRule, RuleState};
