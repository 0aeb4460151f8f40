//! PortGate high-level API
//!
//! `PortGate` is the command boundary a presentation layer polls: list ports,
//! list rules, start and stop forwarding rules, terminate processes. It composes
//! the scanner, the process controller, the rule registry and the forwarding
//! engine; it owns no policy of its own.

pub mod facade;

pub use facade::{CommandError, PortGate};
pub use portgate_forward::{ForwardError, TunnelEngine};
pub use portgate_proto::{AddressError, ForwardRule, PortInfo, Protocol, RemoteAddress, RuleState};
pub use portgate_registry::{RegistryError, RuleRegistry};
pub use portgate_scan::{PortScanner, ProcessController, ProcessError};
