//! Port snapshot types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transport protocol of a scanned socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One listening socket observed by a scan
///
/// Regenerated from scratch on every scan; `pid` and `process_name` are `None`
/// when ownership could not be resolved (insufficient privilege, or the process
/// exited between the socket query and the process query).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub port: u16,
    pub pid: Option<i32>,
    pub process_name: Option<String>,
    pub protocol: Protocol,
}
