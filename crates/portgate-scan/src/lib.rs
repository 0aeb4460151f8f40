//! Socket-table scanning and process control
//!
//! `PortScanner` produces a fresh snapshot of listening sockets per call;
//! `ProcessController` resolves process names and delivers termination requests.
//! Both are independent of the forwarding data path and never block on it.

pub mod process;
pub mod scanner;

pub use process::{ProcessController, ProcessError};
pub use scanner::PortScanner;
