//! The four-operation command boundary (plus process termination)
//!
//! Scans and process operations run on the blocking pool so they never stall the
//! forwarding data path. Scan results are advisory: the registry, not the
//! scanner, is authoritative for port-conflict decisions.

use portgate_forward::{ForwardError, TunnelEngine};
use portgate_proto::{ForwardRule, PortInfo};
use portgate_registry::{RegistryError, RuleRegistry};
use portgate_scan::{PortScanner, ProcessController, ProcessError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

/// Errors surfaced at the command boundary
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Forward(#[from] ForwardError),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// The command surface consumed by the presentation layer
pub struct PortGate {
    scanner: Arc<PortScanner>,
    processes: Arc<ProcessController>,
    registry: Arc<RuleRegistry>,
    engine: Arc<TunnelEngine>,
}

impl PortGate {
    pub fn new() -> Self {
        let registry = Arc::new(RuleRegistry::new());
        Self {
            scanner: Arc::new(PortScanner::new()),
            processes: Arc::new(ProcessController::new()),
            engine: Arc::new(TunnelEngine::new(registry.clone())),
            registry,
        }
    }

    /// Construct with a custom stop grace period for the engine
    pub fn with_stop_grace(grace: Duration) -> Self {
        let registry = Arc::new(RuleRegistry::new());
        Self {
            scanner: Arc::new(PortScanner::new()),
            processes: Arc::new(ProcessController::new()),
            engine: Arc::new(TunnelEngine::new(registry.clone()).with_stop_grace(grace)),
            registry,
        }
    }

    /// Fresh snapshot of listening sockets; always succeeds, possibly partial
    ///
    /// Entries whose name the socket-table walk could not resolve get one more
    /// best-effort lookup through the process controller before they are
    /// reported with `process_name: None`.
    pub async fn list_ports(&self) -> Vec<PortInfo> {
        let scanner = self.scanner.clone();
        let processes = self.processes.clone();

        let snapshot = tokio::task::spawn_blocking(move || {
            let mut ports = scanner.scan();
            resolve_missing_names(&mut ports, &processes);
            ports
        })
        .await;

        match snapshot {
            Ok(ports) => ports,
            Err(e) => {
                error!(error = %e, "Port scan task failed; returning empty snapshot");
                Vec::new()
            }
        }
    }

    /// Snapshot of all forwarding rules, state included
    pub async fn list_rules(&self) -> Vec<ForwardRule> {
        self.registry.list()
    }

    /// Reserve a local port and start forwarding it to `remote_address`
    ///
    /// Fails with RuleConflict, InvalidAddress or PortBindFailed; a failed start
    /// leaves no partial rule behind.
    pub async fn start_forward(
        &self,
        local_port: u16,
        remote_address: &str,
    ) -> Result<ForwardRule, CommandError> {
        let rule = self.registry.reserve(local_port, remote_address)?;
        let rule = self.engine.start(rule).await?;
        Ok(rule)
    }

    /// Stop a forwarding rule by id
    pub async fn stop_forward(&self, id: &str) -> Result<(), CommandError> {
        self.engine.stop(id).await?;
        Ok(())
    }

    /// Deliver a termination request to the process with the given pid
    pub async fn terminate_process(&self, pid: i32) -> Result<(), CommandError> {
        let processes = self.processes.clone();
        let result = tokio::task::spawn_blocking(move || processes.terminate(pid)).await;
        match result {
            Ok(outcome) => Ok(outcome?),
            Err(e) => {
                warn!(pid, error = %e, "Termination task failed");
                Err(CommandError::Process(ProcessError::TerminationFailed(pid)))
            }
        }
    }

    /// Stop every active rule; bounded even with ill-behaved remote peers
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }
}

impl Default for PortGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Backfill names the socket-table walk left unresolved
///
/// The scanner reports a bare pid when a process's fd table was readable but
/// its stat was not; the controller gets one more chance at the name before
/// the entry goes out with `process_name: None`.
fn resolve_missing_names(ports: &mut [PortInfo], processes: &ProcessController) {
    for entry in ports {
        if entry.process_name.is_none() {
            if let Some(pid) = entry.pid {
                entry.process_name = processes.resolve_name(pid);
            }
        }
    }
}
