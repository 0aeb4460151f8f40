//! Rule life cycle management
//!
//! One accept-loop task per active rule, one relay task per accepted connection.
//! Cancellation is cooperative: every blocking boundary (accept, dial, relay)
//! selects on a per-rule watch channel, so a stop is observed promptly even when
//! no inbound connection ever arrives. Stop waits a bounded grace period for
//! tasks to exit on their own, then aborts the stragglers.

use crate::relay::{self, RelayError};
use portgate_proto::{ForwardRule, RemoteAddress, RuleState};
use portgate_registry::{RegistryError, RuleRegistry};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default grace period a stop waits for tasks before aborting them
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);

/// Forwarding engine errors
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Failed to bind local port {port}: {reason}")]
    PortBindFailed { port: u16, reason: String },

    #[error("Rule not found: {0}")]
    RuleNotFound(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Runtime state of one active rule
struct ActiveTunnel {
    shutdown: watch::Sender<bool>,
    accept_handle: JoinHandle<()>,
    sessions: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
}

/// Owns the life cycle of every active forwarding rule
pub struct TunnelEngine {
    registry: Arc<RuleRegistry>,
    tunnels: Mutex<HashMap<String, ActiveTunnel>>,
    stop_grace: Duration,
}

impl TunnelEngine {
    pub fn new(registry: Arc<RuleRegistry>) -> Self {
        Self {
            registry,
            tunnels: Mutex::new(HashMap::new()),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// Override the stop grace period
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ActiveTunnel>> {
        self.tunnels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind the rule's local port and start its accept loop
    ///
    /// Returns as soon as the listener is bound; the accept loop runs
    /// independently until the rule is stopped. On bind failure the rule is
    /// marked failed and removed from the registry, never left dangling.
    pub async fn start(&self, rule: ForwardRule) -> Result<ForwardRule, ForwardError> {
        self.registry.mark_binding(&rule.id)?;

        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, rule.local_port));
        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                let reason = e.to_string();
                let _ = self.registry.mark_failed(&rule.id, &reason);
                let _ = self.registry.remove(&rule.id);
                warn!(rule_id = %rule.id, port = rule.local_port, %reason, "Bind failed");
                return Err(ForwardError::PortBindFailed {
                    port: rule.local_port,
                    reason,
                });
            }
        };

        let bound_port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                let reason = e.to_string();
                let _ = self.registry.mark_failed(&rule.id, &reason);
                let _ = self.registry.remove(&rule.id);
                return Err(ForwardError::PortBindFailed {
                    port: rule.local_port,
                    reason,
                });
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sessions: Arc<Mutex<HashMap<u64, JoinHandle<()>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let accept_handle = tokio::spawn(accept_loop(
            rule.id.clone(),
            listener,
            rule.remote_address.clone(),
            shutdown_rx,
            sessions.clone(),
        ));

        // Register the runtime state before flipping the rule to Active so a
        // concurrent stop always finds something it can cancel.
        self.lock().insert(
            rule.id.clone(),
            ActiveTunnel {
                shutdown: shutdown_tx,
                accept_handle,
                sessions,
            },
        );

        if let Err(e) = self.registry.mark_active(&rule.id, bound_port) {
            // A stop raced this start and took the rule away; tear down the
            // loop we just spawned so the listener is released.
            if let Some(tunnel) = self.lock().remove(&rule.id) {
                let _ = tunnel.shutdown.send(true);
                tunnel.accept_handle.abort();
            }
            warn!(rule_id = %rule.id, "Rule withdrawn during bind; listener released");
            return Err(e.into());
        }

        info!(
            rule_id = %rule.id,
            local_port = bound_port,
            remote_address = %rule.remote_address,
            "Forwarding rule active"
        );

        let mut started = rule;
        started.local_port = bound_port;
        started.state = RuleState::Active;
        Ok(started)
    }

    /// Stop a rule: cancel its accept loop, release the port, close its sessions
    ///
    /// Idempotent against concurrent stop calls: the first caller tears the rule
    /// down; a caller that finds the rule already in `Stopping` returns Ok. A
    /// stop that arrives while the rule is still Pending or Binding withdraws it
    /// from the registry, which makes the in-flight start fail its next
    /// transition and release whatever it bound. RuleNotFound only when the
    /// registry has no such rule at all.
    pub async fn stop(&self, id: &str) -> Result<(), ForwardError> {
        let tunnel = match self.lock().remove(id) {
            Some(tunnel) => tunnel,
            None => match self.registry.withdraw_if_starting(id) {
                Ok(RuleState::Pending | RuleState::Binding) => {
                    info!(rule_id = %id, "Rule withdrawn before its listener came up");
                    return Ok(());
                }
                // The engine registers the runtime entry before marking Active,
                // so an Active rule with no entry means the entry appeared after
                // our first look. Re-check; a second miss means a concurrent
                // stop claimed it.
                Ok(RuleState::Active) => match self.lock().remove(id) {
                    Some(tunnel) => tunnel,
                    None => return Ok(()),
                },
                // Stopping (or terminal): another stop already owns teardown
                Ok(_) => return Ok(()),
                Err(_) => return Err(ForwardError::RuleNotFound(id.to_string())),
            },
        };

        let _ = self.registry.mark_stopping(id);
        let _ = tunnel.shutdown.send(true);

        // The accept loop observes the signal at its next poll; the listener is
        // dropped when the loop exits, releasing the port.
        let mut accept_handle = tunnel.accept_handle;
        if tokio::time::timeout(self.stop_grace, &mut accept_handle)
            .await
            .is_err()
        {
            warn!(rule_id = %id, "Accept loop did not exit within grace; aborting");
            accept_handle.abort();
        }

        // In-flight sessions are force-closed rather than drained; slow or hung
        // peers must not delay the stop beyond the grace period.
        let mut session_handles: Vec<JoinHandle<()>> = {
            let mut sessions = tunnel.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        let aborts: Vec<_> = session_handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(
            self.stop_grace,
            futures::future::join_all(session_handles.iter_mut()),
        )
        .await
        .is_err()
        {
            warn!(rule_id = %id, "Sessions did not exit within grace; aborting");
            for abort in aborts {
                abort.abort();
            }
        }

        let _ = self.registry.remove(id);
        info!(rule_id = %id, "Forwarding rule stopped");
        Ok(())
    }

    /// Stop every active rule concurrently
    ///
    /// Bounded by the same grace period as individual stops; ill-behaved remote
    /// peers cannot hang process shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.lock().keys().cloned().collect();
        if ids.is_empty() {
            return;
        }
        debug!(rules = ids.len(), "Stopping all forwarding rules");
        futures::future::join_all(ids.iter().map(|id| self.stop(id))).await;
    }

    /// Number of rules with a running accept loop
    pub fn active_count(&self) -> usize {
        self.lock().len()
    }
}

/// Accept inbound connections for one rule until cancelled
///
/// Every accepted connection gets its own relay task. A connection-level failure
/// (dial refused, mid-stream error) is logged and absorbed; the loop keeps
/// accepting regardless.
async fn accept_loop(
    rule_id: String,
    listener: TcpListener,
    remote_address: RemoteAddress,
    mut shutdown: watch::Receiver<bool>,
    sessions: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
) {
    let mut next_session: u64 = 0;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                // A dropped sender means the engine let go of this rule
                if changed.is_err() || *shutdown.borrow_and_update() {
                    break;
                }
            }
            res = listener.accept() => match res {
                Ok((client, peer_addr)) => {
                    let session_id = next_session;
                    next_session += 1;
                    debug!(%rule_id, session_id, %peer_addr, "Accepted inbound connection");

                    let task_rule_id = rule_id.clone();
                    let task_remote = remote_address.clone();
                    let mut task_shutdown = shutdown.clone();
                    let handle = tokio::spawn(async move {
                        match relay::run_session(
                            &task_rule_id,
                            session_id,
                            client,
                            &task_remote,
                            &mut task_shutdown,
                        )
                        .await
                        {
                            Ok(Some((to_remote, to_client))) => debug!(
                                rule_id = %task_rule_id,
                                session_id,
                                bytes_to_remote = to_remote,
                                bytes_to_client = to_client,
                                "Session complete"
                            ),
                            Ok(None) => {}
                            Err(RelayError::DialFailed { address, source }) => debug!(
                                rule_id = %task_rule_id,
                                session_id,
                                %address,
                                error = %source,
                                "Dial failed; inbound connection dropped"
                            ),
                            Err(RelayError::Io(e)) => debug!(
                                rule_id = %task_rule_id,
                                session_id,
                                error = %e,
                                "Session ended with IO error"
                            ),
                        }
                    });

                    let mut sessions = sessions.lock().unwrap_or_else(PoisonError::into_inner);
                    sessions.retain(|_, h| !h.is_finished());
                    sessions.insert(session_id, handle);
                }
                Err(e) => {
                    warn!(%rule_id, error = %e, "Accept failed");
                }
            }
        }
    }

    debug!(%rule_id, "Accept loop exited; listener released");
}
