//! Forwarding rule registry
//!
//! The registry is the sole owner of `ForwardRule` values and the sole authority
//! for rule identity and port-conflict detection. All mutations run under a single
//! mutex-guarded critical section that only touches in-memory metadata; no network
//! I/O ever happens while the lock is held, so hold time is bounded and independent
//! of proxy throughput.

use portgate_proto::{AddressError, ForwardRule, RemoteAddress, RuleState};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, trace};
use uuid::Uuid;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Local port {local_port} is already claimed by rule {existing_id}")]
    RuleConflict { local_port: u16, existing_id: String },

    #[error("Invalid remote address: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("Rule not found: {0}")]
    RuleNotFound(String),
}

/// Concurrency-safe store of forwarding rules and their runtime state
pub struct RuleRegistry {
    rules: Mutex<HashMap<String, ForwardRule>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ForwardRule>> {
        self.rules.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically check the port-uniqueness invariant and insert a new rule
    ///
    /// The check and the insert happen under one lock acquisition: of any number
    /// of concurrent `reserve` calls for the same port, exactly one succeeds.
    /// Every rule that has not reached a terminal state is considered to hold its
    /// port: a `Pending` rule is about to bind and a `Stopping` rule may not have
    /// released its listener yet. Port 0 requests an ephemeral port and skips the
    /// uniqueness check; the real port is recorded by `mark_active`.
    pub fn reserve(
        &self,
        local_port: u16,
        remote_address: &str,
    ) -> Result<ForwardRule, RegistryError> {
        let remote_address = RemoteAddress::parse(remote_address)?;

        let mut rules = self.lock();

        if local_port != 0 {
            if let Some(existing) = rules
                .values()
                .find(|r| r.local_port == local_port && !r.state.is_terminal())
            {
                return Err(RegistryError::RuleConflict {
                    local_port,
                    existing_id: existing.id.clone(),
                });
            }
        }

        let rule = ForwardRule {
            id: Uuid::new_v4().to_string(),
            local_port,
            remote_address,
            state: RuleState::Pending,
            error_message: None,
        };

        debug!(
            rule_id = %rule.id,
            local_port = rule.local_port,
            remote_address = %rule.remote_address,
            "Reserved forwarding rule"
        );

        rules.insert(rule.id.clone(), rule.clone());
        Ok(rule)
    }

    /// Snapshot of all rules, state included
    pub fn list(&self) -> Vec<ForwardRule> {
        self.lock().values().cloned().collect()
    }

    /// Look up a rule by id
    pub fn get(&self, id: &str) -> Option<ForwardRule> {
        self.lock().get(id).cloned()
    }

    /// Transition `Pending → Binding`
    pub fn mark_binding(&self, id: &str) -> Result<(), RegistryError> {
        self.transition(id, RuleState::Binding, None)
    }

    /// Transition to `Active`, recording the port the listener actually bound
    ///
    /// For ephemeral-port rules (`local_port == 0`) this is where the OS-assigned
    /// port becomes visible to `list` and to later conflict checks.
    pub fn mark_active(&self, id: &str, bound_port: u16) -> Result<(), RegistryError> {
        let mut rules = self.lock();
        let rule = rules
            .get_mut(id)
            .ok_or_else(|| RegistryError::RuleNotFound(id.to_string()))?;
        rule.local_port = bound_port;
        rule.state = RuleState::Active;
        trace!(rule_id = %id, bound_port, "Rule active");
        Ok(())
    }

    /// Transition `Active → Stopping`
    pub fn mark_stopping(&self, id: &str) -> Result<(), RegistryError> {
        self.transition(id, RuleState::Stopping, None)
    }

    /// Transition to `Failed` with a reason
    pub fn mark_failed(&self, id: &str, reason: &str) -> Result<(), RegistryError> {
        self.transition(id, RuleState::Failed, Some(reason.to_string()))
    }

    /// Remove a rule only while it is still Pending or Binding
    ///
    /// Check and removal share one lock acquisition, so a rule that reaches
    /// `Active` concurrently is never withdrawn by mistake. Returns the state
    /// observed at the time of the call.
    pub fn withdraw_if_starting(&self, id: &str) -> Result<RuleState, RegistryError> {
        let mut rules = self.lock();
        let state = rules
            .get(id)
            .map(|r| r.state)
            .ok_or_else(|| RegistryError::RuleNotFound(id.to_string()))?;
        if matches!(state, RuleState::Pending | RuleState::Binding) {
            rules.remove(id);
            debug!(rule_id = %id, from = state.as_str(), "Withdrew rule before activation");
        }
        Ok(state)
    }

    /// Remove a rule, returning its final snapshot
    pub fn remove(&self, id: &str) -> Result<ForwardRule, RegistryError> {
        self.lock()
            .remove(id)
            .map(|rule| {
                debug!(rule_id = %id, "Removed forwarding rule");
                rule
            })
            .ok_or_else(|| RegistryError::RuleNotFound(id.to_string()))
    }

    /// Number of registered rules
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    fn transition(
        &self,
        id: &str,
        state: RuleState,
        error_message: Option<String>,
    ) -> Result<(), RegistryError> {
        let mut rules = self.lock();
        let rule = rules
            .get_mut(id)
            .ok_or_else(|| RegistryError::RuleNotFound(id.to_string()))?;
        trace!(rule_id = %id, from = rule.state.as_str(), to = state.as_str(), "Rule transition");
        rule.state = state;
        rule.error_message = error_message;
        Ok(())
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
