//! Forwarding rule types
//!
//! A `ForwardRule` is owned by the registry for the lifetime of the process; the
//! forwarding engine refers to rules by id only. The externally visible `active`
//! flag is derived: it is true exactly when the engine state is `Active`.

use crate::address::RemoteAddress;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

/// Life cycle of a forwarding rule
///
/// `Pending → Binding → Active → Stopping → {Stopped, Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleState {
    /// Reserved in the registry, listener not yet bound
    Pending,
    /// Bind in progress
    Binding,
    /// Listener bound, accept loop running
    Active,
    /// Cancellation signalled, listener and sessions winding down
    Stopping,
    /// Fully torn down
    Stopped,
    /// Bind or startup failed
    Failed,
}

impl RuleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleState::Pending => "pending",
            RuleState::Binding => "binding",
            RuleState::Active => "active",
            RuleState::Stopping => "stopping",
            RuleState::Stopped => "stopped",
            RuleState::Failed => "failed",
        }
    }

    /// True once the rule no longer holds its local port
    pub fn is_terminal(&self) -> bool {
        matches!(self, RuleState::Stopped | RuleState::Failed)
    }
}

/// A user-defined TCP forwarding rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRule {
    /// Opaque unique token, generated by the registry
    pub id: String,
    /// Local listening port; 0 requested an ephemeral port until the bind reports back
    pub local_port: u16,
    /// Validated remote endpoint
    pub remote_address: RemoteAddress,
    /// Current engine state
    pub state: RuleState,
    /// Failure reason, set when `state` is `Failed`
    pub error_message: Option<String>,
}

impl ForwardRule {
    /// The externally visible activity flag: true only for engine-state `Active`
    pub fn is_active(&self) -> bool {
        self.state == RuleState::Active
    }
}

impl Serialize for ForwardRule {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut s = serializer.serialize_struct("ForwardRule", 6)?;
        s.serialize_field("id", &self.id)?;
        s.serialize_field("local_port", &self.local_port)?;
        s.serialize_field("remote_address", &self.remote_address)?;
        s.serialize_field("state", self.state.as_str())?;
        s.serialize_field("active", &self.is_active())?;
        s.serialize_field("error_message", &self.error_message)?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(state: RuleState) -> ForwardRule {
        ForwardRule {
            id: "rule-1".to_string(),
            local_port: 8080,
            remote_address: RemoteAddress::parse("127.0.0.1:9000").unwrap(),
            state,
            error_message: None,
        }
    }

    #[test]
    fn test_active_flag_tracks_engine_state() {
        assert!(rule(RuleState::Active).is_active());
        for state in [
            RuleState::Pending,
            RuleState::Binding,
            RuleState::Stopping,
            RuleState::Stopped,
            RuleState::Failed,
        ] {
            assert!(!rule(state).is_active(), "{:?} must not be active", state);
        }
    }

    #[test]
    fn test_rule_json_shape() {
        let json = serde_json::to_value(rule(RuleState::Active)).unwrap();
        assert_eq!(json["id"], "rule-1");
        assert_eq!(json["local_port"], 8080);
        assert_eq!(json["remote_address"], "127.0.0.1:9000");
        assert_eq!(json["state"], "active");
        assert_eq!(json["active"], true);
        assert!(json["error_message"].is_null());
    }

    #[test]
    fn test_terminal_states() {
        assert!(RuleState::Stopped.is_terminal());
        assert!(RuleState::Failed.is_terminal());
        assert!(!RuleState::Stopping.is_terminal());
        assert!(!RuleState::Active.is_terminal());
    }
}
