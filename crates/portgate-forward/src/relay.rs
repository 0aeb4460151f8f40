//! Per-connection bidirectional relay
//!
//! One relay session per accepted connection: dial the remote endpoint, then
//! shuttle bytes in both directions unmodified until either side closes, an I/O
//! error occurs, or the rule is stopped. A failed session never outlives its own
//! sockets and never affects the rule or other sessions.

use portgate_proto::RemoteAddress;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::debug;

/// Session-local failures; absorbed by the accept loop, never rule-fatal
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to dial {address}: {source}")]
    DialFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("IO error during relay: {0}")]
    Io(#[from] std::io::Error),
}

/// Relay one accepted connection to the remote endpoint
///
/// Returns the byte totals (inbound→remote, remote→inbound) when the session
/// ends by itself. Cancellation closes both sockets by dropping them; either
/// direction reaching EOF or erroring tears down the other.
pub async fn run_session(
    rule_id: &str,
    session_id: u64,
    mut client: TcpStream,
    remote_address: &RemoteAddress,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<(u64, u64)>, RelayError> {
    let connect_to = remote_address.to_connect_string();

    let mut remote = tokio::select! {
        _ = shutdown.wait_for(|stop| *stop) => {
            debug!(rule_id, session_id, "Session cancelled before dial completed");
            return Ok(None);
        }
        res = TcpStream::connect(&connect_to) => res.map_err(|e| RelayError::DialFailed {
            address: connect_to.clone(),
            source: e,
        })?,
    };

    debug!(rule_id, session_id, remote = %connect_to, "Relay established");

    tokio::select! {
        _ = shutdown.wait_for(|stop| *stop) => {
            debug!(rule_id, session_id, "Session force-closed by stop");
            Ok(None)
        }
        res = tokio::io::copy_bidirectional(&mut client, &mut remote) => {
            let (to_remote, to_client) = res?;
            Ok(Some((to_remote, to_client)))
        }
    }
}
