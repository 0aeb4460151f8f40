//! End-to-end tests for the forwarding engine: bind, relay, cancellation and
//! port release.

use portgate_forward::TunnelEngine;
use portgate_proto::RuleState;
use portgate_registry::RuleRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn engine() -> (Arc<RuleRegistry>, TunnelEngine) {
    let registry = Arc::new(RuleRegistry::new());
    let engine = TunnelEngine::new(registry.clone()).with_stop_grace(Duration::from_secs(1));
    (registry, engine)
}

/// Echo server that reports its address and echoes every byte back
async fn spawn_echo_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if sock.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_relay_is_byte_exact_both_directions() {
    let remote = spawn_echo_server().await;
    let (registry, engine) = engine();

    let rule = registry.reserve(0, &remote.to_string()).unwrap();
    let rule = engine.start(rule).await.unwrap();
    assert_eq!(rule.state, RuleState::Active);
    assert_ne!(rule.local_port, 0);

    let mut client = TcpStream::connect(("127.0.0.1", rule.local_port))
        .await
        .unwrap();
    client.write_all(b"hello").await.unwrap();

    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    engine.stop(&rule.id).await.unwrap();
}

#[tokio::test]
async fn test_bind_failure_removes_rule() {
    let (registry, engine) = engine();

    // Occupy a port outside the engine
    let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = blocker.local_addr().unwrap().port();

    let rule = registry.reserve(port, "127.0.0.1:9000").unwrap();
    let result = engine.start(rule).await;
    assert!(result.is_err());

    // No dangling rule: the port is reservable again once the blocker goes away
    assert_eq!(registry.count(), 0);
    drop(blocker);
    registry.reserve(port, "127.0.0.1:9000").unwrap();
}

#[tokio::test]
async fn test_stop_releases_port_for_immediate_restart() {
    let remote = spawn_echo_server().await;
    let (registry, engine) = engine();

    let rule = registry.reserve(0, &remote.to_string()).unwrap();
    let rule = engine.start(rule).await.unwrap();
    let port = rule.local_port;

    engine.stop(&rule.id).await.unwrap();

    // Same port, straight away
    let rule2 = registry.reserve(port, &remote.to_string()).unwrap();
    let rule2 = engine.start(rule2).await.unwrap();
    assert_eq!(rule2.local_port, port);

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    engine.stop(&rule2.id).await.unwrap();
}

#[tokio::test]
async fn test_stop_mid_transfer_is_bounded_and_closes_sessions() {
    // Remote accepts and then never responds
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = silent.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let Ok((sock, _)) = silent.accept().await else {
                break;
            };
            held.push(sock);
        }
    });

    let (registry, engine) = engine();
    let rule = registry.reserve(0, &remote.to_string()).unwrap();
    let rule = engine.start(rule).await.unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", rule.local_port))
        .await
        .unwrap();
    client.write_all(b"stuck").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Stop must complete promptly despite the hung peer
    tokio::time::timeout(Duration::from_secs(3), engine.stop(&rule.id))
        .await
        .expect("stop must not hang on in-flight sessions")
        .unwrap();

    // The relayed connection was force-closed
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("closed session must unblock the client");
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_stop_is_idempotent_and_unknown_rule_fails() {
    let remote = spawn_echo_server().await;
    let (registry, engine) = engine();

    let rule = registry.reserve(0, &remote.to_string()).unwrap();
    let rule = engine.start(rule).await.unwrap();

    engine.stop(&rule.id).await.unwrap();
    // Second stop after full teardown: rule is gone from the registry
    assert!(engine.stop(&rule.id).await.is_err());
    assert!(engine.stop("no-such-rule").await.is_err());
}

#[tokio::test]
async fn test_stop_before_start_prevents_activation() {
    let (registry, engine) = engine();

    // The rule id is visible to clients as soon as it is reserved; a stop can
    // arrive before the engine ever sees the rule.
    let rule = registry.reserve(0, "127.0.0.1:9000").unwrap();
    engine.stop(&rule.id).await.unwrap();

    // The withdrawn rule must not come up afterwards
    let result = engine.start(rule).await;
    assert!(result.is_err());
    assert_eq!(engine.active_count(), 0);
    assert_eq!(registry.count(), 0);
}

#[tokio::test]
async fn test_stop_of_withdrawn_rule_releases_port() {
    let (registry, engine) = engine();

    // Pick a concrete free port so we can prove the listener is gone
    let port = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    };

    let rule = registry.reserve(port, "127.0.0.1:9000").unwrap();
    engine.stop(&rule.id).await.unwrap();
    assert!(engine.start(rule).await.is_err());

    // Nothing may be left holding the port
    TcpListener::bind(("127.0.0.1", port)).await.unwrap();
}

#[tokio::test]
async fn test_dial_failure_keeps_rule_active() {
    // A port with nothing listening on it
    let dead_port = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    };

    let (registry, engine) = engine();
    let rule = registry
        .reserve(0, &format!("127.0.0.1:{}", dead_port))
        .unwrap();
    let rule = engine.start(rule).await.unwrap();

    // First attempt: dial fails, inbound connection is dropped
    let mut client = TcpStream::connect(("127.0.0.1", rule.local_port))
        .await
        .unwrap();
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("dropped connection must reach EOF");
    assert!(matches!(read, Ok(0) | Err(_)));

    // The rule itself is untouched
    assert_eq!(registry.get(&rule.id).unwrap().state, RuleState::Active);

    // Once the remote comes up, new connections relay normally
    let revived = TcpListener::bind(("127.0.0.1", dead_port)).await.unwrap();
    tokio::spawn(async move {
        let (mut sock, _) = revived.accept().await.unwrap();
        let mut buf = [0u8; 2];
        sock.read_exact(&mut buf).await.unwrap();
        sock.write_all(&buf).await.unwrap();
    });

    let mut client = TcpStream::connect(("127.0.0.1", rule.local_port))
        .await
        .unwrap();
    client.write_all(b"ok").await.unwrap();
    let mut buf = [0u8; 2];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ok");

    engine.stop(&rule.id).await.unwrap();
}

#[tokio::test]
async fn test_failed_connection_does_not_affect_other_sessions() {
    let remote = spawn_echo_server().await;
    let (registry, engine) = engine();

    let rule = registry.reserve(0, &remote.to_string()).unwrap();
    let rule = engine.start(rule).await.unwrap();

    // A healthy session in flight
    let mut healthy = TcpStream::connect(("127.0.0.1", rule.local_port))
        .await
        .unwrap();
    healthy.write_all(b"one").await.unwrap();
    let mut buf = [0u8; 3];
    healthy.read_exact(&mut buf).await.unwrap();

    // A second session that closes immediately
    let aborted = TcpStream::connect(("127.0.0.1", rule.local_port))
        .await
        .unwrap();
    drop(aborted);

    // The healthy session keeps relaying
    healthy.write_all(b"two").await.unwrap();
    healthy.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"two");

    engine.stop(&rule.id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_stop_never_leaves_a_running_rule() {
    let remote = spawn_echo_server().await;

    for _ in 0..20 {
        let (registry, engine) = engine();
        let engine = Arc::new(engine);
        let rule = registry.reserve(0, &remote.to_string()).unwrap();
        let id = rule.id.clone();

        let starter = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.start(rule).await })
        };
        let stopper = {
            let engine = engine.clone();
            let id = id.clone();
            tokio::spawn(async move { engine.stop(&id).await })
        };

        let _ = starter.await.unwrap();
        let _ = stopper.await.unwrap();

        // Whichever way the race went, nothing may survive it
        assert_eq!(engine.active_count(), 0);
        assert_eq!(registry.count(), 0);
    }
}

#[tokio::test]
async fn test_shutdown_stops_all_rules_concurrently() {
    let remote = spawn_echo_server().await;
    let (registry, engine) = engine();

    let mut ids = Vec::new();
    for _ in 0..5 {
        let rule = registry.reserve(0, &remote.to_string()).unwrap();
        let rule = engine.start(rule).await.unwrap();
        ids.push(rule.id);
    }
    assert_eq!(engine.active_count(), 5);

    tokio::time::timeout(Duration::from_secs(5), engine.shutdown())
        .await
        .expect("shutdown must be bounded");

    assert_eq!(engine.active_count(), 0);
    assert_eq!(registry.count(), 0);
}
