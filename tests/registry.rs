//! Client registry behavior: id compaction after disconnects, backlog
//! exhaustion and recovery, the zero-timeout boundary, and lifecycle
//! teardown.

use std::thread;
use std::time::Duration;

use sockmux::{Client, Domain, Error, Server};

// =============================================================================
// Fixture
// =============================================================================

fn ipv4_server(backlog: usize) -> (Server, u16) {
    let server = Server::new(Domain::Ipv4, 0, backlog).expect("create server");
    server.start().expect("start server");
    server.listen().expect("listen");
    let port = server.local_addr().expect("bound address").port();
    (server, port)
}

fn ipv4_client(port: u16) -> Client {
    let mut client = Client::new(Domain::Ipv4, "127.0.0.1", port).expect("create client");
    client.connect().expect("connect");
    client
}

/// Give the kernel a moment to surface a peer's close on our side.
fn settle() {
    thread::sleep(Duration::from_millis(100));
}

// =============================================================================
// Compaction
// =============================================================================

#[test]
fn disconnect_then_compaction_renumbers_ids() {
    let (server, port) = ipv4_server(4);

    let mut held = Vec::new();
    for expected in 0..3 {
        let client = ipv4_client(port);
        let id = server.accept_client().expect("accept");
        assert_eq!(id, expected);
        held.push(client);
    }

    // Client 1 closes its socket; no accept has run yet.
    drop(held.remove(1));
    settle();
    assert_eq!(server.connected_clients(), 2);

    // The next accept compacts {0, 2} down to {0, 1} and hands out 2.
    let late = ipv4_client(port);
    let id = server.accept_client().expect("accept after compaction");
    assert_eq!(id, 2);
    assert_eq!(server.connected_clients(), 3);

    drop(late);
    drop(held);
}

#[test]
fn backlog_exhaustion_recovers_after_a_disconnect() {
    let (server, port) = ipv4_server(2);

    let first = ipv4_client(port);
    assert_eq!(server.accept_client().expect("accept first"), 0);
    let second = ipv4_client(port);
    assert_eq!(server.accept_client().expect("accept second"), 1);

    // A third connection parks in the kernel queue; the registry is full.
    let third = ipv4_client(port);
    settle();
    let err = server.accept_client().expect_err("registry is full");
    assert!(matches!(err, Error::ServerRuntime(_)));
    assert!(err.transience().is_retryable());
    assert_eq!(
        err.to_string(),
        "Server Runtime Error: maximum number of current connections reached"
    );

    // One peer leaves; the retry reaps it and succeeds.
    drop(first);
    settle();
    let id = server.accept_client().expect("accept after reaping");
    assert_eq!(id, 1);

    drop(second);
    drop(third);
}

// =============================================================================
// Boundaries
// =============================================================================

#[test]
fn zero_timeout_raises_unless_data_is_queued() {
    let (server, port) = ipv4_server(4);
    let client = ipv4_client(port);
    let id = server.accept_client().expect("accept");

    server.set_timeout(Duration::ZERO);
    let err = server.read_exact(id, 1).expect_err("nothing queued yet");
    assert!(matches!(err, Error::ServerTimeout(_)));

    client.send(b"x").expect("send one byte");
    settle();
    server.read_exact(id, 1).expect("data already queued");
    assert_eq!(server.data(id).expect("stored"), b"x");

    drop(client);
}

#[test]
fn peer_close_during_read_is_a_runtime_error() {
    let (server, port) = ipv4_server(4);
    let client = ipv4_client(port);
    let id = server.accept_client().expect("accept");

    drop(client);
    settle();
    let err = server.read_exact(id, 1).expect_err("peer is gone");
    assert!(matches!(err, Error::ServerRuntime(_)));
    assert!(err.to_string().contains("connection closed"));
    assert!(!err.transience().is_retryable());
}

#[test]
fn listener_probe_reports_pending_connections() {
    let (server, port) = ipv4_server(4);

    assert!(!server
        .is_data_available(Duration::from_millis(50))
        .expect("probe idle listener"));

    let client = ipv4_client(port);
    assert!(server
        .is_data_available(Duration::from_secs(2))
        .expect("probe with pending connection"));
    drop(client);
}

// =============================================================================
// Lifecycle
// =============================================================================

#[test]
fn stop_takes_the_server_offline_and_closes_peers() {
    let (server, port) = ipv4_server(4);
    let mut client = ipv4_client(port);
    server.accept_client().expect("accept");

    assert!(server.is_online());
    assert!(server.started_at() > 0);
    assert!(!server.start_date().is_empty());

    server.stop().expect("stop");
    assert!(!server.is_online());
    assert_eq!(server.started_at(), 0);
    assert_eq!(server.uptime(), 0);

    // The peer observes the close.
    settle();
    let err = client.read_exact(1).expect_err("server is gone");
    assert!(matches!(err, Error::ClientRuntime(_)));

    // Stopping twice is a runtime error, not a crash.
    assert!(matches!(server.stop(), Err(Error::ServerRuntime(_))));
}

#[test]
fn client_disconnect_is_explicit_or_on_drop() {
    let (server, port) = ipv4_server(4);
    let mut client = ipv4_client(port);
    server.accept_client().expect("accept");

    assert!(client.is_connected());
    client.disconnect().expect("disconnect");
    assert!(!client.is_connected());
    assert!(matches!(
        client.disconnect(),
        Err(Error::ClientRuntime(_))
    ));

    settle();
    assert_eq!(server.connected_clients(), 0);
}
