//! End-to-end wire scenarios: a real listener, real TCP clients, and the
//! full greeting → request → response exchange.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use conhub::console::ConsoleRegistry;
use conhub::server::serve;

async fn start_server(registry: ConsoleRegistry) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let serve_cancel = cancel.clone();
    tokio::spawn(async move {
        serve(registry, listener, serve_cancel).await.unwrap();
    });
    (addr, cancel)
}

async fn registry_with(names: &[&str]) -> (ConsoleRegistry, SocketAddr, CancellationToken) {
    let registry = ConsoleRegistry::new();
    for name in names {
        registry.add_console(name).unwrap();
    }
    let (addr, cancel) = start_server(registry.clone()).await;
    (registry, addr, cancel)
}

async fn client(addr: SocketAddr) -> BufReader<TcpStream> {
    BufReader::new(TcpStream::connect(addr).await.unwrap())
}

async fn send(conn: &mut BufReader<TcpStream>, line: &str) {
    conn.get_mut().write_all(line.as_bytes()).await.unwrap();
}

/// Read one response line; an empty string means the server closed the
/// connection.
async fn recv(conn: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    tokio::time::timeout(Duration::from_secs(5), conn.read_line(&mut line))
        .await
        .expect("timed out waiting for a response line")
        .unwrap();
    line
}

async fn greet(conn: &mut BufReader<TcpStream>, user: &str) {
    send(conn, &format!("HELLO USER='{user}'\n")).await;
    assert_eq!(recv(conn).await, "OK\n");
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 1s");
}

#[tokio::test]
async fn query_without_patterns_lists_whole_registry_sorted() {
    let (_registry, addr, _cancel) = registry_with(&["node2", "node1"]).await;

    let mut conn = client(addr).await;
    greet(&mut conn, "alice").await;
    send(&mut conn, "QUERY\n").await;
    assert_eq!(recv(&mut conn).await, "OK CONSOLE='node1' CONSOLE='node2'\n");
    // QUERY is terminal: the server closes the connection.
    assert_eq!(recv(&mut conn).await, "");
}

#[tokio::test]
async fn query_pattern_selects_subset() {
    let (_registry, addr, _cancel) = registry_with(&["node3", "node1", "node2"]).await;

    let mut conn = client(addr).await;
    greet(&mut conn, "alice").await;
    send(&mut conn, "QUERY CONSOLE='node[12]'\n").await;
    assert_eq!(recv(&mut conn).await, "OK CONSOLE='node1' CONSOLE='node2'\n");
}

#[tokio::test]
async fn repeated_query_is_idempotent() {
    let (_registry, addr, _cancel) = registry_with(&["b", "a", "c"]).await;

    for _ in 0..2 {
        let mut conn = client(addr).await;
        greet(&mut conn, "alice").await;
        send(&mut conn, "QUERY CONSOLE='.*'\n").await;
        assert_eq!(
            recv(&mut conn).await,
            "OK CONSOLE='a' CONSOLE='b' CONSOLE='c'\n"
        );
    }
}

#[tokio::test]
async fn empty_registry_yields_no_matching_consoles() {
    let (_registry, addr, _cancel) = registry_with(&[]).await;

    for request in ["QUERY\n", "CONNECT CONSOLE='.*'\n", "MONITOR CONSOLE='x'\n"] {
        let mut conn = client(addr).await;
        greet(&mut conn, "alice").await;
        send(&mut conn, request).await;
        assert_eq!(
            recv(&mut conn).await,
            "ERROR CODE=5 MESSAGE='Found no matching consoles.'\n",
            "request {request:?}"
        );
        assert_eq!(recv(&mut conn).await, "");
    }
}

#[tokio::test]
async fn connect_two_consoles_without_broadcast_lists_matches() {
    let (_registry, addr, _cancel) = registry_with(&["node2", "node1"]).await;

    let mut conn = client(addr).await;
    greet(&mut conn, "alice").await;
    send(&mut conn, "CONNECT CONSOLE='node1' CONSOLE='node2'\n").await;
    assert_eq!(
        recv(&mut conn).await,
        "ERROR CODE=6 MESSAGE='Found 2 matching consoles.'\n"
    );
    // The itemized follow-up enumerates every match, sorted.
    assert_eq!(recv(&mut conn).await, "node1\n");
    assert_eq!(recv(&mut conn).await, "node2\n");
    assert_eq!(recv(&mut conn).await, "");
}

#[tokio::test]
async fn greeting_without_user_is_a_bad_request() {
    let (_registry, addr, _cancel) = registry_with(&["node1"]).await;

    let mut conn = client(addr).await;
    send(&mut conn, "HELLO\n").await;
    assert_eq!(
        recv(&mut conn).await,
        "ERROR CODE=1 MESSAGE='Invalid greeting: no user specified'\n"
    );
    assert_eq!(recv(&mut conn).await, "");
}

#[tokio::test]
async fn line_without_hello_is_a_bad_request() {
    let (_registry, addr, _cancel) = registry_with(&["node1"]).await;

    let mut conn = client(addr).await;
    send(&mut conn, "USER='alice'\n").await;
    assert_eq!(
        recv(&mut conn).await,
        "ERROR CODE=1 MESSAGE='Invalid greeting: no user specified'\n"
    );
}

#[tokio::test]
async fn bad_pattern_reports_the_regex_diagnostic() {
    let (_registry, addr, _cancel) = registry_with(&["node1"]).await;

    let mut conn = client(addr).await;
    greet(&mut conn, "alice").await;
    send(&mut conn, "CONNECT CONSOLE='['\n").await;
    let line = recv(&mut conn).await;
    assert!(line.starts_with("ERROR CODE=4 MESSAGE='"), "got {line:?}");
    assert_eq!(recv(&mut conn).await, "");
}

#[tokio::test]
async fn force_bypasses_busy_and_replaces_writer() {
    let (registry, addr, _cancel) = registry_with(&["node1"]).await;
    let console = registry.find_console("node1").unwrap();

    let mut first = client(addr).await;
    greet(&mut first, "alice").await;
    send(&mut first, "CONNECT CONSOLE='node1'\n").await;
    assert_eq!(recv(&mut first).await, "OK CONSOLE='node1'\n");
    eventually(|| console.writer().is_some()).await;

    let mut second = client(addr).await;
    greet(&mut second, "bob").await;
    send(&mut second, "CONNECT CONSOLE='node1' OPTION=FORCE\n").await;
    assert_eq!(recv(&mut second).await, "OK CONSOLE='node1'\n");

    eventually(|| console.writer().map(|w| w.user() == "bob").unwrap_or(false)).await;
}

#[tokio::test]
async fn monitor_succeeds_on_a_busy_console() {
    let (registry, addr, _cancel) = registry_with(&["node1"]).await;
    let console = registry.find_console("node1").unwrap();

    let mut writer_conn = client(addr).await;
    greet(&mut writer_conn, "alice").await;
    send(&mut writer_conn, "CONNECT CONSOLE='node1'\n").await;
    assert_eq!(recv(&mut writer_conn).await, "OK CONSOLE='node1'\n");
    eventually(|| console.writer().is_some()).await;

    let mut monitor_conn = client(addr).await;
    greet(&mut monitor_conn, "bob").await;
    send(&mut monitor_conn, "MONITOR CONSOLE='node1'\n").await;
    assert_eq!(recv(&mut monitor_conn).await, "OK CONSOLE='node1'\n");

    // The monitor joined as a reader; alice keeps the console.
    eventually(|| console.readers().len() == 2).await;
    assert_eq!(console.writer().unwrap().user(), "alice");
}

#[tokio::test]
async fn busy_listing_names_writer_and_idle_time() {
    let (registry, addr, _cancel) = registry_with(&["node1", "node2"]).await;

    let mut first = client(addr).await;
    greet(&mut first, "alice").await;
    send(&mut first, "CONNECT CONSOLE='node1'\n").await;
    assert_eq!(recv(&mut first).await, "OK CONSOLE='node1'\n");
    eventually(|| registry.find_console("node1").unwrap().writer().is_some()).await;

    // A broadcast over both consoles without FORCE trips on node1.
    let mut second = client(addr).await;
    greet(&mut second, "bob").await;
    send(
        &mut second,
        "CONNECT CONSOLE='node.*' OPTION=BROADCAST\n",
    )
    .await;
    assert_eq!(
        recv(&mut second).await,
        "ERROR CODE=7 MESSAGE='Found 1 console already in use.'\n"
    );
    let listing = recv(&mut second).await;
    assert!(
        listing.starts_with("Console [node1] in use by <alice@127.0.0.1:"),
        "unexpected listing: {listing:?}"
    );
    assert!(listing.trim_end().ends_with(").") && listing.contains("(idle "));
    assert_eq!(recv(&mut second).await, "");
}

#[tokio::test]
async fn escaped_user_name_round_trips_into_the_session() {
    let (registry, addr, _cancel) = registry_with(&["node1"]).await;

    let mut conn = client(addr).await;
    send(&mut conn, "HELLO USER='o\\'brien'\n").await;
    assert_eq!(recv(&mut conn).await, "OK\n");
    send(&mut conn, "CONNECT CONSOLE='node1'\n").await;
    assert_eq!(recv(&mut conn).await, "OK CONSOLE='node1'\n");

    let console = registry.find_console("node1").unwrap();
    eventually(|| console.writer().is_some()).await;
    assert_eq!(console.writer().unwrap().user(), "o'brien");
}

#[tokio::test]
async fn patterns_match_case_insensitively() {
    let (_registry, addr, _cancel) = registry_with(&["Rack-A-01"]).await;

    let mut conn = client(addr).await;
    greet(&mut conn, "alice").await;
    send(&mut conn, "QUERY CONSOLE='rack-a-01'\n").await;
    assert_eq!(recv(&mut conn).await, "OK CONSOLE='Rack-A-01'\n");
}

#[tokio::test]
async fn unknown_request_tokens_are_skipped() {
    let (_registry, addr, _cancel) = registry_with(&["node1"]).await;

    let mut conn = client(addr).await;
    greet(&mut conn, "alice").await;
    send(&mut conn, "QUERY FUTURE=OPTION CONSOLE='node1'\n").await;
    assert_eq!(recv(&mut conn).await, "OK CONSOLE='node1'\n");
}

#[tokio::test]
async fn closing_before_the_greeting_aborts_quietly() {
    let (registry, addr, _cancel) = registry_with(&["node1"]).await;

    let conn = client(addr).await;
    drop(conn);
    // The server must not register anything for the dead connection.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(registry.socket_count(), 0);
}

#[tokio::test]
async fn no_writer_appears_without_a_session() {
    // Invariant: a socket object is linked only after validation passes.
    let (registry, addr, _cancel) = registry_with(&["node1", "node2"]).await;
    let node1 = registry.find_console("node1").unwrap();

    // Rejected: too many consoles.
    let mut conn = client(addr).await;
    greet(&mut conn, "alice").await;
    send(&mut conn, "CONNECT CONSOLE='node.*'\n").await;
    let line = recv(&mut conn).await;
    assert!(line.starts_with("ERROR CODE=6"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(registry.socket_count(), 0);
    assert!(node1.writer().is_none());
    assert!(node1.readers().is_empty());
}

#[tokio::test]
async fn concurrent_connects_leave_exactly_one_writer() {
    let (registry, addr, _cancel) = registry_with(&["node1"]).await;
    let console = registry.find_console("node1").unwrap();

    let mut tasks = Vec::new();
    for i in 0..8 {
        let user = format!("user{i}");
        tasks.push(tokio::spawn(async move {
            let mut conn = client(addr).await;
            greet(&mut conn, &user).await;
            send(&mut conn, "CONNECT CONSOLE='node1' OPTION=FORCE\n").await;
            let line = recv(&mut conn).await;
            assert_eq!(line, "OK CONSOLE='node1'\n");
            // Hold the connection so the session stays live.
            tokio::time::sleep(Duration::from_millis(300)).await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // However the eight takeovers interleaved, one writer remains.
    let writer = console.writer().expect("a writer must survive");
    assert!(writer.user().starts_with("user"));
    assert_eq!(registry.socket_count(), 8);
}

#[tokio::test]
async fn release_socket_ends_the_session_links() {
    // Stand-in for the multiplexer's unlink path.
    let (registry, addr, _cancel) = registry_with(&["node1"]).await;
    let console = registry.find_console("node1").unwrap();

    let mut conn = client(addr).await;
    greet(&mut conn, "alice").await;
    send(&mut conn, "CONNECT CONSOLE='node1'\n").await;
    assert_eq!(recv(&mut conn).await, "OK CONSOLE='node1'\n");
    eventually(|| console.writer().is_some()).await;

    let peer = console.writer().unwrap();
    registry.release_socket(&peer);
    assert!(console.writer().is_none());
    assert!(console.readers().is_empty());
    assert_eq!(registry.socket_count(), 0);

    // The console is free for the next session.
    let mut next = client(addr).await;
    greet(&mut next, "bob").await;
    send(&mut next, "CONNECT CONSOLE='node1'\n").await;
    assert_eq!(recv(&mut next).await, "OK CONSOLE='node1'\n");
}
