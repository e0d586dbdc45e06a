//! TCP request server: accepts client connections and processes one
//! session-establishment request per connection.
//!
//! Each accepted connection gets its own task running the pipeline
//! handshake → parse → resolve → validate → establish. QUERY is answered
//! and closed here. CONNECT and MONITOR wire the connection into the
//! console object graph and leave it registered for the I/O multiplexer;
//! from then on the connection belongs to the new socket peer, not to the
//! request task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::console::{ConsoleRegistry, SocketPeer};
use crate::protocol::{self, ErrorCode};
use crate::request::{CommandKind, Peer, Request, RequestError};
use crate::resolve::{resolve_consoles, validate_request, ResolveError};

/// Marker prefixed to server-generated notices injected into another
/// session's output stream.
const NOTICE_PREFIX: &str = "<conhub>";

/// Message sent whenever the server runs out of a governed resource.
const RESOURCE_MSG: &str = "Insufficient resources to process request.";

/// Accept client connections until the `cancel` token fires.
///
/// Stops accepting on cancellation but lets in-flight request tasks run
/// to completion.
pub async fn serve(
    registry: ConsoleRegistry,
    listener: TcpListener,
    cancel: CancellationToken,
) -> io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "request listener ready");
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("request listener received cancel signal, stopping accept loop");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let registry = registry.clone();
                        tokio::spawn(async move {
                            handle_client(stream, addr, registry).await;
                        });
                    }
                    Err(e) => {
                        tracing::error!(?e, "failed to accept connection");
                        // Backoff to prevent a tight loop under sustained accept errors
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Process one client connection from greeting to session establishment.
///
/// On any pipeline failure the connection closes when `stream` drops; on
/// success for CONNECT/MONITOR/EXECUTE the stream has been moved into a
/// registered socket peer and stays open.
async fn handle_client(mut stream: TcpStream, addr: SocketAddr, registry: ConsoleRegistry) {
    let mut req = Request::new(Peer::from_addr(addr));
    tracing::debug!(peer = %addr, "processing new client");

    match process(&mut stream, &mut req, &registry).await {
        Ok(()) => establish(stream, req, &registry).await,
        Err(RequestError::Rejected(code)) => {
            tracing::debug!(peer = %req.identity(), code = code.code(), "request rejected");
        }
        Err(e) => {
            tracing::debug!(peer = %req.identity(), error = %e, "request ended");
        }
    }
}

/// The fallible front of the pipeline; stages run strictly in order and
/// the first failure is terminal.
async fn process(
    conn: &mut TcpStream,
    req: &mut Request,
    registry: &ConsoleRegistry,
) -> Result<(), RequestError> {
    recv_greeting(conn, req).await?;
    recv_request(conn, req).await?;
    if let Err(ResolveError::BadRegex(msg)) = resolve_consoles(registry, req) {
        protocol::send_error(conn, ErrorCode::BadRegex, &msg).await?;
        return Err(RequestError::Rejected(ErrorCode::BadRegex));
    }
    validate_request(conn, req).await?;
    Ok(())
}

/// Read one line, reporting closure and transport failures with peer
/// identity.
async fn read_request_line(conn: &mut TcpStream, req: &Request) -> Result<String, RequestError> {
    let mut line = String::new();
    match protocol::read_line(conn, &mut line).await {
        Ok(0) => {
            tracing::info!(peer = %req.peer.ip, "connection terminated by peer");
            Err(RequestError::ConnectionClosed)
        }
        Ok(_) => Ok(line),
        Err(e) => {
            tracing::warn!(peer = %req.peer.ip, error = %e, "error reading from peer");
            Err(RequestError::Io(e))
        }
    }
}

/// Perform the initial handshake: read the greeting line, require a named
/// user, authorize, and acknowledge.
async fn recv_greeting(conn: &mut TcpStream, req: &mut Request) -> Result<(), RequestError> {
    let line = read_request_line(conn, req).await?;
    req.parse_greeting(&line);

    if req.user.is_none() {
        protocol::send_error(
            conn,
            ErrorCode::BadRequest,
            "Invalid greeting: no user specified",
        )
        .await?;
        return Err(RequestError::Rejected(ErrorCode::BadRequest));
    }

    // Placeholder authorization: only loopback peers are admitted until
    // real authentication exists.
    if !req.peer.is_loopback() {
        protocol::send_error(
            conn,
            ErrorCode::AuthRequired,
            "Authentication required (but not yet implemented)",
        )
        .await?;
        return Err(RequestError::Rejected(ErrorCode::AuthRequired));
    }

    tracing::debug!(peer = %req.identity(), "greeting accepted");
    protocol::send_ok(conn, []).await?;
    Ok(())
}

/// Read and parse the request line that follows the greeting.
async fn recv_request(conn: &mut TcpStream, req: &mut Request) -> Result<(), RequestError> {
    let line = read_request_line(conn, req).await?;
    req.parse_command(&line);
    tracing::trace!(peer = %req.identity(), line = %line, "received request");
    Ok(())
}

/// Session-establishment state machine, entered only after validation
/// succeeds. Takes ownership of the connection.
async fn establish(stream: TcpStream, mut req: Request, registry: &ConsoleRegistry) {
    match req.command {
        CommandKind::Query => perform_query(stream, &req).await,
        CommandKind::Monitor => perform_monitor(stream, &req, registry).await,
        CommandKind::Connect => perform_connect(stream, &mut req, registry).await,
        CommandKind::Execute => perform_execute(stream, &req, registry).await,
        CommandKind::None => {
            // Validation rejects requests without a command (they resolve
            // to zero consoles), so this arm should be unreachable.
            // Dropping the stream closes the connection.
            tracing::error!(peer = %req.identity(), "internal error: validated request has no command");
        }
    }
}

/// QUERY: enumerate the matched consoles and close. Handled entirely by
/// this task.
async fn perform_query(mut stream: TcpStream, req: &Request) {
    let names = req.consoles.names();
    if let Err(e) = protocol::send_ok(&mut stream, names.iter().map(String::as_str)).await {
        tracing::warn!(peer = %req.identity(), error = %e, "error writing query response");
        return;
    }
    tracing::info!(peer = %req.identity(), consoles = names.len(), "query served");
}

/// Admit the connection as a socket peer, or report `ResourceError` on it
/// and give it up.
async fn admit_socket(
    stream: TcpStream,
    req: &Request,
    registry: &ConsoleRegistry,
) -> Option<Arc<SocketPeer>> {
    let ip = req.peer.ip.to_string();
    match registry.register_socket(req.user(), &ip, req.peer.port, stream) {
        Ok(peer) => Some(peer),
        Err(mut rejected) => {
            tracing::warn!(
                peer = %req.identity(),
                error = %rejected.error,
                "socket admission failed",
            );
            if let Err(e) =
                protocol::send_error(&mut rejected.stream, ErrorCode::NoResources, RESOURCE_MSG)
                    .await
            {
                tracing::debug!(error = %e, "error reporting admission failure");
            }
            None
        }
    }
}

/// MONITOR: a read-only session with a single console. The peer joins
/// the console's reader set and never becomes its writer.
async fn perform_monitor(stream: TcpStream, req: &Request, registry: &ConsoleRegistry) {
    let Some(console) = req.resolved().first().cloned() else {
        tracing::error!(peer = %req.identity(), "internal error: monitor with no console");
        return;
    };
    let Some(peer) = admit_socket(stream, req, registry).await else {
        return;
    };

    let names = req.consoles.names();
    if let Err(e) = peer
        .send_line(&protocol::encode_ok(names.iter().map(String::as_str)))
        .await
    {
        tracing::warn!(peer = %peer.display(), error = %e, "error writing monitor response");
    }
    console.add_reader(&peer);
    tracing::info!(
        console = %console.name(),
        peer = %peer.display(),
        "monitor session established",
    );
}

/// CONNECT: a duplex session when one console matched, a write-only
/// broadcast session when several did (the validator has already required
/// the broadcast option for that case).
async fn perform_connect(stream: TcpStream, req: &mut Request, registry: &ConsoleRegistry) {
    let Some(peer) = admit_socket(stream, req, registry).await else {
        return;
    };

    let names = req.consoles.names();
    if let Err(e) = peer
        .send_line(&protocol::encode_ok(names.iter().map(String::as_str)))
        .await
    {
        tracing::warn!(peer = %peer.display(), error = %e, "error writing connect response");
    }

    // From here the console sequence belongs to the session, not to the
    // request.
    let consoles = req.take_resolved();
    if consoles.len() == 1 {
        let console = &consoles[0];
        if let Some(displaced) = console.set_writer(&peer) {
            // Only reachable under OPTION=FORCE.
            tracing::info!(
                console = %console.name(),
                old = %displaced.display(),
                new = %peer.display(),
                "console writer displaced",
            );
        }
        console.add_reader(&peer);
        tracing::info!(
            console = %console.name(),
            peer = %peer.display(),
            "connect session established",
        );
    } else {
        // Tell each console's current writer what is joining its stream.
        for console in &consoles {
            if let Some(writer) = console.writer() {
                let notice = format!(
                    "\r\n{NOTICE_PREFIX} Broadcast for console [{}] opened for <{}@{}>.\r\n",
                    console.name(),
                    req.user(),
                    req.peer.host,
                );
                if let Err(e) = writer.send_line(&notice).await {
                    tracing::debug!(
                        writer = %writer.display(),
                        error = %e,
                        "error delivering broadcast notice",
                    );
                }
            }
        }
        let count = consoles.len();
        peer.set_fanout(consoles);
        tracing::info!(
            peer = %peer.display(),
            consoles = count,
            "broadcast session established",
        );
    }
}

/// EXECUTE is not implemented upstream. The peer is registered so the
/// connection stays open in a well-defined, unlinked state; nothing else
/// happens.
async fn perform_execute(stream: TcpStream, req: &Request, registry: &ConsoleRegistry) {
    let Some(peer) = admit_socket(stream, req, registry).await else {
        return;
    };
    tracing::warn!(
        peer = %peer.display(),
        program = req.program.as_deref().unwrap_or(""),
        "EXECUTE requested but not implemented; connection left unlinked",
    );
}
