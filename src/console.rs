//! Console and socket objects and the shared registry that owns them.
//!
//! Consoles are long-lived, created from configuration at startup. Socket
//! peers are created when a session is established and live until the
//! multiplexer tears the session down. The writer/reader link fields on a
//! console are the system's primary shared mutable state: every request
//! task reads them during contention checks and mutates them when linking,
//! and the multiplexer mutates them when unlinking, so they sit behind a
//! per-console mutex.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::activity::ActivityTracker;

/// Validate a console name. Names must be 1-64 chars,
/// alphanumeric/hyphens/underscores/dots.
pub fn validate_console_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("console name must not be empty".into());
    }
    if name.len() > 64 {
        return Err(format!("console name too long ({} chars, max 64)", name.len()));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(format!("console name contains invalid characters: {name}"));
    }
    Ok(())
}

/// A named endpoint representing one managed device stream.
///
/// The name is immutable after creation. At most one writer is linked at
/// any instant; any number of readers receive a copy of the console's
/// output.
pub struct Console {
    name: String,
    links: Mutex<Links>,
}

#[derive(Default)]
struct Links {
    writer: Option<Arc<SocketPeer>>,
    readers: Vec<Arc<SocketPeer>>,
}

impl Console {
    fn new(name: String) -> Arc<Self> {
        Arc::new(Self {
            name,
            links: Mutex::new(Links::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Install `peer` as this console's writer, replacing any current
    /// writer. Returns the displaced writer, if any.
    pub fn set_writer(&self, peer: &Arc<SocketPeer>) -> Option<Arc<SocketPeer>> {
        self.links.lock().writer.replace(Arc::clone(peer))
    }

    /// The current writer, if any.
    pub fn writer(&self) -> Option<Arc<SocketPeer>> {
        self.links.lock().writer.clone()
    }

    /// Unlink `peer` as this console's writer. Returns true if it was
    /// the current writer. Used by the multiplexer when a session ends.
    pub fn clear_writer(&self, peer: &Arc<SocketPeer>) -> bool {
        let mut links = self.links.lock();
        match &links.writer {
            Some(current) if Arc::ptr_eq(current, peer) => {
                links.writer = None;
                true
            }
            _ => false,
        }
    }

    /// Link `peer` as a reader of this console's output.
    pub fn add_reader(&self, peer: &Arc<SocketPeer>) {
        self.links.lock().readers.push(Arc::clone(peer));
    }

    /// Unlink `peer` from this console's reader set.
    pub fn remove_reader(&self, peer: &Arc<SocketPeer>) {
        self.links.lock().readers.retain(|r| !Arc::ptr_eq(r, peer));
    }

    /// Snapshot of the current reader set.
    pub fn readers(&self) -> Vec<Arc<SocketPeer>> {
        self.links.lock().readers.clone()
    }
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let links = self.links.lock();
        f.debug_struct("Console")
            .field("name", &self.name)
            .field("busy", &links.writer.is_some())
            .field("readers", &links.readers.len())
            .finish_non_exhaustive()
    }
}

/// Runtime object for one established client session.
///
/// Created by the session establisher after validation succeeds; owns the
/// client connection from then on. Destroyed by the multiplexer when the
/// session ends.
pub struct SocketPeer {
    user: String,
    ip: String,
    port: u16,
    display: String,
    connected_at: Instant,
    /// Last-read timestamp, published on every read the multiplexer
    /// services. Kept apart from the structural link locks: it changes at
    /// I/O frequency, they change once per session.
    pub activity: ActivityTracker,
    /// The client connection. An async mutex: broadcast-open notices are
    /// written into another session's connection while that session's own
    /// task may also be writing.
    stream: tokio::sync::Mutex<TcpStream>,
    /// Consoles fed by this peer in a broadcast session.
    fanout: Mutex<Vec<Arc<Console>>>,
}

impl SocketPeer {
    fn new(user: &str, ip: &str, port: u16, stream: TcpStream) -> Self {
        Self {
            user: user.to_string(),
            ip: ip.to_string(),
            port,
            display: format!("{user}@{ip}:{port}"),
            connected_at: Instant::now(),
            activity: ActivityTracker::new(),
            stream: tokio::sync::Mutex::new(stream),
            fanout: Mutex::new(Vec::new()),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Display name used in busy listings and notices: `user@ip:port`.
    pub fn display(&self) -> &str {
        &self.display
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Write a pre-encoded line (or notice) onto this peer's connection.
    pub async fn send_line(&self, line: &str) -> io::Result<()> {
        let mut stream = self.stream.lock().await;
        stream.write_all(line.as_bytes()).await?;
        stream.flush().await
    }

    /// Replace this peer's broadcast fanout set.
    pub fn set_fanout(&self, consoles: Vec<Arc<Console>>) {
        *self.fanout.lock() = consoles;
    }

    /// Snapshot of the broadcast fanout set.
    pub fn fanout(&self) -> Vec<Arc<Console>> {
        self.fanout.lock().clone()
    }
}

impl std::fmt::Debug for SocketPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketPeer")
            .field("display", &self.display)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("console name already exists: {0}")]
    ConsoleExists(String),
    #[error("invalid console name: {0}")]
    InvalidName(String),
    #[error("maximum number of sockets reached")]
    SocketLimitReached,
}

/// A socket registration turned away at the admission cap. Carries the
/// connection back so the caller can report the failure on it.
#[derive(Debug)]
pub struct SocketRejected {
    pub stream: TcpStream,
    pub error: RegistryError,
}

struct RegistryInner {
    consoles: Vec<Arc<Console>>,
    sockets: Vec<Arc<SocketPeer>>,
    max_sockets: Option<usize>,
}

/// The server's authoritative set of consoles and live socket peers.
///
/// Cheap to clone; all clones share state. The inner lock guards the
/// object lists only; per-console link state has its own lock, so a
/// registry scan never blocks on another task's linking.
#[derive(Clone)]
pub struct ConsoleRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl Default for ConsoleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleRegistry {
    /// Default cap on live socket peers when no explicit limit is set.
    ///
    /// Each peer holds an open connection and a watch channel; the cap
    /// keeps a runaway client farm from exhausting file descriptors.
    const DEFAULT_MAX_SOCKETS: usize = 256;

    /// Create an empty registry with the default socket cap.
    pub fn new() -> Self {
        Self::with_max_sockets(Some(Self::DEFAULT_MAX_SOCKETS))
    }

    /// Create an empty registry with an optional socket cap.
    pub fn with_max_sockets(max_sockets: Option<usize>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                consoles: Vec::new(),
                sockets: Vec::new(),
                max_sockets,
            })),
        }
    }

    /// Register a console. Names are unique keys.
    pub fn add_console(&self, name: &str) -> Result<Arc<Console>, RegistryError> {
        validate_console_name(name).map_err(RegistryError::InvalidName)?;
        let mut inner = self.inner.write();
        if inner.consoles.iter().any(|c| c.name() == name) {
            return Err(RegistryError::ConsoleExists(name.to_string()));
        }
        let console = Console::new(name.to_string());
        inner.consoles.push(Arc::clone(&console));
        Ok(console)
    }

    /// Snapshot of all consoles. The returned references stay valid
    /// regardless of later registry changes.
    pub fn consoles(&self) -> Vec<Arc<Console>> {
        self.inner.read().consoles.clone()
    }

    /// Look up a console by exact name.
    pub fn find_console(&self, name: &str) -> Option<Arc<Console>> {
        self.inner
            .read()
            .consoles
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    pub fn console_count(&self) -> usize {
        self.inner.read().consoles.len()
    }

    /// Admit a new socket peer, taking ownership of the connection.
    ///
    /// Fails when the socket cap is reached; the connection is handed
    /// back in [`SocketRejected`] so the caller can still respond on it.
    pub fn register_socket(
        &self,
        user: &str,
        ip: &str,
        port: u16,
        stream: TcpStream,
    ) -> Result<Arc<SocketPeer>, SocketRejected> {
        let mut inner = self.inner.write();
        if let Some(max) = inner.max_sockets {
            if inner.sockets.len() >= max {
                return Err(SocketRejected {
                    stream,
                    error: RegistryError::SocketLimitReached,
                });
            }
        }
        let peer = Arc::new(SocketPeer::new(user, ip, port, stream));
        inner.sockets.push(Arc::clone(&peer));
        Ok(peer)
    }

    pub fn socket_count(&self) -> usize {
        self.inner.read().sockets.len()
    }

    /// Snapshot of all live socket peers.
    pub fn sockets(&self) -> Vec<Arc<SocketPeer>> {
        self.inner.read().sockets.clone()
    }

    /// Tear down a socket peer: drop it from the registry and unlink it
    /// from every console it writes or reads. The multiplexer calls this
    /// when a session ends; the connection closes when the last reference
    /// drops.
    pub fn release_socket(&self, peer: &Arc<SocketPeer>) {
        let consoles = {
            let mut inner = self.inner.write();
            inner.sockets.retain(|p| !Arc::ptr_eq(p, peer));
            inner.consoles.clone()
        };
        for console in consoles {
            console.clear_writer(peer);
            console.remove_reader(peer);
        }
        peer.set_fanout(Vec::new());
    }
}
