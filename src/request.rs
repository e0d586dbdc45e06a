//! The per-connection request: peer identity, parsed command, and the
//! console set as it moves from raw patterns to resolved references.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::console::Console;
use crate::protocol::{unescape, ErrorCode, Keyword, Lexeme, Tokenizer};

/// Command named by the request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandKind {
    /// No command token was seen. Never survives validation.
    #[default]
    None,
    Connect,
    Execute,
    Monitor,
    Query,
}

/// The request's console set.
///
/// Starts as the raw pattern strings received from the client and is
/// replaced wholesale with resolved console references by the resolver.
/// The transition happens exactly once; no code path observes a mix of
/// the two representations.
#[derive(Debug)]
pub enum ConsoleSelection {
    Patterns(Vec<String>),
    Resolved(Vec<Arc<Console>>),
}

impl Default for ConsoleSelection {
    fn default() -> Self {
        Self::Patterns(Vec::new())
    }
}

impl ConsoleSelection {
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Patterns(p) => p.len(),
            Self::Resolved(c) => c.len(),
        }
    }

    /// Console names to enumerate in a success response. Empty before
    /// resolution.
    pub fn names(&self) -> Vec<String> {
        match self {
            Self::Patterns(_) => Vec::new(),
            Self::Resolved(c) => c.iter().map(|c| c.name().to_string()).collect(),
        }
    }
}

/// Identity of the connecting peer.
#[derive(Debug, Clone)]
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
    /// Resolved peer hostname. Hostname resolution is a collaborator this
    /// core doesn't carry; the field falls back to the address string.
    pub host: String,
}

impl Peer {
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
            host: addr.ip().to_string(),
        }
    }

    pub fn is_loopback(&self) -> bool {
        self.ip.is_loopback()
    }
}

/// Terminal failure of a request. Every variant closes the connection.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// Peer closed the connection before completing the exchange.
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The request was turned away; the error response has already been
    /// sent to the client.
    #[error("request rejected: {0:?}")]
    Rejected(ErrorCode),
}

/// One client request, owned by its connection task from accept to
/// session establishment.
#[derive(Debug)]
pub struct Request {
    pub peer: Peer,
    /// Client user, from the greeting.
    pub user: Option<String>,
    pub command: CommandKind,
    pub broadcast: bool,
    pub force: bool,
    /// Program name for EXECUTE. Parsed, currently unused.
    pub program: Option<String>,
    pub consoles: ConsoleSelection,
}

impl Request {
    pub fn new(peer: Peer) -> Self {
        Self {
            peer,
            user: None,
            command: CommandKind::None,
            broadcast: false,
            force: false,
            program: None,
            consoles: ConsoleSelection::default(),
        }
    }

    /// The greeted user. The handshake guarantees one before any later
    /// stage runs.
    pub fn user(&self) -> &str {
        self.user.as_deref().unwrap_or("unknown")
    }

    /// `user@host:port`, for logs.
    pub fn identity(&self) -> String {
        format!("{}@{}:{}", self.user(), self.peer.host, self.peer.port)
    }

    /// Resolved console references; empty before resolution.
    pub fn resolved(&self) -> &[Arc<Console>] {
        match &self.consoles {
            ConsoleSelection::Resolved(c) => c,
            ConsoleSelection::Patterns(_) => &[],
        }
    }

    /// Move the resolved console sequence out of the request, leaving the
    /// slot empty. Used by the broadcast path, which hands the sequence
    /// to the new socket peer.
    pub fn take_resolved(&mut self) -> Vec<Arc<Console>> {
        match std::mem::take(&mut self.consoles) {
            ConsoleSelection::Resolved(c) => c,
            ConsoleSelection::Patterns(_) => Vec::new(),
        }
    }

    /// Scan the greeting line for `HELLO USER='<str>'`. Later `USER=`
    /// fields win; unrecognized tokens are skipped.
    pub fn parse_greeting(&mut self, line: &str) {
        let mut tok = Tokenizer::new(line);
        loop {
            match tok.next() {
                Lexeme::Keyword(Keyword::Hello) => self.parse_greeting_opts(&mut tok),
                Lexeme::End => break,
                _ => {}
            }
        }
    }

    fn parse_greeting_opts(&mut self, tok: &mut Tokenizer) {
        loop {
            match tok.next() {
                Lexeme::Keyword(Keyword::User) => {
                    if let Some(user) = expect_string(tok) {
                        self.user = Some(user);
                    }
                }
                Lexeme::End => break,
                _ => {}
            }
        }
    }

    /// Dispatch on the leading command token and parse the flat option
    /// grammar shared by all commands.
    pub fn parse_command(&mut self, line: &str) {
        let mut tok = Tokenizer::new(line);
        loop {
            match tok.next() {
                Lexeme::Keyword(Keyword::Connect) => {
                    self.command = CommandKind::Connect;
                    self.parse_options(&mut tok);
                }
                Lexeme::Keyword(Keyword::Execute) => {
                    self.command = CommandKind::Execute;
                    self.parse_options(&mut tok);
                }
                Lexeme::Keyword(Keyword::Monitor) => {
                    self.command = CommandKind::Monitor;
                    self.parse_options(&mut tok);
                }
                Lexeme::Keyword(Keyword::Query) => {
                    self.command = CommandKind::Query;
                    self.parse_options(&mut tok);
                }
                Lexeme::End => break,
                _ => {}
            }
        }
    }

    fn parse_options(&mut self, tok: &mut Tokenizer) {
        loop {
            match tok.next() {
                Lexeme::Keyword(Keyword::Console) => {
                    if let Some(pattern) = expect_string(tok) {
                        self.push_pattern(pattern);
                    }
                }
                Lexeme::Keyword(Keyword::Option) => {
                    if matches!(tok.next(), Lexeme::Equals) {
                        match tok.next() {
                            Lexeme::Keyword(Keyword::Force) => self.force = true,
                            Lexeme::Keyword(Keyword::Broadcast) => self.broadcast = true,
                            _ => {}
                        }
                    }
                }
                Lexeme::Keyword(Keyword::Program) => {
                    if let Some(program) = expect_string(tok) {
                        self.program = Some(program);
                    }
                }
                Lexeme::End => break,
                _ => {}
            }
        }
    }

    fn push_pattern(&mut self, pattern: String) {
        // Patterns only arrive while the selection is still string-typed.
        if let ConsoleSelection::Patterns(patterns) = &mut self.consoles {
            patterns.push(pattern);
        }
    }
}

/// Consume `= '<str>'`, returning the decoded value. Empty values and
/// malformed sequences yield None and the caller skips the option.
fn expect_string(tok: &mut Tokenizer) -> Option<String> {
    if !matches!(tok.next(), Lexeme::Equals) {
        return None;
    }
    match tok.next() {
        Lexeme::Str(s) if !s.is_empty() => Some(unescape(s)),
        _ => None,
    }
}
