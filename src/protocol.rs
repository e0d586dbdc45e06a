//! Line-oriented wire protocol for the conhub client/server exchange.
//!
//! Every message is one newline-terminated line of at most [`MAX_LINE`]
//! bytes: a sequence of keywords, `=`, and single-quoted strings with
//! backslash escaping. Unrecognized words are skipped by parsers, keeping
//! the grammar forward-compatible.
//!
//! Exchange:
//!
//! ```text
//! C: HELLO USER='alice'
//! S: OK
//! C: CONNECT CONSOLE='node1' OPTION=FORCE
//! S: OK CONSOLE='node1'
//! ```
//!
//! Errors are reported as `ERROR CODE=<n> MESSAGE='<escaped>'`.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum length of a protocol line, requests and responses alike.
pub const MAX_LINE: usize = 8192;

/// Numeric error taxonomy carried in `ERROR CODE=<n>` responses.
///
/// The discriminants are wire-visible and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    None = 0,
    BadRequest = 1,
    NoResources = 2,
    AuthRequired = 3,
    BadRegex = 4,
    NoConsoles = 5,
    TooManyConsoles = 6,
    BusyConsoles = 7,
}

impl ErrorCode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Keywords of the protocol grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Hello,
    User,
    Connect,
    Execute,
    Monitor,
    Query,
    Console,
    Option,
    Force,
    Broadcast,
    Program,
    Ok,
    Error,
    Code,
    Message,
}

impl Keyword {
    /// Match a word against the keyword table, ASCII case-insensitively.
    pub fn from_word(word: &str) -> Option<Self> {
        const TABLE: &[(&str, Keyword)] = &[
            ("HELLO", Keyword::Hello),
            ("USER", Keyword::User),
            ("CONNECT", Keyword::Connect),
            ("EXECUTE", Keyword::Execute),
            ("MONITOR", Keyword::Monitor),
            ("QUERY", Keyword::Query),
            ("CONSOLE", Keyword::Console),
            ("OPTION", Keyword::Option),
            ("FORCE", Keyword::Force),
            ("BROADCAST", Keyword::Broadcast),
            ("PROGRAM", Keyword::Program),
            ("OK", Keyword::Ok),
            ("ERROR", Keyword::Error),
            ("CODE", Keyword::Code),
            ("MESSAGE", Keyword::Message),
        ];
        TABLE
            .iter()
            .find(|(w, _)| w.eq_ignore_ascii_case(word))
            .map(|(_, k)| *k)
    }
}

/// One lexeme of a protocol line.
///
/// `Str` carries the text between the quotes with escapes still in place;
/// apply [`unescape`] to recover the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lexeme<'a> {
    Keyword(Keyword),
    Equals,
    Str(&'a str),
    Word(&'a str),
    End,
}

/// Tokenizer over one protocol line.
///
/// Yields [`Lexeme`]s until [`Lexeme::End`], which repeats once the line
/// is exhausted.
pub struct Tokenizer<'a> {
    rest: &'a str,
}

impl<'a> Tokenizer<'a> {
    pub fn new(line: &'a str) -> Self {
        Self { rest: line }
    }

    /// Advance to the next lexeme.
    pub fn next(&mut self) -> Lexeme<'a> {
        self.rest = self.rest.trim_start();
        let bytes = self.rest.as_bytes();
        match bytes.first() {
            None => Lexeme::End,
            Some(b'=') => {
                self.rest = &self.rest[1..];
                Lexeme::Equals
            }
            Some(b'\'') => {
                // Quoted string: scan for the closing unescaped quote.
                // An unterminated string runs to the end of the line.
                let mut escaped = false;
                for (i, &b) in bytes.iter().enumerate().skip(1) {
                    if escaped {
                        escaped = false;
                    } else if b == b'\\' {
                        escaped = true;
                    } else if b == b'\'' {
                        let text = &self.rest[1..i];
                        self.rest = &self.rest[i + 1..];
                        return Lexeme::Str(text);
                    }
                }
                let text = &self.rest[1..];
                self.rest = "";
                Lexeme::Str(text)
            }
            Some(_) => {
                let end = bytes
                    .iter()
                    .position(|&b| b.is_ascii_whitespace() || b == b'=' || b == b'\'')
                    .unwrap_or(bytes.len());
                let word = &self.rest[..end];
                self.rest = &self.rest[end..];
                match Keyword::from_word(word) {
                    Some(k) => Lexeme::Keyword(k),
                    None => Lexeme::Word(word),
                }
            }
        }
    }
}

/// Escape a string for transmission inside single quotes: prefixes a
/// backslash before quotes and backslashes.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '\'' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Reverse [`escape`]: a backslash makes the following character literal.
/// A trailing lone backslash is kept as-is.
pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) => out.push(next),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Read one newline-terminated line from the connection.
///
/// Returns the number of bytes consumed; `0` means the peer closed the
/// connection before sending anything. The newline is not included in
/// `line`; carriage returns are dropped. Reading stops after [`MAX_LINE`]
/// bytes without a newline.
///
/// Bytes are read one at a time so nothing past the newline is consumed:
/// on CONNECT/MONITOR the connection is handed to the multiplexer
/// afterwards and must not lose buffered input.
pub async fn read_line<R>(reader: &mut R, line: &mut String) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut raw = Vec::new();
    let mut consumed = 0usize;
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            break;
        }
        consumed += 1;
        match byte[0] {
            b'\n' => break,
            b'\r' => {}
            b => {
                raw.push(b);
                if raw.len() >= MAX_LINE {
                    break;
                }
            }
        }
    }
    line.push_str(&String::from_utf8_lossy(&raw));
    Ok(consumed)
}

/// Write a pre-encoded line and flush it.
pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Encode a success response: `OK` plus one `CONSOLE='<name>'` field per
/// associated console.
///
/// Fields that would push the line past [`MAX_LINE`] are dropped; the
/// response stays well-formed, only the enumeration may be incomplete.
pub fn encode_ok<'a, I>(consoles: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut line = String::from("OK");
    for name in consoles {
        let field = format!(" CONSOLE='{}'", escape(name));
        if line.len() + field.len() + 1 > MAX_LINE {
            break;
        }
        line.push_str(&field);
    }
    line.push('\n');
    line
}

/// Encode an error response: `ERROR CODE=<n> MESSAGE='<escaped>'`.
///
/// The message is flattened to a single line (regex diagnostics span
/// several) and truncated to keep the response within [`MAX_LINE`].
pub fn encode_error(code: ErrorCode, message: Option<&str>) -> String {
    let msg = message.unwrap_or("unspecified error");
    let flat: String = msg
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let mut escaped = escape(&flat);
    let budget = MAX_LINE - "ERROR CODE=255 MESSAGE=''\n".len();
    if escaped.len() > budget {
        truncate_escaped(&mut escaped, budget);
    }
    format!("ERROR CODE={} MESSAGE='{}'\n", code.code(), escaped)
}

/// Truncate an escaped string to at most `max` bytes without splitting a
/// character or an escape pair.
fn truncate_escaped(s: &mut String, max: usize) {
    let mut end = max.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    let trailing = s.bytes().rev().take_while(|&b| b == b'\\').count();
    if trailing % 2 == 1 {
        s.pop();
    }
}

/// Send an error response, leaving the connection open for any follow-up
/// listing lines.
pub async fn send_error<W>(writer: &mut W, code: ErrorCode, message: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_line(writer, &encode_error(code, Some(message))).await
}

/// Send a success response enumerating the given console names.
pub async fn send_ok<'a, W, I>(writer: &mut W, consoles: I) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    I: IntoIterator<Item = &'a str>,
{
    write_line(writer, &encode_ok(consoles)).await
}
