//! Console resolution and request validation.
//!
//! Resolution turns the request's pattern strings into a sorted set of
//! console references by matching one joined regex against the registry.
//! Validation then enforces the per-command cardinality limits and the
//! writer-contention rule, reporting failures to the client before the
//! connection is closed.

use std::sync::Arc;

use regex::RegexBuilder;
use tokio::io::AsyncWrite;

use crate::activity::format_idle;
use crate::console::{Console, ConsoleRegistry, SocketPeer};
use crate::protocol::{self, ErrorCode};
use crate::request::{CommandKind, ConsoleSelection, Request, RequestError};

/// Why resolution failed.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// The joined pattern did not compile. Carries the engine diagnostic,
    /// which is surfaced to the client.
    #[error("{0}")]
    BadRegex(String),
}

/// Resolve the request's console patterns against the registry.
///
/// An empty pattern list matches all consoles for QUERY and nothing for
/// any other command. Patterns are joined by alternation into one
/// case-insensitive regex; a match must span the entire console name.
/// On success the request's pattern list is replaced by the matching
/// console references, sorted by name.
pub fn resolve_consoles(
    registry: &ConsoleRegistry,
    req: &mut Request,
) -> Result<(), ResolveError> {
    let mut patterns = match &req.consoles {
        ConsoleSelection::Patterns(p) => p.clone(),
        // Already resolved; nothing to do.
        ConsoleSelection::Resolved(_) => return Ok(()),
    };

    if patterns.is_empty() {
        if req.command != CommandKind::Query {
            req.consoles = ConsoleSelection::Resolved(Vec::new());
            return Ok(());
        }
        patterns.push(".*".to_string());
    }

    // Anchoring the joined alternation makes partial matches impossible
    // for every branch.
    let joined = format!("^(?:{})$", patterns.join("|"));
    let re = RegexBuilder::new(&joined)
        .case_insensitive(true)
        .build()
        .map_err(|e| ResolveError::BadRegex(e.to_string()))?;

    let mut matches: Vec<Arc<Console>> = registry
        .consoles()
        .into_iter()
        .filter(|c| re.is_match(c.name()))
        .collect();
    matches.sort_by(|a, b| a.name().cmp(b.name()));

    req.consoles = ConsoleSelection::Resolved(matches);
    Ok(())
}

/// Validate the resolved request: cardinality first, then contention.
///
/// On failure the error response (and any itemized listing) has already
/// been sent; the caller closes the connection.
pub async fn validate_request<C>(conn: &mut C, req: &Request) -> Result<(), RequestError>
where
    C: AsyncWrite + Unpin,
{
    if req.resolved().is_empty() {
        protocol::send_error(conn, ErrorCode::NoConsoles, "Found no matching consoles.").await?;
        return Err(RequestError::Rejected(ErrorCode::NoConsoles));
    }
    check_too_many_consoles(conn, req).await?;
    check_busy_consoles(conn, req).await?;
    Ok(())
}

/// MONITOR affects exactly one console, as do CONNECT and EXECUTE unless
/// the broadcast option is set. QUERY tolerates any count.
async fn check_too_many_consoles<C>(conn: &mut C, req: &Request) -> Result<(), RequestError>
where
    C: AsyncWrite + Unpin,
{
    let consoles = req.resolved();
    if req.command == CommandKind::Query || consoles.len() == 1 {
        return Ok(());
    }
    if matches!(req.command, CommandKind::Connect | CommandKind::Execute) && req.broadcast {
        return Ok(());
    }

    let msg = format!("Found {} matching consoles.", consoles.len());
    protocol::send_error(conn, ErrorCode::TooManyConsoles, &msg).await?;

    // Itemized follow-up, best-effort: a failed write ends the listing,
    // the error itself has already been reported.
    for console in consoles {
        if let Err(e) = protocol::write_line(conn, &format!("{}\n", console.name())).await {
            tracing::debug!(error = %e, "console listing write failed");
            break;
        }
    }
    Err(RequestError::Rejected(ErrorCode::TooManyConsoles))
}

/// A writable command must not touch a console that already has a writer,
/// unless the force option is set. QUERY and MONITOR never contend.
async fn check_busy_consoles<C>(conn: &mut C, req: &Request) -> Result<(), RequestError>
where
    C: AsyncWrite + Unpin,
{
    if matches!(req.command, CommandKind::Query | CommandKind::Monitor) || req.force {
        return Ok(());
    }

    let busy: Vec<(Arc<Console>, Arc<SocketPeer>)> = req
        .resolved()
        .iter()
        .filter_map(|c| c.writer().map(|w| (Arc::clone(c), w)))
        .collect();
    if busy.is_empty() {
        return Ok(());
    }

    let msg = format!(
        "Found {} console{} already in use.",
        busy.len(),
        if busy.len() == 1 { "" } else { "s" }
    );
    protocol::send_error(conn, ErrorCode::BusyConsoles, &msg).await?;

    for (console, writer) in &busy {
        let line = format!(
            "Console [{}] in use by <{}> (idle {}).\n",
            console.name(),
            writer.display(),
            format_idle(writer.activity.idle()),
        );
        if let Err(e) = protocol::write_line(conn, &line).await {
            tracing::debug!(error = %e, "busy listing write failed");
            break;
        }
    }
    Err(RequestError::Rejected(ErrorCode::BusyConsoles))
}
