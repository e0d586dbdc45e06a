//! Request-processing core of the conhub console-aggregation server.
//!
//! A client connects over TCP, greets the server (`HELLO USER='<str>'`),
//! and sends one request line (`CONNECT`/`EXECUTE`/`MONITOR`/`QUERY` plus
//! options). The server resolves the requested console patterns against
//! its registry, validates the request, and either answers and closes
//! (QUERY) or wires the connection into the console object graph for the
//! I/O multiplexer to drive (CONNECT/MONITOR).

pub mod activity;
pub mod config;
pub mod console;
pub mod protocol;
pub mod request;
pub mod resolve;
pub mod server;
