//! riptide is an in-memory key/value server that keeps cold values in a
//! backing store and swaps them in and out per key, asynchronously, while
//! every command still executes on one thread.
//!
//! # Basic Operation
//!
//! The binary runs a single-threaded reactor: one poll loop multiplexes
//! all client sockets and timers. Commands parse from RESP frames and
//! dispatch through arity, authentication and ACL checks. When a command
//! addresses a key whose value currently lives in the backing store, the
//! client suspends on that key's swap queue while a worker pipe does the
//! I/O; the reactor keeps serving everyone else. Completions resume
//! suspended commands strictly in per-key arrival order.
//!
//! ```text
//! client ──▶ parser ──▶ dispatch ──▶ swap analysis ──▶ handler ──▶ reply
//!                                        │   ▲
//!                                 submit ▼   │ resume (FIFO per key)
//!                                    swap pipes (crc16-routed)
//! ```
//!
//! # Components
//!
//! - [`reactor`]: file and time events over the platform poller.
//! - [`parser`] / [`resp`]: restartable request parsing and reply encoding.
//! - [`db`] / [`dict`]: the keyspace and its scan-cursor hash tables.
//! - [`swap`] / [`swap_io`]: the per-key swap pipeline and its worker pipes.
//! - [`acl`]: users, command bitmaps, key patterns and the audit log.
//! - [`expire`]: lazy plus budgeted active expiration.
//! - [`notify`] / [`pubsub`] / [`tracking`]: keyspace events and
//!   client-side caching invalidation.
//! - [`slowlog`]: the slow and fat command logs.
//! - [`repl`]: ordered application of a replication stream through
//!   parallel swaps.

pub mod acl;
pub mod bits;
pub mod command;
pub mod config;
pub mod connection;
pub mod db;
pub mod dict;
pub mod expire;
pub mod migrate;
pub mod notify;
pub mod parser;
pub mod pubsub;
pub mod reactor;
pub mod repl;
pub mod resp;
pub mod server;
pub mod slowlog;
pub mod string;
pub mod swap;
pub mod swap_io;
pub mod tracking;
pub mod types;
pub mod util;
pub mod zset;

pub use crate::config::{Config, MaxmemoryPolicy};
pub use crate::resp::Reply;
pub use crate::server::Server;
pub use crate::types::{ErrorKind, ServerError, ServerResult, Value};
