#![forbid(unsafe_code)]
//! Shared substrate for the mail table proxy and address verification daemons.
//!
//! Both services answer request/response transactions over Unix-domain
//! sockets using the same plain-text attribute frame protocol, look keys up
//! in the same pluggable table abstraction, and run inside the same worker
//! skeleton (connection limits, idle shutdown, restart on table change).
//! This crate carries those shared pieces:
//!
//! - [`attr`]: the attribute frame codec, typed `name=value` fields with a
//!   blank-line frame terminator, strict field order, and resynchronization
//!   after a malformed request body.
//! - [`proto`]: request names, attribute names, and status codes.
//! - [`table`]: the key/value table ("dictionary") abstraction, with a
//!   [`Table`] trait, `memory:` and `file:` backends, and a per-worker
//!   registry sharing one open handle per distinct reference + flags pair.
//! - [`server`]: the multi-client socket server skeleton.
//! - [`config`]: TOML configuration loading and the shared `[server]`
//!   settings section.

pub mod attr;
pub mod config;
pub mod proto;
pub mod server;
pub mod table;

pub use attr::{AttrError, AttrReader, AttrWriter};
pub use config::{ConfigError, ServerSettings};
pub use server::{
    bind_unix, serve, ConnectionError, ConnectionHandler, ServeOutcome, ServerError, ServerLimits,
    ServerOptions,
};
pub use table::{open_table, AccessMode, Table, TableError, TableRegistry};
