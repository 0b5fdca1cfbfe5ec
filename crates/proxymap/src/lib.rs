#![forbid(unsafe_code)]
//! Read-only lookup table proxy server.
//!
//! Mail system processes that cannot open a table themselves, because they
//! run chrooted or because the backend rations connections, ask this
//! service instead. The worker opens each approved table once and serves
//! lookups from many clients over one Unix-domain socket.
//!
//! Two requests exist: `open` (report a table's capability flags) and
//! `lookup` (fetch one key). Only tables on the operator's approved list
//! are touched; everything else is refused with a DENY status. There is no
//! close request and tables stay open for the worker's lifetime, which is
//! the entire point of the service.

pub mod config;
pub mod dispatch;
pub mod gate;

pub use config::ProxyConfig;
pub use dispatch::ProxyWorker;
pub use gate::{canonicalize, ApprovedSet};
