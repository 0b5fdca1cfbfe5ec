#![forbid(unsafe_code)]
//! Recipient address verification cache server.
//!
//! Keeps a record of which recipient addresses are known to be deliverable
//! or undeliverable. Unknown or stale addresses are verified by injecting
//! probe messages into the mail queue; probes run through all routing and
//! rewriting machinery but are discarded instead of delivered, and delivery
//! agents report the outcome back through `update` requests.
//!
//! Caching is optimistic: a single failed probe never demotes an address
//! that is currently recorded as deliverable; only consistent failure past
//! the positive expiry does. The cache lives in memory by default or in a
//! persistent table; the persistent variant is opened before the worker
//! drops privileges and is protected from mid-update interruption by
//! putting the worker in its own process group.

pub mod config;
pub mod dispatch;
pub mod entry;
pub mod policy;
pub mod probe;

pub use config::VerifyConfig;
pub use dispatch::VerifyWorker;
pub use entry::{status_from_raw, CacheEntry};
pub use policy::{Clock, PolicyEngine, PolicyOptions, SystemClock, PROBE_TTL_SECS};
pub use probe::{ProbeError, ProbeSubmitter, QueueClient};
