//! Verification cache policy.
//!
//! Two operations share one cache. UPDATE records what a delivery agent
//! reported, guarded by the anti-clobber rule: a failed probe must not
//! demote an address that is currently known good. QUERY answers from the
//! cache, substituting "verification in progress" for missing, malformed,
//! or expired entries, and decides whether a fresh probe is due.
//!
//! Probe submission is deliberately split off the reply path: [`query`]
//! returns a [`QueryOutcome`] carrying an optional refresh plan, and the
//! dispatcher runs [`refresh`] after the reply frame is flushed. The plan
//! records `probed = now` only when the submission succeeds, so a lost
//! submission leaves the entry eligible for the next query.
//!
//! [`query`]: PolicyEngine::query
//! [`refresh`]: PolicyEngine::refresh

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::{debug, warn};

use mail_core::{
    proto::{AddrStatus, VerifyStatus},
    table::Table,
};

use crate::{
    entry::{status_from_raw, CacheEntry},
    probe::ProbeSubmitter,
};

/// Minimum interval between successive probes of one address, regardless of
/// expiry. A probe with no response within this window is assumed lost.
pub const PROBE_TTL_SECS: i64 = 1000;

/// Diagnostic text reported while an address is being probed.
pub const IN_PROGRESS_TEXT: &str = "Address verification in progress";

/// Seconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct PolicyOptions {
    /// Sender address for probe messages; empty selects the null sender.
    pub sender: String,
    /// Seconds after which a known-good address expires.
    pub positive_expire: i64,
    /// Seconds after which a known-good address is proactively re-probed.
    pub positive_refresh: i64,
    /// Seconds after which a known-bad address expires.
    pub negative_expire: i64,
    /// Seconds after which a known-bad address is proactively re-probed.
    pub negative_refresh: i64,
    /// Whether negative probe results are stored at all. When disabled,
    /// expired and malformed entries are purged instead of refreshed, and
    /// probes never create new cache rows.
    pub negative_cache: bool,
}

impl Default for PolicyOptions {
    fn default() -> Self {
        Self {
            sender: "postmaster".to_string(),
            positive_expire: 31 * 24 * 3600,
            positive_refresh: 7 * 24 * 3600,
            negative_expire: 3 * 24 * 3600,
            negative_refresh: 3 * 3600,
            negative_cache: true,
        }
    }
}

/// The reply to one QUERY, plus the deferred refresh decision.
#[derive(Debug)]
pub struct QueryOutcome {
    pub status: AddrStatus,
    pub text: String,
    refresh: Option<RefreshPlan>,
}

impl QueryOutcome {
    pub fn needs_refresh(&self) -> bool {
        self.refresh.is_some()
    }
}

/// What to write back if the probe submission succeeds.
#[derive(Debug)]
struct RefreshPlan {
    address: String,
    entry: CacheEntry,
    /// Probes never create a brand-new cache row when negative caching is
    /// off; they only refresh rows that already carry information.
    record: bool,
}

pub struct PolicyEngine {
    cache: Arc<dyn Table>,
    options: PolicyOptions,
    clock: Arc<dyn Clock>,
    prober: Arc<dyn ProbeSubmitter>,
}

impl PolicyEngine {
    pub fn new(
        cache: Arc<dyn Table>,
        options: PolicyOptions,
        clock: Arc<dyn Clock>,
        prober: Arc<dyn ProbeSubmitter>,
    ) -> Self {
        Self {
            cache,
            options,
            clock,
            prober,
        }
    }

    /// Records an authoritative delivery outcome for one address.
    pub fn update(&self, address: &str, status_code: i64, text: &str) -> VerifyStatus {
        let Some(status) = AddrStatus::from_code(status_code).filter(|s| s.is_authoritative())
        else {
            warn!("bad recipient status {status_code} for recipient {address}");
            return VerifyStatus::Bad;
        };

        // Don't let a failed probe clobber an OK address before it expires.
        // The failed probe is ignored so the address is re-probed on the
        // next query; as long as some probes succeed it stays cached as OK.
        if status != AddrStatus::Ok {
            match self.cache.lookup(address) {
                Ok(Some(raw)) if status_from_raw(&raw) == AddrStatus::Ok.code() => {
                    debug!("KEEP {address} ignoring {status:?} update for cached-OK address");
                    return VerifyStatus::Ok;
                }
                Ok(_) => {}
                Err(err) => warn!("cache read for {address} failed: {err}"),
            }
        }

        let entry = CacheEntry::new(status, 0, self.clock.now(), text);
        debug!(
            "PUT {address} status={:?} probed=0 updated={} text={}",
            entry.status, entry.updated, entry.text
        );
        if let Err(err) = self.cache.update(address, &entry.encode()) {
            warn!("cache write for {address} failed: {err}");
            return VerifyStatus::Fail;
        }
        VerifyStatus::Ok
    }

    /// Answers one QUERY from the cache.
    ///
    /// The returned outcome carries the reply fields and, independently of
    /// what was reported, the refresh plan to run once the reply is out.
    pub fn query(&self, address: &str) -> QueryOutcome {
        let now = self.clock.now();
        let raw = match self.cache.lookup(address) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("cache read for {address} failed: {err}");
                None
            }
        };
        let had_raw = raw.is_some();

        // A usable entry is well-formed and not (expired while safe to
        // re-probe). An expired entry inside the probe-TTL window is still
        // served as-is; the probe already in flight will settle it.
        let usable = raw
            .as_deref()
            .and_then(CacheEntry::parse)
            .filter(|entry| !(probe_allowed(entry.probed, now) && self.expired(entry, now)));

        let entry = match usable {
            Some(entry) => entry,
            None => {
                if had_raw && !self.options.negative_cache {
                    match self.cache.delete(address) {
                        Ok(_) => debug!("DEL {address} purged unusable entry"),
                        Err(err) => warn!("cache purge for {address} failed: {err}"),
                    }
                }
                CacheEntry::new(AddrStatus::Todo, 0, 0, IN_PROGRESS_TEXT)
            }
        };

        debug!(
            "GOT {address} status={:?} probed={} updated={} text={}",
            entry.status, entry.probed, entry.updated, entry.text
        );

        let refresh = (probe_allowed(entry.probed, now) && self.refresh_needed(&entry, now))
            .then(|| RefreshPlan {
                address: address.to_string(),
                record: entry.updated != 0 || self.options.negative_cache,
                entry: CacheEntry::new(entry.status, now, entry.updated, entry.text.clone()),
            });

        QueryOutcome {
            status: entry.status,
            text: entry.text,
            refresh,
        }
    }

    /// Runs the deferred refresh step of a query: submit a probe and, on
    /// success, re-record the entry with `probed = now`. Submission failure
    /// is logged and leaves the cache untouched, so the next query retries.
    pub async fn refresh(&self, outcome: QueryOutcome) {
        let Some(plan) = outcome.refresh else {
            return;
        };
        debug!(
            "PROBE {} status={:?} probed={} updated={}",
            plan.address, plan.entry.status, plan.entry.probed, plan.entry.updated
        );
        match self.prober.submit(&self.options.sender, &plan.address).await {
            Ok(()) => {
                if plan.record {
                    debug!(
                        "PUT {} status={:?} probed={} updated={} text={}",
                        plan.address,
                        plan.entry.status,
                        plan.entry.probed,
                        plan.entry.updated,
                        plan.entry.text
                    );
                    if let Err(err) = self.cache.update(&plan.address, &plan.entry.encode()) {
                        warn!("cache write for {} failed: {err}", plan.address);
                    }
                }
            }
            Err(err) => warn!("address probe for {} not sent: {err}", plan.address),
        }
    }

    fn expired(&self, entry: &CacheEntry, now: i64) -> bool {
        if entry.status == AddrStatus::Ok {
            entry.updated + self.options.positive_expire < now
        } else {
            entry.updated + self.options.negative_expire < now
        }
    }

    fn refresh_needed(&self, entry: &CacheEntry, now: i64) -> bool {
        if entry.status == AddrStatus::Ok {
            entry.updated + self.options.positive_refresh < now
        } else {
            entry.updated + self.options.negative_refresh < now
        }
    }
}

fn probe_allowed(probed: i64, now: i64) -> bool {
    now - probed > PROBE_TTL_SECS
}
