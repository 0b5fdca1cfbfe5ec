//! Wire-level names and status codes shared by the proxy and verify services.
//!
//! The numeric codes are the on-the-wire contract with client processes and
//! the first field of persisted verify cache entries; they must not be
//! renumbered.

/// Name of the leading attribute that selects the request type.
pub const ATTR_REQUEST: &str = "request";

pub const ATTR_TABLE: &str = "table";
pub const ATTR_FLAGS: &str = "flags";
pub const ATTR_KEY: &str = "key";
pub const ATTR_STATUS: &str = "status";
pub const ATTR_VALUE: &str = "value";
pub const ATTR_ADDRESS: &str = "address";
pub const ATTR_ADDR_STATUS: &str = "addr_status";
pub const ATTR_WHY: &str = "why";
pub const ATTR_SENDER: &str = "sender";

/// Proxy map service requests.
pub const REQ_PROXY_LOOKUP: &str = "lookup";
pub const REQ_PROXY_OPEN: &str = "open";

/// Address verification service requests.
pub const REQ_VERIFY_UPDATE: &str = "update";
pub const REQ_VERIFY_QUERY: &str = "query";

/// Mail submission service request used by the probe submitter.
pub const REQ_QUEUE_SUBMIT: &str = "submit";

/// Submission flag marking a message as a verify-only probe: the transport
/// routes and queues it but discards it at final delivery.
pub const FLAG_VERIFY_PROBE: i64 = 1;

/// Completion status of a proxy map request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyStatus {
    /// Table opened, or the requested entry was found.
    Ok,
    /// The requested table entry does not exist.
    NoKey,
    /// The lookup could not be completed; the client may retry.
    Retry,
    /// Malformed request or bad parameter value.
    Bad,
    /// The table is not approved for access through the proxy.
    Deny,
}

impl ProxyStatus {
    pub fn code(self) -> i64 {
        match self {
            ProxyStatus::Ok => 0,
            ProxyStatus::NoKey => 1,
            ProxyStatus::Retry => 2,
            ProxyStatus::Bad => 3,
            ProxyStatus::Deny => 4,
        }
    }
}

/// Server-level completion status of a verify request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStatus {
    Ok,
    /// The server rejected the request (bad request name or parameter).
    Bad,
    /// The request was understood but could not be completed.
    Fail,
}

impl VerifyStatus {
    pub fn code(self) -> i64 {
        match self {
            VerifyStatus::Ok => 0,
            VerifyStatus::Bad => 1,
            VerifyStatus::Fail => 2,
        }
    }
}

/// Delivery status of one recipient address.
///
/// Also the first field of a persisted verify cache entry, so the numeric
/// codes are part of the on-disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrStatus {
    /// The address is deliverable.
    Ok,
    /// Undeliverable due to a temporary problem.
    Defer,
    /// Undeliverable due to a permanent problem.
    Bounce,
    /// The status is being determined; a probe is in flight.
    Todo,
}

impl AddrStatus {
    pub fn code(self) -> i64 {
        match self {
            AddrStatus::Ok => 0,
            AddrStatus::Defer => 1,
            AddrStatus::Bounce => 2,
            AddrStatus::Todo => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(AddrStatus::Ok),
            1 => Some(AddrStatus::Defer),
            2 => Some(AddrStatus::Bounce),
            3 => Some(AddrStatus::Todo),
            _ => None,
        }
    }

    /// Whether this status may be recorded by an UPDATE request. TODO is
    /// only ever synthesized by the server itself.
    pub fn is_authoritative(self) -> bool {
        !matches!(self, AddrStatus::Todo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_status_codes_round_trip() {
        for status in [
            AddrStatus::Ok,
            AddrStatus::Defer,
            AddrStatus::Bounce,
            AddrStatus::Todo,
        ] {
            assert_eq!(AddrStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(AddrStatus::from_code(4), None);
        assert_eq!(AddrStatus::from_code(-1), None);
    }

    #[test]
    fn todo_is_not_an_update_status() {
        assert!(AddrStatus::Ok.is_authoritative());
        assert!(AddrStatus::Defer.is_authoritative());
        assert!(AddrStatus::Bounce.is_authoritative());
        assert!(!AddrStatus::Todo.is_authoritative());
    }
}
