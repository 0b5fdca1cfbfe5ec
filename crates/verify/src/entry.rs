//! Cache entry codec.
//!
//! The cache maps a recipient address to one printable record,
//! `status:probed:updated:text`:
//!
//! - `status`: numeric [`AddrStatus`] code.
//! - `probed`: epoch seconds of the last outstanding probe, 0 if none.
//! - `updated`: epoch seconds of the last authoritative status change,
//!   0 if the address has never been verified.
//! - `text`: diagnostic text from delivery agents; it absorbs the rest of
//!   the record verbatim, further colons and fields appended by newer
//!   versions included.
//!
//! The store may hold malformed records left behind by older versions or
//! corruption; anything that does not parse is treated as "no entry".

use tracing::warn;

use mail_core::proto::AddrStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub status: AddrStatus,
    pub probed: i64,
    pub updated: i64,
    pub text: String,
}

impl CacheEntry {
    pub fn new(status: AddrStatus, probed: i64, updated: i64, text: impl Into<String>) -> Self {
        Self {
            status,
            probed,
            updated,
            text: text.into(),
        }
    }

    /// Renders the persistent record form.
    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.status.code(),
            self.probed,
            self.updated,
            self.text
        )
    }

    /// Parses a raw cache value; `None` means "no usable entry".
    ///
    /// Rejected: missing fields, unparsable integers, a status outside the
    /// known set, and records where both timestamps are zero (such a record
    /// carries no information at all).
    pub fn parse(raw: &str) -> Option<Self> {
        match Self::try_parse(raw) {
            Some(entry) => Some(entry),
            None => {
                let shown: String = raw.chars().take(100).collect();
                warn!("bad address verify table entry: {shown}");
                None
            }
        }
    }

    fn try_parse(raw: &str) -> Option<Self> {
        let mut fields = raw.splitn(4, ':');
        let status = fields.next()?.parse::<i64>().ok()?;
        let probed = fields.next()?.parse::<i64>().ok()?;
        let updated = fields.next()?.parse::<i64>().ok()?;
        let text = fields.next()?;
        let status = AddrStatus::from_code(status)?;
        if probed == 0 && updated == 0 {
            return None;
        }
        Some(Self::new(status, probed, updated, text))
    }
}

/// Leading-integer fast path over a raw record, without a full parse.
///
/// Keeps C `atoi` semantics (optional sign, leading digits, 0 when there
/// are none) because the anti-clobber check in the policy engine compares
/// this value against the OK code and must judge legacy garbage the same
/// way the original did.
pub fn status_from_raw(raw: &str) -> i64 {
    let trimmed = raw.trim_start();
    let (sign, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse::<i64>().map(|v| sign * v).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_parse_round_trip() {
        for (status, probed, updated, text) in [
            (AddrStatus::Ok, 0, 100, "ok"),
            (AddrStatus::Defer, 1234, 0, "connection timed out"),
            (AddrStatus::Bounce, 5, 6, "user unknown"),
            (AddrStatus::Todo, 99, 0, ""),
            (AddrStatus::Ok, 0, 7, "text: with: colons"),
        ] {
            let entry = CacheEntry::new(status, probed, updated, text);
            let parsed = CacheEntry::parse(&entry.encode()).expect("round trip");
            assert_eq!(parsed, entry);
        }
    }

    #[test]
    fn text_absorbs_appended_fields() {
        let parsed = CacheEntry::parse("0:0:100:ok:future:fields").unwrap();
        assert_eq!(parsed.status, AddrStatus::Ok);
        assert_eq!(parsed.text, "ok:future:fields");
    }

    #[test]
    fn malformed_records_parse_to_none() {
        for raw in [
            "",
            "garbage",
            "0:0:100",          // missing text separator
            "9:0:100:bad code", // status outside the set
            "x:0:100:bad int",
            "0:x:100:bad int",
            "0:0:x:bad int",
            "0:0:0:both timestamps zero",
        ] {
            assert_eq!(CacheEntry::parse(raw), None, "raw: {raw:?}");
        }
    }

    #[test]
    fn status_fast_path_matches_atoi() {
        assert_eq!(status_from_raw("0:0:100:ok"), 0);
        assert_eq!(status_from_raw("2:0:100:nouser"), 2);
        assert_eq!(status_from_raw("15whatever"), 15);
        assert_eq!(status_from_raw("-3:x"), -3);
        assert_eq!(status_from_raw("  7"), 7);
        // No leading integer reads as 0, exactly like atoi.
        assert_eq!(status_from_raw("garbage"), 0);
        assert_eq!(status_from_raw(""), 0);
    }
}
