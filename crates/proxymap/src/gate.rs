//! Table-reference canonicalization and the approved-name gate.

use std::collections::HashSet;

const PROXY_PREFIX: &str = "proxy:";

/// Strips any leading run of `proxy:` prefixes from a table reference.
///
/// The canonical form must still contain a `:` separating type from name;
/// pathological inputs like `"proxy:"` or `"proxy:proxy:"` canonicalize to
/// nothing and are rejected. Gate membership and registry keys only ever
/// use the canonical form.
pub fn canonicalize(reference: &str) -> Option<&str> {
    let mut rest = reference;
    while let Some(stripped) = rest.strip_prefix(PROXY_PREFIX) {
        rest = stripped;
    }
    rest.contains(':').then_some(rest)
}

/// The allow-list of canonical table references this worker may open.
///
/// Built once at startup from the operator's configuration and read-only
/// thereafter.
#[derive(Debug, Default)]
pub struct ApprovedSet {
    names: HashSet<String>,
}

impl ApprovedSet {
    /// Parses a whitespace-separated list of table references.
    ///
    /// The operator's list may mix in references meant for direct access;
    /// only tokens starting with `proxy:` are for this service, the rest
    /// are skipped. Surviving tokens are canonicalized with the same rule
    /// the dispatcher applies at lookup time.
    pub fn parse(list: &str) -> Self {
        let mut names = HashSet::new();
        for token in list.split_whitespace() {
            if !token.starts_with(PROXY_PREFIX) {
                continue;
            }
            if let Some(canonical) = canonicalize(token) {
                names.insert(canonical.to_string());
            }
        }
        Self { names }
    }

    pub fn contains(&self, canonical: &str) -> bool {
        self.names.contains(canonical)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_strips_all_proxy_prefixes() {
        assert_eq!(canonicalize("file:/etc/aliases"), Some("file:/etc/aliases"));
        assert_eq!(
            canonicalize("proxy:file:/etc/aliases"),
            Some("file:/etc/aliases")
        );
        assert_eq!(
            canonicalize("proxy:proxy:proxy:file:/etc/aliases"),
            Some("file:/etc/aliases")
        );
    }

    #[test]
    fn canonical_form_requires_a_type_separator() {
        assert_eq!(canonicalize("aliases"), None);
        assert_eq!(canonicalize("proxy:aliases"), None);
        // The boundary cases where the prefix loop consumes everything.
        assert_eq!(canonicalize("proxy:"), None);
        assert_eq!(canonicalize("proxy:proxy:"), None);
        assert_eq!(canonicalize(""), None);
    }

    #[test]
    fn builder_and_lookup_agree_on_pathological_tokens() {
        let set = ApprovedSet::parse("proxy: proxy:proxy: proxy:bare");
        assert!(set.is_empty());
    }

    #[test]
    fn approved_list_membership() {
        let set = ApprovedSet::parse("proxy:file:/e/a proxy:proxy:file:/e/b non:x");
        assert_eq!(set.len(), 2);
        assert!(set.contains("file:/e/a"));
        assert!(set.contains("file:/e/b"));
        // Non-proxy tokens are the operator's business, not ours.
        assert!(!set.contains("non:x"));
        assert!(!set.contains("file:/e/c"));
    }

    #[test]
    fn duplicate_tokens_collapse() {
        let set = ApprovedSet::parse("proxy:file:/e/a proxy:proxy:file:/e/a");
        assert_eq!(set.len(), 1);
    }
}
