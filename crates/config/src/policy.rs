//! Host authorization policy for automated certificate issuance.
//!
//! Two sub-policies are composed into one predicate:
//!
//! 1. an exact, case-insensitive domain list
//! 2. an ordered list of hostname regexes
//!
//! The list is consulted first and short-circuits on allow. A host is
//! denied unless one of the configured sub-policies explicitly allows it;
//! an evaluation error from either sub-policy is a denial. When neither
//! sub-policy is configured every host is allowed.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, trace};

use crate::ConfigError;

/// Longest hostname accepted by any policy
const MAX_HOST_LEN: usize = 253;

/// Reasons a host is refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    /// No configured rule matches the host
    #[error("host {0:?} is not allowed by the host policy")]
    NotAllowed(String),

    /// The host is not a usable DNS name
    #[error("invalid host name {0:?}")]
    InvalidHost(String),

    /// A rule could not be evaluated
    #[error("failed to evaluate host policy for {host:?}: {reason}")]
    Evaluation { host: String, reason: String },
}

/// Decides whether a hostname may trigger automated issuance.
///
/// `Ok(())` is the only allow verdict.
pub trait HostPolicy: Send + Sync {
    fn check(&self, host: &str) -> Result<(), PolicyError>;

    fn is_allowed(&self, host: &str) -> bool {
        self.check(host).is_ok()
    }
}

/// Lowercase a host and strip a trailing root dot
fn normalize_host(host: &str) -> Result<String, PolicyError> {
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.is_empty() || host.len() > MAX_HOST_LEN {
        return Err(PolicyError::InvalidHost(host.to_string()));
    }
    Ok(host.to_ascii_lowercase())
}

// ============================================================================
// Exact List
// ============================================================================

/// Allows hosts that appear verbatim (ignoring case) in the domain list
#[derive(Debug, Clone)]
pub struct ExactListPolicy {
    domains: HashSet<String>,
}

impl ExactListPolicy {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains = domains
            .into_iter()
            .filter_map(|d| normalize_host(d.as_ref()).ok())
            .collect();
        Self { domains }
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

impl HostPolicy for ExactListPolicy {
    fn check(&self, host: &str) -> Result<(), PolicyError> {
        let normalized = normalize_host(host)?;
        if self.domains.contains(&normalized) {
            Ok(())
        } else {
            Err(PolicyError::NotAllowed(host.to_string()))
        }
    }
}

// ============================================================================
// Regex List
// ============================================================================

/// Allows hosts matching any of the compiled patterns
#[derive(Debug, Clone)]
pub struct RegexListPolicy {
    patterns: Vec<Regex>,
}

impl RegexListPolicy {
    pub fn new(patterns: Vec<Regex>) -> Self {
        Self { patterns }
    }

    /// Compile patterns, failing on the first one that does not parse
    pub fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Self, ConfigError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(p.as_ref()).map_err(|source| ConfigError::InvalidPattern {
                    context: "lets_encrypt domain",
                    pattern: p.as_ref().to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(patterns))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl HostPolicy for RegexListPolicy {
    fn check(&self, host: &str) -> Result<(), PolicyError> {
        let normalized = normalize_host(host)?;
        if self.patterns.iter().any(|re| re.is_match(&normalized)) {
            Ok(())
        } else {
            Err(PolicyError::NotAllowed(host.to_string()))
        }
    }
}

// ============================================================================
// Composition
// ============================================================================

/// Exact list first, then regex list; deny unless one of them allows
#[derive(Clone, Default)]
pub struct ComposedPolicy {
    list: Option<Arc<dyn HostPolicy>>,
    patterns: Option<Arc<dyn HostPolicy>>,
}

impl ComposedPolicy {
    pub fn new(list: Option<Arc<dyn HostPolicy>>, patterns: Option<Arc<dyn HostPolicy>>) -> Self {
        Self { list, patterns }
    }

    /// True when no sub-policy is configured
    pub fn allows_all(&self) -> bool {
        self.list.is_none() && self.patterns.is_none()
    }
}

impl HostPolicy for ComposedPolicy {
    fn check(&self, host: &str) -> Result<(), PolicyError> {
        if self.allows_all() {
            trace!(host = %host, "No host policy configured, allowing");
            return Ok(());
        }

        let mut verdict = Err(PolicyError::NotAllowed(host.to_string()));

        if let Some(ref list) = self.list {
            match list.check(host) {
                Ok(()) => {
                    trace!(host = %host, "Host allowed by domain list");
                    return Ok(());
                }
                Err(e) => verdict = Err(e),
            }
        }

        if let Some(ref patterns) = self.patterns {
            match patterns.check(host) {
                Ok(()) => {
                    trace!(host = %host, "Host allowed by domain pattern");
                    return Ok(());
                }
                Err(e) => verdict = Err(e),
            }
        }

        debug!(host = %host, "Host denied by host policy");
        verdict
    }
}

impl fmt::Debug for ComposedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComposedPolicy")
            .field("has_list", &self.list.is_some())
            .field("has_patterns", &self.patterns.is_some())
            .finish()
    }
}

/// Build the issuance policy from the configured domains and patterns.
///
/// Empty inputs leave the corresponding sub-policy unset. An unparsable
/// pattern is a configuration error.
pub fn build_host_policy<D, P>(domains: &[D], re_patterns: &[P]) -> Result<ComposedPolicy, ConfigError>
where
    D: AsRef<str>,
    P: AsRef<str>,
{
    let list: Option<Arc<dyn HostPolicy>> = if domains.is_empty() {
        None
    } else {
        Some(Arc::new(ExactListPolicy::new(domains)))
    };

    let patterns: Option<Arc<dyn HostPolicy>> = if re_patterns.is_empty() {
        None
    } else {
        Some(Arc::new(RegexListPolicy::compile(re_patterns)?))
    };

    debug!(
        domain_count = domains.len(),
        pattern_count = re_patterns.len(),
        "Built host policy"
    );

    Ok(ComposedPolicy::new(list, patterns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Sub-policy whose evaluation always fails
    struct BrokenPolicy;

    impl HostPolicy for BrokenPolicy {
        fn check(&self, host: &str) -> Result<(), PolicyError> {
            Err(PolicyError::Evaluation {
                host: host.to_string(),
                reason: "corrupted matcher state".to_string(),
            })
        }
    }

    fn policy(domains: &[&str], patterns: &[&str]) -> ComposedPolicy {
        build_host_policy(domains, patterns).unwrap()
    }

    #[test]
    fn test_list_and_patterns() {
        let policy = policy(&["a.example.com"], &[r"^b\."]);

        assert!(policy.check("a.example.com").is_ok());
        assert!(policy.check("b.example.com").is_ok());
        assert_eq!(
            policy.check("c.example.com"),
            Err(PolicyError::NotAllowed("c.example.com".to_string()))
        );
    }

    #[test]
    fn test_empty_policy_allows_everything() {
        let policy = policy(&[], &[]);

        assert!(policy.allows_all());
        assert!(policy.is_allowed("anything.example.net"));
        assert!(policy.is_allowed("localhost"));
    }

    #[test]
    fn test_list_only() {
        let policy = policy(&["Www.Example.com"], &[]);

        assert!(policy.is_allowed("www.example.com"));
        assert!(policy.is_allowed("WWW.EXAMPLE.COM."));
        assert!(!policy.is_allowed("example.com"));
        // No wildcard expansion
        assert!(!policy.is_allowed("sub.www.example.com"));
    }

    #[test]
    fn test_patterns_only() {
        let policy = policy(&[], &[r"^[a-z]+\.example\.org$"]);

        assert!(policy.is_allowed("shop.example.org"));
        assert!(!policy.is_allowed("shop.example.com"));
        assert!(!policy.is_allowed("a.b.example.org"));
    }

    #[test]
    fn test_evaluation_error_denies() {
        let list: Arc<dyn HostPolicy> = Arc::new(ExactListPolicy::new(["a.example.com"]));
        let policy = ComposedPolicy::new(Some(list), Some(Arc::new(BrokenPolicy)));

        // The list still allows its own hosts
        assert!(policy.is_allowed("a.example.com"));

        // Everything else reaches the broken matcher and must be denied
        let err = policy.check("b.example.com").unwrap_err();
        assert!(matches!(err, PolicyError::Evaluation { .. }));
    }

    #[test]
    fn test_broken_patterns_alone_deny() {
        let policy = ComposedPolicy::new(None, Some(Arc::new(BrokenPolicy)));

        assert!(!policy.allows_all());
        assert!(!policy.is_allowed("b.example.com"));
    }

    #[test]
    fn test_invalid_hosts_denied() {
        let policy = policy(&["a.example.com"], &[".*"]);

        assert_eq!(
            policy.check(""),
            Err(PolicyError::InvalidHost(String::new()))
        );
        let long = "a".repeat(MAX_HOST_LEN + 1);
        assert!(!policy.is_allowed(&long));
    }

    #[test]
    fn test_invalid_pattern_reports_pattern() {
        let err = build_host_policy::<&str, &str>(&[], &["ok", "[z-a]"]).unwrap_err();
        match err {
            ConfigError::InvalidPattern { pattern, .. } => assert_eq!(pattern, "[z-a]"),
            other => panic!("unexpected error: {other}"),
        }
    }

    proptest! {
        #[test]
        fn prop_list_match_ignores_case(label in "[a-z][a-z0-9-]{0,20}") {
            let domain = format!("{}.example.com", label);
            let policy = policy(&[domain.as_str()], &[]);

            prop_assert!(policy.is_allowed(&domain.to_ascii_uppercase()));
            let rooted = format!("{}.", domain);
            prop_assert!(policy.is_allowed(&rooted));
        }

        #[test]
        fn prop_unlisted_hosts_denied(label in "[a-z]{1,20}") {
            let policy = policy(&["listed.example.com"], &[r"^never-matches\.invalid$"]);
            let host = format!("{}.unlisted.example.com", label);

            prop_assert!(!policy.is_allowed(&host));
        }
    }
}
