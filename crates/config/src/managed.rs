//! Managed certificate table.
//!
//! Maps a requested hostname to the blob key of the operator-managed
//! certificate that serves it. Entries are tried in configuration order and
//! the first matching pattern wins.

use regex::Regex;
use tracing::{debug, trace};

use crate::{ConfigError, ManagedConfig};

/// A compiled managed certificate entry
#[derive(Debug, Clone)]
pub struct ManagedDomain {
    pattern: Regex,
    cert: String,
    priv_key: String,
}

impl ManagedDomain {
    /// Hostname pattern served by this entry
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Certificate blob key, also used as the cache key
    pub fn cert_key(&self) -> &str {
        &self.cert
    }

    /// Private key blob key
    ///
    /// Falls back to the certificate key when the key is bundled with the chain.
    pub fn priv_key(&self) -> &str {
        if self.priv_key.is_empty() {
            &self.cert
        } else {
            &self.priv_key
        }
    }

    pub fn matches(&self, host: &str) -> bool {
        self.pattern.is_match(host)
    }
}

/// Ordered table of managed certificates
#[derive(Debug, Clone, Default)]
pub struct ManagedDomains {
    entries: Vec<ManagedDomain>,
}

impl ManagedDomains {
    /// Compile every configured pattern; the first bad one is fatal
    pub fn from_config(managed: &[ManagedConfig]) -> Result<Self, ConfigError> {
        let mut entries = Vec::with_capacity(managed.len());
        for item in managed {
            let pattern = Regex::new(&item.pattern).map_err(|source| ConfigError::InvalidPattern {
                context: "managed domain",
                pattern: item.pattern.clone(),
                source,
            })?;
            entries.push(ManagedDomain {
                pattern,
                cert: item.cert.clone(),
                priv_key: item.priv_key.clone(),
            });
        }

        debug!(entry_count = entries.len(), "Compiled managed domain table");
        Ok(Self { entries })
    }

    /// Entry serving `host`, if any
    pub fn lookup(&self, host: &str) -> Option<&ManagedDomain> {
        let host = host.to_ascii_lowercase();
        let found = self.entries.iter().find(|e| e.matches(&host));
        trace!(host = %host, cert_key = ?found.map(|e| e.cert_key()), "Managed domain lookup");
        found
    }

    /// Cache key of the certificate serving `host`, if any
    pub fn cert_key_for(&self, host: &str) -> Option<&str> {
        self.lookup(host).map(ManagedDomain::cert_key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManagedDomain> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
