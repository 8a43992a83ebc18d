//! Withdrawal-address whitelist (spec.md §4.1 "private/withdraw").
//!
//! The base set is loaded once from a resource file, in the same "plain data,
//! loaded once, queried by value" style as `known.rs`'s
//! `KNOWN_NETWORKS` table. A second, periodically refreshed external set is
//! unioned in at query time — external refresh *transport* is explicitly out
//! of scope (spec.md §1 Non-goals), so `refresh_external` takes the already
//! fetched set rather than owning how it's fetched.

use dashmap::DashSet;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WhitelistEntry {
    pub symbol: String,
    pub address_to: String,
}

#[derive(Debug, thiserror::Error)]
pub enum WhitelistError {
    #[error("failed to read whitelist file {0}: {1}")]
    Read(std::path::PathBuf, std::io::Error),
    #[error("malformed whitelist line {0}: {1:?}")]
    MalformedLine(usize, String),
}

/// Union of a base resource-file set and an externally refreshed set.
/// Queries normalize `address_to` case since EVM addresses are
/// case-insensitive at the checksum level.
pub struct Whitelist {
    base: DashSet<WhitelistEntry>,
    external: DashSet<WhitelistEntry>,
}

impl Whitelist {
    pub fn empty() -> Self {
        Self {
            base: DashSet::new(),
            external: DashSet::new(),
        }
    }

    /// Loads the base set from a `symbol,address_to` CSV-style resource file.
    pub fn load_from_file(path: &Path) -> Result<Self, WhitelistError> {
        let content = std::fs::read_to_string(path).map_err(|e| WhitelistError::Read(path.to_path_buf(), e))?;
        let base = DashSet::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (symbol, address_to) = line
                .split_once(',')
                .ok_or_else(|| WhitelistError::MalformedLine(lineno + 1, line.to_string()))?;
            base.insert(normalize(symbol, address_to));
        }
        Ok(Self {
            base,
            external: DashSet::new(),
        })
    }

    /// Replaces the externally sourced set wholesale (spec.md §4.1:
    /// "periodically refreshed external set").
    pub fn refresh_external(&self, entries: impl IntoIterator<Item = WhitelistEntry>) {
        self.external.clear();
        for entry in entries {
            let normalized = normalize(&entry.symbol, &entry.address_to);
            self.external.insert(normalized);
        }
    }

    /// `(symbol, address_to)` is permitted iff it's in the base or external set.
    /// Logs a HIGH-ALERT on rejection, per spec.md §4.1.
    pub fn check(&self, symbol: &str, address_to: &str) -> bool {
        let entry = normalize(symbol, address_to);
        let allowed = self.base.contains(&entry) || self.external.contains(&entry);
        if !allowed {
            tracing::error!(
                alert = "HIGH",
                symbol,
                address_to,
                "rejected withdrawal to non-whitelisted address"
            );
        }
        allowed
    }
}

fn normalize(symbol: &str, address_to: &str) -> WhitelistEntry {
    WhitelistEntry {
        symbol: symbol.to_uppercase(),
        address_to: address_to.to_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_set_permits_exact_and_case_insensitive_match() {
        let whitelist = Whitelist::empty();
        whitelist.refresh_external([WhitelistEntry {
            symbol: "usdc".into(),
            address_to: "0xDEADBEEF00000000000000000000000000000000".into(),
        }]);
        assert!(whitelist.check("USDC", "0xdeadbeef00000000000000000000000000000000"));
    }

    #[test]
    fn unknown_address_is_rejected() {
        let whitelist = Whitelist::empty();
        assert!(!whitelist.check("USDC", "0xDEAD"));
    }

    #[test]
    fn refresh_replaces_previous_external_set() {
        let whitelist = Whitelist::empty();
        whitelist.refresh_external([WhitelistEntry {
            symbol: "USDC".into(),
            address_to: "0xAAA".into(),
        }]);
        assert!(whitelist.check("USDC", "0xAAA"));
        whitelist.refresh_external([WhitelistEntry {
            symbol: "USDC".into(),
            address_to: "0xBBB".into(),
        }]);
        assert!(!whitelist.check("USDC", "0xAAA"));
        assert!(whitelist.check("USDC", "0xBBB"));
    }
}
