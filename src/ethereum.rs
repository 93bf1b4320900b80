//! Ethereum address handling and label conventions.
//!
//! Addresses compare case-insensitively but keep the casing the ledger
//! returned them with. Whether a label is "real" or merely a shortened raw
//! address is decided by a [`LabelConvention`], so the hex-prefix heuristic
//! can be swapped per target chain.

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::sync::LazyLock;

/// Regex pattern for Ethereum addresses (case-insensitive)
static ETH_ADDRESS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b0x[a-f0-9]{40}\b").expect("Invalid regex pattern")
});

/// Address identifier as returned by the ledger.
///
/// Equality, hashing and ordering all use the lowercase form, so
/// `0xAbC...` and `0xabc...` are the same key in maps and sets.
#[derive(Debug, Clone)]
pub struct Address {
    raw: String,
    lower: String,
}

impl Address {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into().trim().to_string();
        let lower = raw.to_lowercase();
        Self { raw, lower }
    }

    /// Canonical form, in the ledger's original casing
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Normalized form used in queries and comparisons
    pub fn normalized(&self) -> &str {
        &self.lower
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.lower == other.lower
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.lower.hash(state);
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> Ordering {
        self.lower.cmp(&other.lower)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Address {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Address::new)
    }
}

/// Decides how unresolved addresses are displayed and recognised.
pub trait LabelConvention: Send + Sync {
    /// True if `label` still looks like a raw address (no curated label known)
    fn is_synthetic_label(&self, label: &str) -> bool;

    /// Fallback display label derived from the address itself
    fn short_label(&self, address: &Address) -> String;
}

/// Hex-prefixed account convention used by EVM chains.
#[derive(Debug, Clone)]
pub struct HexPrefixConvention {
    prefix: String,
}

impl HexPrefixConvention {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for HexPrefixConvention {
    fn default() -> Self {
        Self::new("0x")
    }
}

impl LabelConvention for HexPrefixConvention {
    fn is_synthetic_label(&self, label: &str) -> bool {
        label.starts_with(&self.prefix)
    }

    fn short_label(&self, address: &Address) -> String {
        let chars: Vec<char> = address.as_str().chars().collect();
        if chars.len() <= 6 {
            return address.as_str().to_string();
        }
        let head: String = chars[..3].iter().collect();
        let tail: String = chars[chars.len() - 3..].iter().collect();
        format!("{}{}", head, tail)
    }
}

/// Extract all Ethereum addresses from a text blob
pub fn extract_addresses(text: &str) -> Vec<Address> {
    ETH_ADDRESS_PATTERN
        .find_iter(text)
        .map(|m| Address::new(m.as_str()))
        .collect()
}

/// True if `input` is a well-formed 20-byte hex address
pub fn is_valid_address(input: &str) -> bool {
    let trimmed = input.trim();
    trimmed.len() == 42
        && ETH_ADDRESS_PATTERN
            .find(trimmed)
            .map_or(false, |m| m.start() == 0 && m.end() == trimmed.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_case_insensitive_equality() {
        let a = Address::new("0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045");
        let b = Address::new("0xd8da6bf26964af9d7eed9e03e53415d37aa96045");
        assert_eq!(a, b);

        let set: BTreeSet<Address> = [a.clone(), b].into_iter().collect();
        assert_eq!(set.len(), 1);
        // Canonical casing is kept
        assert_eq!(a.as_str(), "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045");
    }

    #[test]
    fn test_short_label() {
        let conv = HexPrefixConvention::default();
        let addr = Address::new("0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045");
        assert_eq!(conv.short_label(&addr), "0xd045");
        assert_eq!(conv.short_label(&Address::new("0xab")), "0xab");
    }

    #[test]
    fn test_synthetic_label() {
        let conv = HexPrefixConvention::default();
        assert!(conv.is_synthetic_label("0xd045"));
        assert!(!conv.is_synthetic_label("Binance"));
        assert!(!conv.is_synthetic_label("0X upper-case is not the convention"));
    }

    #[test]
    fn test_extract_addresses() {
        let text = "seeds: 0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045, 0x0000000000000000000000000000000000000000 and 0x123";
        let addrs = extract_addresses(text);
        assert_eq!(addrs.len(), 2);
    }

    #[test]
    fn test_is_valid_address() {
        assert!(is_valid_address("0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045"));
        assert!(!is_valid_address("0x123"));
        assert!(!is_valid_address("0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045ff"));
        assert!(!is_valid_address(""));
    }

    #[test]
    fn test_serde_keeps_casing() {
        let addr = Address::new("0xAbC");
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"0xAbC\"");
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_str(), "0xAbC");
    }
}
