//! Strong type definitions for Conclave.
//!
//! Identifiers are newtypes so a group id can never be passed where a
//! message id or an address is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, Result};

/// Canonical identifier of a group conversation.
///
/// Producers and consumers of an identifier do not agree on formatting:
/// some emit `0xABC123`, others `abc123`. A `GroupId` always holds the
/// lowercase hex form without the `0x` marker, so both spellings compare
/// equal once parsed.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GroupId(String);

impl GroupId {
    /// Parse and normalize a textual identifier.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let body = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        if body.is_empty() {
            return Err(CoreError::EmptyGroupId);
        }
        if let Some(bad) = body.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(CoreError::InvalidGroupId {
                input: input.to_string(),
                reason: format!("non-hex character {bad:?}"),
            });
        }

        Ok(Self(body.to_ascii_lowercase()))
    }

    /// Build from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::parse(&hex::encode(bytes))
    }

    /// The canonical form (lowercase, unprefixed).
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `0x`-prefixed spelling.
    pub fn prefixed(&self) -> String {
        format!("0x{}", self.0)
    }

    /// Both textual spellings a transport might index this group under.
    pub fn variants(&self) -> [String; 2] {
        [self.0.clone(), self.prefixed()]
    }

    /// Check whether an arbitrarily formatted identifier refers to this group.
    pub fn matches(&self, other: &str) -> bool {
        Self::parse(other).map(|g| g == *self).unwrap_or(false)
    }

    /// Decode to raw bytes. Fails for odd-length identifiers.
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, hex::FromHexError> {
        hex::decode(&self.0)
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = &self.0[..self.0.len().min(16)];
        write!(f, "GroupId({short})")
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for GroupId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for GroupId {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<GroupId> for String {
    fn from(id: GroupId) -> Self {
        id.0
    }
}

/// A participant address, always stored lowercase.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn new(s: impl AsRef<str>) -> Self {
        Self(s.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Address {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<Address> for String {
    fn from(a: Address) -> Self {
        a.0
    }
}

/// Network-assigned message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_nanos() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_id_prefix_and_case_normalize() {
        let a = GroupId::parse("0xABC123").unwrap();
        let b = GroupId::parse("abc123").unwrap();
        let c = GroupId::parse("  0Xabc123 ").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a.as_str(), "abc123");
        assert_eq!(a.prefixed(), "0xabc123");
    }

    #[test]
    fn test_group_id_rejects_garbage() {
        assert_eq!(GroupId::parse("0x"), Err(CoreError::EmptyGroupId));
        assert!(matches!(
            GroupId::parse("hello"),
            Err(CoreError::InvalidGroupId { .. })
        ));
    }

    #[test]
    fn test_group_id_variants_and_matches() {
        let id = GroupId::parse("DEADbeef").unwrap();
        assert_eq!(id.variants(), ["deadbeef".to_string(), "0xdeadbeef".to_string()]);
        assert!(id.matches("0xDEADBEEF"));
        assert!(!id.matches("deadbee0"));
        assert!(!id.matches("not hex"));
    }

    #[test]
    fn test_group_id_serde_normalizes() {
        let id: GroupId = serde_json::from_str("\"0xAB\"").unwrap();
        assert_eq!(id.as_str(), "ab");
        assert!(serde_json::from_str::<GroupId>("\"zz\"").is_err());
    }

    #[test]
    fn test_group_id_bytes() {
        let id = GroupId::from_bytes(&[0xab, 0x01]).unwrap();
        assert_eq!(id.as_str(), "ab01");
        assert_eq!(id.to_bytes().unwrap(), vec![0xab, 0x01]);
    }

    #[test]
    fn test_address_lowercases() {
        let a = Address::new("0xAbCd");
        assert_eq!(a.as_str(), "0xabcd");
        assert_eq!(a, Address::from("0xABCD"));
    }
}
