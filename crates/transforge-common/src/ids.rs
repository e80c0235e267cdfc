//! Typed identifier wrappers.
//!
//! [`JobId`] wraps the database-generated row key. There is deliberately no
//! constructor that invents a fresh id: the only way to obtain one for a new
//! job is from the store after the inserting transaction commits.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a job, assigned by the database on insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i64);

impl JobId {
    /// Wrap a key read back from the database.
    pub fn from_row(id: i64) -> Self {
        Self(id)
    }

    /// The raw database key.
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<i64>().map(Self)
    }
}

/// Maximum length of an owner key.
pub const MAX_OWNER_KEY_LEN: usize = 128;

/// The principal that owns jobs and is charged against the per-owner quota.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OwnerKey(String);

impl OwnerKey {
    /// Create an owner key, rejecting empty, overlong or non-printable values.
    pub fn new(key: impl Into<String>) -> Option<Self> {
        let key = key.into();
        let valid = !key.is_empty()
            && key.len() <= MAX_OWNER_KEY_LEN
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '@'));
        valid.then_some(Self(key))
    }

    /// The owner every request runs as while authentication is disabled.
    pub fn anonymous() -> Self {
        Self("anonymous".to_string())
    }

    /// Borrow the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for OwnerKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        OwnerKey::new(value.clone()).ok_or_else(|| format!("invalid owner key: {value:?}"))
    }
}

impl From<OwnerKey> for String {
    fn from(key: OwnerKey) -> Self {
        key.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_parse_and_display() {
        let id: JobId = "17".parse().unwrap();
        assert_eq!(id.get(), 17);
        assert_eq!(id.to_string(), "17");
        assert!("abc".parse::<JobId>().is_err());
    }

    #[test]
    fn test_job_id_serde_transparent() {
        let json = serde_json::to_string(&JobId::from_row(5)).unwrap();
        assert_eq!(json, "5");
    }

    #[test]
    fn test_owner_key_validation() {
        assert!(OwnerKey::new("team-7@prod").is_some());
        assert!(OwnerKey::new("").is_none());
        assert!(OwnerKey::new("has space").is_none());
        assert!(OwnerKey::new("x".repeat(MAX_OWNER_KEY_LEN + 1)).is_none());
        assert!(OwnerKey::new("ünïcode").is_none());
        assert_eq!(OwnerKey::new("anonymous"), Some(OwnerKey::anonymous()));
    }

    #[test]
    fn test_owner_key_deserialize_rejects_invalid() {
        let ok: OwnerKey = serde_json::from_str("\"acme\"").unwrap();
        assert_eq!(ok.as_str(), "acme");
        assert!(serde_json::from_str::<OwnerKey>("\"a b\"").is_err());
    }
}
