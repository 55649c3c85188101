//! Change identifiers.
//!
//! A Change-Id is `I` followed by 40 lowercase hex characters. Fresh ids are
//! random; commits that never carried one get a deterministic fallback
//! derived from their sha so every device computes the same id.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::storage::{CommitId, InvalidNameError};

const ID_LEN: usize = 41;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChangeId(String);

impl ChangeId {
    /// mint a new random id
    pub fn generate() -> Self {
        let mut bytes = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(format!("I{}", hex(&bytes)))
    }

    /// deterministic id for a commit that has none
    pub fn fallback_for(sha: CommitId) -> Self {
        let digest = Sha256::digest(sha.to_string().as_bytes());
        Self(format!("I{}", hex(&digest[..20])))
    }

    /// Parse and normalize: surrounding whitespace and slashes are trimmed
    /// and only the last path segment is kept, so a full
    /// `refs/wsync/changes/<id>` resolves to `<id>`.
    pub fn parse(raw: &str) -> Result<Self, InvalidNameError> {
        let trimmed = raw.trim().trim_matches('/');
        let last = trimmed.rsplit('/').next().unwrap_or(trimmed).trim();
        if last.is_empty() {
            return Err(InvalidNameError::Empty);
        }
        if !Self::is_valid(last) {
            return Err(InvalidNameError::InvalidPath(last.to_string()));
        }
        Ok(Self(last.to_string()))
    }

    /// `I` followed by 40 characters, none of them path separators
    pub fn is_valid(value: &str) -> bool {
        value.len() == ID_LEN
            && value.starts_with('I')
            && value[1..].chars().all(|c| c.is_ascii_alphanumeric())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// first 12 characters, for log lines
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ChangeId {
    type Error = InvalidNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ChangeId> for String {
    fn from(id: ChangeId) -> Self {
        id.0
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_format() {
        let a = ChangeId::generate();
        let b = ChangeId::generate();
        assert_eq!(a.as_str().len(), 41);
        assert!(a.as_str().starts_with('I'));
        assert!(a.as_str()[1..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_fallback_is_deterministic() {
        let sha = CommitId::from_hex("0123456789abcdef0123456789abcdef01234567").unwrap();
        let a = ChangeId::fallback_for(sha);
        let b = ChangeId::fallback_for(sha);
        assert_eq!(a, b);
        assert!(ChangeId::is_valid(a.as_str()));
    }

    #[test]
    fn test_parse_normalizes() {
        let id = ChangeId::generate();
        let from_ref = ChangeId::parse(&format!("refs/wsync/changes/{}/", id)).unwrap();
        assert_eq!(from_ref, id);
        let padded = ChangeId::parse(&format!("  {}\n", id)).unwrap();
        assert_eq!(padded, id);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(ChangeId::parse(""), Err(InvalidNameError::Empty)));
        assert!(matches!(ChangeId::parse("/"), Err(InvalidNameError::Empty)));
        assert!(ChangeId::parse("Ishort").is_err());
        assert!(ChangeId::parse(&format!("X{}", "a".repeat(40))).is_err());
    }

    #[test]
    fn test_serde_validates() {
        let id = ChangeId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(serde_json::from_str::<ChangeId>(&json).unwrap(), id);
        assert!(serde_json::from_str::<ChangeId>("\"nope\"").is_err());
    }
}
