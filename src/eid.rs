use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Opaque identifier shared by videos and frames.
///
/// Freshly generated ids are ULIDs so they sort by creation time, but any
/// non-empty externally supplied string is accepted as-is.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Eid(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("identifier must not be empty")]
pub struct EmptyEid;

impl Eid {
    pub fn new() -> Self {
        Self(rusty_ulid::generate_ulid_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Eid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parsing user input: surrounding whitespace is dropped, blank ids rejected.
impl FromStr for Eid {
    type Err = EmptyEid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err(EmptyEid),
            id => Ok(Self(id.to_string())),
        }
    }
}

impl Deref for Eid {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Eid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Eid {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// trusted sources (database rows, generated names) convert directly
impl From<String> for Eid {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for Eid {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generated_ids_are_unique_ulids() {
        let a = Eid::new();
        let b = Eid::new();
        assert_ne!(a, b);
        assert_eq!(a.len(), 26);
    }

    #[test]
    fn test_parse_trims_and_rejects_blank() {
        assert_eq!("  video-42 ".parse::<Eid>().unwrap().as_str(), "video-42");
        assert_eq!("".parse::<Eid>(), Err(EmptyEid));
        assert_eq!("   ".parse::<Eid>(), Err(EmptyEid));
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let id = Eid::from("video-42");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"video-42\"");
        let back: Eid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_lookup_by_str() {
        let ids: HashSet<Eid> = [Eid::from("a"), Eid::from("b")].into_iter().collect();
        assert!(ids.contains("a"));
        assert!(!ids.contains("c"));
    }
}
