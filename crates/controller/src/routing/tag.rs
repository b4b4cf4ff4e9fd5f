//! Canary tag model.
//!
//! A canary identifier is the pull request number of the change under test.
//! It travels on requests under a single well-known field name, identical
//! for HTTP headers and gRPC metadata, and must survive strict validation
//! before it is ever propagated: anything other than a short run of ASCII
//! digits is treated as "no tag" so that hostile header values can never
//! reach the routing layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Header / metadata key carrying the canary identifier. Absence means
/// "no canary"; the request is served by the stable environment.
pub const CANARY_TAG_FIELD: &str = "x-canary-id";

/// Longest tag value we accept. PR numbers are nowhere near this; anything
/// longer is garbage or abuse.
const MAX_TAG_DIGITS: usize = 10;

/// Identifier of one isolated canary environment (the PR number).
/// Immutable once assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanaryId(pub u64);

impl CanaryId {
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CanaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for CanaryId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl FromStr for CanaryId {
    type Err = TagParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > MAX_TAG_DIGITS {
            return Err(TagParseError);
        }
        if !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TagParseError);
        }
        s.parse::<u64>().map(CanaryId).map_err(|_| TagParseError)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagParseError;

impl fmt::Display for TagParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("canary tag must be 1-10 ASCII digits")
    }
}

impl std::error::Error for TagParseError {}

/// The tag as seen on a request: either a syntactically valid canary id or
/// nothing. Malformed values collapse to `None` at the first hop and are
/// never propagated further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tag(pub Option<CanaryId>);

impl Tag {
    pub const NONE: Tag = Tag(None);

    /// Parses a raw field value. Invalid syntax yields `Tag::NONE`, never
    /// an error: untagged requests are routed to stable rather than
    /// rejected.
    #[must_use]
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some(value) => Tag(value.trim().parse::<CanaryId>().ok()),
            None => Tag::NONE,
        }
    }

    #[must_use]
    pub fn id(self) -> Option<CanaryId> {
        self.0
    }
}

impl From<CanaryId> for Tag {
    fn from(id: CanaryId) -> Self {
        Tag(Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_pr_numbers() {
        assert_eq!("42".parse::<CanaryId>().unwrap(), CanaryId(42));
        assert_eq!("1".parse::<CanaryId>().unwrap(), CanaryId(1));
        assert_eq!("1234567890".parse::<CanaryId>().unwrap(), CanaryId(1_234_567_890));
    }

    #[test]
    fn rejects_non_digit_values() {
        assert!("".parse::<CanaryId>().is_err());
        assert!("42a".parse::<CanaryId>().is_err());
        assert!("-1".parse::<CanaryId>().is_err());
        assert!("4 2".parse::<CanaryId>().is_err());
        assert!("0x2a".parse::<CanaryId>().is_err());
        // header injection style payloads
        assert!("42\r\nX-Other: 1".parse::<CanaryId>().is_err());
        assert!("12345678901".parse::<CanaryId>().is_err());
    }

    #[test]
    fn malformed_tag_collapses_to_none() {
        assert_eq!(Tag::parse(None), Tag::NONE);
        assert_eq!(Tag::parse(Some("")), Tag::NONE);
        assert_eq!(Tag::parse(Some("not-a-pr")), Tag::NONE);
        assert_eq!(Tag::parse(Some(" 42 ")), Tag(Some(CanaryId(42))));
    }
}
