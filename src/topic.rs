//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Topic and pattern handling for the bus. Topics are dot-separated strings of
// non-empty segments; patterns are topic-shaped filters where a segment may be
// a literal, `*` (exactly one segment) or a trailing `#` (zero or more
// segments). Matching walks both segment lists in lock-step with no
// backtracking, so it is O(|pattern| + |topic|).
//--------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};

use crate::error::BusError;

/// Segment separator shared by topics and patterns.
pub const DELIMITER: char = '.';

/// Wildcard matching exactly one segment.
const ONE: &str = "*";

/// Wildcard matching zero or more trailing segments.
const REST: &str = "#";

/// Validates a topic: at least one segment, no empty segments.
pub fn validate_topic(topic: &str) -> Result<(), BusError> {
    if topic.is_empty() || topic.split(DELIMITER).any(|s| s.is_empty()) {
        return Err(BusError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

/// One parsed pattern segment.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternSegment {
    Literal(String),
    /// `*`: consumes exactly one topic segment
    One,
    /// `#`: consumes the remainder of the topic, including zero segments
    Rest,
}

/// A validated subscription pattern.
///
/// Parsing rejects malformed patterns at subscribe time, so matching at
/// publish time can never fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pattern {
    text: String,
    segments: Vec<PatternSegment>,
}

impl Pattern {
    /// Parses and validates a pattern string.
    ///
    /// # Errors
    /// Returns `BusError::InvalidPattern` when the pattern is empty, contains
    /// an empty segment, or places `#` anywhere but the final position.
    pub fn parse(text: &str) -> Result<Self, BusError> {
        if text.is_empty() {
            return Err(BusError::InvalidPattern {
                pattern: text.to_string(),
                reason: "pattern must have at least one segment".to_string(),
            });
        }

        let raw: Vec<&str> = text.split(DELIMITER).collect();
        let mut segments = Vec::with_capacity(raw.len());

        for (idx, segment) in raw.iter().enumerate() {
            match *segment {
                "" => {
                    return Err(BusError::InvalidPattern {
                        pattern: text.to_string(),
                        reason: "segments must be non-empty".to_string(),
                    });
                }
                ONE => segments.push(PatternSegment::One),
                REST => {
                    if idx != raw.len() - 1 {
                        return Err(BusError::InvalidPattern {
                            pattern: text.to_string(),
                            reason: "'#' may only appear as the final segment".to_string(),
                        });
                    }
                    segments.push(PatternSegment::Rest);
                }
                literal => segments.push(PatternSegment::Literal(literal.to_string())),
            }
        }

        Ok(Self {
            text: text.to_string(),
            segments,
        })
    }

    /// Returns the original pattern text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Tests whether this pattern matches a topic.
    pub fn matches(&self, topic: &str) -> bool {
        let segments: Vec<&str> = topic.split(DELIMITER).collect();
        self.matches_segments(&segments)
    }

    /// Tests against a pre-split topic. Callers matching one topic against
    /// many patterns should split once and reuse the segments.
    pub fn matches_segments(&self, topic: &[&str]) -> bool {
        let mut j = 0;

        for segment in &self.segments {
            match segment {
                // `#` consumes everything that remains, including nothing
                PatternSegment::Rest => return true,
                PatternSegment::One => {
                    if j >= topic.len() {
                        return false;
                    }
                    j += 1;
                }
                PatternSegment::Literal(literal) => {
                    if j >= topic.len() || topic[j] != literal.as_str() {
                        return false;
                    }
                    j += 1;
                }
            }
        }

        // Both sequences must be fully consumed
        j == topic.len()
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

impl TryFrom<String> for Pattern {
    type Error = BusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Pattern::parse(&value)
    }
}

impl From<Pattern> for String {
    fn from(pattern: Pattern) -> Self {
        pattern.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, topic: &str) -> bool {
        Pattern::parse(pattern).unwrap().matches(topic)
    }

    #[test]
    fn test_literal_patterns_match_only_themselves() {
        assert!(matches("orders.created", "orders.created"));
        assert!(!matches("orders.created", "orders.cancelled"));
        assert!(!matches("orders.created", "orders"));
        assert!(!matches("orders", "orders.created"));
    }

    #[test]
    fn test_single_segment_wildcard() {
        assert!(matches("a.*.c", "a.b.c"));
        assert!(!matches("a.*.c", "a.b.b.c"));
        assert!(!matches("a.*.c", "a.c"));
        assert!(matches("*", "anything"));
        assert!(!matches("*", "two.segments"));
    }

    #[test]
    fn test_trailing_hash_wildcard() {
        assert!(matches("a.#", "a.b.c.d"));
        // `#` matches zero trailing segments as well
        assert!(matches("a.#", "a"));
        assert!(matches("#", "a"));
        assert!(matches("#", "a.b.c"));
        assert!(!matches("a.#", "b.c"));
    }

    #[test]
    fn test_mixed_wildcards() {
        assert!(matches("a.*.#", "a.b"));
        assert!(matches("a.*.#", "a.b.c.d"));
        assert!(!matches("a.*.#", "a"));
    }

    #[test]
    fn test_misplaced_hash_rejected() {
        assert!(Pattern::parse("a.#.b").is_err());
        assert!(Pattern::parse("#.a").is_err());
    }

    #[test]
    fn test_empty_segments_rejected() {
        assert!(Pattern::parse("").is_err());
        assert!(Pattern::parse("a..b").is_err());
        assert!(Pattern::parse(".a").is_err());
        assert!(Pattern::parse("a.").is_err());
    }

    #[test]
    fn test_topic_validation() {
        assert!(validate_topic("orders.created").is_ok());
        assert!(validate_topic("a").is_ok());
        assert!(validate_topic("").is_err());
        assert!(validate_topic("a..b").is_err());
        assert!(validate_topic(".a").is_err());
    }
}
