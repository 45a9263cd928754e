use conductor_core::{ConductorError, ConductorResult};
use regex::Regex;

/// Compiled channel pattern.
///
/// Channels are `:`-separated segments (`role:architect`, `reply:<id>`).
/// `*` matches any run of characters inside a single segment, so
/// `role:*` matches `role:architect` but not `role` or `role:a:b`.
#[derive(Debug, Clone)]
pub struct ChannelPattern {
    raw: String,
    regex: Regex,
}

impl ChannelPattern {
    pub fn new(pattern: &str) -> ConductorResult<Self> {
        if pattern.trim().is_empty() {
            return Err(ConductorError::validation("empty channel pattern"));
        }
        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join("[^:]*");
        let regex = Regex::new(&format!("^{body}$"))
            .map_err(|e| ConductorError::validation(format!("bad pattern '{pattern}': {e}")))?;
        Ok(Self {
            raw: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, channel: &str) -> bool {
        self.regex.is_match(channel)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the pattern contains no wildcard.
    pub fn is_literal(&self) -> bool {
        !self.raw.contains('*')
    }
}

impl std::fmt::Display for ChannelPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_literal() {
        let p = ChannelPattern::new("broadcast").unwrap();
        assert!(p.is_literal());
        assert!(p.matches("broadcast"));
        assert!(!p.matches("broadcast:x"));
    }

    #[test]
    fn test_wildcard_stays_in_segment() {
        let p = ChannelPattern::new("role:*").unwrap();
        assert!(p.matches("role:architect"));
        assert!(p.matches("role:"));
        assert!(!p.matches("role"));
        assert!(!p.matches("role:a:b"));
        assert!(!p.matches("reply:abc"));
    }

    #[test]
    fn test_partial_segment_wildcard() {
        let p = ChannelPattern::new("role:*_developer").unwrap();
        assert!(p.matches("role:backend_developer"));
        assert!(p.matches("role:frontend_developer"));
        assert!(!p.matches("role:architect"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let p = ChannelPattern::new("reply:a.b").unwrap();
        assert!(p.matches("reply:a.b"));
        assert!(!p.matches("reply:axb"));
    }

    #[test]
    fn test_empty_rejected() {
        assert!(ChannelPattern::new(" ").is_err());
    }
}
