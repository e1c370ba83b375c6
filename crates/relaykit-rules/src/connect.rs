//! HTTP CONNECT allow-list
//!
//! Only messages that begin with the `CONNECT` method are judged. The target
//! (second whitespace-delimited token, e.g. `example.com:443`) must match one
//! of the configured regular expressions; otherwise the default response is
//! returned.

use crate::{Rule, RuleError, RuleResponse};
use regex_lite::Regex;
use tracing::trace;

const CONNECT_METHOD: &[u8] = b"CONNECT";

#[derive(Debug)]
pub struct ConnectRules {
    /// Acceptable target patterns, tried in order
    whitelist: Vec<Regex>,
    default_response: RuleResponse,
}

impl ConnectRules {
    /// Build from a list of patterns; unmatched CONNECT targets are dropped
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, RuleError> {
        let whitelist = patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern.as_ref()).map_err(|source| RuleError::InvalidPattern {
                    pattern: pattern.as_ref().to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            whitelist,
            default_response: RuleResponse::DropFlat,
        })
    }

    /// Response for CONNECT targets that match no pattern
    pub fn with_default(mut self, response: RuleResponse) -> Self {
        self.default_response = response;
        self
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.whitelist.iter().map(|r| r.as_str())
    }

    fn target(message: &[u8]) -> Option<&str> {
        let target = message
            .split(|b| b.is_ascii_whitespace())
            .filter(|token| !token.is_empty())
            .nth(1)?;
        std::str::from_utf8(target).ok()
    }
}

impl Rule for ConnectRules {
    fn allow(&self, message: &[u8]) -> RuleResponse {
        if !message.starts_with(CONNECT_METHOD) {
            return RuleResponse::Undefined;
        }

        let Some(host) = Self::target(message) else {
            return self.default_response;
        };

        for rule in &self.whitelist {
            trace!("Try match {} with {}", rule.as_str(), host);
            if rule.is_match(host) {
                return RuleResponse::Allow;
            }
        }
        self.default_response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patterns_keep_configured_order() {
        let rules = ConnectRules::new(&["^b\\.example:443$", "^a\\.example:443$"]).unwrap();
        let patterns: Vec<&str> = rules.patterns().collect();
        assert_eq!(patterns, vec!["^b\\.example:443$", "^a\\.example:443$"]);
    }

    #[test]
    fn test_matching_host_allowed() {
        let rules = ConnectRules::new(&["^example\\.com:443$"]).unwrap();
        let resp = rules.allow(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n");
        assert_eq!(resp, RuleResponse::Allow);
    }

    #[test]
    fn test_unmatched_host_dropped() {
        let rules = ConnectRules::new(&["^example\\.com:443$"]).unwrap();
        let resp = rules.allow(b"CONNECT evil.com:443 HTTP/1.1\r\n\r\n");
        assert_eq!(resp, RuleResponse::DropFlat);
    }

    #[test]
    fn test_non_connect_undefined() {
        let rules = ConnectRules::new(&[".*"]).unwrap();
        assert_eq!(
            rules.allow(b"GET / HTTP/1.1\r\n\r\n"),
            RuleResponse::Undefined
        );
        assert_eq!(rules.allow(&[0xff, 0x00, 0x13]), RuleResponse::Undefined);
        assert_eq!(rules.allow(b""), RuleResponse::Undefined);
    }

    #[test]
    fn test_first_match_wins_in_order() {
        let rules = ConnectRules::new(&["^api\\.", "\\.internal:22$"]).unwrap();

        assert_eq!(
            rules.allow(b"CONNECT api.example.com:443 HTTP/1.1\r\n\r\n"),
            RuleResponse::Allow
        );
        assert_eq!(
            rules.allow(b"CONNECT db.internal:22 HTTP/1.1\r\n\r\n"),
            RuleResponse::Allow
        );
        assert_eq!(
            rules.allow(b"CONNECT db.internal:5432 HTTP/1.1\r\n\r\n"),
            RuleResponse::DropFlat
        );
    }

    #[test]
    fn test_connect_without_target_gets_default() {
        let rules = ConnectRules::new(&[".*"]).unwrap();
        assert_eq!(rules.allow(b"CONNECT"), RuleResponse::DropFlat);
        assert_eq!(rules.allow(b"CONNECT   \r\n"), RuleResponse::DropFlat);
    }

    #[test]
    fn test_extra_whitespace_between_tokens() {
        let rules = ConnectRules::new(&["^example\\.com:443$"]).unwrap();
        assert_eq!(
            rules.allow(b"CONNECT  example.com:443\tHTTP/1.1\r\n\r\n"),
            RuleResponse::Allow
        );
    }

    #[test]
    fn test_configured_default() {
        let rules = ConnectRules::new(&["^ok$"])
            .unwrap()
            .with_default(RuleResponse::RespondFail);
        assert_eq!(
            rules.allow(b"CONNECT nope:80 HTTP/1.1\r\n\r\n"),
            RuleResponse::RespondFail
        );
    }

    #[test]
    fn test_no_patterns_drops_every_connect() {
        let rules = ConnectRules::new::<&str>(&[]).unwrap();
        assert_eq!(
            rules.allow(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n"),
            RuleResponse::DropFlat
        );
    }

    #[test]
    fn test_invalid_pattern() {
        let err = ConnectRules::new(&["(unclosed"]).unwrap_err();
        assert!(matches!(err, RuleError::InvalidPattern { ref pattern, .. } if pattern == "(unclosed"));
    }
}
