use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Network,
    Timeout,
    Quota,
    Validation,
    Processing,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Network => "network",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Quota => "quota",
            ErrorClass::Validation => "validation",
            ErrorClass::Processing => "processing",
            ErrorClass::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Checked in order; the first class with a matching keyword wins.
const KEYWORDS: &[(ErrorClass, &[&str])] = &[
    (
        ErrorClass::Timeout,
        &["timeout", "timed out", "deadline exceeded", "deadline-exceeded"],
    ),
    (
        ErrorClass::Network,
        &[
            "network",
            "fetch",
            "connection",
            "offline",
            "unavailable",
            "econnreset",
            "socket",
            "dns",
        ],
    ),
    (
        ErrorClass::Quota,
        &[
            "quota",
            "rate limit",
            "rate-limit",
            "too many requests",
            "429",
            "resource-exhausted",
            "resource exhausted",
        ],
    ),
    (
        ErrorClass::Validation,
        &[
            "invalid",
            "validation",
            "required",
            "malformed",
            "bad request",
            "unsupported",
            "too large",
        ],
    ),
    (
        ErrorClass::Processing,
        &[
            "processing",
            "parse",
            "generation",
            "analysis",
            "internal",
            "failed to generate",
        ],
    ),
];

/// Maps a free-text error message onto an error class by keyword.
pub fn classify(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| lower.contains(w)))
        .map_or(ErrorClass::Unknown, |(class, _)| *class)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_keyword() {
        assert_eq!(classify("Network request failed"), ErrorClass::Network);
        assert_eq!(classify("deadline-exceeded"), ErrorClass::Timeout);
        assert_eq!(classify("HTTP 429 Too Many Requests"), ErrorClass::Quota);
        assert_eq!(classify("Invalid file type: .exe"), ErrorClass::Validation);
        assert_eq!(classify("Failed to parse CV sections"), ErrorClass::Processing);
        assert_eq!(classify("something odd happened"), ErrorClass::Unknown);
    }

    #[test]
    fn test_timeout_wins_over_network() {
        assert_eq!(classify("connection timed out"), ErrorClass::Timeout);
    }
}
