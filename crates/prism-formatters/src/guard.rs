//! Size ceiling and threat screening applied before any parsing.

use prism_core::{codes, PatternTable, ProcessingResult};
use tracing::warn;

/// Byte ceiling applied by the provider formatters before any regex work.
pub const MAX_INPUT_BYTES: usize = 10 * 1024 * 1024;

/// Script, SQL-injection and path-traversal idioms rejected by the OpenAI
/// formatter and the tool-call extractor.
pub const THREAT_PATTERNS: &[(&str, &str)] = &[
    ("script_open", r"(?i)<script[^>]*>"),
    ("script_close", r"(?i)</script>"),
    ("javascript_uri", r"(?i)javascript\s*:"),
    ("onerror_handler", r"(?i)onerror\s*="),
    ("onload_handler", r"(?i)onload\s*="),
    ("eval_call", r"(?i)eval\s*\("),
    ("system_call", r"(?i)system\s*\("),
    ("exec_call", r"(?i)exec\s*\("),
    ("sql_tautology_single", r"(?i)'\s+OR\s+'1'\s*=\s*'1"),
    ("sql_tautology_double", r#"(?i)"\s+OR\s+"1"\s*=\s*"1"#),
    ("sql_drop_table", r"(?i);\s*DROP\s+TABLE"),
    ("sql_union_select", r"(?i)UNION\s+SELECT"),
    ("path_traversal", r"\.\./"),
    ("path_traversal_any", r"\.\.[\\/]"),
    ("etc_passwd", r"(?i)/etc/passwd"),
    ("windows_dir", r"(?i)c:\\windows"),
];

/// Input screen: size ceiling, optional threat scan, control character strip.
///
/// Control characters other than `\n`, `\t` and `\r` are removed from
/// accepted input.
#[derive(Debug, Clone)]
pub struct ContentGuard {
    max_bytes: usize,
    threats: PatternTable,
}

impl Default for ContentGuard {
    fn default() -> Self {
        Self::new(MAX_INPUT_BYTES)
    }
}

impl ContentGuard {
    /// A guard enforcing only the size ceiling.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            threats: PatternTable::default(),
        }
    }

    /// A guard that also rejects [`THREAT_PATTERNS`].
    pub fn with_threats(max_bytes: usize) -> Self {
        Self::new(max_bytes).with_table(PatternTable::build("threats", THREAT_PATTERNS))
    }

    /// Replaces the threat table.
    pub fn with_table(mut self, threats: PatternTable) -> Self {
        self.threats = threats;
        self
    }

    /// Configured ceiling in bytes.
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Changes the ceiling.
    pub fn set_max_bytes(&mut self, max_bytes: usize) {
        self.max_bytes = max_bytes;
    }

    /// Name of the first threat rule matching `text`.
    pub fn scan(&self, text: &str) -> Option<&'static str> {
        self.threats
            .iter()
            .find(|p| p.regex.is_match(text))
            .map(|p| p.name)
    }

    /// Screens `input`.
    pub fn screen(&self, input: &str) -> Screened {
        if input.len() > self.max_bytes {
            warn!(
                size = input.len(),
                max = self.max_bytes,
                "Rejecting oversized input"
            );
            return Screened::Rejected {
                code: codes::INPUT_TOO_LARGE,
                reason: format!(
                    "Input size {} exceeds maximum {} bytes",
                    input.len(),
                    self.max_bytes
                ),
            };
        }

        if let Some(rule) = self.scan(input) {
            warn!(rule, "Rejecting input matching threat pattern");
            return Screened::Rejected {
                code: codes::SECURITY_VIOLATION,
                reason: format!("Malicious content detected ({rule})"),
            };
        }

        if !input
            .chars()
            .any(|c| c.is_control() && !matches!(c, '\n' | '\t' | '\r'))
        {
            return Screened::Clean;
        }
        let cleaned: String = input
            .chars()
            .filter(|c| !c.is_control() || matches!(c, '\n' | '\t' | '\r'))
            .collect();
        if cleaned.is_empty() {
            return Screened::Rejected {
                code: codes::VALIDATION_ERROR,
                reason: "Input contains only control characters".to_string(),
            };
        }
        Screened::Cleaned(cleaned)
    }
}

/// Outcome of [`ContentGuard::screen`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Screened {
    /// Input was already clean; use it as is.
    Clean,
    /// Control characters were removed.
    Cleaned(String),
    /// Input was rejected entirely.
    Rejected {
        /// Stable error code.
        code: &'static str,
        /// Human readable reason.
        reason: String,
    },
}

impl Screened {
    /// Whether the input was rejected.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Screened::Rejected { .. })
    }

    /// The text to process: the cleaned copy, or `original` when clean.
    /// Rejections become a failed [`ProcessingResult`].
    pub fn resolve(self, original: &str) -> Result<String, ProcessingResult> {
        match self {
            Screened::Clean => Ok(original.to_string()),
            Screened::Cleaned(cleaned) => Ok(cleaned),
            Screened::Rejected { code, reason } => Err(ProcessingResult::failure(reason, code)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_input() {
        let guard = ContentGuard::default();
        assert_eq!(guard.screen("Hello world\nNew line"), Screened::Clean);
    }

    #[test]
    fn test_control_chars_stripped() {
        let guard = ContentGuard::default();
        assert_eq!(
            guard.screen("Hello\x00\x01World"),
            Screened::Cleaned("HelloWorld".to_string())
        );
    }

    #[test]
    fn test_length_rejection() {
        let guard = ContentGuard::new(10);
        let screened = guard.screen("This is too long for the limit");
        assert!(screened.is_rejected());
        let failure = screened.resolve("").unwrap_err();
        assert_eq!(failure.error_code(), Some(codes::INPUT_TOO_LARGE));
    }

    #[test]
    fn test_threats_rejected() {
        let guard = ContentGuard::with_threats(MAX_INPUT_BYTES);
        for input in [
            "<script>alert(1)</script>",
            "x' OR '1'='1",
            "read ../../secret",
            "cat /etc/passwd",
            "1; DROP TABLE users",
        ] {
            match guard.screen(input) {
                Screened::Rejected { code, .. } => assert_eq!(code, codes::SECURITY_VIOLATION),
                other => panic!("{input:?} was not rejected: {other:?}"),
            }
        }
        assert_eq!(guard.screen("The weather in Paris"), Screened::Clean);
    }

    #[test]
    fn test_plain_guard_ignores_threats() {
        let guard = ContentGuard::default();
        assert!(guard.scan("<script>").is_none());
    }
}
