use prism_core::PrismError;
use thiserror::Error;

/// Structural errors raised while encoding or decoding TOON text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToonError {
    /// No `# NAME` header line was found.
    #[error("No valid TOON sections found")]
    NoSections,

    /// A header names a section outside the closed set.
    #[error("Invalid section name: {0}")]
    InvalidSection(String),

    /// The mandatory CONTENT section is absent.
    #[error("Missing required CONTENT section")]
    MissingContent,

    /// Content exceeds the configured ceiling.
    #[error("Content length {size} exceeds maximum {max}")]
    ContentTooLarge {
        /// Offending size in bytes.
        size: usize,
        /// Configured ceiling in bytes.
        max: usize,
    },

    /// A section body could not be read.
    #[error("Malformed TOON: {0}")]
    Malformed(String),
}

impl From<ToonError> for PrismError {
    fn from(err: ToonError) -> Self {
        PrismError::Toon(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_messages() {
        assert_eq!(ToonError::NoSections.to_string(), "No valid TOON sections found");
        assert_eq!(
            ToonError::InvalidSection("FOO".to_string()).to_string(),
            "Invalid section name: FOO"
        );
        assert_eq!(
            ToonError::MissingContent.to_string(),
            "Missing required CONTENT section"
        );
    }

    #[test]
    fn test_into_prism_error() {
        let err: PrismError = ToonError::MissingContent.into();
        assert!(matches!(err, PrismError::Toon(_)));
    }
}
