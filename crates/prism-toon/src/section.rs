use crate::error::ToonError;
use std::fmt;

/// The closed set of TOON section names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Section {
    /// Flat `key: value` metadata.
    Meta,
    /// The primary payload. Mandatory.
    Content,
    /// Extracted tool calls.
    Tools,
    /// Separated reasoning.
    Thinking,
}

impl Section {
    /// Emission order.
    pub const ORDER: [Section; 4] = [
        Section::Meta,
        Section::Content,
        Section::Tools,
        Section::Thinking,
    ];

    /// Header name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Meta => "META",
            Section::Content => "CONTENT",
            Section::Tools => "TOOLS",
            Section::Thinking => "THINKING",
        }
    }

    /// Parses a header name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ORDER.into_iter().find(|s| s.as_str() == name)
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A header line found in a document, with the raw body that follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSection<'a> {
    /// Name as written in the header.
    pub name: &'a str,
    /// Text between the end of the header line and the next header.
    pub body: &'a str,
}

/// Recognizes `# NAME` header lines where NAME is one or more ASCII
/// uppercase letters, optionally followed by trailing whitespace.
fn header_name(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("# ")?;
    let name = rest.trim_end_matches([' ', '\t', '\r', '\n']);
    if !name.is_empty() && name.bytes().all(|b| b.is_ascii_uppercase()) {
        Some(name)
    } else {
        None
    }
}

/// Splits a document into header/body pairs, in document order.
///
/// Text before the first header is ignored. Names are not checked against
/// the closed set here; see [`check_sections`].
pub fn split_sections(text: &str) -> Vec<RawSection<'_>> {
    let mut headers: Vec<(&str, usize, usize)> = Vec::new();
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if let Some(name) = header_name(line) {
            headers.push((name, offset, offset + line.len()));
        }
        offset += line.len();
    }

    headers
        .iter()
        .enumerate()
        .map(|(i, &(name, _, body_start))| {
            let body_end = headers.get(i + 1).map_or(text.len(), |next| next.1);
            RawSection {
                name,
                body: &text[body_start..body_end],
            }
        })
        .collect()
}

/// Validates the section structure of a document.
pub fn check_sections(sections: &[RawSection<'_>]) -> Result<(), ToonError> {
    if sections.is_empty() {
        return Err(ToonError::NoSections);
    }
    for raw in sections {
        if Section::from_name(raw.name).is_none() {
            return Err(ToonError::InvalidSection(raw.name.to_string()));
        }
    }
    if !sections.iter().any(|s| s.name == Section::Content.as_str()) {
        return Err(ToonError::MissingContent);
    }
    Ok(())
}

/// Drops the single blank separator line the encoder writes after each
/// section body.
pub fn strip_separator(body: &str) -> &str {
    if body.ends_with("\n\n") {
        &body[..body.len() - 1]
    } else {
        body
    }
}
