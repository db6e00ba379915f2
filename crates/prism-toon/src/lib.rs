//! TOON: the tagged-section wire format produced by every prism formatter.
//!
//! A document is an ordered list of `# NAME` sections drawn from a closed
//! set (`META`, `CONTENT`, `TOOLS`, `THINKING`). `CONTENT` is mandatory.
//! Payload lines that look like section headers are escaped, so
//! `decode(encode(doc))` recovers the content byte for byte.
//!
//! # Main types
//!
//! - [`ToonCodec`]: encoder/decoder, configured by [`ToonConfig`].
//! - [`ToonDocument`]: structured form of a document.
//! - [`ToonError`]: structural errors raised by validation and decoding.
//! - [`Section`]: the closed set of section names.

/// Encoder, decoder and report helpers.
pub mod codec;
/// Structured document types.
pub mod document;
/// Codec errors.
pub mod error;
pub mod escape;
/// Section names and splitting.
pub mod section;

pub use codec::{content_type_for, ToonCodec, ToonConfig};
pub use document::{SectionInfo, ToonAnalysis, ToonContent, ToonDocument};
pub use error::ToonError;
pub use section::Section;
