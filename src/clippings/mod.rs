//! Clippings Module
//!
//! Decodes the annotation file a Kindle keeps in `documents/My Clippings.txt`
//! into [`HighlightRecord`]s, in file order.
//!
//! The decoder performs structural decoding only. It does not deduplicate
//! and it may emit records with empty content; the export pipeline filters
//! those out.
//!
//! # Usage
//!
//! ```rust,ignore
//! use kindlewise::clippings::{AnnotationParser, ClippingsParser};
//!
//! let parser = ClippingsParser::new("My Clippings.txt");
//! for record in parser.parse()? {
//!     println!("{}: {}", record.title, record.content);
//! }
//! ```

mod parser;

use std::path::Path;

use crate::error::ExportError;
use crate::model::HighlightRecord;

pub use parser::{ClippingsParser, SEPARATOR, parse_clippings};

/// Source of annotation records for one pipeline run.
///
/// Every call re-reads the source; nothing is cached between calls.
pub trait AnnotationParser: Send + Sync {
    /// Identifies the source, used for validation and session records.
    fn source(&self) -> &Path;

    fn parse(&self) -> Result<Vec<HighlightRecord>, ExportError>;
}
