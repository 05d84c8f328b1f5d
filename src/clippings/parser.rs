use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;

use super::AnnotationParser;
use crate::error::ExportError;
use crate::model::{ClippingKind, HighlightRecord};

pub const SEPARATOR: &str = "==========";

const BOM: char = '\u{feff}';
const PREVIEW_LENGTH: usize = 80;
const DATE_FORMATS: &[&str] = &["%A, %B %d, %Y %I:%M:%S %p", "%A, %d %B %Y %H:%M:%S"];

static TITLE_AUTHOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+?)(?:\s+\(([^)]+)\))?$").expect("title regex"));

// - Your Highlight on page 12 | Location 180-182 | Added on ...
static METADATA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^- Your (\w+)(?: on page (\d+(?:-\d+)?)?)?(?: \| )?(?:[Ll]ocation )?(\d+-\d+|\d+)?(?: \| )?Added on (.+)$",
    )
    .expect("metadata regex")
});

// - Your Highlight at location 1406-1407 | Added on ...
static AT_LOCATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^- Your (\w+)(?: at [Ll]ocation (\d+-\d+|\d+))?(?: \| )?Added on (.+)$")
        .expect("location regex")
});

// - Your Highlight on page 92 | Added on ...
static PAGE_ONLY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^- Your (\w+)(?: on)? page (\d+(?:-\d+)?)?(?: \| )?Added on (.+)$").expect("page regex")
});

static KIND_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"- Your (\w+)").expect("kind regex"));
static PAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)page (\d+(?:-\d+)?)").expect("page search regex"));
static LOCATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)location (\d+-\d+|\d+)").expect("location search regex"));
static ADDED_ON_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Added on (.+)$").expect("date regex"));

/// Reads a Kindle `My Clippings.txt` file.
#[derive(Debug, Clone)]
pub struct ClippingsParser {
    path: PathBuf,
}

impl ClippingsParser {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AnnotationParser for ClippingsParser {
    fn source(&self) -> &Path {
        &self.path
    }

    fn parse(&self) -> Result<Vec<HighlightRecord>, ExportError> {
        tracing::info!(path = ?self.path, "parsing clippings file");
        let text = fs::read_to_string(&self.path)
            .map_err(|e| ExportError::parsing(&self.path, format!("could not read file: {e}")))?;
        tracing::debug!("read {} bytes from {:?}", text.len(), self.path);

        parse_clippings(&self.path, &text)
    }
}

/// Decodes the text of a clippings file. Bookmarks are dropped; sections
/// that cannot be decoded are skipped with a warning. A file with content
/// but no decodable section at all is malformed.
pub fn parse_clippings(source: &Path, text: &str) -> Result<Vec<HighlightRecord>, ExportError> {
    let text = text.trim_start_matches(BOM);

    let mut records = Vec::new();
    let mut sections = 0;
    let mut skipped = 0;
    let mut bookmarks = 0;

    for (i, raw) in text.split(SEPARATOR).enumerate() {
        let section = raw.trim();
        if section.is_empty() {
            continue;
        }
        sections += 1;

        let Some(record) = parse_section(section, i + 1) else {
            skipped += 1;
            continue;
        };

        if record.kind == ClippingKind::Bookmark {
            bookmarks += 1;
            tracing::debug!("skipping bookmark in section {}", i + 1);
            continue;
        }

        records.push(record);
    }

    tracing::info!(
        sections,
        skipped,
        bookmarks,
        parsed = records.len(),
        "parsing complete"
    );

    if sections > 0 && skipped == sections {
        return Err(ExportError::parsing(
            source,
            format!("none of the {sections} sections could be decoded"),
        ));
    }

    Ok(records)
}

fn parse_section(section: &str, index: usize) -> Option<HighlightRecord> {
    let lines: Vec<&str> = section.lines().collect();

    if lines.len() < 2 {
        tracing::warn!(
            "skipping section {}: expected a title and a metadata line, got '{}'",
            index,
            preview(section)
        );
        return None;
    }

    let title_line = lines[0].trim().trim_start_matches(BOM);
    if title_line.is_empty() {
        tracing::warn!("skipping section {}: empty title line", index);
        return None;
    }

    let (title, author) = parse_title_author(title_line);
    let metadata = parse_metadata(lines[1].trim(), index);
    let content = lines[2..].join("\n").trim().to_string();

    if content.is_empty() && metadata.kind != ClippingKind::Bookmark {
        tracing::warn!("section {} ('{}') has metadata but no content", index, title);
    }

    Some(HighlightRecord {
        title,
        author,
        content,
        location: metadata.location,
        page: metadata.page,
        date: metadata.date,
        kind: metadata.kind,
    })
}

fn parse_title_author(line: &str) -> (String, Option<String>) {
    match TITLE_AUTHOR_RE.captures(line) {
        Some(caps) => {
            let title = caps.get(1).map_or(line, |m| m.as_str()).trim().to_string();
            let author = caps
                .get(2)
                .map(|m| m.as_str().trim().to_string())
                .filter(|a| !a.is_empty());
            (title, author)
        }
        None => (line.to_string(), None),
    }
}

#[derive(Debug, PartialEq)]
struct Metadata {
    kind: ClippingKind,
    page: Option<String>,
    location: Option<String>,
    date: Option<String>,
}

impl Metadata {
    fn unknown() -> Self {
        Metadata {
            kind: ClippingKind::Unknown,
            page: None,
            location: None,
            date: None,
        }
    }
}

fn parse_metadata(line: &str, index: usize) -> Metadata {
    let group = |caps: &regex::Captures, i: usize| caps.get(i).map(|m| m.as_str().to_string());
    let kind = |caps: &regex::Captures| ClippingKind::from_str(&caps[1]);

    if let Some(caps) = METADATA_RE.captures(line) {
        return Metadata {
            kind: kind(&caps),
            page: group(&caps, 2),
            location: group(&caps, 3),
            date: group(&caps, 4).map(|d| normalize_date(&d)),
        };
    }

    if let Some(caps) = AT_LOCATION_RE.captures(line) {
        return Metadata {
            kind: kind(&caps),
            page: None,
            location: group(&caps, 2),
            date: group(&caps, 3).map(|d| normalize_date(&d)),
        };
    }

    if let Some(caps) = PAGE_ONLY_RE.captures(line) {
        return Metadata {
            kind: kind(&caps),
            page: group(&caps, 2),
            location: None,
            date: group(&caps, 3).map(|d| normalize_date(&d)),
        };
    }

    if line.to_lowercase().contains("location") && line.contains("Added on") {
        tracing::debug!("section {}: falling back to field search for '{}'", index, line);
        return Metadata {
            kind: KIND_RE
                .captures(line)
                .map_or(ClippingKind::Unknown, |caps| kind(&caps)),
            page: PAGE_RE.captures(line).and_then(|caps| group(&caps, 1)),
            location: LOCATION_RE.captures(line).and_then(|caps| group(&caps, 1)),
            date: ADDED_ON_RE
                .captures(line)
                .and_then(|caps| group(&caps, 1))
                .map(|d| normalize_date(&d)),
        };
    }

    tracing::warn!("section {}: unrecognised metadata line '{}'", index, preview(line));
    Metadata::unknown()
}

/// ISO-8601 for the two date layouts Kindles write, the raw string otherwise.
fn normalize_date(raw: &str) -> String {
    let raw = raw.trim();
    for format in DATE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return dt.format("%Y-%m-%dT%H:%M:%S").to_string();
        }
    }
    tracing::debug!("keeping unparsed device date '{}'", raw);
    raw.to_string()
}

fn preview(s: &str) -> String {
    if s.chars().count() > PREVIEW_LENGTH {
        format!("{}...", s.chars().take(PREVIEW_LENGTH).collect::<String>())
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = "\u{feff}The Pragmatic Programmer (Hunt, Andrew)\n\
- Your Highlight on page 12 | Location 180-182 | Added on Tuesday, April 15, 2025 11:18:50 PM\n\
\n\
Care about your craft.\n\
==========\n\
Dune (Frank Herbert)\n\
- Your Highlight at location 1406-1407 | Added on Saturday, 26 March 2016 14:59:39\n\
\n\
Fear is the mind-killer.\n\
==========\n\
Dune (Frank Herbert)\n\
- Your Bookmark on Location 1500 | Added on Saturday, 26 March 2016 15:00:00\n\
\n\
\n\
==========\n\
Notes Without Author\n\
- Your Note on page 5 | Added on Someday soon\n\
\n\
My own note\n\
line two\n\
==========\n";

    fn parse(text: &str) -> Result<Vec<HighlightRecord>, ExportError> {
        parse_clippings(Path::new("My Clippings.txt"), text)
    }

    #[test]
    fn test_parse_sample_in_file_order() {
        let records = parse(SAMPLE).unwrap();

        assert_eq!(records.len(), 3);

        assert_eq!(records[0].title, "The Pragmatic Programmer");
        assert_eq!(records[0].author.as_deref(), Some("Hunt, Andrew"));
        assert_eq!(records[0].page.as_deref(), Some("12"));
        assert_eq!(records[0].location.as_deref(), Some("180-182"));
        assert_eq!(records[0].date.as_deref(), Some("2025-04-15T23:18:50"));
        assert_eq!(records[0].content, "Care about your craft.");

        assert_eq!(records[1].title, "Dune");
        assert_eq!(records[1].location.as_deref(), Some("1406-1407"));
        assert_eq!(records[1].date.as_deref(), Some("2016-03-26T14:59:39"));

        assert_eq!(records[2].kind, ClippingKind::Note);
        assert_eq!(records[2].author, None);
        assert_eq!(records[2].page.as_deref(), Some("5"));
        assert_eq!(records[2].date.as_deref(), Some("Someday soon"));
        assert_eq!(records[2].content, "My own note\nline two");
    }

    #[test]
    fn test_title_author_uses_last_parenthesised_group() {
        assert_eq!(
            parse_title_author("Collected Works (Vol 1) (Borges, Jorge Luis)"),
            ("Collected Works (Vol 1)".to_string(), Some("Borges, Jorge Luis".to_string()))
        );
        assert_eq!(parse_title_author("Untitled"), ("Untitled".to_string(), None));
    }

    #[test]
    fn test_metadata_fallbacks() {
        let m = parse_metadata(
            "- Your Highlight on Location 100-102 | Added on Saturday, 26 March 2016 14:59:39",
            1,
        );
        assert_eq!(m.kind, ClippingKind::Highlight);
        assert_eq!(m.location.as_deref(), Some("100-102"));
        assert_eq!(m.date.as_deref(), Some("2016-03-26T14:59:39"));

        let m = parse_metadata("- Your Highlight on page 92 | Added on Saturday, 26 March 2016 14:59:39", 2);
        assert_eq!(m.page.as_deref(), Some("92"));
        assert_eq!(m.location, None);

        assert_eq!(parse_metadata("garbage", 3), Metadata::unknown());
    }

    #[test]
    fn test_section_without_content_is_emitted_empty() {
        let text = "Dune (Frank Herbert)\r\n- Your Highlight at location 10 | Added on Saturday, 26 March 2016 14:59:39\r\n";
        let records = parse(text).unwrap();

        assert_eq!(records.len(), 1);
        assert!(records[0].content.is_empty());
        assert!(!records[0].is_exportable());
    }

    #[test]
    fn test_undecodable_file_is_malformed() {
        let err = parse("just one line\n==========\nanother\n").unwrap_err();
        assert!(matches!(err, ExportError::Parsing { .. }));

        assert!(parse("").unwrap().is_empty());
        assert!(parse("\n==========\n").unwrap().is_empty());
    }

    #[test]
    fn test_parser_rereads_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("My Clippings.txt");
        fs::write(&path, SAMPLE).unwrap();

        let parser = ClippingsParser::new(&path);
        assert_eq!(parser.parse().unwrap().len(), 3);

        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(
            file,
            "Dune (Frank Herbert)\n- Your Highlight at location 20 | Added on Saturday, 26 March 2016 14:59:39\n\nThe spice must flow.\n==========\n"
        )
        .unwrap();

        assert_eq!(parser.parse().unwrap().len(), 4);
    }

    #[test]
    fn test_missing_file_is_a_parsing_error() {
        let parser = ClippingsParser::new("/nonexistent/My Clippings.txt");
        assert!(matches!(parser.parse(), Err(ExportError::Parsing { .. })));
    }
}
