use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type SessionId = i64;

const UNKNOWN: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClippingKind {
    Highlight,
    Note,
    Bookmark,
    Unknown,
}

impl ClippingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClippingKind::Highlight => "highlight",
            ClippingKind::Note => "note",
            ClippingKind::Bookmark => "bookmark",
            ClippingKind::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "highlight" => ClippingKind::Highlight,
            "note" => ClippingKind::Note,
            "bookmark" => ClippingKind::Bookmark,
            _ => ClippingKind::Unknown,
        }
    }
}

/// A single annotation decoded from the device file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighlightRecord {
    pub title: String,
    pub author: Option<String>,
    pub content: String,
    pub location: Option<String>,
    pub page: Option<String>,
    /// ISO-8601 when the device string could be parsed, the raw string otherwise.
    pub date: Option<String>,
    pub kind: ClippingKind,
}

impl HighlightRecord {
    pub fn new(title: impl Into<String>, author: Option<&str>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            author: author.map(str::to_string),
            content: content.into(),
            location: None,
            page: None,
            date: None,
            kind: ClippingKind::Highlight,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_date(mut self, date: impl Into<String>) -> Self {
        self.date = Some(date.into());
        self
    }

    /// Records with empty content are dropped before dedup and export.
    pub fn is_exportable(&self) -> bool {
        !self.content.is_empty()
    }

    pub fn dedup_key(&self) -> DedupKey<'_> {
        DedupKey {
            title: &self.title,
            author: self.author.as_deref().unwrap_or(""),
            content: &self.content,
        }
    }
}

/// Identity of a highlight for exactly-once export: `(title, author-or-empty, content)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupKey<'a> {
    pub title: &'a str,
    pub author: &'a str,
    pub content: &'a str,
}

impl DedupKey<'_> {
    /// SHA-256 hex over the three fields, each preceded by its byte length
    /// as a little-endian `u64`, stored as `highlight_hash`.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for field in [self.title, self.author, self.content] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Counters for one pipeline run. Each stage takes the value and hands back
/// an updated copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExportStats {
    pub total_processed: usize,
    pub new_sent: usize,
    pub duplicates_skipped: usize,
    pub failed_to_send: usize,
}

impl ExportStats {
    pub fn with_total(self, total_processed: usize) -> Self {
        Self {
            total_processed,
            ..self
        }
    }

    pub fn with_duplicates(self, duplicates_skipped: usize) -> Self {
        Self {
            duplicates_skipped,
            ..self
        }
    }

    pub fn with_delivery(self, new_sent: usize, failed_to_send: usize) -> Self {
        Self {
            new_sent,
            failed_to_send,
            ..self
        }
    }

    /// Best-effort figures for an aborted run: nothing counts as sent and
    /// everything not yet settled counts as failed.
    pub fn aborted(self, unsettled: usize) -> Self {
        self.with_delivery(0, unsettled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Success,
    Partial,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Success => "success",
            SessionStatus::Partial => "partial",
            SessionStatus::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(SessionStatus::InProgress),
            "success" => Some(SessionStatus::Success),
            "partial" => Some(SessionStatus::Partial),
            "error" => Some(SessionStatus::Error),
            _ => None,
        }
    }

    /// Status of a run that finished without aborting.
    pub fn for_completed(stats: &ExportStats) -> Self {
        if stats.failed_to_send > 0 {
            SessionStatus::Partial
        } else {
            SessionStatus::Success
        }
    }
}

/// Per-highlight export status kept in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportStatus {
    Success,
    Failed,
}

impl ExportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportStatus::Success => "success",
            ExportStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSession {
    pub id: SessionId,
    pub start_time: String,
    pub end_time: Option<String>,
    pub source_file: String,
    pub highlights_total: i64,
    pub highlights_new: i64,
    pub highlights_dupe: i64,
    pub highlights_failed: i64,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredHighlight {
    pub id: i64,
    pub highlight_hash: String,
    pub title: String,
    pub author: Option<String>,
    pub text: String,
    pub location: Option<String>,
    pub date_highlighted: Option<String>,
    pub date_exported: String,
    pub readwise_id: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookSummary {
    pub title: String,
    pub author: Option<String>,
    pub highlight_count: i64,
}

#[derive(Debug, Clone, Default)]
pub struct HighlightFilter {
    pub title: Option<String>,
    pub author: Option<String>,
    pub text: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

/// One entry of the pending view shown before a selective export.
#[derive(Debug, Clone, Serialize)]
pub struct PendingHighlight {
    /// 1-based position within the current pending view.
    pub id: usize,
    pub title: String,
    pub author: String,
    pub highlight: String,
    pub location: String,
    pub date: String,
    #[serde(skip)]
    pub record: HighlightRecord,
}

impl PendingHighlight {
    pub fn new(id: usize, record: HighlightRecord) -> Self {
        let or_unknown = |v: &Option<String>| v.clone().unwrap_or_else(|| UNKNOWN.to_string());
        Self {
            id,
            title: record.title.clone(),
            author: or_unknown(&record.author),
            highlight: record.content.clone(),
            location: or_unknown(&record.location),
            date: or_unknown(&record.date),
            record,
        }
    }
}
