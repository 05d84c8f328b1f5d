use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, NaiveDateTime};
use comfy_table::presets::UTF8_FULL;
use comfy_table::{ContentArrangement, Table};
use serde::Serialize;

use crate::devices::KindleDevice;
use crate::model::{BookSummary, ExportSession, ExportStats, HighlightFilter, PendingHighlight, StoredHighlight};

/// Highlights listed under a session's details before the rest is summarised.
const SESSION_PREVIEW: usize = 10;

const NEWER_KINDLE_NOTICE: &str = "\
Newer Kindle models (Scribe and the 2024 line) are not mounted as a drive.
Copy My Clippings.txt off the device with Amazon's USB File Manager, then run:
  kindlewise export --file /path/to/My\\ Clippings.txt";

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(header);
    table
}

fn or_unknown(value: Option<&str>) -> String {
    value.unwrap_or("Unknown").to_string()
}

/// `YYYY-MM-DD HH:MM:SS` for stored timestamps, the input unchanged otherwise.
pub fn display_time(raw: &str) -> String {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return dt.format("%Y-%m-%d %H:%M:%S").to_string();
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return dt.format("%Y-%m-%d %H:%M:%S").to_string();
    }
    raw.to_string()
}

pub fn export_summary(stats: &ExportStats, source: &Path, dry_run: bool) -> String {
    let mut out = vec!["\n--- Export Summary ---".to_string()];
    if dry_run {
        out.push("[DRY RUN MODE - No highlights were actually sent to Readwise]".to_string());
    }
    out.push(format!("Clippings File: {}", source.display()));
    out.push(format!("Total Clippings Processed: {}", stats.total_processed));
    out.push(format!(
        "New Highlights {}: {}",
        if dry_run { "Found" } else { "Sent to Readwise" },
        stats.new_sent
    ));
    out.push(format!("Duplicate Highlights Skipped: {}", stats.duplicates_skipped));

    if stats.failed_to_send > 0 {
        out.push(format!("Highlights Failed to Send: {}", stats.failed_to_send));
    } else if dry_run {
        out.push("Dry run completed successfully. No actual highlights were sent.".to_string());
    } else {
        out.push("All new highlights sent successfully!".to_string());
    }

    out.join("\n")
}

pub fn history_table(sessions: &[ExportSession]) -> String {
    if sessions.is_empty() {
        return "No export history found.".to_string();
    }

    let mut table = new_table(vec![
        "ID", "Date", "Status", "Total", "New", "Dupes", "Failed", "Source File",
    ]);
    for s in sessions {
        table.add_row(vec![
            s.id.to_string(),
            display_time(&s.start_time),
            s.status.clone(),
            s.highlights_total.to_string(),
            s.highlights_new.to_string(),
            s.highlights_dupe.to_string(),
            s.highlights_failed.to_string(),
            s.source_file.clone(),
        ]);
    }

    let exported: i64 = sessions.iter().map(|s| s.highlights_new).sum();
    format!(
        "\n--- Export History ---\n{}\nTotal Exported: {} highlights across {} sessions",
        table,
        exported,
        sessions.len()
    )
}

fn duration(start: &str, end: &str) -> Option<String> {
    let start = DateTime::parse_from_rfc3339(start).ok()?;
    let end = DateTime::parse_from_rfc3339(end).ok()?;
    let secs = (end - start).num_milliseconds() as f64 / 1000.0;
    Some(format!("{:.3}s", secs))
}

pub fn session_details(session: &ExportSession, highlights: &[StoredHighlight]) -> String {
    let end = session.end_time.as_deref();
    let took = end
        .and_then(|end| duration(&session.start_time, end))
        .unwrap_or_else(|| "Unknown".to_string());

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    for (field, value) in [
        ("Session ID", session.id.to_string()),
        ("Start Time", display_time(&session.start_time)),
        ("End Time", end.map(display_time).unwrap_or_else(|| "Unknown".into())),
        ("Duration", took),
        ("Status", session.status.clone()),
        ("Source File", session.source_file.clone()),
        ("Highlights Processed", session.highlights_total.to_string()),
        ("New Highlights", session.highlights_new.to_string()),
        ("Duplicate Highlights", session.highlights_dupe.to_string()),
        ("Failed Highlights", session.highlights_failed.to_string()),
    ] {
        table.add_row(vec![field.to_string(), value]);
    }

    let mut out = vec![format!("\n--- Session {} ---\n{}", session.id, table)];
    if !highlights.is_empty() {
        let mut recorded = new_table(vec!["Title", "Author", "Status"]);
        for h in highlights.iter().take(SESSION_PREVIEW) {
            recorded.add_row(vec![h.title.clone(), or_unknown(h.author.as_deref()), h.status.clone()]);
        }
        out.push(format!("\nHighlights recorded in this session ({}):\n{}", highlights.len(), recorded));
        if highlights.len() > SESSION_PREVIEW {
            out.push(format!("... and {} more", highlights.len() - SESSION_PREVIEW));
        }
    }

    out.join("\n")
}

pub fn highlight_list(highlights: &[StoredHighlight], total: i64, filter: &HighlightFilter) -> String {
    let mut out = vec![format!("\nFound {} highlights total", total)];
    if total > filter.limit as i64 {
        out.push(format!(
            "Displaying {} highlights (offset: {}, limit: {})",
            highlights.len(),
            filter.offset,
            filter.limit
        ));
    }

    let mut table = new_table(vec!["ID", "Title", "Author", "Location", "Date", "Text"]);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    for h in highlights {
        table.add_row(vec![
            h.id.to_string(),
            h.title.clone(),
            or_unknown(h.author.as_deref()),
            or_unknown(h.location.as_deref()),
            h.date_highlighted.as_deref().map(display_time).unwrap_or_else(|| "Unknown".into()),
            h.text.clone(),
        ]);
    }
    out.push(table.to_string());

    out.join("\n")
}

pub fn book_table(books: &[BookSummary]) -> String {
    if books.is_empty() {
        return "No books found in the database.".to_string();
    }

    let mut table = new_table(vec!["Title", "Author", "Highlights"]);
    for b in books {
        table.add_row(vec![
            b.title.clone(),
            or_unknown(b.author.as_deref()),
            b.highlight_count.to_string(),
        ]);
    }

    let total: i64 = books.iter().map(|b| b.highlight_count).sum();
    format!(
        "\n--- Books in Database ---\n{}\nTotal: {} books, {} highlights",
        table,
        books.len(),
        total
    )
}

/// Pending highlights grouped by book, books in first-seen order.
pub fn pending_by_book(pending: &[PendingHighlight]) -> String {
    let mut order: Vec<(String, String)> = Vec::new();
    let mut groups: BTreeMap<(String, String), Vec<&PendingHighlight>> = BTreeMap::new();
    for p in pending {
        let key = (p.title.clone(), p.author.clone());
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(p);
    }

    let mut out = vec![
        "\n=== Interactive Export Mode ===".to_string(),
        format!("Found {} new highlights to export.", pending.len()),
    ];
    for key in order {
        let mut table = new_table(vec!["#", "Highlight", "Location", "Date"]);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        for p in &groups[&key] {
            table.add_row(vec![p.id.to_string(), p.highlight.clone(), p.location.clone(), p.date.clone()]);
        }
        out.push(format!("\n{} by {}\n{}", key.0, key.1, table));
    }
    out.join("\n")
}

pub fn device_list(devices: &[KindleDevice]) -> String {
    if devices.is_empty() {
        return format!("No Kindle devices detected.\n\n{}", NEWER_KINDLE_NOTICE);
    }

    let mut table = new_table(vec!["#", "Device", "Clippings File", "Status"]);
    for (i, device) in devices.iter().enumerate() {
        let status = if device.is_available() {
            "Available"
        } else {
            "Not available (file not found)"
        };
        table.add_row(vec![
            (i + 1).to_string(),
            device.name.clone(),
            device.clippings.display().to_string(),
            status.to_string(),
        ]);
    }

    format!(
        "Detected {} Kindle device(s):\n{}\nTo export from a device, run:\n  kindlewise export --file <CLIPPINGS FILE>\n\n{}",
        devices.len(),
        table,
        NEWER_KINDLE_NOTICE
    )
}

/// A CSV document with one record per row, headed by the field names of `T`.
pub fn csv_rows<T: Serialize>(rows: &[T]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(row)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("failed to finish csv output: {e}"))?;
    Ok(String::from_utf8(bytes)?)
}

/// The session record, then its highlights as a second CSV block.
pub fn session_csv(session: &ExportSession, highlights: &[StoredHighlight]) -> Result<String> {
    let mut out = csv_rows(std::slice::from_ref(session))?;
    if !highlights.is_empty() {
        out.push('\n');
        out.push_str(&csv_rows(highlights)?);
    }
    Ok(out)
}
