use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use libsql::{Builder, Connection, Database as LibsqlDatabase};
use tokio::sync::RwLock;

use crate::error::ExportError;
use crate::model::*;

/// Bookkeeping table. Created unconditionally before any schema step runs.
const MIGRATIONS_TABLE: &str = include_str!("migrations/system/000_migrations_table.sql");

/// Ledger schema steps in apply order, recorded by name in `_migrations`.
const SCHEMA_STEPS: &[(&str, &str)] = &[
    ("001_highlights.sql", include_str!("migrations/001_highlights.sql")),
    ("002_export_sessions.sql", include_str!("migrations/002_export_sessions.sql")),
];

const SESSION_COLUMNS: &str = "id, start_time, end_time, source_file, highlights_total, highlights_new, \
     highlights_dupe, highlights_failed, status";

const HIGHLIGHT_COLUMNS: &str = "id, highlight_hash, title, author, text, location, date_highlighted, \
     date_exported, readwise_id, status";

/// Deduplication ledger and session log used by the export pipeline.
#[async_trait]
pub trait HighlightStore: Send + Sync {
    /// True iff a highlight with this DedupKey was exported successfully before.
    async fn exists(&self, title: &str, author: &str, content: &str) -> Result<bool, ExportError>;

    async fn save(&self, record: &HighlightRecord, status: ExportStatus) -> Result<(), ExportError>;

    async fn start_session(&self, source: &str) -> Result<SessionId, ExportError>;

    async fn complete_session(
        &self,
        session_id: SessionId,
        stats: &ExportStats,
        status: SessionStatus,
    ) -> Result<(), ExportError>;

    /// Releases the underlying connection. Safe to call more than once.
    async fn close(&self) -> Result<(), ExportError>;
}

struct Handle {
    _db: LibsqlDatabase,
    conn: Connection,
}

pub struct Database {
    path: PathBuf,
    handle: RwLock<Option<Handle>>,
}

fn now() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

impl Database {
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| anyhow::anyhow!("failed to create data directory {:?}: {e}", parent))?;
            }
        }

        tracing::info!(path = ?path, "opening highlight ledger");
        let db = Builder::new_local(path).build().await?;
        let conn = db.connect()?;
        conn.query("SELECT 1", ()).await?;

        Self::migrate(&conn).await?;

        Ok(Database {
            path: path.to_path_buf(),
            handle: RwLock::new(Some(Handle { _db: db, conn })),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn connection(&self) -> Result<Connection> {
        self.handle
            .read()
            .await
            .as_ref()
            .map(|h| h.conn.clone())
            .ok_or_else(|| anyhow::anyhow!("database {:?} is closed", self.path))
    }

    /// Brings the ledger schema up to date, skipping steps already recorded.
    async fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(MIGRATIONS_TABLE).await?;
        let applied = Self::applied_steps(conn).await?;

        let pending = SCHEMA_STEPS.iter().filter(|(name, _)| !applied.contains(*name));
        for (name, sql) in pending {
            tracing::info!(step = name, "migrating ledger schema");
            conn.execute_batch(sql)
                .await
                .map_err(|e| anyhow::anyhow!("ledger schema step {name} failed: {e}"))?;
            conn.execute(
                "INSERT INTO _migrations (name, applied_at) VALUES (?, ?)",
                libsql::params![*name, now()],
            )
            .await?;
        }

        tracing::debug!(steps = SCHEMA_STEPS.len(), "ledger schema up to date");
        Ok(())
    }

    async fn applied_steps(conn: &Connection) -> Result<HashSet<String>> {
        let mut rows = conn.query("SELECT name FROM _migrations", ()).await?;
        let mut names = HashSet::new();
        while let Some(row) = rows.next().await? {
            names.insert(row.get::<String>(0)?);
        }
        Ok(names)
    }

    pub async fn highlight_exists(&self, title: &str, author: &str, text: &str) -> Result<bool> {
        let hash = DedupKey { title, author, content: text }.fingerprint();
        let conn = self.connection().await?;

        let query = "SELECT 1 FROM highlights WHERE highlight_hash = ? AND status = 'success' LIMIT 1";
        let mut rows = conn.query(query, libsql::params![hash.clone()]).await?;
        let exists = rows.next().await?.is_some();

        tracing::debug!("highlight {} {}", &hash[..8], if exists { "exists" } else { "is new" });
        Ok(exists)
    }

    pub async fn save_highlight(&self, record: &HighlightRecord, status: ExportStatus) -> Result<()> {
        let hash = record.dedup_key().fingerprint();
        let conn = self.connection().await?;

        let query = r#"
            INSERT INTO highlights
                (highlight_hash, title, author, text, location, date_highlighted, date_exported, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(highlight_hash) DO UPDATE SET
                location = excluded.location,
                date_highlighted = excluded.date_highlighted,
                date_exported = excluded.date_exported,
                status = excluded.status
        "#;

        conn.execute(
            query,
            libsql::params![
                hash.clone(),
                record.title.clone(),
                record.author.clone(),
                record.content.clone(),
                record.location.clone(),
                record.date.clone(),
                now(),
                status.as_str()
            ],
        )
        .await
        .map_err(|e| anyhow::anyhow!("failed to save highlight {}: {e}", &hash[..8]))?;

        tracing::debug!(title = %record.title, hash = &hash[..8], "saved highlight");
        Ok(())
    }

    pub async fn start_export_session(&self, source_file: &str) -> Result<SessionId> {
        let conn = self.connection().await?;
        let query = r#"
            INSERT INTO export_sessions (start_time, source_file, status)
            VALUES (?, ?, ?)
            RETURNING id
        "#;

        let mut rows = conn
            .query(
                query,
                libsql::params![now(), source_file, SessionStatus::InProgress.as_str()],
            )
            .await?;

        let session_id: SessionId = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => anyhow::bail!("failed to start export session for {}", source_file),
        };

        tracing::info!(session_id, source_file, "export session started");
        Ok(session_id)
    }

    /// Records the outcome of a session. A session is completed once; later
    /// calls for the same id are ignored.
    pub async fn complete_export_session(
        &self,
        session_id: SessionId,
        stats: &ExportStats,
        status: SessionStatus,
    ) -> Result<()> {
        let conn = self.connection().await?;
        let query = r#"
            UPDATE export_sessions
            SET end_time = ?, highlights_total = ?, highlights_new = ?,
                highlights_dupe = ?, highlights_failed = ?, status = ?
            WHERE id = ? AND end_time IS NULL
        "#;

        let affected = conn
            .execute(
                query,
                libsql::params![
                    now(),
                    stats.total_processed as i64,
                    stats.new_sent as i64,
                    stats.duplicates_skipped as i64,
                    stats.failed_to_send as i64,
                    status.as_str(),
                    session_id
                ],
            )
            .await?;

        if affected == 0 {
            tracing::warn!(session_id, "session missing or already completed, ignoring");
        } else {
            tracing::info!(session_id, status = status.as_str(), "export session completed");
        }
        Ok(())
    }

    pub async fn close(&self) {
        if self.handle.write().await.take().is_some() {
            tracing::info!(path = ?self.path, "closed highlight ledger");
        }
    }

    pub async fn export_history(&self, limit: u32) -> Result<Vec<ExportSession>> {
        let conn = self.connection().await?;
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM export_sessions ORDER BY start_time DESC, id DESC LIMIT ?"
        );

        let mut rows = conn.query(&query, libsql::params![limit as i64]).await?;
        let mut sessions = Vec::new();
        while let Some(row) = rows.next().await? {
            sessions.push(Self::row_to_session(&row)?);
        }
        Ok(sessions)
    }

    pub async fn session(&self, session_id: SessionId) -> Result<Option<ExportSession>> {
        let conn = self.connection().await?;
        let query = format!("SELECT {SESSION_COLUMNS} FROM export_sessions WHERE id = ?");

        let mut rows = conn.query(&query, libsql::params![session_id]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(Self::row_to_session(&row)?)),
            None => Ok(None),
        }
    }

    /// Highlights whose export time falls inside the session's window.
    pub async fn highlights_by_session(&self, session_id: SessionId) -> Result<Vec<StoredHighlight>> {
        let Some(session) = self.session(session_id).await? else {
            return Ok(vec![]);
        };
        let Some(end_time) = session.end_time else {
            return Ok(vec![]);
        };

        let conn = self.connection().await?;
        let query = format!(
            "SELECT {HIGHLIGHT_COLUMNS} FROM highlights \
             WHERE date_exported >= ? AND date_exported <= ? ORDER BY date_exported"
        );

        let mut rows = conn
            .query(&query, libsql::params![session.start_time, end_time])
            .await?;
        let mut highlights = Vec::new();
        while let Some(row) = rows.next().await? {
            highlights.push(Self::row_to_highlight(&row)?);
        }
        Ok(highlights)
    }

    pub async fn highlight_count(&self) -> Result<i64> {
        self.count("SELECT COUNT(*) FROM highlights", vec![]).await
    }

    pub async fn session_count(&self) -> Result<i64> {
        self.count("SELECT COUNT(*) FROM export_sessions", vec![]).await
    }

    pub async fn count_highlights(&self, filter: &HighlightFilter) -> Result<i64> {
        let (clause, params) = Self::filter_clause(filter);
        self.count(&format!("SELECT COUNT(*) FROM highlights {clause}"), params)
            .await
    }

    async fn count(&self, query: &str, params: Vec<libsql::Value>) -> Result<i64> {
        let conn = self.connection().await?;
        let mut rows = conn.query(query, params).await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }

    pub async fn list_highlights(&self, filter: &HighlightFilter) -> Result<Vec<StoredHighlight>> {
        let (clause, mut params) = Self::filter_clause(filter);
        params.push((filter.limit as i64).into());
        params.push((filter.offset as i64).into());

        let conn = self.connection().await?;
        let query = format!(
            "SELECT {HIGHLIGHT_COLUMNS} FROM highlights {clause} \
             ORDER BY date_exported DESC, id DESC LIMIT ? OFFSET ?"
        );

        let mut rows = conn.query(&query, params).await?;
        let mut highlights = Vec::new();
        while let Some(row) = rows.next().await? {
            highlights.push(Self::row_to_highlight(&row)?);
        }
        Ok(highlights)
    }

    fn filter_clause(filter: &HighlightFilter) -> (String, Vec<libsql::Value>) {
        let mut clauses = Vec::new();
        let mut params: Vec<libsql::Value> = Vec::new();

        if let Some(title) = &filter.title {
            clauses.push("title LIKE ?");
            params.push(format!("%{}%", title).into());
        }
        if let Some(author) = &filter.author {
            clauses.push("author LIKE ?");
            params.push(format!("%{}%", author).into());
        }
        if let Some(text) = &filter.text {
            clauses.push("text LIKE ?");
            params.push(format!("%{}%", text).into());
        }

        if clauses.is_empty() {
            (String::new(), params)
        } else {
            (format!("WHERE {}", clauses.join(" AND ")), params)
        }
    }

    pub async fn books(&self) -> Result<Vec<BookSummary>> {
        let conn = self.connection().await?;
        let query = r#"
            SELECT title, author, COUNT(*) AS highlight_count
            FROM highlights
            GROUP BY title, author
            ORDER BY title COLLATE NOCASE, author COLLATE NOCASE
        "#;

        let mut rows = conn.query(query, ()).await?;
        let mut books = Vec::new();
        while let Some(row) = rows.next().await? {
            books.push(BookSummary {
                title: row.get(0)?,
                author: row.get(1)?,
                highlight_count: row.get(2)?,
            });
        }
        Ok(books)
    }

    pub async fn delete_highlight(&self, id: i64) -> Result<bool> {
        let conn = self.connection().await?;
        let affected = conn
            .execute("DELETE FROM highlights WHERE id = ?", libsql::params![id])
            .await?;
        Ok(affected > 0)
    }

    /// Deleted highlights become pending again on the next export.
    pub async fn delete_highlights_by_book(&self, title: &str, author: Option<&str>) -> Result<u64> {
        let conn = self.connection().await?;
        let affected = match author {
            Some(author) => {
                conn.execute(
                    "DELETE FROM highlights WHERE title = ? AND author = ?",
                    libsql::params![title, author],
                )
                .await?
            }
            None => {
                conn.execute("DELETE FROM highlights WHERE title = ?", libsql::params![title])
                    .await?
            }
        };
        Ok(affected)
    }

    fn row_to_session(row: &libsql::Row) -> Result<ExportSession> {
        Ok(ExportSession {
            id: row.get(0)?,
            start_time: row.get(1)?,
            end_time: row.get(2)?,
            source_file: row.get(3)?,
            highlights_total: row.get(4)?,
            highlights_new: row.get(5)?,
            highlights_dupe: row.get(6)?,
            highlights_failed: row.get(7)?,
            status: row.get(8)?,
        })
    }

    fn row_to_highlight(row: &libsql::Row) -> Result<StoredHighlight> {
        Ok(StoredHighlight {
            id: row.get(0)?,
            highlight_hash: row.get(1)?,
            title: row.get(2)?,
            author: row.get(3)?,
            text: row.get(4)?,
            location: row.get(5)?,
            date_highlighted: row.get(6)?,
            date_exported: row.get(7)?,
            readwise_id: row.get(8)?,
            status: row.get(9)?,
        })
    }
}

#[async_trait]
impl HighlightStore for Database {
    async fn exists(&self, title: &str, author: &str, content: &str) -> Result<bool, ExportError> {
        Ok(self.highlight_exists(title, author, content).await?)
    }

    async fn save(&self, record: &HighlightRecord, status: ExportStatus) -> Result<(), ExportError> {
        Ok(self.save_highlight(record, status).await?)
    }

    async fn start_session(&self, source: &str) -> Result<SessionId, ExportError> {
        Ok(self.start_export_session(source).await?)
    }

    async fn complete_session(
        &self,
        session_id: SessionId,
        stats: &ExportStats,
        status: SessionStatus,
    ) -> Result<(), ExportError> {
        Ok(self.complete_export_session(session_id, stats, status).await?)
    }

    async fn close(&self) -> Result<(), ExportError> {
        Database::close(self).await;
        Ok(())
    }
}
