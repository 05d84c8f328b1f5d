//! Export Pipeline
//!
//! Moves highlights from an annotation source to a remote sink exactly once,
//! using the highlight store as the deduplication ledger.
//!
//! A run goes through parse, filter, dispatch, persist and complete. Outside
//! preview mode every run is tracked by a session record that is completed on
//! every exit path: `success`, `partial` when the sink rejected some highlights,
//! `error` when a stage aborted. Aborted runs surface as `ProcessingError`.
//!
//! The sink only reports counts, so the pipeline treats the first `sent`
//! records of the submission as delivered and records only those.
//!
//! # Usage
//!
//! ```rust,ignore
//! use kindlewise::pipeline::ExportPipeline;
//!
//! let pipeline = ExportPipeline::new(parser, db, client);
//! let stats = pipeline.process().await?;
//!
//! // preview, then export a hand-picked subset
//! let pending = pipeline.pending_highlights().await?;
//! let stats = pipeline.process_selected(&[1, 3]).await?;
//! pipeline.close().await?;
//! ```

mod session;
mod stages;

use crate::clippings::AnnotationParser;
use crate::db::HighlightStore;
use crate::error::ExportError;
use crate::model::{ExportStats, PendingHighlight};
use crate::readwise::RemoteSink;

pub use session::{SessionScope, StageFailure};

pub struct ExportPipeline<P, S, R> {
    parser: P,
    store: S,
    sink: R,
    preview: bool,
}

impl<P, S, R> ExportPipeline<P, S, R>
where
    P: AnnotationParser,
    S: HighlightStore,
    R: RemoteSink,
{
    pub fn new(parser: P, store: S, sink: R) -> Self {
        Self {
            parser,
            store,
            sink,
            preview: false,
        }
    }

    /// In preview mode nothing is sent, saved or recorded as a session.
    pub fn with_preview(mut self, preview: bool) -> Self {
        self.preview = preview;
        self
    }

    pub fn is_preview(&self) -> bool {
        self.preview
    }

    pub fn parser(&self) -> &P {
        &self.parser
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn sink(&self) -> &R {
        &self.sink
    }

    /// Checks that the source file exists and, outside preview mode, that the
    /// sink accepts the credential. Has no side effects on the store.
    pub async fn validate(&self) -> Result<(), ExportError> {
        let source = self.parser.source();
        if !source.is_file() {
            return Err(ExportError::Validation(format!(
                "clippings file not found: {}",
                source.display()
            )));
        }

        if !self.preview && !self.sink.validate_credential().await {
            return Err(ExportError::Validation("invalid Readwise API token".to_string()));
        }

        tracing::debug!("export setup validated");
        Ok(())
    }

    pub async fn process(&self) -> Result<ExportStats, ExportError> {
        self.validate().await?;

        if self.preview {
            return self.export_all().await.map_err(|f| f.error);
        }

        let session = self.open_session().await?;
        let result = self.export_all().await;
        session.finish(result).await
    }

    /// Parsed highlights not yet in the store, numbered from 1 in parse order.
    /// Recomputed on every call.
    pub async fn pending_highlights(&self) -> Result<Vec<PendingHighlight>, ExportError> {
        let (records, stats) = self.parse_stage(ExportStats::default()).map_err(|f| f.error)?;
        let (new, _) = self
            .filter_stage(records, stats)
            .await
            .map_err(|f| f.error)?;
        Ok(stages::pending_view(new))
    }

    /// Exports the pending highlights with the given ids. The pending view is
    /// rebuilt first, so ids refer to the view as it is now.
    pub async fn process_selected(&self, ids: &[usize]) -> Result<ExportStats, ExportError> {
        self.validate().await?;

        if self.preview {
            return self.export_selected(ids).await.map_err(|f| f.error);
        }

        let session = self.open_session().await?;
        let result = self.export_selected(ids).await;
        session.finish(result).await
    }

    pub async fn close(&self) -> Result<(), ExportError> {
        self.store.close().await
    }

    async fn open_session(&self) -> Result<SessionScope<'_, S>, ExportError> {
        let source = self.parser.source().display().to_string();
        let session = SessionScope::open(&self.store, &source).await?;
        tracing::info!(session_id = session.id(), source = %source, "export started");
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::model::*;
    use crate::readwise::SendOutcome;

    struct FakeParser {
        _file: tempfile::NamedTempFile,
        path: PathBuf,
        records: Mutex<Result<Vec<HighlightRecord>, String>>,
        calls: AtomicUsize,
    }

    impl FakeParser {
        fn new(records: Vec<HighlightRecord>) -> Self {
            let file = tempfile::NamedTempFile::new().unwrap();
            Self {
                path: file.path().to_path_buf(),
                _file: file,
                records: Mutex::new(Ok(records)),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing(reason: &str) -> Self {
            let parser = Self::new(vec![]);
            *parser.records.lock().unwrap() = Err(reason.to_string());
            parser
        }
    }

    impl AnnotationParser for FakeParser {
        fn source(&self) -> &Path {
            &self.path
        }

        fn parse(&self) -> Result<Vec<HighlightRecord>, ExportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.records
                .lock()
                .unwrap()
                .clone()
                .map_err(|reason| ExportError::parsing(&self.path, reason))
        }
    }

    #[derive(Default)]
    struct FakeStore {
        rows: Mutex<HashMap<String, ExportStatus>>,
        saved: Mutex<Vec<HighlightRecord>>,
        sessions: Mutex<Vec<(String, Option<(ExportStats, SessionStatus)>)>>,
        fail_lookups: bool,
        fail_save_of: Option<String>,
        fail_start: bool,
        fail_complete: bool,
        closes: AtomicUsize,
    }

    impl FakeStore {
        fn with_existing(records: &[HighlightRecord]) -> Self {
            let store = Self::default();
            for r in records {
                store
                    .rows
                    .lock()
                    .unwrap()
                    .insert(r.dedup_key().fingerprint(), ExportStatus::Success);
            }
            store
        }

        fn saved_contents(&self) -> Vec<String> {
            self.saved.lock().unwrap().iter().map(|r| r.content.clone()).collect()
        }

        fn session(&self, index: usize) -> (String, Option<(ExportStats, SessionStatus)>) {
            self.sessions.lock().unwrap()[index].clone()
        }

        fn session_count(&self) -> usize {
            self.sessions.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl HighlightStore for FakeStore {
        async fn exists(&self, title: &str, author: &str, content: &str) -> Result<bool, ExportError> {
            if self.fail_lookups {
                return Err(ExportError::Storage("ledger unavailable".into()));
            }
            let hash = DedupKey { title, author, content }.fingerprint();
            Ok(self.rows.lock().unwrap().get(&hash) == Some(&ExportStatus::Success))
        }

        async fn save(&self, record: &HighlightRecord, status: ExportStatus) -> Result<(), ExportError> {
            if self.fail_save_of.as_deref() == Some(record.content.as_str()) {
                return Err(ExportError::Storage("disk full".into()));
            }
            self.rows
                .lock()
                .unwrap()
                .insert(record.dedup_key().fingerprint(), status);
            self.saved.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn start_session(&self, source: &str) -> Result<SessionId, ExportError> {
            if self.fail_start {
                return Err(ExportError::Storage("ledger is read-only".into()));
            }
            let mut sessions = self.sessions.lock().unwrap();
            sessions.push((source.to_string(), None));
            Ok(sessions.len() as SessionId)
        }

        async fn complete_session(
            &self,
            session_id: SessionId,
            stats: &ExportStats,
            status: SessionStatus,
        ) -> Result<(), ExportError> {
            if self.fail_complete {
                return Err(ExportError::Storage("database is locked".into()));
            }
            let mut sessions = self.sessions.lock().unwrap();
            let entry = &mut sessions[(session_id - 1) as usize];
            assert!(entry.1.is_none(), "session completed twice");
            entry.1 = Some((*stats, status));
            Ok(())
        }

        async fn close(&self) -> Result<(), ExportError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Accepts up to `accept` records per call, in submission order.
    struct FakeSink {
        accept: Option<usize>,
        valid: bool,
        unreachable: bool,
        batches: Mutex<Vec<Vec<HighlightRecord>>>,
    }

    impl FakeSink {
        fn accepting_all() -> Self {
            Self {
                accept: None,
                valid: true,
                unreachable: false,
                batches: Mutex::new(vec![]),
            }
        }

        fn accepting(n: usize) -> Self {
            Self {
                accept: Some(n),
                ..Self::accepting_all()
            }
        }

        fn send_calls(&self) -> usize {
            self.batches.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RemoteSink for FakeSink {
        async fn validate_credential(&self) -> bool {
            self.valid
        }

        async fn send(&self, records: &[HighlightRecord]) -> Result<SendOutcome, ExportError> {
            if self.unreachable {
                return Err(ExportError::Delivery("connection refused".into()));
            }
            self.batches.lock().unwrap().push(records.to_vec());
            let sent = self.accept.unwrap_or(records.len()).min(records.len());
            Ok(SendOutcome {
                sent,
                failed: records.len() - sent,
            })
        }
    }

    fn highlight(title: &str, text: &str) -> HighlightRecord {
        HighlightRecord::new(title, Some("Author"), text)
    }

    fn five_records() -> Vec<HighlightRecord> {
        (1..=5).map(|i| highlight("Book", &format!("passage {i}"))).collect()
    }

    #[tokio::test]
    async fn test_partial_acceptance_persists_confirmed_prefix() {
        let records = five_records();
        let store = FakeStore::with_existing(&[records[0].clone(), records[3].clone()]);
        let pipeline = ExportPipeline::new(FakeParser::new(records), store, FakeSink::accepting(2));

        let stats = pipeline.process().await.unwrap();

        assert_eq!(
            stats,
            ExportStats {
                total_processed: 5,
                new_sent: 2,
                duplicates_skipped: 2,
                failed_to_send: 1,
            }
        );
        assert_eq!(pipeline.store().saved_contents(), vec!["passage 2", "passage 3"]);
        assert_eq!(pipeline.sink().batches.lock().unwrap()[0].len(), 3);

        let (_, completion) = pipeline.store().session(0);
        assert_eq!(completion, Some((stats, SessionStatus::Partial)));
    }

    #[tokio::test]
    async fn test_second_run_finds_only_duplicates() {
        let mut records = five_records();
        records.push(highlight("Book", ""));
        let pipeline = ExportPipeline::new(
            FakeParser::new(records),
            FakeStore::default(),
            FakeSink::accepting_all(),
        );

        let first = pipeline.process().await.unwrap();
        assert_eq!(first.new_sent, 5);
        assert_eq!(pipeline.store().session(0).1.unwrap().1, SessionStatus::Success);

        let second = pipeline.process().await.unwrap();
        assert_eq!(second.total_processed, 6);
        assert_eq!(second.new_sent, 0);
        assert_eq!(second.duplicates_skipped, 5);
        assert_eq!(second.failed_to_send, 0);
        assert_eq!(pipeline.sink().send_calls(), 1);
        assert_eq!(pipeline.store().session(1).1.unwrap().1, SessionStatus::Success);
    }

    #[tokio::test]
    async fn test_empty_content_only_counts_as_processed() {
        let records = vec![highlight("Book", ""), highlight("Book", "kept")];
        let pipeline = ExportPipeline::new(
            FakeParser::new(records),
            FakeStore::default(),
            FakeSink::accepting_all(),
        );

        let stats = pipeline.process().await.unwrap();

        assert_eq!(stats.total_processed, 2);
        assert_eq!(stats.new_sent, 1);
        assert_eq!(stats.duplicates_skipped, 0);
        assert_eq!(stats.failed_to_send, 0);
        assert_eq!(pipeline.sink().batches.lock().unwrap()[0].len(), 1);
    }

    #[tokio::test]
    async fn test_preview_does_not_mutate() {
        let records = five_records();
        let store = FakeStore::with_existing(&records[..1]);
        let mut sink = FakeSink::accepting_all();
        sink.valid = false;
        let pipeline = ExportPipeline::new(FakeParser::new(records), store, sink).with_preview(true);

        let stats = pipeline.process().await.unwrap();

        assert_eq!(stats.new_sent, 4);
        assert_eq!(stats.duplicates_skipped, 1);
        assert_eq!(pipeline.sink().send_calls(), 0);
        assert_eq!(pipeline.store().session_count(), 0);
        assert!(pipeline.store().saved_contents().is_empty());

        let selected = pipeline.process_selected(&[1, 2]).await.unwrap();
        assert_eq!(selected.new_sent, 2);
        assert_eq!(pipeline.sink().send_calls(), 0);
        assert_eq!(pipeline.store().session_count(), 0);
    }

    #[tokio::test]
    async fn test_pending_view_numbers_new_highlights() {
        let records = vec![highlight("A", "one"), highlight("B", "two"), highlight("C", "three")];
        let store = FakeStore::with_existing(&records[1..2]);
        let pipeline = ExportPipeline::new(FakeParser::new(records), store, FakeSink::accepting_all());

        let pending = pipeline.pending_highlights().await.unwrap();

        let ids: Vec<usize> = pending.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(pending[0].title, "A");
        assert_eq!(pending[1].highlight, "three");
        assert_eq!(pending[1].location, "Unknown");
        assert_eq!(pipeline.store().session_count(), 0);
    }

    #[tokio::test]
    async fn test_selected_export_ignores_unknown_ids() {
        let records = five_records();
        let pipeline = ExportPipeline::new(
            FakeParser::new(records),
            FakeStore::default(),
            FakeSink::accepting_all(),
        );

        let stats = pipeline.process_selected(&[4, 2, 9, 2, 0]).await.unwrap();

        assert_eq!(stats.total_processed, 2);
        assert_eq!(stats.new_sent, 2);
        assert_eq!(stats.duplicates_skipped, 0);
        assert_eq!(pipeline.store().saved_contents(), vec!["passage 2", "passage 4"]);
        assert_eq!(pipeline.store().session(0).1.unwrap().1, SessionStatus::Success);
    }

    #[tokio::test]
    async fn test_selected_export_rebuilds_pending_view() {
        let records = five_records();
        let pipeline = ExportPipeline::new(
            FakeParser::new(records),
            FakeStore::default(),
            FakeSink::accepting_all(),
        );

        pipeline.process_selected(&[1]).await.unwrap();
        let pending = pipeline.pending_highlights().await.unwrap();
        assert_eq!(pending.len(), 4);
        assert_eq!(pending[0].highlight, "passage 2");

        // id 1 now names what used to be id 2
        pipeline.process_selected(&[1]).await.unwrap();
        assert_eq!(pipeline.store().saved_contents(), vec!["passage 1", "passage 2"]);
        assert_eq!(pipeline.parser().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_delivery_failure_completes_session_with_error() {
        let records = five_records();
        let store = FakeStore::with_existing(&records[..1]);
        let mut sink = FakeSink::accepting_all();
        sink.unreachable = true;
        let pipeline = ExportPipeline::new(FakeParser::new(records), store, sink);

        let err = pipeline.process().await.unwrap_err();

        assert!(matches!(err, ExportError::Processing { session_id: 1, .. }));
        assert!(matches!(err.root(), ExportError::Delivery(_)));

        let (_, completion) = pipeline.store().session(0);
        let (stats, status) = completion.unwrap();
        assert_eq!(status, SessionStatus::Error);
        assert_eq!(stats.new_sent, 0);
        assert_eq!(stats.failed_to_send, 4);
        assert_eq!(stats.duplicates_skipped, 1);
        assert!(pipeline.store().saved_contents().is_empty());
    }

    #[tokio::test]
    async fn test_parse_failure_is_recorded_as_error_session() {
        let pipeline = ExportPipeline::new(
            FakeParser::failing("no clippings found"),
            FakeStore::default(),
            FakeSink::accepting_all(),
        );

        let err = pipeline.process().await.unwrap_err();

        assert!(matches!(err.root(), ExportError::Parsing { .. }));
        let (source, completion) = pipeline.store().session(0);
        assert_eq!(source, pipeline.parser().path.display().to_string());
        assert_eq!(completion, Some((ExportStats::default(), SessionStatus::Error)));
    }

    #[tokio::test]
    async fn test_lookup_failure_aborts_run() {
        let store = FakeStore {
            fail_lookups: true,
            ..Default::default()
        };
        let pipeline = ExportPipeline::new(FakeParser::new(five_records()), store, FakeSink::accepting_all());

        let err = pipeline.process().await.unwrap_err();

        assert!(matches!(err.root(), ExportError::Storage(_)));
        assert_eq!(pipeline.sink().send_calls(), 0);
        let (stats, status) = pipeline.store().session(0).1.unwrap();
        assert_eq!(status, SessionStatus::Error);
        assert_eq!(stats.failed_to_send, 5);
    }

    #[tokio::test]
    async fn test_save_failure_is_skipped() {
        let store = FakeStore {
            fail_save_of: Some("passage 2".into()),
            ..Default::default()
        };
        let pipeline = ExportPipeline::new(FakeParser::new(five_records()), store, FakeSink::accepting_all());

        let stats = pipeline.process().await.unwrap();

        assert_eq!(stats.new_sent, 5);
        assert_eq!(stats.failed_to_send, 0);
        assert_eq!(
            pipeline.store().saved_contents(),
            vec!["passage 1", "passage 3", "passage 4", "passage 5"]
        );
        assert_eq!(pipeline.store().session(0).1.unwrap().1, SessionStatus::Success);
    }

    #[tokio::test]
    async fn test_validation_happens_before_any_session() {
        let mut sink = FakeSink::accepting_all();
        sink.valid = false;
        let pipeline = ExportPipeline::new(FakeParser::new(five_records()), FakeStore::default(), sink);

        let err = pipeline.process().await.unwrap_err();
        assert!(matches!(err, ExportError::Validation(_)));
        assert_eq!(pipeline.store().session_count(), 0);
        assert_eq!(pipeline.parser().calls.load(Ordering::SeqCst), 0);

        let mut parser = FakeParser::new(five_records());
        parser.path = parser.path.with_extension("missing");
        let pipeline = ExportPipeline::new(parser, FakeStore::default(), FakeSink::accepting_all());
        let err = pipeline.process_selected(&[1]).await.unwrap_err();
        assert!(err.to_string().contains("clippings file not found"));
        assert_eq!(pipeline.store().session_count(), 0);
    }

    #[tokio::test]
    async fn test_session_start_failure_stops_before_parsing() {
        for selected in [false, true] {
            let store = FakeStore {
                fail_start: true,
                ..Default::default()
            };
            let pipeline = ExportPipeline::new(FakeParser::new(five_records()), store, FakeSink::accepting_all());

            let err = if selected {
                pipeline.process_selected(&[1, 2]).await.unwrap_err()
            } else {
                pipeline.process().await.unwrap_err()
            };

            assert!(matches!(err, ExportError::Storage(_)), "got {err:?}");
            assert_eq!(pipeline.parser().calls.load(Ordering::SeqCst), 0);
            assert_eq!(pipeline.sink().send_calls(), 0);
            assert_eq!(pipeline.store().session_count(), 0);
            assert!(pipeline.store().saved_contents().is_empty());
        }
    }

    #[tokio::test]
    async fn test_session_completion_failure_keeps_run_result() {
        let failing_store = || FakeStore {
            fail_complete: true,
            ..Default::default()
        };

        let pipeline = ExportPipeline::new(FakeParser::new(five_records()), failing_store(), FakeSink::accepting_all());
        let stats = pipeline.process().await.unwrap();
        assert_eq!(stats.new_sent, 5);
        assert_eq!(pipeline.store().saved_contents().len(), 5);
        assert_eq!(pipeline.store().session(0).1, None);

        let pipeline = ExportPipeline::new(FakeParser::new(five_records()), failing_store(), FakeSink::accepting_all());
        let stats = pipeline.process_selected(&[2, 4]).await.unwrap();
        assert_eq!(stats.new_sent, 2);
        assert_eq!(pipeline.store().saved_contents(), vec!["passage 2", "passage 4"]);
        assert_eq!(pipeline.store().session(0).1, None);

        let pipeline = ExportPipeline::new(
            FakeParser::failing("no clippings found"),
            failing_store(),
            FakeSink::accepting_all(),
        );
        let err = pipeline.process().await.unwrap_err();
        assert!(matches!(err, ExportError::Processing { session_id: 1, .. }));
        assert!(matches!(err.root(), ExportError::Parsing { .. }));
    }

    #[tokio::test]
    async fn test_close_delegates_to_store() {
        let pipeline = ExportPipeline::new(
            FakeParser::new(vec![]),
            FakeStore::default(),
            FakeSink::accepting_all(),
        );

        pipeline.close().await.unwrap();
        pipeline.close().await.unwrap();
        assert_eq!(pipeline.store().closes.load(Ordering::SeqCst), 2);
    }
}
