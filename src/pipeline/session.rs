use crate::db::HighlightStore;
use crate::error::ExportError;
use crate::model::{ExportStats, SessionId, SessionStatus};

/// A stage aborted the run. Carries the best-effort counters at the point of failure.
#[derive(Debug)]
pub struct StageFailure {
    pub error: ExportError,
    pub stats: ExportStats,
}

impl StageFailure {
    pub fn new(error: ExportError, stats: ExportStats) -> Self {
        Self { error, stats }
    }
}

pub type StageResult<T> = Result<(T, ExportStats), StageFailure>;

/// An open export session. The only way to release it is [`SessionScope::finish`],
/// which records the run's outcome exactly once.
pub struct SessionScope<'a, S: HighlightStore> {
    store: &'a S,
    id: SessionId,
    finished: bool,
}

impl<'a, S: HighlightStore> SessionScope<'a, S> {
    pub async fn open(store: &'a S, source: &str) -> Result<Self, ExportError> {
        let id = store.start_session(source).await?;
        Ok(Self {
            store,
            id,
            finished: false,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Completes the session from the run's result and hands the result on.
    /// Failures are wrapped in `ProcessingError` after the session is closed.
    pub async fn finish(
        mut self,
        result: Result<ExportStats, StageFailure>,
    ) -> Result<ExportStats, ExportError> {
        self.finished = true;

        let (stats, status) = match &result {
            Ok(stats) => (*stats, SessionStatus::for_completed(stats)),
            Err(failure) => (failure.stats, SessionStatus::Error),
        };

        if let Err(e) = self.store.complete_session(self.id, &stats, status).await {
            tracing::error!(
                session_id = self.id,
                error = %crate::error_chain(&e),
                "failed to record session completion"
            );
        }

        match result {
            Ok(stats) => {
                tracing::info!(
                    session_id = self.id,
                    status = status.as_str(),
                    total = stats.total_processed,
                    sent = stats.new_sent,
                    duplicates = stats.duplicates_skipped,
                    failed = stats.failed_to_send,
                    "export finished"
                );
                Ok(stats)
            }
            Err(failure) => {
                tracing::error!(
                    session_id = self.id,
                    error = %crate::error_chain(&failure.error),
                    "export aborted"
                );
                Err(ExportError::processing(self.id, failure.error))
            }
        }
    }
}

impl<S: HighlightStore> Drop for SessionScope<'_, S> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(session_id = self.id, "export session dropped without completion");
        }
    }
}
