use std::collections::HashSet;

use super::ExportPipeline;
use super::session::{StageFailure, StageResult};
use crate::clippings::AnnotationParser;
use crate::db::HighlightStore;
use crate::model::{ExportStats, ExportStatus, HighlightRecord, PendingHighlight};
use crate::readwise::RemoteSink;

impl<P, S, R> ExportPipeline<P, S, R>
where
    P: AnnotationParser,
    S: HighlightStore,
    R: RemoteSink,
{
    pub(super) fn parse_stage(&self, stats: ExportStats) -> StageResult<Vec<HighlightRecord>> {
        let records = self
            .parser
            .parse()
            .map_err(|e| StageFailure::new(e, stats))?;

        tracing::info!("parsed {} clippings from {:?}", records.len(), self.parser.source());
        let stats = stats.with_total(records.len());
        Ok((records, stats))
    }

    /// Drops empty records and splits the rest into new and already exported,
    /// keeping parse order for the new ones.
    pub(super) async fn filter_stage(
        &self,
        records: Vec<HighlightRecord>,
        stats: ExportStats,
    ) -> StageResult<Vec<HighlightRecord>> {
        let mut new = Vec::new();
        let mut duplicates = 0;
        let mut empty = 0;

        for record in records {
            if !record.is_exportable() {
                empty += 1;
                continue;
            }

            let key = record.dedup_key();
            match self.store.exists(key.title, key.author, key.content).await {
                Ok(true) => duplicates += 1,
                Ok(false) => new.push(record),
                Err(e) => {
                    let stats = stats.with_duplicates(duplicates);
                    let unsettled = stats.total_processed - empty - duplicates;
                    return Err(StageFailure::new(e, stats.aborted(unsettled)));
                }
            }
        }

        if empty > 0 {
            tracing::debug!("dropped {} clippings without content", empty);
        }
        tracing::info!("found {} new highlights, {} duplicates", new.len(), duplicates);

        Ok((new, stats.with_duplicates(duplicates)))
    }

    /// Sends `new` and returns how many leading records the sink confirmed.
    pub(super) async fn dispatch_stage(
        &self,
        new: &[HighlightRecord],
        stats: ExportStats,
    ) -> StageResult<usize> {
        if new.is_empty() {
            tracing::info!("no new highlights to export");
            return Ok((0, stats.with_delivery(0, 0)));
        }

        if self.preview {
            tracing::info!("preview: would send {} highlights", new.len());
            return Ok((0, stats.with_delivery(new.len(), 0)));
        }

        let outcome = self
            .sink
            .send(new)
            .await
            .map_err(|e| StageFailure::new(e, stats.aborted(new.len())))?;

        if outcome.sent + outcome.failed != new.len() {
            tracing::warn!(
                submitted = new.len(),
                sent = outcome.sent,
                failed = outcome.failed,
                "sink tally does not match submission"
            );
        }

        let sent = outcome.sent.min(new.len());
        let failed = new.len() - sent;
        if failed > 0 {
            tracing::warn!("{} highlights failed to send", failed);
        }

        Ok((sent, stats.with_delivery(sent, failed)))
    }

    /// Records the confirmed prefix. A failed save is logged and skipped; the
    /// highlight was delivered, so it may be sent again on the next run.
    pub(super) async fn persist_stage(&self, confirmed: &[HighlightRecord]) {
        if self.preview {
            return;
        }

        let mut saved = 0;
        for record in confirmed {
            match self.store.save(record, ExportStatus::Success).await {
                Ok(()) => saved += 1,
                Err(e) => tracing::error!(
                    title = %record.title,
                    error = %crate::error_chain(&e),
                    "failed to record exported highlight"
                ),
            }
        }

        tracing::debug!("recorded {} of {} exported highlights", saved, confirmed.len());
    }

    pub(super) async fn export_all(&self) -> Result<ExportStats, StageFailure> {
        let (records, stats) = self.parse_stage(ExportStats::default())?;
        let (new, stats) = self.filter_stage(records, stats).await?;
        self.deliver(new, stats).await
    }

    pub(super) async fn export_selected(&self, ids: &[usize]) -> Result<ExportStats, StageFailure> {
        let (records, stats) = self.parse_stage(ExportStats::default())?;
        let (new, _) = self.filter_stage(records, stats).await?;

        let selected = select(new, ids);
        let stats = ExportStats::default().with_total(selected.len());
        self.deliver(selected, stats).await
    }

    async fn deliver(
        &self,
        new: Vec<HighlightRecord>,
        stats: ExportStats,
    ) -> Result<ExportStats, StageFailure> {
        let (sent, stats) = self.dispatch_stage(&new, stats).await?;
        self.persist_stage(&new[..sent]).await;
        Ok(stats)
    }
}

pub(super) fn pending_view(new: Vec<HighlightRecord>) -> Vec<PendingHighlight> {
    new.into_iter()
        .enumerate()
        .map(|(i, record)| PendingHighlight::new(i + 1, record))
        .collect()
}

/// Maps 1-based pending ids to records in pending order. Unknown and repeated
/// ids are ignored.
fn select(new: Vec<HighlightRecord>, ids: &[usize]) -> Vec<HighlightRecord> {
    let wanted: HashSet<usize> = ids.iter().copied().collect();
    let pending = pending_view(new);

    for id in &wanted {
        if *id == 0 || *id > pending.len() {
            tracing::warn!("ignoring unknown highlight id {}", id);
        }
    }

    pending
        .into_iter()
        .filter(|p| wanted.contains(&p.id))
        .map(|p| p.record)
        .collect()
}
