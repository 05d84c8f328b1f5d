use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::{RemoteSink, SendOutcome};
use crate::config::Readwise;
use crate::error::ExportError;
use crate::model::HighlightRecord;

const SOURCE_TYPE: &str = "kindle";
const CATEGORY: &str = "books";
const LOCATION_TYPE: &str = "location";

#[derive(Debug, Serialize)]
struct HighlightPayload<'a> {
    text: &'a str,
    title: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    author: Option<&'a str>,
    source_type: &'static str,
    category: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    location_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    highlighted_at: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct CreateHighlights<'a> {
    highlights: Vec<HighlightPayload<'a>>,
}

impl<'a> From<&'a HighlightRecord> for HighlightPayload<'a> {
    fn from(record: &'a HighlightRecord) -> Self {
        let location = record.location.as_deref().and_then(location_start);
        Self {
            text: &record.content,
            title: &record.title,
            author: record.author.as_deref().filter(|a| !a.is_empty()),
            source_type: SOURCE_TYPE,
            category: CATEGORY,
            location,
            location_type: location.map(|_| LOCATION_TYPE),
            highlighted_at: record.date.as_deref().filter(|d| is_iso_timestamp(d)),
        }
    }
}

/// Readwise wants a single integer; ranges such as `100-102` send their start.
fn location_start(location: &str) -> Option<i64> {
    location.split('-').next()?.trim().parse().ok()
}

fn is_iso_timestamp(date: &str) -> bool {
    chrono::NaiveDateTime::parse_from_str(date, "%Y-%m-%dT%H:%M:%S").is_ok()
}

enum BatchFailure {
    Rejected(reqwest::StatusCode, String),
    Transport(reqwest::Error),
}

pub struct ReadwiseClient {
    client: reqwest::Client,
    token: String,
    api_url: String,
    batch_size: usize,
    request_delay: Duration,
}

impl ReadwiseClient {
    pub fn new(token: impl Into<String>, settings: &Readwise) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: token.into(),
            api_url: settings.api_url.trim_end_matches('/').to_string(),
            batch_size: settings.batch_size.max(1),
            request_delay: Duration::from_millis(settings.request_delay_ms),
        }
    }

    fn auth_header(&self) -> String {
        format!("Token {}", self.token)
    }

    async fn post_batch(&self, batch: &[HighlightRecord]) -> Result<(), BatchFailure> {
        let body = CreateHighlights {
            highlights: batch.iter().map(HighlightPayload::from).collect(),
        };

        let response = self
            .client
            .post(format!("{}/highlights/", self.api_url))
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .json(&body)
            .send()
            .await
            .map_err(BatchFailure::Transport)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        Err(BatchFailure::Rejected(status, text.chars().take(500).collect()))
    }
}

#[async_trait]
impl RemoteSink for ReadwiseClient {
    async fn validate_credential(&self) -> bool {
        tracing::info!("validating Readwise API token");

        let response = self
            .client
            .get(format!("{}/auth/", self.api_url))
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .send()
            .await;

        match response {
            Ok(r) if matches!(r.status().as_u16(), 200 | 204) => {
                tracing::info!(status = r.status().as_u16(), "Readwise API token is valid");
                true
            }
            Ok(r) => {
                tracing::warn!(status = r.status().as_u16(), "Readwise API token was rejected");
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to reach Readwise while validating token");
                false
            }
        }
    }

    async fn send(&self, records: &[HighlightRecord]) -> Result<SendOutcome, ExportError> {
        if records.is_empty() {
            return Ok(SendOutcome::default());
        }

        let total_batches = records.len().div_ceil(self.batch_size);
        tracing::info!(
            "sending {} highlights to Readwise in {} batch(es)",
            records.len(),
            total_batches
        );

        let mut sent = 0;
        for (index, batch) in records.chunks(self.batch_size).enumerate() {
            if index > 0 && !self.request_delay.is_zero() {
                tokio::time::sleep(self.request_delay).await;
            }

            tracing::debug!("batch {}/{} ({} highlights)", index + 1, total_batches, batch.len());
            match self.post_batch(batch).await {
                Ok(()) => sent += batch.len(),
                Err(BatchFailure::Rejected(status, body)) => {
                    tracing::error!(
                        status = status.as_u16(),
                        body = %body,
                        "Readwise rejected batch {}, stopping dispatch",
                        index + 1
                    );
                    break;
                }
                Err(BatchFailure::Transport(e)) if sent == 0 => {
                    return Err(ExportError::Delivery(e.to_string()));
                }
                Err(BatchFailure::Transport(e)) => {
                    tracing::error!(
                        error = %e,
                        "network error on batch {}, stopping dispatch",
                        index + 1
                    );
                    break;
                }
            }
        }

        let outcome = SendOutcome {
            sent,
            failed: records.len() - sent,
        };
        tracing::info!(sent = outcome.sent, failed = outcome.failed, "finished sending highlights");
        Ok(outcome)
    }
}
