//! Readwise Module
//!
//! Delivers highlights to the Readwise v2 API. The client submits records in
//! fixed-size batches and reports how many were accepted; it never says which
//! ones. Dispatch stops at the first rejected batch, so the accepted records are
//! always a prefix of the submission and callers can confirm the first `sent`
//! records positionally.
//!
//! # Usage
//!
//! ```rust,ignore
//! use kindlewise::readwise::{ReadwiseClient, RemoteSink};
//!
//! let client = ReadwiseClient::new(token, &config.readwise);
//! if !client.validate_credential().await {
//!     anyhow::bail!("invalid token");
//! }
//! let outcome = client.send(&records).await?;
//! println!("{} sent, {} failed", outcome.sent, outcome.failed);
//! ```

mod client;

use async_trait::async_trait;

use crate::error::ExportError;
use crate::model::HighlightRecord;

pub use client::ReadwiseClient;

/// Accept/reject tally for one `send` call. `sent + failed` equals the number
/// of records submitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOutcome {
    pub sent: usize,
    pub failed: usize,
}

#[async_trait]
pub trait RemoteSink: Send + Sync {
    /// Checks the credential without side effects. Transport problems count as invalid.
    async fn validate_credential(&self) -> bool;

    /// Rejections are reported through `SendOutcome::failed`. An `Err` means
    /// nothing could be submitted at all.
    async fn send(&self, records: &[HighlightRecord]) -> Result<SendOutcome, ExportError>;
}
