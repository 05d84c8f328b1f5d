use anyhow::{Result, bail};

use super::{ExportArgs, confirm, format, prompt};
use crate::clippings::{AnnotationParser, ClippingsParser};
use crate::config::{Config, TOKEN_ENV_VAR, mask_token};
use crate::db::{Database, HighlightStore};
use crate::model::ExportStats;
use crate::pipeline::ExportPipeline;
use crate::readwise::{ReadwiseClient, RemoteSink};

/// What the user typed at the interactive prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    Quit,
    /// Ids within `1..=max`, in input order, plus the ones outside it.
    Ids { valid: Vec<usize>, invalid: Vec<usize> },
    Invalid,
}

pub fn parse_selection(input: &str, max: usize) -> Selection {
    let input = input.trim().to_lowercase();
    match input.as_str() {
        "a" | "all" => return Selection::All,
        "q" | "quit" | "" => return Selection::Quit,
        _ => {}
    }

    let mut valid = Vec::new();
    let mut invalid = Vec::new();
    for part in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.parse::<usize>() {
            Ok(id) if (1..=max).contains(&id) => {
                if !valid.contains(&id) {
                    valid.push(id);
                }
            }
            Ok(id) => invalid.push(id),
            Err(_) => return Selection::Invalid,
        }
    }

    Selection::Ids { valid, invalid }
}

pub async fn handle_export(args: &ExportArgs, cfg: &Config) -> Result<i32> {
    if args.devices {
        return super::devices::handle_devices();
    }

    let Some(source) = cfg.resolve_clippings_path(args.file.as_deref()) else {
        bail!("no clippings file found; pass --file or set app.clippings_path");
    };

    let token = cfg.resolve_token(args.api_token.as_deref());
    if token.is_none() && !args.dry_run {
        bail!(
            "no Readwise API token; pass --api-token, set {} or readwise.token",
            TOKEN_ENV_VAR
        );
    }
    if let Some(t) = &token {
        tracing::debug!(token = %mask_token(t), "using Readwise API token");
    }

    let db_path = cfg.database_path(args.db_path.as_deref());
    let db = Database::new(&db_path).await?;
    let client = ReadwiseClient::new(token.unwrap_or_default(), &cfg.readwise);
    let pipeline =
        ExportPipeline::new(ClippingsParser::new(&source), db, client).with_preview(args.dry_run);

    tracing::info!(source = ?source, db = ?db_path, dry_run = args.dry_run, "starting export");

    let result = if args.interactive {
        interactive(&pipeline).await
    } else {
        pipeline.process().await.map(Some).map_err(anyhow::Error::from)
    };
    pipeline.close().await?;

    match result? {
        Some(stats) => {
            println!("{}", format::export_summary(&stats, &source, args.dry_run));
            Ok(if stats.failed_to_send > 0 { 1 } else { 0 })
        }
        None => Ok(0),
    }
}

/// Lets the user pick from the pending highlights. `None` when nothing was exported.
async fn interactive<P, S, R>(pipeline: &ExportPipeline<P, S, R>) -> Result<Option<ExportStats>>
where
    P: AnnotationParser,
    S: HighlightStore,
    R: RemoteSink,
{
    pipeline.validate().await?;

    let pending = pipeline.pending_highlights().await?;
    if pending.is_empty() {
        println!("\nNo new highlights found to export.");
        return Ok(None);
    }

    println!("{}", format::pending_by_book(&pending));
    println!("\nSelect highlights to export:");
    println!("  - Enter highlight IDs separated by commas (e.g. '1,3,5')");
    println!("  - Enter 'a' to select all highlights");
    println!("  - Enter 'q' to quit without exporting");

    let ids = match parse_selection(&prompt("Your selection")?, pending.len()) {
        Selection::Quit => {
            println!("Export cancelled.");
            return Ok(None);
        }
        Selection::Invalid => {
            println!("Invalid selection format. Export cancelled.");
            return Ok(None);
        }
        Selection::All => {
            println!("Selected all {} highlights.", pending.len());
            pending.iter().map(|p| p.id).collect::<Vec<_>>()
        }
        Selection::Ids { valid, invalid } => {
            if !invalid.is_empty() {
                let list: Vec<String> = invalid.iter().map(|i| i.to_string()).collect();
                println!("Warning: Invalid IDs ignored: {}", list.join(", "));
            }
            println!("Selected {} highlights.", valid.len());
            valid
        }
    };

    if ids.is_empty() {
        println!("No highlights selected. Export cancelled.");
        return Ok(None);
    }
    if !confirm("Proceed with export?")? {
        println!("Export cancelled.");
        return Ok(None);
    }

    println!("\nExporting selected highlights...");
    Ok(Some(pipeline.process_selected(&ids).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_keywords() {
        assert_eq!(parse_selection("a", 3), Selection::All);
        assert_eq!(parse_selection(" ALL ", 3), Selection::All);
        assert_eq!(parse_selection("q", 3), Selection::Quit);
        assert_eq!(parse_selection("", 3), Selection::Quit);
    }

    #[test]
    fn test_selection_ids() {
        assert_eq!(
            parse_selection("3, 1,3,7", 5),
            Selection::Ids {
                valid: vec![3, 1],
                invalid: vec![7]
            }
        );
        assert_eq!(
            parse_selection("0", 5),
            Selection::Ids {
                valid: vec![],
                invalid: vec![0]
            }
        );
        assert_eq!(parse_selection("1,two", 5), Selection::Invalid);
    }
}
