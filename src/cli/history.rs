use anyhow::{Result, bail};
use serde::Serialize;

use super::{HistoryArgs, OutputFormat, format, print_json};
use crate::config::Config;
use crate::db::Database;
use crate::model::{ExportSession, StoredHighlight};

#[derive(Serialize)]
struct SessionReport<'a> {
    session: &'a ExportSession,
    highlights: &'a [StoredHighlight],
}

pub async fn handle_history(args: &HistoryArgs, cfg: &Config) -> Result<i32> {
    let db = Database::new(&cfg.database_path(None)).await?;

    if let Some(id) = args.session {
        let Some(session) = db.session(id).await? else {
            bail!("export session {} not found", id);
        };
        let highlights = db.highlights_by_session(id).await?;

        match args.format {
            OutputFormat::Text => println!("{}", format::session_details(&session, &highlights)),
            OutputFormat::Json => print_json(&SessionReport {
                session: &session,
                highlights: &highlights,
            })?,
            OutputFormat::Csv => print!("{}", format::session_csv(&session, &highlights)?),
        }
    } else {
        let sessions = db.export_history(args.limit).await?;
        match args.format {
            OutputFormat::Text => {
                println!("{}", format::history_table(&sessions));
                if args.details && !sessions.is_empty() {
                    println!("\n--- Detailed Information ---");
                    for session in &sessions {
                        let highlights = db.highlights_by_session(session.id).await?;
                        println!("{}", format::session_details(session, &highlights));
                    }
                }
            }
            OutputFormat::Json => print_json(&sessions)?,
            OutputFormat::Csv => print!("{}", format::csv_rows(&sessions)?),
        }
    }

    db.close().await;
    Ok(0)
}
